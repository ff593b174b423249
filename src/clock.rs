//! PPS-disciplined clock.
//!
//! A GNSS receiver gives us two things: a hardware pulse marking the start
//! of every UTC second, and (slightly later, over UART) a message naming
//! which second the pulse marked. The clock fuses the two into an anchor
//! (monotonic instant of the edge + the integer second it started) and
//! answers every time query by extrapolating from that anchor with the
//! monotonic counter.
//!
//! The edge path is split the way the hardware splits it: `pps_edge()` does
//! the ISR-sized work (capture the instant, set a flag), `poll()` runs the
//! deferred fuse and the timeout transitions.

use crate::packet::LeapIndicator;
use crate::time_types::{
    ticks_to_fraction, MonotonicInstant, NtpShortDuration, NtpTimestamp, UNIX_TO_NTP_OFFSET,
};
use log::{debug, info, warn};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Missing this many seconds of PPS edges while locked drops us to holdover.
const EDGE_LOSS_SECS: u64 = 3;

/// With neither PPS nor UBX fixes for this long, the receiver is gone and
/// holdover extrapolation is no longer defensible.
const TOTAL_LOSS_SECS: u64 = 60;

/// Smoothing factor for the oscillator drift estimate (EMA over per-edge
/// interval measurements).
const DRIFT_SMOOTH_ALPHA: f64 = 0.3;

/// While locked, the pulse train alone may carry the anchor across at most
/// this many missed seconds; longer gaps need a fresh wall-time match.
const MAX_EDGE_GAP_SECS: u64 = 5;

// ============================================================================
// TYPES
// ============================================================================

/// Discipline state, derived from PPS/UBX availability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PpsState {
    /// No edge seen since boot (or sync was abandoned).
    Unknown,
    /// Edges arriving but wall time not yet fused.
    Warming,
    /// Edge and wall time fused; serving stratum 1.
    Locked,
    /// Edges temporarily missing; extrapolating from the last anchor.
    Holdover,
}

/// A time fix from the GNSS receiver, tagged with the monotonic instant at
/// which the message was accepted.
#[derive(Debug, Copy, Clone)]
pub struct WallTimeFix {
    pub unix_seconds: u64,
    pub nanos: u32,
    pub time_valid: bool,
    pub date_valid: bool,
    /// Two-bit leap indicator hint reported by the receiver.
    pub leap_hint: u8,
    /// Reference stratum of the source (0 for a direct GNSS fix).
    pub stratum_source: u8,
    pub mono: MonotonicInstant,
}

impl WallTimeFix {
    pub fn is_valid(&self) -> bool {
        self.time_valid && self.date_valid
    }
}

/// The fused clock state. Snapshot-copied to readers; written only by the
/// edge handler and the deferred fuse.
#[derive(Debug, Copy, Clone)]
pub struct PpsAnchor {
    pub mono_at_edge: MonotonicInstant,
    pub wall_seconds_at_edge: u64,
    pub last_edge_mono: MonotonicInstant,
    pub pps_state: PpsState,
    /// Smoothed local oscillator error in parts per billion.
    pub drift_ppb: i64,
}

/// Tunables that come from the GNSS section of the configuration.
#[derive(Debug, Copy, Clone)]
pub struct ClockParams {
    /// How far the extrapolated edge may land from an integer second and
    /// still fuse.
    pub pps_match_tolerance_ns: u64,
    /// Maximum holdover duration before giving up to Unknown.
    pub holdover_max_secs: u64,
    /// Base dispersion of a fresh anchor, in microseconds.
    pub dispersion_base_micros: u64,
    /// Assumed oscillator instability for dispersion growth, in ppm
    /// (microseconds of error per second of extrapolation).
    pub dispersion_growth_ppm: u64,
}

impl Default for ClockParams {
    fn default() -> Self {
        ClockParams {
            pps_match_tolerance_ns: 50_000_000,
            holdover_max_secs: 600,
            dispersion_base_micros: 100,
            dispersion_growth_ppm: 15,
        }
    }
}

// ============================================================================
// CLOCK
// ============================================================================

pub struct GnssClock {
    tick_rate: u64,
    params: ClockParams,
    anchor: PpsAnchor,
    /// Edge captured by the ISR path, kept until fused or stale.
    pending_edge: Option<MonotonicInstant>,
    latest_fix: Option<WallTimeFix>,
    drift_ppb_smoothed: f64,
    edge_count: u64,
    fuse_count: u64,
    anchored_once: bool,
}

impl GnssClock {
    pub fn new(tick_rate_hz: u64, params: ClockParams) -> Self {
        assert!(tick_rate_hz > 0);
        info!(
            "[Clock] tick rate {} Hz, precision 2^{}, match tolerance {} ms",
            tick_rate_hz,
            precision_exponent(tick_rate_hz),
            params.pps_match_tolerance_ns / 1_000_000
        );
        GnssClock {
            tick_rate: tick_rate_hz,
            params,
            anchor: PpsAnchor {
                mono_at_edge: MonotonicInstant::from_ticks(0),
                wall_seconds_at_edge: 0,
                last_edge_mono: MonotonicInstant::from_ticks(0),
                pps_state: PpsState::Unknown,
                drift_ppb: 0,
            },
            pending_edge: None,
            latest_fix: None,
            drift_ppb_smoothed: 0.0,
            edge_count: 0,
            fuse_count: 0,
            anchored_once: false,
        }
    }

    /// Apply new tunables (after a configuration commit). The discipline
    /// state is untouched.
    pub fn set_params(&mut self, params: ClockParams) {
        self.params = params;
    }

    // ========================================================================
    // EVENT INTAKE
    // ========================================================================

    /// PPS rising edge. ISR contract: capture the instant, flag the
    /// deferred handler, nothing else.
    pub fn pps_edge(&mut self, mono: MonotonicInstant) {
        self.anchor.last_edge_mono = mono;
        self.pending_edge = Some(mono);
        self.edge_count += 1;
        if self.anchor.pps_state == PpsState::Unknown {
            self.anchor.pps_state = PpsState::Warming;
            info!("[Clock] first PPS edge, warming up");
        }
    }

    /// Time-bearing UBX message from the GNSS parser.
    ///
    /// While locked, a fix that disagrees with the dead-reckoned anchor
    /// second corrects it; the receiver's wall time is authoritative.
    pub fn ubx_time(&mut self, fix: WallTimeFix) {
        if !fix.is_valid() {
            debug!("[Clock] discarding fix without time+date validity");
            return;
        }
        self.latest_fix = Some(fix);

        if self.anchor.pps_state == PpsState::Locked {
            let edge = self.anchor.mono_at_edge;
            if fix.mono.ticks_since(edge) <= self.tick_rate {
                if let Some(second) = self.match_edge_to_second(edge, &fix) {
                    if second != self.anchor.wall_seconds_at_edge {
                        warn!(
                            "[Clock] fix names second {} for anchor counted as {}, correcting",
                            second, self.anchor.wall_seconds_at_edge
                        );
                        self.anchor.wall_seconds_at_edge = second;
                    }
                }
            }
        }
    }

    /// Deferred work: fuse a pending edge with the latest fix and run the
    /// loss-of-signal timeouts. Called every loop iteration.
    pub fn poll(&mut self, now: MonotonicInstant) {
        if let Some(edge) = self.pending_edge {
            if self.fuse_edge(edge) {
                self.pending_edge = None;
            } else if now.ticks_since(edge) > self.tick_rate * 3 / 2 {
                // The fix that could have named this edge never came.
                debug!("[Clock] dropping unfused edge at {}", edge.ticks());
                self.pending_edge = None;
            }
        }
        self.check_timeouts(now);
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Current time as an NTP timestamp. Never fails: in unsynchronized
    /// states this extrapolates from whatever anchor exists (or from boot),
    /// and callers must honor `stratum() == 16`.
    pub fn ntp_now(&self, now: MonotonicInstant) -> NtpTimestamp {
        let anchor = &self.anchor;
        let delta = now.ticks_since(anchor.mono_at_edge);
        let seconds = anchor.wall_seconds_at_edge + delta / self.tick_rate;
        let fraction = ticks_to_fraction(delta % self.tick_rate, self.tick_rate);
        NtpTimestamp::new(seconds.wrapping_add(UNIX_TO_NTP_OFFSET) as u32, fraction)
    }

    /// Consistent copy of the anchor for external readers.
    pub fn anchor_snapshot(&self) -> PpsAnchor {
        self.anchor
    }

    pub fn state(&self) -> PpsState {
        self.anchor.pps_state
    }

    /// NTP stratum implied by the discipline state.
    pub fn stratum(&self) -> u8 {
        match self.anchor.pps_state {
            PpsState::Locked => 1,
            PpsState::Holdover => 2,
            PpsState::Unknown | PpsState::Warming => 16,
        }
    }

    pub fn leap(&self) -> LeapIndicator {
        match (self.anchor.pps_state, self.latest_fix) {
            (PpsState::Locked, Some(fix)) => LeapIndicator::from_gnss_hint(fix.leap_hint),
            _ => LeapIndicator::Alarm,
        }
    }

    /// Read-to-read resolution as a power-of-two exponent.
    pub fn precision(&self) -> i8 {
        precision_exponent(self.tick_rate)
    }

    /// Wall time of the current anchor, i.e. the instant the discipline
    /// last touched reality.
    pub fn reference_timestamp(&self) -> NtpTimestamp {
        if !self.anchored_once {
            return NtpTimestamp::ZERO;
        }
        NtpTimestamp::new(
            self.anchor
                .wall_seconds_at_edge
                .wrapping_add(UNIX_TO_NTP_OFFSET) as u32,
            0,
        )
    }

    /// Root dispersion: base uncertainty plus growth for every second of
    /// extrapolation since the last edge.
    pub fn root_dispersion(&self, now: MonotonicInstant) -> NtpShortDuration {
        let elapsed_secs = now.ticks_since(self.anchor.last_edge_mono) / self.tick_rate;
        let micros = self.params.dispersion_base_micros
            + self.params.dispersion_growth_ppm * elapsed_secs;
        NtpShortDuration::from_micros(micros)
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count
    }

    pub fn fuse_count(&self) -> u64 {
        self.fuse_count
    }

    pub fn latest_fix(&self) -> Option<WallTimeFix> {
        self.latest_fix
    }

    // ========================================================================
    // FUSE AND TIMEOUTS
    // ========================================================================

    /// Returns true once the edge has been consumed into the anchor.
    fn fuse_edge(&mut self, edge: MonotonicInstant) -> bool {
        // Preferred path: a fix close to the edge names its second.
        if let Some(fix) = self.latest_fix {
            let near = edge.ticks_since(fix.mono) <= self.tick_rate
                || fix.mono.ticks_since(edge) <= self.tick_rate;
            if near {
                if let Some(second) = self.match_edge_to_second(edge, &fix) {
                    self.commit_anchor(edge, second);
                    return true;
                }
            }
        }

        // Fallback: with a live anchor the pulse train itself counts
        // seconds. From holdover the permissible gap is the whole holdover
        // window (drift over that span stays well under half a second).
        let state = self.anchor.pps_state;
        if state == PpsState::Locked || state == PpsState::Holdover {
            let max_gap = if state == PpsState::Holdover {
                self.params.holdover_max_secs
            } else {
                MAX_EDGE_GAP_SECS
            };
            let gap = edge.ticks_since(self.anchor.mono_at_edge);
            let whole = (gap + self.tick_rate / 2) / self.tick_rate;
            if whole >= 1 && whole <= max_gap {
                let second = self.anchor.wall_seconds_at_edge + whole;
                self.commit_anchor(edge, second);
                return true;
            }
            debug!("[Clock] edge gap of {} ticks not countable", gap);
        }
        false
    }

    /// Extrapolate the fix to the edge instant; if that lands within
    /// tolerance of an integer second boundary, that boundary is the second
    /// the edge started. The tolerance also absorbs the receiver's message
    /// delivery latency.
    fn match_edge_to_second(&self, edge: MonotonicInstant, fix: &WallTimeFix) -> Option<u64> {
        let fix_wall_ns = fix.unix_seconds as i128 * 1_000_000_000 + fix.nanos as i128;
        let ahead = edge.ticks_since(fix.mono);
        let behind = fix.mono.ticks_since(edge);
        let mono_delta_ns = if ahead <= behind {
            ticks_to_ns(ahead, self.tick_rate) as i128
        } else {
            -(ticks_to_ns(behind, self.tick_rate) as i128)
        };
        let edge_wall_ns = fix_wall_ns + mono_delta_ns;

        let second = ((edge_wall_ns + 500_000_000) / 1_000_000_000) as u64;
        let boundary_ns = second as i128 * 1_000_000_000;
        let distance = (edge_wall_ns - boundary_ns).unsigned_abs() as u64;

        if distance <= self.params.pps_match_tolerance_ns {
            Some(second)
        } else {
            debug!(
                "[Clock] fix misses second boundary by {} us, tolerance {} us",
                distance / 1_000,
                self.params.pps_match_tolerance_ns / 1_000
            );
            None
        }
    }

    fn commit_anchor(&mut self, edge: MonotonicInstant, second: u64) {
        self.update_drift(edge, second);

        let was = self.anchor.pps_state;
        self.anchor.mono_at_edge = edge;
        self.anchor.wall_seconds_at_edge = second;
        self.anchor.pps_state = PpsState::Locked;
        self.anchor.drift_ppb = self.drift_ppb_smoothed as i64;
        self.anchored_once = true;
        self.fuse_count += 1;

        if was != PpsState::Locked {
            info!(
                "[Clock] locked: second {} starts at mono {} (from {:?})",
                second,
                edge.ticks(),
                was
            );
        }
    }

    /// Measure oscillator drift from the interval between fused edges.
    /// Runs before the anchor moves, so `self.anchor` is the previous edge.
    fn update_drift(&mut self, edge: MonotonicInstant, second: u64) {
        if !self.anchored_once {
            return;
        }
        let wall_gap = second.saturating_sub(self.anchor.wall_seconds_at_edge);
        if wall_gap == 0 || wall_gap > MAX_EDGE_GAP_SECS {
            return;
        }
        let interval = edge.ticks_since(self.anchor.mono_at_edge);
        let nominal = wall_gap * self.tick_rate;
        let err_ppb = (interval as i128 - nominal as i128) * 1_000_000_000 / nominal as i128;
        // A wildly off interval is a glitch, not oscillator drift.
        if err_ppb.unsigned_abs() > 500_000 {
            return;
        }
        self.drift_ppb_smoothed = self.drift_ppb_smoothed * (1.0 - DRIFT_SMOOTH_ALPHA)
            + err_ppb as f64 * DRIFT_SMOOTH_ALPHA;
    }

    fn check_timeouts(&mut self, now: MonotonicInstant) {
        let since_edge_secs = now.ticks_since(self.anchor.last_edge_mono) / self.tick_rate;
        match self.anchor.pps_state {
            PpsState::Locked => {
                if since_edge_secs >= EDGE_LOSS_SECS {
                    warn!(
                        "[Clock] no PPS edge for {} s, entering holdover",
                        since_edge_secs
                    );
                    self.anchor.pps_state = PpsState::Holdover;
                }
            }
            PpsState::Holdover => {
                let fix_age_secs = self
                    .latest_fix
                    .map(|fix| now.ticks_since(fix.mono) / self.tick_rate)
                    .unwrap_or(u64::MAX);
                let total_loss =
                    since_edge_secs >= TOTAL_LOSS_SECS && fix_age_secs >= TOTAL_LOSS_SECS;
                if since_edge_secs >= self.params.holdover_max_secs || total_loss {
                    warn!(
                        "[Clock] holdover expired after {} s, sync abandoned",
                        since_edge_secs
                    );
                    self.anchor.pps_state = PpsState::Unknown;
                    self.drift_ppb_smoothed = 0.0;
                }
            }
            PpsState::Unknown | PpsState::Warming => {}
        }
    }
}

fn ticks_to_ns(ticks: u64, rate: u64) -> u64 {
    ((ticks as u128 * 1_000_000_000) / rate as u128) as u64
}

/// Smallest exponent e with 2^e no coarser than one counter tick;
/// -20 for a 1 MHz counter.
pub fn precision_exponent(tick_rate_hz: u64) -> i8 {
    if tick_rate_hz <= 1 {
        return 0;
    }
    let ceil_log2 = 64 - (tick_rate_hz - 1).leading_zeros();
    -(ceil_log2 as i8)
}

// ============================================================================
// TESTS
// ============================================================================
