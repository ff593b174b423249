//! RFC 5905 responder.
//!
//! One datagram per call: ingress timestamp first, then length and header
//! policy, then the per-source rate limit, then response synthesis with the
//! transmit timestamp taken as late as possible. Send failures are counted
//! and forgotten; NTP clients retransmit on their own schedule.

use crate::clock::GnssClock;
use crate::packet::{NtpPacket, PacketMode, REFERENCE_ID_GPS};
use crate::rate_limit::RateLimiter;
use crate::time_types::{MonotonicInstant, NtpShortDuration, NtpTimestamp};
use crate::traits::{MonotonicSource, SendOutcome, TransportError, UdpTransport};
use log::{debug, warn};
use std::net::SocketAddrV4;

/// Smoothing factor for the processing-time moving average.
const PROCESSING_EMA_ALPHA: f64 = 0.2;

/// Server policy knobs, taken from the NTP section of the configuration.
#[derive(Debug, Copy, Clone)]
pub struct ServerPolicy {
    /// When unsynchronized: `true` answers with stratum 16 + leap alarm,
    /// `false` drops silently. Either way no valid stratum is claimed.
    pub respond_unsynchronized: bool,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        ServerPolicy {
            respond_unsynchronized: true,
        }
    }
}

/// Operational counters. Monotonic within an uptime; reset only on a
/// supervisor-initiated restart.
#[derive(Debug, Default, Copy, Clone)]
pub struct ServerCounters {
    pub requests_total: u64,
    pub requests_valid: u64,
    pub invalid_size: u64,
    pub invalid_mode: u64,
    pub rate_limited: u64,
    pub responses_sent: u64,
    pub send_failed: u64,
    pub dropped_unsync: u64,
    /// Moving average of end-to-end processing time (T_tx - T_rx).
    pub avg_processing_us: f64,
}

impl ServerCounters {
    pub fn requests_invalid(&self) -> u64 {
        self.invalid_size + self.invalid_mode
    }
}

pub struct NtpServer {
    policy: ServerPolicy,
    limiter: RateLimiter,
    counters: ServerCounters,
}

impl NtpServer {
    pub fn new(policy: ServerPolicy, limiter: RateLimiter) -> Self {
        NtpServer {
            policy,
            limiter,
            counters: ServerCounters::default(),
        }
    }

    pub fn counters(&self) -> ServerCounters {
        self.counters
    }

    /// Supervisor-initiated restart clears the uptime counters.
    pub fn reset_counters(&mut self) {
        self.counters = ServerCounters::default();
    }

    /// Apply a new policy (after a configuration commit).
    pub fn set_policy(&mut self, policy: ServerPolicy) {
        self.policy = policy;
    }

    /// Swap in a rebuilt rate limiter (after a configuration commit).
    pub fn set_rate_limiter(&mut self, limiter: RateLimiter) {
        self.limiter = limiter;
    }

    pub fn rate_table_occupancy(&self) -> usize {
        self.limiter.occupancy()
    }

    /// Service one pending datagram, if any. Returns whether a datagram was
    /// consumed, so the caller can bound its loop-iteration budget.
    pub fn poll<T, M>(
        &mut self,
        transport: &mut T,
        clock: &GnssClock,
        mono: &M,
    ) -> Result<bool, TransportError>
    where
        T: UdpTransport,
        M: MonotonicSource,
    {
        let Some(datagram) = transport.recv()? else {
            return Ok(false);
        };

        // Ingress timestamp before any parsing, so parse time is never
        // billed to the client's round trip.
        let mono_rx = mono.now_mono();
        let t_rx = clock.ntp_now(mono_rx);

        self.counters.requests_total += 1;

        let request = match NtpPacket::from_bytes(&datagram.bytes) {
            Ok(request) => request,
            Err(_) => {
                self.counters.invalid_size += 1;
                debug!(
                    "[NTP] dropping {}-byte datagram from {}",
                    datagram.bytes.len(),
                    datagram.src
                );
                return Ok(true);
            }
        };

        if !(3..=4).contains(&request.version) || request.mode != PacketMode::Client {
            self.counters.invalid_mode += 1;
            debug!(
                "[NTP] dropping v{} mode {:?} from {}",
                request.version, request.mode, datagram.src
            );
            return Ok(true);
        }
        self.counters.requests_valid += 1;

        if !self.limiter.check(*datagram.src.ip(), mono_rx) {
            self.counters.rate_limited += 1;
            return Ok(true);
        }

        if clock.stratum() == 16 && !self.policy.respond_unsynchronized {
            self.counters.dropped_unsync += 1;
            return Ok(true);
        }

        self.respond(transport, clock, mono, &request, datagram.src, mono_rx, t_rx);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn respond<T, M>(
        &mut self,
        transport: &mut T,
        clock: &GnssClock,
        mono: &M,
        request: &NtpPacket,
        src: SocketAddrV4,
        mono_rx: MonotonicInstant,
        t_rx: NtpTimestamp,
    ) where
        T: UdpTransport,
        M: MonotonicSource,
    {
        let mut response = NtpPacket {
            leap: clock.leap(),
            version: request.version,
            mode: PacketMode::Server,
            stratum: clock.stratum(),
            poll: request.poll,
            precision: clock.precision(),
            root_delay: NtpShortDuration::ZERO,
            root_dispersion: clock.root_dispersion(mono_rx),
            reference_id: REFERENCE_ID_GPS,
            reference_timestamp: clock.reference_timestamp(),
            // Verbatim echo of the client's transmit timestamp; clients
            // match replies on these exact bytes.
            origin_timestamp: request.transmit_timestamp,
            receive_timestamp: t_rx,
            transmit_timestamp: NtpTimestamp::ZERO,
        };

        // Transmit timestamp as late as possible before the send call.
        let mono_tx = mono.now_mono();
        let t_tx = clock.ntp_now(mono_tx);
        response.transmit_timestamp = t_tx;

        match transport.send(src, &response.serialize()) {
            SendOutcome::Sent => {
                self.counters.responses_sent += 1;
                let elapsed = micros_between(t_rx, t_tx);
                self.counters.avg_processing_us = self.counters.avg_processing_us
                    * (1.0 - PROCESSING_EMA_ALPHA)
                    + elapsed as f64 * PROCESSING_EMA_ALPHA;
            }
            outcome @ (SendOutcome::Busy | SendOutcome::Error) => {
                self.counters.send_failed += 1;
                warn!("[NTP] send to {} failed: {:?}", src, outcome);
            }
        }
    }
}

/// Microseconds from `a` to `b`, zero when `b` precedes `a`.
fn micros_between(a: NtpTimestamp, b: NtpTimestamp) -> u64 {
    if b < a {
        return 0;
    }
    let secs = (b.seconds() - a.seconds()) as u64;
    let frac = b.fraction() as i64 - a.fraction() as i64;
    let micros = secs as i64 * 1_000_000 + (frac * 1_000_000 >> 32);
    micros.max(0) as u64
}

// ============================================================================
// TESTS
// ============================================================================
