//! Core time representations: monotonic counter instants, NTP timestamps
//! and the short-format durations used in NTP headers.

use serde::{Deserialize, Serialize};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const UNIX_TO_NTP_OFFSET: u64 = 2_208_988_800;

/// An opaque reading of the free-running monotonic hardware counter.
///
/// The counter wraps at `u64::MAX`; durations are always formed with
/// wrapping subtraction, so two readings spanning a wrap still produce the
/// correct tick count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicInstant(u64);

impl MonotonicInstant {
    pub fn from_ticks(ticks: u64) -> Self {
        MonotonicInstant(ticks)
    }

    pub fn ticks(&self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`, modulo the counter width.
    pub fn ticks_since(&self, earlier: MonotonicInstant) -> u64 {
        self.0.wrapping_sub(earlier.0)
    }

    pub fn add_ticks(&self, ticks: u64) -> MonotonicInstant {
        MonotonicInstant(self.0.wrapping_add(ticks))
    }
}

/// An RFC 5905 timestamp: seconds since the NTP epoch plus a binary
/// fraction of a second (`fraction` / 2^32 seconds).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NtpTimestamp {
    seconds: u32,
    fraction: u32,
}

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp {
        seconds: 0,
        fraction: 0,
    };

    pub fn new(seconds: u32, fraction: u32) -> Self {
        NtpTimestamp { seconds, fraction }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    /// Build a timestamp from Unix wall time.
    ///
    /// `nanos` above one second are folded into the seconds field. The NTP
    /// seconds field truncates to 32 bits, which is the era-0 convention of
    /// RFC 5905.
    pub fn from_unix(unix_seconds: u64, nanos: u32) -> Self {
        let extra = (nanos / 1_000_000_000) as u64;
        let nanos = nanos % 1_000_000_000;
        let seconds = unix_seconds
            .wrapping_add(UNIX_TO_NTP_OFFSET)
            .wrapping_add(extra) as u32;
        NtpTimestamp {
            seconds,
            fraction: nanos_to_fraction(nanos),
        }
    }

    /// Unix seconds and nanoseconds for this timestamp (era 0).
    pub fn to_unix(&self) -> (u64, u32) {
        let unix = (self.seconds as u64).wrapping_sub(UNIX_TO_NTP_OFFSET);
        (unix, fraction_to_nanos(self.fraction))
    }

    pub fn from_bits(bits: [u8; 8]) -> Self {
        NtpTimestamp {
            seconds: u32::from_be_bytes(bits[0..4].try_into().unwrap()),
            fraction: u32::from_be_bytes(bits[4..8].try_into().unwrap()),
        }
    }

    pub fn to_bits(&self) -> [u8; 8] {
        let mut bits = [0u8; 8];
        bits[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        bits[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        bits
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }
}

/// Nanoseconds within a second to a 32-bit binary fraction, truncated
/// toward zero. 64-bit intermediate keeps the shift from overflowing.
pub fn nanos_to_fraction(nanos: u32) -> u32 {
    (((nanos as u64) << 32) / 1_000_000_000) as u32
}

/// Inverse of [`nanos_to_fraction`], truncated toward zero.
pub fn fraction_to_nanos(fraction: u32) -> u32 {
    (((fraction as u64) * 1_000_000_000) >> 32) as u32
}

/// Sub-second tick remainder to a 32-bit binary fraction.
///
/// `sub_ticks` must be < `tick_rate`. A result that would round up to 2^32
/// is clamped to 2^32 - 1 so the seconds field is never disturbed.
pub fn ticks_to_fraction(sub_ticks: u64, tick_rate: u64) -> u32 {
    debug_assert!(sub_ticks < tick_rate);
    let frac = ((sub_ticks as u128) << 32) / tick_rate as u128;
    if frac >= 1 << 32 {
        u32::MAX
    } else {
        frac as u32
    }
}

/// A non-negative duration in the NTP short format: 16 bits of seconds and
/// 16 bits of binary fraction, as used for root delay and root dispersion.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpShortDuration(u32);

impl NtpShortDuration {
    pub const ZERO: NtpShortDuration = NtpShortDuration(0);

    pub fn from_bits_short(bits: [u8; 4]) -> Self {
        NtpShortDuration(u32::from_be_bytes(bits))
    }

    pub fn to_bits_short(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Whole microseconds to 16.16 fixed point, saturating at the format
    /// maximum (just under 65536 seconds).
    pub fn from_micros(micros: u64) -> Self {
        let fixed = (micros as u128 * 65536) / 1_000_000;
        NtpShortDuration(fixed.min(u32::MAX as u128) as u32)
    }

    pub fn to_micros(&self) -> u64 {
        (self.0 as u64 * 1_000_000) >> 16
    }

    pub fn saturating_add(&self, other: NtpShortDuration) -> NtpShortDuration {
        NtpShortDuration(self.0.saturating_add(other.0))
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_maps_to_ntp_offset() {
        let ts = NtpTimestamp::from_unix(0, 0);
        assert_eq!(ts.seconds() as u64, UNIX_TO_NTP_OFFSET);
        assert_eq!(ts.fraction(), 0);
    }

    #[test]
    fn test_unix_ntp_roundtrip() {
        for &(secs, nanos) in &[
            (0u64, 0u32),
            (1_700_000_000, 0),
            (1_700_000_000, 999_999_999),
            (1_234_567_890, 500_000_000),
        ] {
            let ts = NtpTimestamp::from_unix(secs, nanos);
            let (rsecs, rnanos) = ts.to_unix();
            assert_eq!(rsecs, secs);
            // Fraction conversion truncates; the error is below 1ns.
            assert!(
                (rnanos as i64 - nanos as i64).abs() <= 1,
                "nanos {} -> {}",
                nanos,
                rnanos
            );
        }
    }

    #[test]
    fn test_fraction_half_second() {
        // 0.5 s is exactly 2^31 in binary fraction.
        assert_eq!(nanos_to_fraction(500_000_000), 1 << 31);
        assert_eq!(fraction_to_nanos(1 << 31), 500_000_000);
    }

    #[test]
    fn test_fraction_truncates_toward_zero() {
        // 1 ns is 4.29 fraction units; truncation keeps 4, never 5.
        assert_eq!(nanos_to_fraction(1), 4);
    }

    #[test]
    fn test_ticks_to_fraction_at_1mhz() {
        // Half a second at 1 MHz.
        assert_eq!(ticks_to_fraction(500_000, 1_000_000), 1 << 31);
        // The last representable tick stays just below 2^32.
        let frac = ticks_to_fraction(999_999, 1_000_000);
        assert!(frac > u32::MAX - 5000);
    }

    #[test]
    fn test_timestamp_bits_roundtrip() {
        let ts = NtpTimestamp::new(0xE5F6_63A8, 0x761D_DE48);
        let bits = ts.to_bits();
        assert_eq!(bits, [0xE5, 0xF6, 0x63, 0xA8, 0x76, 0x1D, 0xDE, 0x48]);
        assert_eq!(NtpTimestamp::from_bits(bits), ts);
    }

    #[test]
    fn test_monotonic_wraparound() {
        let before = MonotonicInstant::from_ticks(u64::MAX - 10);
        let after = before.add_ticks(25);
        assert_eq!(after.ticks_since(before), 25);
    }

    #[test]
    fn test_short_duration_micros() {
        // 100 us default dispersion floor.
        let d = NtpShortDuration::from_micros(100);
        // 100e-6 * 65536 = 6.55 -> truncates to 6 fixed-point units.
        assert_eq!(d.as_raw(), 6);

        // One second exactly.
        let one = NtpShortDuration::from_micros(1_000_000);
        assert_eq!(one.as_raw(), 65536);
        assert_eq!(one.to_micros(), 1_000_000);
    }

    #[test]
    fn test_short_duration_saturates() {
        let big = NtpShortDuration::from_micros(u64::MAX / 70000);
        assert_eq!(big.as_raw(), u32::MAX);
        assert_eq!(big.saturating_add(big).as_raw(), u32::MAX);
    }
}
