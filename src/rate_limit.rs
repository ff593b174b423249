//! Per-source rate limiting for the NTP responder.
//!
//! Classic token bucket, one per source address, in a fixed-size table with
//! LRU eviction. All bookkeeping runs on the monotonic counter so a clock
//! that is still warming up cannot distort credit accounting.

use crate::time_types::MonotonicInstant;
use log::debug;
use std::net::Ipv4Addr;

/// Default bucket capacity (burst allowance) in tokens.
pub const DEFAULT_CAPACITY: u32 = 8;
/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SEC: u32 = 1;
/// Default number of table slots.
pub const DEFAULT_TABLE_SLOTS: usize = 64;

#[derive(Debug, Copy, Clone)]
struct Bucket {
    addr: Ipv4Addr,
    tokens: u32,
    /// Credit accrual position; advanced only by whole earned tokens so
    /// fractional credit is never lost between checks.
    refill_mark: MonotonicInstant,
    last_seen: MonotonicInstant,
}

pub struct RateLimiter {
    slots: Vec<Option<Bucket>>,
    capacity: u32,
    refill_per_sec: u32,
    tick_rate: u64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32, table_slots: usize, tick_rate_hz: u64) -> Self {
        assert!(capacity > 0 && refill_per_sec > 0 && table_slots > 0);
        RateLimiter {
            slots: vec![None; table_slots.max(1)],
            capacity,
            refill_per_sec,
            tick_rate: tick_rate_hz,
        }
    }

    pub fn with_defaults(tick_rate_hz: u64) -> Self {
        Self::new(
            DEFAULT_CAPACITY,
            DEFAULT_REFILL_PER_SEC,
            DEFAULT_TABLE_SLOTS,
            tick_rate_hz,
        )
    }

    /// Charge one request from `addr` at instant `now`. Returns whether the
    /// request may be answered. The same `now` is used for refill and
    /// consumption, keeping the decision monotone.
    pub fn check(&mut self, addr: Ipv4Addr, now: MonotonicInstant) -> bool {
        if let Some(index) = self.find(addr) {
            let bucket = self.slots[index].as_mut().unwrap();
            Self::refill(bucket, now, self.capacity, self.refill_per_sec, self.tick_rate);
            bucket.last_seen = now;
            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                return true;
            }
            return false;
        }

        // New source: take a free slot, or evict the least recently seen
        // entry, but only one idle for a full refill-to-capacity window.
        // A table saturated with active sources answers no new ones; that
        // is the correct posture under an address-spraying flood.
        let index = match self.free_or_evictable(now) {
            Some(index) => index,
            None => {
                debug!("[RateLimit] table saturated, denying new source {}", addr);
                return false;
            }
        };
        self.slots[index] = Some(Bucket {
            addr,
            // A fresh bucket starts full; the first request spends one.
            tokens: self.capacity - 1,
            refill_mark: now,
            last_seen: now,
        });
        true
    }

    /// Number of live table entries, for the status surface.
    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn find(&self, addr: Ipv4Addr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.map(|bucket| bucket.addr) == Some(addr))
    }

    fn free_or_evictable(&mut self, now: MonotonicInstant) -> Option<usize> {
        if let Some(index) = self.slots.iter().position(|slot| slot.is_none()) {
            return Some(index);
        }

        // An entry idle longer than this has refilled to capacity; evicting
        // it cannot take away credit the source could still have spent.
        let refill = self.refill_per_sec as u64;
        let idle_window_ticks = (self.capacity as u64 * self.tick_rate + refill - 1) / refill;

        let mut oldest: Option<(usize, u64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let bucket = slot.as_ref().unwrap();
            let idle = now.ticks_since(bucket.last_seen);
            if idle >= idle_window_ticks {
                match oldest {
                    Some((_, best)) if best >= idle => {}
                    _ => oldest = Some((index, idle)),
                }
            }
        }
        oldest.map(|(index, _)| index)
    }

    fn refill(
        bucket: &mut Bucket,
        now: MonotonicInstant,
        capacity: u32,
        refill_per_sec: u32,
        tick_rate: u64,
    ) {
        let elapsed = now.ticks_since(bucket.refill_mark);
        let earned = (elapsed as u128 * refill_per_sec as u128 / tick_rate as u128) as u64;
        if earned == 0 {
            return;
        }
        let new_tokens = (bucket.tokens as u64 + earned).min(capacity as u64) as u32;
        if new_tokens == capacity {
            // Full bucket: fractional progress toward the next token is moot.
            bucket.refill_mark = now;
        } else {
            let consumed_ticks = earned * tick_rate / refill_per_sec as u64;
            bucket.refill_mark = bucket.refill_mark.add_ticks(consumed_ticks);
        }
        bucket.tokens = new_tokens;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u64 = 1_000_000;

    fn mono(ticks: u64) -> MonotonicInstant {
        MonotonicInstant::from_ticks(ticks)
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, last)
    }

    #[test]
    fn test_burst_limited_to_capacity() {
        let mut limiter = RateLimiter::new(8, 1, 64, RATE);
        let mut allowed = 0;
        let mut denied = 0;
        // 16 requests within one second.
        for i in 0..16u64 {
            if limiter.check(addr(1), mono(i * 50_000)) {
                allowed += 1;
            } else {
                denied += 1;
            }
        }
        assert_eq!(allowed, 8);
        assert_eq!(denied, 8);
    }

    #[test]
    fn test_refill_one_token_per_second() {
        let mut limiter = RateLimiter::new(8, 1, 64, RATE);
        for i in 0..8u64 {
            assert!(limiter.check(addr(1), mono(i)));
        }
        assert!(!limiter.check(addr(1), mono(100)));

        // 999 ms later: still dry.
        assert!(!limiter.check(addr(1), mono(999_000)));
        // Past one second since the bucket drained: exactly one token back.
        assert!(limiter.check(addr(1), mono(1_000_001)));
        assert!(!limiter.check(addr(1), mono(1_000_002)));
    }

    #[test]
    fn test_steady_state_rate_matches_refill() {
        let mut limiter = RateLimiter::new(8, 1, 64, RATE);
        // Drain the burst allowance.
        for i in 0..8u64 {
            limiter.check(addr(1), mono(i));
        }
        // Hammer with 10 requests per second for 10 seconds; only the
        // refill rate (1/s) should get through.
        let mut allowed = 0;
        for i in 1..=100u64 {
            let t = i * 100_000; // every 100 ms
            if limiter.check(addr(1), mono(t)) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_sources_are_independent() {
        let mut limiter = RateLimiter::new(2, 1, 64, RATE);
        assert!(limiter.check(addr(1), mono(0)));
        assert!(limiter.check(addr(1), mono(1)));
        assert!(!limiter.check(addr(1), mono(2)));
        // A different source still has its full burst.
        assert!(limiter.check(addr(2), mono(3)));
        assert!(limiter.check(addr(2), mono(4)));
    }

    #[test]
    fn test_lru_eviction_spares_active_entries() {
        let mut limiter = RateLimiter::new(2, 1, 4, RATE);
        // Fill the table: sources 1..=4 at t=0.
        for last in 1..=4u8 {
            assert!(limiter.check(addr(last), mono(last as u64)));
        }
        assert_eq!(limiter.occupancy(), 4);

        // Half a second later every entry is inside the refill window
        // (capacity 2 / refill 1 = 2 s): a new source must be denied, not
        // given a recycled slot.
        assert!(!limiter.check(addr(9), mono(500_000)));
        assert_eq!(limiter.occupancy(), 4);

        // Keep sources 2..=4 warm past the window, leave source 1 idle.
        for last in 2..=4u8 {
            limiter.check(addr(last), mono(2_500_000 + last as u64));
        }
        // Now the idle entry may be evicted for the newcomer.
        assert!(limiter.check(addr(9), mono(2_600_000)));
        assert_eq!(limiter.occupancy(), 4);
        // Source 1 lost its slot; the warm ones kept theirs.
        assert!(limiter.find(addr(1)).is_none());
        assert!(limiter.find(addr(3)).is_some());
    }

    #[test]
    fn test_fractional_credit_not_lost() {
        let mut limiter = RateLimiter::new(4, 1, 8, RATE);
        for i in 0..4u64 {
            limiter.check(addr(1), mono(i));
        }
        // Two checks 600 ms apart: neither alone earns a token, together
        // they do.
        assert!(!limiter.check(addr(1), mono(600_000)));
        assert!(limiter.check(addr(1), mono(1_200_000)));
    }
}
