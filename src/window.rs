//! Lock-free sliding window of fixed time buckets.
//!
//! Each bucket slot packs an epoch tag and a count into one `AtomicU64`, so moving a slot to a new
//! epoch and counting into it is a single compare-and-swap: an event lands in exactly one bucket,
//! a stale bucket is never added to a fresh one, and nothing is counted twice.
//!
//! `N` independent counters share the same bucket geometry (the sampler uses one, delivery stats
//! use two: attempts and failures).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const COUNT_BITS: u32 = 40;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const TAG_MASK: u64 = (1 << (64 - COUNT_BITS)) - 1;

#[derive(Debug)]
pub(crate) struct SlidingWindow<const N: usize> {
    slots: Box<[[AtomicU64; N]]>,
    bucket_millis: u64,
    window: Duration,
}

impl<const N: usize> SlidingWindow<N> {
    pub(crate) fn new(window: Duration, segments: u32) -> Self {
        let segments = segments.max(1);
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let bucket_millis = (window_millis / u64::from(segments)).max(1);
        let slots = (0..segments)
            .map(|_| std::array::from_fn(|_| AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots, bucket_millis, window }
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn segments(&self) -> usize {
        self.slots.len()
    }

    /// Add `n` to counter `counter` in the bucket covering `now_millis`.
    pub(crate) fn record(&self, now_millis: u64, counter: usize, n: u64) {
        let epoch = now_millis / self.bucket_millis;
        let tag = epoch & TAG_MASK;
        let cell = &self.slots[self.index(epoch)][counter];
        let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
            let count = if packed >> COUNT_BITS == tag { packed & COUNT_MASK } else { 0 };
            Some((tag << COUNT_BITS) | count.saturating_add(n).min(COUNT_MASK))
        });
    }

    /// Sum of counter `counter` over the buckets still inside the window at `now_millis`.
    pub(crate) fn total(&self, now_millis: u64, counter: usize) -> u64 {
        let current = now_millis / self.bucket_millis;
        let mut sum = 0;
        for back in 0..self.slots.len() as u64 {
            let Some(epoch) = current.checked_sub(back) else { break };
            let packed = self.slots[self.index(epoch)][counter].load(Ordering::Acquire);
            if packed >> COUNT_BITS == epoch & TAG_MASK {
                sum += packed & COUNT_MASK;
            }
        }
        sum
    }

    /// Zero every bucket whose epoch has left the window. Returns how many were cleared.
    pub(crate) fn rotate(&self, now_millis: u64) -> usize {
        let current = now_millis / self.bucket_millis;
        let oldest = current.saturating_sub(self.slots.len() as u64 - 1);
        let mut cleared = 0;
        for row in self.slots.iter() {
            for cell in row {
                let packed = cell.load(Ordering::Acquire);
                if packed & COUNT_MASK == 0 {
                    continue;
                }
                if !self.is_live(packed >> COUNT_BITS, oldest, current) {
                    // a concurrent record into a fresh epoch wins over the clear
                    if cell
                        .compare_exchange(packed, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }

    fn is_live(&self, tag: u64, oldest: u64, current: u64) -> bool {
        (oldest..=current).any(|epoch| epoch & TAG_MASK == tag)
    }

    fn index(&self, epoch: u64) -> usize {
        (epoch % self.slots.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window() {
        let w = SlidingWindow::<1>::new(Duration::from_secs(60), 6);
        for _ in 0..10 {
            w.record(1_000, 0, 1);
        }
        w.record(15_000, 0, 5);
        assert_eq!(w.total(15_000, 0), 15);
    }

    #[test]
    fn old_buckets_fall_out() {
        let w = SlidingWindow::<1>::new(Duration::from_secs(60), 6);
        w.record(0, 0, 100);
        w.record(30_000, 0, 7);

        assert_eq!(w.total(59_999, 0), 107);
        // bucket 0 (0..10s) leaves the window once bucket 6 starts
        assert_eq!(w.total(60_000, 0), 7);
        assert_eq!(w.total(95_000, 0), 0);
    }

    #[test]
    fn reused_slot_starts_from_zero() {
        let w = SlidingWindow::<1>::new(Duration::from_secs(60), 6);
        w.record(0, 0, 100);
        // same slot index, next lap
        w.record(60_000, 0, 1);
        assert_eq!(w.total(60_000, 0), 1);
    }

    #[test]
    fn rotate_clears_expired_buckets_only() {
        let w = SlidingWindow::<2>::new(Duration::from_secs(60), 6);
        w.record(0, 0, 3);
        w.record(0, 1, 1);
        w.record(50_000, 0, 2);

        assert_eq!(w.rotate(59_000), 0);
        assert_eq!(w.rotate(70_000), 2);
        assert_eq!(w.total(70_000, 0), 2);
        assert_eq!(w.total(70_000, 1), 0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let w = std::sync::Arc::new(SlidingWindow::<1>::new(Duration::from_secs(60), 6));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let w = w.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        w.record(5_000, 0, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(w.total(5_000, 0), 4_000);
    }
}
