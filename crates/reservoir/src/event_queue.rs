use crate::reservoir::{Reservoir, DEFAULT_LIMIT};
use rand::rngs::SmallRng;

/// A [`Reservoir`] plus the bookkeeping every telemetry producer needs.
///
/// All unbounded event streams (error events, custom events, analytics
/// events, span events) share this representation: "at most N events,
/// statistically representative of all events seen". On top of the sampler
/// it provides harvest-boundary draining, merge-back of events returned by
/// a failed harvest, and splitting into bounded payload segments.
#[derive(Debug, Clone)]
pub struct EventQueue<T> {
    reservoir: Reservoir<T>,
}

/// One outbound payload segment drained from an [`EventQueue`].
///
/// Each segment independently carries the sampler state (`seen`, `limit`)
/// it represents, so a segment whose send failed can be merged back on its
/// own without disturbing segments that were already delivered.
#[derive(Debug, Clone)]
pub struct EventSegment<T> {
    pub events: Vec<T>,
    pub seen: u64,
    pub limit: usize,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl<T> EventQueue<T> {
    /// Creates a queue holding at most `limit` events.
    pub fn new(limit: usize) -> Self {
        Self {
            reservoir: Reservoir::new(limit),
        }
    }

    /// Creates a queue with an explicit RNG (deterministic tests).
    pub fn with_rng(limit: usize, rng: SmallRng) -> Self {
        Self {
            reservoir: Reservoir::with_rng(limit, rng),
        }
    }

    /// Offers an event; never blocks, never fails.
    pub fn add(&mut self, event: T) {
        self.reservoir.add(event);
    }

    pub fn len(&self) -> usize {
        self.reservoir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservoir.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.reservoir.limit()
    }

    pub fn seen(&self) -> u64 {
        self.reservoir.seen()
    }

    /// Events offered but not retained.
    pub fn overflow(&self) -> u64 {
        self.reservoir.overflow()
    }

    /// Currently retained events, insertion-biased order.
    pub fn as_slice(&self) -> &[T] {
        self.reservoir.as_slice()
    }

    /// Drains the queue for a harvest snapshot, leaving it empty.
    ///
    /// Returns the retained events together with the `seen` count they
    /// represent.
    pub fn take(&mut self) -> (Vec<T>, u64) {
        let seen = self.reservoir.seen();
        (self.reservoir.drain(), seen)
    }

    /// Merges events returned by a failed harvest back into the live queue.
    ///
    /// Restored events re-enter through the sampler so the capacity bound
    /// holds even when live producers raced ahead; afterwards `seen` is
    /// corrected to count every original offer exactly once (re-offers are
    /// not new events).
    pub fn merge(&mut self, events: Vec<T>, seen: u64) {
        let live_seen = self.reservoir.seen();
        for event in events {
            self.reservoir.add(event);
        }
        // The segment's `seen` already counts the restored events, so the
        // re-offer increments from the adds above are discarded here.
        self.reservoir.set_seen(live_seen + seen);
    }

    /// Drains the queue into bounded payload segments.
    ///
    /// A queue under one third of capacity becomes a single segment carrying
    /// everything; otherwise it is split into two equal halves (by count, by
    /// capacity and by seen, first half taking the remainders) so no single
    /// outbound payload is unboundedly large. An empty queue yields no
    /// segments, and a single retained event never splits.
    pub fn split_for_harvest(&mut self) -> Vec<EventSegment<T>> {
        let limit = self.reservoir.limit();
        let (events, seen) = self.take();
        if events.is_empty() {
            return Vec::new();
        }

        // Multiplied-out form of `len < limit / 3` so the comparison is
        // exact rather than floored; a single event never splits either,
        // or the second half would be an empty segment.
        if events.len() * 3 < limit || events.len() < 2 {
            return vec![EventSegment {
                events,
                seen,
                limit,
            }];
        }

        let mut first = events;
        let second = first.split_off(first.len() / 2 + first.len() % 2);
        let second_seen = seen / 2;
        let second_limit = limit / 2;
        vec![
            EventSegment {
                events: first,
                seen: seen - second_seen,
                limit: limit - second_limit,
            },
            EventSegment {
                events: second,
                seen: second_seen,
                limit: second_limit,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn bookkeeping_tracks_the_reservoir() {
        let mut q = EventQueue::new(10);
        for i in 0..25u32 {
            q.add(i);
        }
        assert_eq!(q.len(), 10);
        assert_eq!(q.seen(), 25);
        assert_eq!(q.overflow(), 15);
    }

    #[test]
    fn take_leaves_a_fresh_queue() {
        let mut q = EventQueue::new(10);
        for i in 0..4u32 {
            q.add(i);
        }
        let (events, seen) = q.take();
        assert_eq!(events, vec![0, 1, 2, 3]);
        assert_eq!(seen, 4);
        assert!(q.is_empty());
        assert_eq!(q.seen(), 0);
        assert_eq!(q.limit(), 10);
    }

    #[test]
    fn merge_restores_events_and_seen() {
        let mut q = EventQueue::new(10);
        for i in 0..4u32 {
            q.add(i);
        }
        let (events, seen) = q.take();

        // Two new live events arrive while the harvest is in flight.
        q.add(100);
        q.add(101);

        q.merge(events, seen);
        assert_eq!(q.len(), 6);
        assert_eq!(q.seen(), 6);
    }

    #[test]
    fn merge_respects_capacity() {
        let mut q = EventQueue::with_rng(4, SmallRng::seed_from_u64(3));
        for i in 0..4u32 {
            q.add(i);
        }
        let (events, seen) = q.take();
        for i in 10..14u32 {
            q.add(i);
        }
        q.merge(events, seen);
        assert_eq!(q.len(), 4);
        assert_eq!(q.seen(), 8);
        assert_eq!(q.overflow(), 4);
    }

    #[test]
    fn small_queue_stays_whole() {
        let mut q = EventQueue::new(100);
        for i in 0..10u32 {
            q.add(i);
        }
        let segments = q.split_for_harvest();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].events.len(), 10);
        assert_eq!(segments[0].seen, 10);
        assert_eq!(segments[0].limit, 100);
        assert!(q.is_empty());
    }

    #[test]
    fn large_queue_splits_in_half() {
        let mut q = EventQueue::new(100);
        for i in 0..51u32 {
            q.add(i);
        }
        let segments = q.split_for_harvest();
        assert_eq!(segments.len(), 2);
        // First half carries the odd item and the remainders.
        assert_eq!(segments[0].events.len(), 26);
        assert_eq!(segments[1].events.len(), 25);
        assert_eq!(segments[0].seen + segments[1].seen, 51);
        assert_eq!(segments[0].limit + segments[1].limit, 100);
    }

    #[test]
    fn exactly_under_one_third_stays_whole() {
        // 3 retained of limit 10 is under a third of capacity (3 < 10/3),
        // even though integer division would say otherwise.
        let mut q = EventQueue::new(10);
        for i in 0..3u32 {
            q.add(i);
        }
        let segments = q.split_for_harvest();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].events.len(), 3);
        assert_eq!(segments[0].limit, 10);
    }

    #[test]
    fn tiny_limits_never_emit_an_empty_segment() {
        for limit in 1..=3usize {
            let mut q = EventQueue::new(limit);
            for i in 0..limit as u32 {
                q.add(i);
            }
            let segments = q.split_for_harvest();
            assert!(
                segments.iter().all(|s| !s.events.is_empty()),
                "limit {limit} produced an empty segment"
            );
            assert!(segments.iter().all(|s| s.limit > 0));
        }
    }

    #[test]
    fn empty_queue_yields_no_segments() {
        let mut q = EventQueue::<u32>::new(10);
        assert!(q.split_for_harvest().is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_conserves_events_and_seen(
                limit in 1usize..64,
                count in 0u64..256,
                seed: u64,
            ) {
                let mut q = EventQueue::with_rng(limit, SmallRng::seed_from_u64(seed));
                for i in 0..count {
                    q.add(i);
                }
                let retained = q.len();
                let seen = q.seen();
                let segments = q.split_for_harvest();
                let total: usize = segments.iter().map(|s| s.events.len()).sum();
                let total_seen: u64 = segments.iter().map(|s| s.seen).sum();
                prop_assert_eq!(total, retained);
                prop_assert!(segments.iter().all(|s| !s.events.is_empty()));
                if retained > 0 {
                    prop_assert_eq!(total_seen, seen);
                    prop_assert!(segments.len() <= 2);
                }
            }

            #[test]
            fn merge_round_trip_restores_counts(
                limit in 1usize..32,
                count in 1u64..128,
                seed: u64,
            ) {
                let mut q = EventQueue::with_rng(limit, SmallRng::seed_from_u64(seed));
                for i in 0..count {
                    q.add(i);
                }
                let before_len = q.len();
                let before_seen = q.seen();
                let (events, seen) = q.take();
                q.merge(events, seen);
                prop_assert_eq!(q.len(), before_len);
                prop_assert_eq!(q.seen(), before_seen);
            }
        }
    }
}
