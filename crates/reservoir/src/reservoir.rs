use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Default capacity when none is configured.
pub const DEFAULT_LIMIT: usize = 10;

/// Fixed-capacity reservoir sampler (Vitter's Algorithm R).
///
/// Maintains an at-most-`limit` subset of an unbounded stream such that every
/// item ever offered has an equal probability of being retained. The first
/// `limit` items are kept directly; after that, each new item replaces a
/// random slot with probability `limit / seen`.
///
/// `add` never blocks and never panics. Retained order is insertion-biased,
/// not time-ordered, once replacements begin.
///
/// # Example
///
/// ```
/// use reservoir::Reservoir;
///
/// let mut sampler = Reservoir::new(10);
/// for i in 0..25u32 {
///     sampler.add(i);
/// }
/// assert_eq!(sampler.len(), 10);
/// assert_eq!(sampler.overflow(), 15);
/// ```
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    limit: usize,
    seen: u64,
    items: Vec<T>,
    rng: SmallRng,
}

impl<T> Reservoir<T> {
    /// Creates a reservoir with the given capacity, seeded from entropy.
    pub fn new(limit: usize) -> Self {
        Self::with_rng(limit, SmallRng::from_entropy())
    }

    /// Creates a reservoir with an explicit RNG (deterministic tests).
    pub fn with_rng(limit: usize, rng: SmallRng) -> Self {
        Self {
            limit,
            seen: 0,
            items: Vec::with_capacity(limit),
            rng,
        }
    }

    /// Offers an item to the reservoir.
    ///
    /// Increments `seen` unconditionally. Until the reservoir is full the
    /// item is appended; afterwards a candidate slot is drawn uniformly from
    /// `[0, seen)` and the item replaces that slot only when it falls inside
    /// the retained range, otherwise it is discarded.
    pub fn add(&mut self, item: T) {
        self.seen += 1;

        if self.items.len() < self.limit {
            self.items.push(item);
        } else if self.limit > 0 {
            let candidate = self.rng.gen_range(0..self.seen) as usize;
            if candidate < self.limit {
                self.items[candidate] = item;
            }
        }

        // Equality with min(seen, limit) holds for pure streams; after a
        // merge-back corrects `seen`, only the bounds hold.
        debug_assert!(
            self.items.len() <= self.limit && self.items.len() as u64 <= self.seen,
            "reservoir size {} exceeds min(seen {}, limit {})",
            self.items.len(),
            self.seen,
            self.limit
        );
    }

    /// Number of items offered but not retained. Pure, no side effect.
    pub fn overflow(&self) -> u64 {
        self.seen.saturating_sub(self.limit as u64)
    }

    /// Total number of items ever offered.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Capacity fixed at construction.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of currently retained items (`min(seen, limit)`).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The retained set, insertion-biased order.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Consumes the reservoir, yielding the retained items.
    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Drains the retained items, resetting `seen` to zero.
    pub fn drain(&mut self) -> Vec<T> {
        self.seen = 0;
        std::mem::take(&mut self.items)
    }

    /// Overwrites the offered-count, used when a harvest merge-back restores
    /// events that were already counted once.
    pub(crate) fn set_seen(&mut self, seen: u64) {
        self.seen = seen.max(self.items.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_capacity_keeps_everything() {
        let mut r = Reservoir::new(10);
        for i in 0..7u32 {
            r.add(i);
        }
        assert_eq!(r.len(), 7);
        assert_eq!(r.overflow(), 0);
        assert_eq!(r.seen(), 7);
        assert_eq!(r.as_slice(), &[0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn over_capacity_is_bounded() {
        let mut r = Reservoir::new(5);
        for i in 0..100u32 {
            r.add(i);
        }
        assert_eq!(r.len(), 5);
        assert_eq!(r.overflow(), 95);
        assert_eq!(r.seen(), 100);
    }

    #[test]
    fn seeded_run_is_deterministic() {
        // End-to-end scenario from the harvest design: limit 10, 25 offers.
        let mut a = Reservoir::with_rng(10, SmallRng::seed_from_u64(42));
        let mut b = Reservoir::with_rng(10, SmallRng::seed_from_u64(42));
        for i in 0..25u32 {
            a.add(i);
            b.add(i);
        }
        assert_eq!(a.len(), 10);
        assert_eq!(a.overflow(), 15);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn zero_limit_discards_everything() {
        let mut r = Reservoir::new(0);
        for i in 0..10u32 {
            r.add(i);
        }
        assert_eq!(r.len(), 0);
        assert_eq!(r.overflow(), 10);
    }

    #[test]
    fn drain_resets_seen() {
        let mut r = Reservoir::new(3);
        for i in 0..8u32 {
            r.add(i);
        }
        let drained = r.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(r.seen(), 0);
        assert_eq!(r.len(), 0);
        assert_eq!(r.overflow(), 0);
    }

    #[test]
    fn replacement_spread_is_roughly_uniform() {
        // With limit 100 and 10_000 offers, each item should be retained
        // with probability ~1%. Check the retained set isn't degenerate
        // (e.g. only early or only late items).
        let mut r = Reservoir::with_rng(100, SmallRng::seed_from_u64(7));
        for i in 0..10_000u32 {
            r.add(i);
        }
        let late = r.as_slice().iter().filter(|&&i| i >= 5_000).count();
        assert!(late > 20, "expected a sampled mix, got {} late items", late);
        assert!(late < 80, "expected a sampled mix, got {} late items", late);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn size_invariant_holds(limit in 0usize..64, count in 0u64..512, seed: u64) {
                let mut r = Reservoir::with_rng(limit, SmallRng::seed_from_u64(seed));
                for i in 0..count {
                    r.add(i);
                }
                prop_assert_eq!(r.len() as u64, count.min(limit as u64));
                prop_assert_eq!(r.overflow(), count.saturating_sub(limit as u64));
                prop_assert_eq!(r.seen(), count);
            }
        }
    }
}
