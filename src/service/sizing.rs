//! Grow/shrink decisions for dynamic pools.
//!
//! Pure bookkeeping with no I/O; the pool reactor feeds it member and free
//! counts and applies the returned deltas.

use std::time::Duration;

use tokio::time::Instant;

/// Hysteresis state of one pool.
#[derive(Debug, Clone)]
pub struct PoolSizer {
    min: usize,
    max: usize,
    cooldown: Duration,
    shrink_after: Option<Instant>,
}

impl PoolSizer {
    /// Creates a sizer keeping the pool within `min..=max` members.
    #[must_use]
    pub fn new(min: usize, max: usize, cooldown: Duration) -> Self {
        Self {
            min,
            max,
            cooldown,
            shrink_after: None,
        }
    }

    /// Returns `true` while shrinking is suppressed.
    #[must_use]
    pub fn cooling_down(&self, now: Instant) -> bool {
        self.shrink_after.is_some_and(|until| now < until)
    }

    /// Number of workers to add when no worker is free.
    ///
    /// Doubles the pool, capped at `max`. Any growth arms the cooldown.
    pub fn grow(&mut self, members: usize, now: Instant) -> usize {
        if members >= self.max {
            return 0;
        }
        let target = self.max.min((2 * members).max(1));
        self.shrink_after = Some(now + self.cooldown);
        target - members
    }

    /// Number of free workers to remove.
    ///
    /// Shrinks only above `min`, when more than half the pool is free and the
    /// cooldown has elapsed; removes at most half the free workers and never
    /// goes below `min`. Any shrink re-arms the cooldown.
    pub fn shrink(&mut self, members: usize, free: usize, now: Instant) -> usize {
        if members <= self.min || free <= members / 2 || self.cooling_down(now) {
            return 0;
        }
        let remove = (members - self.min).min(free / 2);
        if remove > 0 {
            self.shrink_after = Some(now + self.cooldown);
        }
        remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(10);

    #[test]
    fn grow_doubles_up_to_max() {
        let now = Instant::now();
        let mut sizer = PoolSizer::new(5, 50, COOLDOWN);
        assert_eq!(sizer.grow(5, now), 5);
        assert_eq!(sizer.grow(10, now), 10);
        assert_eq!(sizer.grow(20, now), 20);
        assert_eq!(sizer.grow(40, now), 10);
        assert_eq!(sizer.grow(50, now), 0);
    }

    #[test]
    fn grow_from_empty_adds_one() {
        let mut sizer = PoolSizer::new(0, 4, COOLDOWN);
        assert_eq!(sizer.grow(0, Instant::now()), 1);
    }

    #[test]
    fn shrink_waits_for_cooldown_after_grow() {
        let start = Instant::now();
        let mut sizer = PoolSizer::new(5, 50, COOLDOWN);
        let added = sizer.grow(5, start);
        assert_eq!(added, 5);
        // Everything free, but still cooling down.
        assert_eq!(sizer.shrink(10, 10, start + Duration::from_secs(9)), 0);
        assert_eq!(sizer.shrink(10, 10, start + COOLDOWN), 5);
    }

    #[test]
    fn shrink_requires_more_than_half_free() {
        let now = Instant::now();
        let mut sizer = PoolSizer::new(5, 50, COOLDOWN);
        assert_eq!(sizer.shrink(20, 10, now), 0);
        assert_eq!(sizer.shrink(20, 11, now), 5);
    }

    #[test]
    fn shrink_never_goes_below_min() {
        let now = Instant::now();
        let mut sizer = PoolSizer::new(8, 50, Duration::ZERO);
        assert_eq!(sizer.shrink(10, 10, now), 2);
        assert_eq!(sizer.shrink(8, 8, now), 0);
    }

    #[test]
    fn shrink_sequence_converges_to_min() {
        let mut now = Instant::now();
        let mut sizer = PoolSizer::new(5, 50, COOLDOWN);
        let mut members = 40;
        let mut steps = Vec::new();
        while let removed @ 1.. = sizer.shrink(members, members, now) {
            members -= removed;
            steps.push(members);
            now += COOLDOWN;
        }
        assert_eq!(steps, vec![20, 10, 5]);
    }
}
