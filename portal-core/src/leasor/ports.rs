use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::PortRange;

/// Auto-port allocator: a permutation of `[range.start, range.end]` handed
/// out head-first and replenished tail-first, per §4.1.
///
/// A lease on a port is released back to the pool only when the port lies
/// inside `range`; fixed ports never enter or leave this structure.
pub struct PortPool {
    range: PortRange,
    queue: VecDeque<u16>,
}

impl PortPool {
    /// Build a pool seeded deterministically from `seed`, so tests can run
    /// leasors in parallel with reproducible port draws (§9 "Global mutable
    /// state").
    pub fn new(range: PortRange, seed: u64) -> Self {
        let mut offsets: Vec<u16> = (0..range.len() as u16).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        offsets.shuffle(&mut rng);
        let queue = offsets.into_iter().map(|o| range.start + o).collect();
        Self { range, queue }
    }

    /// Draw the next unused port, skipping any already held by a live
    /// lease (e.g. after a reload where a persisted registration already
    /// occupies it). Returns `None` when the pool is exhausted.
    pub fn acquire(&mut self, is_held: impl Fn(u16) -> bool) -> Option<u16> {
        let len = self.queue.len();
        for _ in 0..len {
            let candidate = self.queue.pop_front()?;
            if is_held(candidate) {
                self.queue.push_back(candidate);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Return a port to the tail of the queue. No-op for ports outside the
    /// auto range (fixed ports never belonged to this pool).
    pub fn release(&mut self, port: u16) {
        if self.range.contains(port) {
            self.queue.push_back(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_draws_from_range_and_is_exhaustible() {
        let range = PortRange { start: 9000, end: 9002 };
        let mut pool = PortPool::new(range, 42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let p = pool.acquire(|_| false).expect("pool should not be empty yet");
            assert!(range.contains(p));
            assert!(seen.insert(p), "ports must not repeat before being released");
        }
        assert!(pool.acquire(|_| false).is_none());
    }

    #[test]
    fn release_and_reacquire_round_trips() {
        let range = PortRange { start: 9000, end: 9000 };
        let mut pool = PortPool::new(range, 1);
        let p = pool.acquire(|_| false).unwrap();
        assert!(pool.acquire(|_| false).is_none());
        pool.release(p);
        assert_eq!(pool.acquire(|_| false), Some(p));
    }

    #[test]
    fn acquire_skips_already_held_ports() {
        let range = PortRange { start: 9000, end: 9001 };
        let mut pool = PortPool::new(range, 7);
        let held = 9000u16;
        let p = pool.acquire(|port| port == held).unwrap();
        assert_ne!(p, held);
    }

    #[test]
    fn release_ignores_ports_outside_range() {
        let range = PortRange { start: 9000, end: 9000 };
        let mut pool = PortPool::new(range, 3);
        pool.acquire(|_| false).unwrap();
        pool.release(12345);
        assert!(pool.acquire(|_| false).is_none());
    }
}
