use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Randomness consumed while compiling `$sample` defaults.
///
/// Passed to the compiler explicitly so tests and reproducible runs can pin
/// the sequence.
pub trait RandomSource: Send + Sync {
    /// A value in `[0, bound)`. `bound` is never zero.
    fn next_below(&self, bound: u64) -> u64;
}

/// Thread-local OS-seeded generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_below(&self, bound: u64) -> u64 {
        rand::rng().random_range(0..bound.max(1))
    }
}

/// Deterministic generator seeded once.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_below(&self, bound: u64) -> u64 {
        self.rng.lock().random_range(0..bound.max(1))
    }
}

/// Cycles through a fixed list of values, each reduced modulo `bound`.
pub struct FixedSequence {
    values: Vec<u64>,
    cursor: AtomicUsize,
}

impl FixedSequence {
    pub fn new(values: impl Into<Vec<u64>>) -> Self {
        Self {
            values: values.into(),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for FixedSequence {
    fn next_below(&self, bound: u64) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.values.len();
        self.values[i] % bound.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_random_stays_in_range() {
        let r = ThreadRandom;
        for _ in 0..200 {
            assert!(r.next_below(100) < 100);
        }
        assert_eq!(r.next_below(1), 0);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let a = SeededRandom::new(7);
        let b = SeededRandom::new(7);
        let xs: Vec<u64> = (0..10).map(|_| a.next_below(100)).collect();
        let ys: Vec<u64> = (0..10).map(|_| b.next_below(100)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn fixed_sequence_cycles() {
        let r = FixedSequence::new(vec![3, 150, 42]);
        assert_eq!(r.next_below(100), 3);
        assert_eq!(r.next_below(100), 50);
        assert_eq!(r.next_below(100), 42);
        assert_eq!(r.next_below(100), 3);
    }

    #[test]
    fn empty_fixed_sequence_yields_zero() {
        let r = FixedSequence::new(Vec::new());
        assert_eq!(r.next_below(100), 0);
    }
}
