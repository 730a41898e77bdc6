//! Thread-local randomness.
//!
//! Sampling and stripe selection need cheap, statistically-decent random
//! numbers, not cryptographic ones.  Each thread owns a [`Lcg`] seeded from
//! a global seeder that advances by a fixed odd increment per thread, so
//! streams are distinct without coordination beyond a single `fetch_add`.

use rand::{Error, RngCore, SeedableRng};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

// MMIX multiplier/increment (Knuth).
const MULTIPLIER: u64 = 6364136223846793005;
const INCREMENT: u64 = 1442695040888963407;

// Odd, so successive seeds walk the full 2^64 ring. (The high word of
// sqrt(2), picked for no deeper reason than being a fixed nothing-up-my-
// sleeve constant.)
const SEED_STEP: u64 = 0x6a09e667f3bcc909;

/// A 64-bit linear congruential generator.
///
/// Not cryptographically secure.  Implements [`RngCore`] so it composes
/// with the `rand` ecosystem where needed.
pub struct Lcg {
    state: u64,
}

impl Lcg {
    /// Creates a generator from a raw seed.
    pub fn new(seed: u64) -> Lcg {
        Lcg { state: seed }
    }
}

impl RngCore for Lcg {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        self.state
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Lcg {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Lcg {
        Lcg::new(u64::from_le_bytes(seed))
    }
}

fn next_seed() -> u64 {
    static SEEDER: OnceLock<AtomicU64> = OnceLock::new();
    let seeder = SEEDER.get_or_init(|| AtomicU64::new(rand::rngs::OsRng.next_u64()));
    seeder.fetch_add(SEED_STEP, Ordering::Relaxed)
}

thread_local! {
    static LOCAL: UnsafeCell<Lcg> = UnsafeCell::new(Lcg::new(next_seed()));
}

fn with_local<T>(f: impl FnOnce(&mut Lcg) -> T) -> T {
    LOCAL.with(|rng| {
        // SAFETY: the value is thread-local and the reference never
        // escapes the closure executing on this thread.
        f(unsafe { &mut *rng.get() })
    })
}

/// Returns the next random value in `[0, 2^63)`.
pub fn next() -> i64 {
    with_local(|rng| (rng.next_u64() >> 1) as i64)
}

/// Returns a uniform `f64` in `(0, 1]`.
pub fn next_double() -> f64 {
    // 53 significant bits, shifted up by one ulp so 0.0 is excluded and
    // 1.0 included.
    with_local(|rng| ((rng.next_u64() >> 11) + 1) as f64 * (1.0 / (1u64 << 53) as f64))
}

#[cfg(test)]
mod tests {
    use super::{next, next_double, Lcg};
    use rand::RngCore;

    #[test]
    fn test_next_is_nonnegative() {
        for _ in 0..10_000 {
            assert!(next() >= 0);
        }
    }

    #[test]
    fn test_next_double_in_half_open_unit() {
        for _ in 0..10_000 {
            let value = next_double();
            assert!(value > 0.0);
            assert!(value <= 1.0);
        }
    }

    #[test]
    fn test_streams_differ_across_threads() {
        let here: Vec<i64> = (0..8).map(|_| next()).collect();
        let there = std::thread::spawn(|| (0..8).map(|_| next()).collect::<Vec<i64>>())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_lcg_is_deterministic_per_seed() {
        let mut a = Lcg::new(42);
        let mut b = Lcg::new(42);
        let mut c = Lcg::new(43);
        let from_a: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
        let from_b: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
        let from_c: Vec<u64> = (0..4).map(|_| c.next_u64()).collect();
        assert_eq!(from_a, from_b);
        assert_ne!(from_a, from_c);
    }
}
