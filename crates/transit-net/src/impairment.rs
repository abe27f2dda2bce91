//! Seeded-PRNG perturbation applied at the wire→NIC edge.
//!
//! Mirrors the knob shape of a `tc netem`-style impairment configuration
//! (delay/loss/duplicate/corrupt/reorder) but is evaluated entirely
//! in-process against a seeded [`rand::rngs::SmallRng`] so scenarios are
//! reproducible without touching the network stack.

use rand::rngs::SmallRng;
use rand::RngExt as _;

/// Roll a `pct` (0..100) percent chance, consuming one RNG draw.
fn roll_pct(rng: &mut SmallRng, pct: u8) -> bool {
    if pct == 0 {
        return false;
    }
    if pct >= 100 {
        return true;
    }
    rng.random::<f64>() * 100.0 < pct as f64
}

pub fn roll_drop(rng: &mut SmallRng, drop_rate_pct: u8) -> bool {
    roll_pct(rng, drop_rate_pct)
}

pub fn roll_duplicate(rng: &mut SmallRng, duplicate_rate_pct: u8) -> bool {
    roll_pct(rng, duplicate_rate_pct)
}

/// Flip a single random byte of `bytes` in place if the corrupt roll hits.
/// Corruption is applied to the raw wire bytes, after the header has
/// already been written, so it can land in header or payload alike — the
/// core makes no integrity guarantee for simulator-injected corruption.
pub fn maybe_corrupt(rng: &mut SmallRng, bytes: &mut [u8], corrupt_rate_pct: u8) {
    if bytes.is_empty() || !roll_pct(rng, corrupt_rate_pct) {
        return;
    }
    let idx = (rng.random::<u32>() as usize) % bytes.len();
    let bit = 1u8 << (rng.random::<u32>() % 8);
    bytes[idx] ^= bit;
}
