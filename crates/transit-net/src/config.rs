//! Tunable knobs for a [`crate::NetworkLayer`].

use serde::{Deserialize, Serialize};

/// Configuration for one [`crate::NetworkLayer`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wire serialization delay numerator, in bits/second.
    pub bandwidth_bps: u64,
    /// One-way simulated propagation latency, in milliseconds.
    pub latency_ms: u32,
    /// Wire buffer data arena size, in bytes.
    pub wire_arena_bytes: usize,
    /// Wire buffer slot count.
    pub wire_slot_count: usize,
    /// NIC packet slot count (each direction, each role).
    pub nic_slot_count: usize,
    /// How long a wire/NIC thread sleeps when it has nothing to do.
    pub net_retry_ms: u64,
    /// Percentage (0..100) of packets dropped at the wire→NIC edge.
    pub drop_rate_pct: u8,
    /// Percentage (0..100) of packets duplicated at the wire→NIC edge.
    pub duplicate_rate_pct: u8,
    /// Percentage (0..100) of packets corrupted at the wire→NIC edge.
    pub corrupt_rate_pct: u8,
    /// Whether batches of simultaneously-due packets may be reordered.
    pub reorder_enabled: bool,
    /// Seed for the deterministic perturbation PRNG.
    pub rng_seed: u64,
    /// Whether the NIC→wire thread enforces `packet_bits / bandwidth_bps`
    /// serialization delay. Marked TODO in most source variants; every
    /// correctness property holds with this either `true` or `false`.
    pub enforce_serialization_delay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bandwidth_bps: 100_000_000,
            latency_ms: 20,
            wire_arena_bytes: 16 * 1024 * 1024,
            wire_slot_count: 4096,
            nic_slot_count: 256,
            net_retry_ms: 5,
            drop_rate_pct: 0,
            duplicate_rate_pct: 0,
            corrupt_rate_pct: 0,
            reorder_enabled: false,
            rng_seed: 0,
            enforce_serialization_delay: true,
        }
    }
}

impl NetworkConfig {
    /// Arena size for a NIC ring; sized generously for `nic_slot_count`
    /// maximum-size packets so legitimate traffic never collides with the
    /// reader purely due to arena pressure.
    pub fn nic_arena_bytes(&self) -> usize {
        self.nic_slot_count * transit_wire::MAX_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.bandwidth_bps, 100_000_000);
        assert_eq!(cfg.latency_ms, 20);
        assert_eq!(cfg.wire_arena_bytes, 16 * 1024 * 1024);
        assert!(cfg.nic_slot_count >= 256);
        assert_eq!(cfg.drop_rate_pct, 0);
        assert_eq!(cfg.duplicate_rate_pct, 0);
        assert_eq!(cfg.corrupt_rate_pct, 0);
    }
}
