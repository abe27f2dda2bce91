//! Ambient configuration layer for the transport engine, matching the
//! externally-tunable options table.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use transit_net::NetworkConfig;
use transit_wire::MAX_PAYLOAD_SIZE;

/// Sender/receiver engine tunables. `network` nests the simulator's own
/// configuration so a single TOML file can describe an entire scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default timeout `receive_transmission` uses when the caller doesn't
    /// override it.
    pub packet_wait_time_ms: u64,
    /// Cadence of the sender's retransmit-pass loop. Defaults to
    /// `2 * network.latency_ms`, recomputed on `Default` — override after
    /// construction if `network.latency_ms` is customized and the 2x
    /// relationship should be preserved.
    pub retry_interval_ms: u64,
    /// Overall wall-clock budget for one `send_transmission` call before it
    /// gives up and returns `Err(TransportError::Timeout)`.
    pub send_timeout_ms: u64,
    /// How many minion/worker threads feed the sender's packetize-and-push
    /// loop.
    pub sender_worker_threads: usize,
    /// Emit a COMM_PACKET after this many newly-received data packets.
    pub ack_every_n_packets: u32,
    /// Emit a COMM_PACKET after this many milliseconds even if
    /// `ack_every_n_packets` hasn't been reached, as long as something is
    /// outstanding.
    pub ack_every_ms: u64,
    /// Depth of the bounded cache between the inbound NIC drainer and the
    /// reassembler.
    pub reassembly_cache_capacity: usize,
    /// The network simulator this transport layer rides on top of.
    pub network: NetworkConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let network = NetworkConfig::default();
        TransportConfig {
            packet_wait_time_ms: 500,
            retry_interval_ms: u64::from(network.latency_ms) * 2,
            send_timeout_ms: 10_000,
            sender_worker_threads: 2,
            ack_every_n_packets: 16,
            ack_every_ms: 50,
            reassembly_cache_capacity: 128,
            network,
        }
    }
}

impl TransportConfig {
    pub fn packet_wait_time(&self) -> Duration {
        Duration::from_millis(self.packet_wait_time_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn ack_every(&self) -> Duration {
        Duration::from_millis(self.ack_every_ms)
    }

    /// Parse a `TransportConfig` from a TOML document, matching the
    /// standalone test-harness binary's configuration-loading convention.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: TransportConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    pub const fn max_payload_size() -> usize {
        MAX_PAYLOAD_SIZE
    }
}
