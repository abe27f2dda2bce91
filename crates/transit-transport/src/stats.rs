//! Ambient per-engine counters, not part of the wire protocol or the public
//! send/receive contract. Exposed for diagnostics and JSON export, matching
//! the rest of the workspace's habit of pairing a protocol engine with a
//! `Serialize`-able stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters for one [`crate::sender::SenderEngine`]. Cheap atomic
/// increments on the hot path; [`SenderEngine::stats`] below renders a
/// point-in-time snapshot.
#[derive(Debug, Default)]
pub struct SenderStats {
    packets_sent: AtomicU64,
    retransmit_passes: AtomicU64,
    transmissions_completed: AtomicU64,
    transmissions_timed_out: AtomicU64,
}

impl SenderStats {
    pub(crate) fn record_packets_sent(&self, n: u64) {
        self.packets_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmit_pass(&self) {
        self.retransmit_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.transmissions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.transmissions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            retransmit_passes: self.retransmit_passes.load(Ordering::Relaxed),
            transmissions_completed: self.transmissions_completed.load(Ordering::Relaxed),
            transmissions_timed_out: self.transmissions_timed_out.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`SenderStats`], serializable for export.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SenderStatsSnapshot {
    /// Total DATA_PACKETs pushed to the network, including retransmissions.
    pub packets_sent: u64,
    /// Number of packetize-and-push passes across all transmissions
    /// (the first pass plus every retransmit pass).
    pub retransmit_passes: u64,
    /// Transmissions that reached a fully-set ack bitmap.
    pub transmissions_completed: u64,
    /// Transmissions that gave up after the wall-clock send budget elapsed.
    pub transmissions_timed_out: u64,
}

/// Running counters for one [`crate::receiver::ReceiverEngine`].
#[derive(Debug, Default)]
pub struct ReceiverStats {
    packets_received: AtomicU64,
    duplicates_discarded: AtomicU64,
    transmissions_delivered: AtomicU64,
    acks_sent: AtomicU64,
}

impl ReceiverStats {
    pub(crate) fn record_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.transmissions_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
            transmissions_delivered: self.transmissions_delivered.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`ReceiverStats`], serializable for export.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    /// Total DATA_PACKETs observed on the inbound NIC, including duplicates.
    pub packets_received: u64,
    /// Packets discarded because their bit was already set.
    pub duplicates_discarded: u64,
    /// Transmissions whose completion signal fired.
    pub transmissions_delivered: u64,
    /// COMM_PACKETs emitted back to the sender.
    pub acks_sent: u64,
}
