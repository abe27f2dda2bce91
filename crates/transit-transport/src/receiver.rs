//! Multi-transmission receiver engine: drains the inbound NIC into a
//! bounded cache, reassembles transmissions from whichever record each
//! packet belongs to, and periodically reports progress back to the
//! sender via COMM_PACKETs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use transit_net::{NetworkLayer, Role};
use transit_wire::{Packet, PacketBody, MAX_PAYLOAD_SIZE, MAX_TRANSMISSION_ID};

use crate::bitmap::AckBitmap;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::event::Completion;
use crate::sender::send_with_backoff;
use crate::sparse::SparseTable;
use crate::stats::{ReceiverStats, ReceiverStatsSnapshot};

/// Per-transmission receiver-side state, created lazily on the first data
/// packet observed for a new `transmission_id`.
pub struct ReceiverTransmissionRecord {
    n_packets: u32,
    data_buffer: Mutex<Vec<u8>>,
    received: AckBitmap,
    packets_remaining: AtomicU32,
    total_bytes: AtomicUsize,
    completion: Completion,
}

impl ReceiverTransmissionRecord {
    fn new(n_packets: u32) -> Self {
        ReceiverTransmissionRecord {
            n_packets,
            data_buffer: Mutex::new(vec![0u8; n_packets as usize * MAX_PAYLOAD_SIZE]),
            received: AckBitmap::new(n_packets),
            packets_remaining: AtomicU32::new(n_packets),
            total_bytes: AtomicUsize::new(n_packets as usize * MAX_PAYLOAD_SIZE),
            completion: Completion::new(),
        }
    }

    /// Applies a data packet's payload. Returns `true` if this was a new
    /// (non-duplicate) packet, and whether the transmission is now complete.
    fn apply(&self, index: u32, payload: &[u8]) -> (bool, bool) {
        if self.received.is_set(index) {
            return (false, self.packets_remaining.load(Ordering::Acquire) == 0);
        }
        self.received.set(index);
        let start = index as usize * MAX_PAYLOAD_SIZE;
        {
            let mut buffer = self.data_buffer.lock().expect("receiver record buffer mutex poisoned");
            buffer[start..start + payload.len()].copy_from_slice(payload);
        }
        if index == self.n_packets - 1 {
            self.total_bytes.store(start + payload.len(), Ordering::Release);
        }
        let remaining = self.packets_remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.completion.signal();
        }
        (true, remaining == 0)
    }
}

pub struct ReceiverEngine {
    records: Arc<SparseTable<ReceiverTransmissionRecord>>,
    completed_ids_rx: Receiver<u32>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<ReceiverStats>,
}

impl ReceiverEngine {
    pub fn new(net: Arc<NetworkLayer>, config: TransportConfig) -> Arc<Self> {
        let records: Arc<SparseTable<ReceiverTransmissionRecord>> = Arc::new(SparseTable::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ReceiverStats::default());
        let (cache_tx, cache_rx) = crossbeam_channel::bounded::<Vec<u8>>(config.reassembly_cache_capacity);
        let (completed_ids_tx, completed_ids_rx) = crossbeam_channel::unbounded::<u32>();

        let drainer = spawn_drainer(Arc::clone(&net), cache_tx, Arc::clone(&shutdown));
        let reassembler = spawn_reassembler(
            Arc::clone(&net),
            Arc::clone(&records),
            cache_rx,
            completed_ids_tx,
            Arc::clone(&shutdown),
            config,
            Arc::clone(&stats),
        );

        Arc::new(ReceiverEngine {
            records,
            completed_ids_rx,
            shutdown,
            threads: Mutex::new(vec![drainer, reassembler]),
            stats,
        })
    }

    /// Point-in-time counters for diagnostics/export; not part of the
    /// protocol or the public receive contract.
    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.stats.snapshot()
    }

    /// `receive_transmission(id_or_wildcard, dest, timeout)`.
    pub fn receive_transmission(&self, id_or_wildcard: u32, dest: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if id_or_wildcard == 0 {
            return self.receive_any(dest, timeout);
        }
        if id_or_wildcard > MAX_TRANSMISSION_ID {
            return Err(TransportError::InvalidId);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(TransportError::Timeout);
            }
            let Some(record) = self.records.get(id_or_wildcard) else {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout);
                }
                thread::sleep(Duration::from_millis(5).min(deadline.saturating_duration_since(Instant::now())));
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if record.completion.wait_timeout(remaining, &self.shutdown) {
                return self.deliver(id_or_wildcard, &record, dest);
            }
            return Err(TransportError::Timeout);
        }
    }

    fn receive_any(&self, dest: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(TransportError::Timeout);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            match self.completed_ids_rx.recv_timeout(remaining.min(Duration::from_millis(50))) {
                Ok(id) => {
                    if let Some(record) = self.records.get(id) {
                        return self.deliver(id, &record, dest);
                    }
                    // Claimed by a direct `receive_transmission(id, ...)` caller already.
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::ShuttingDown),
            }
        }
    }

    fn deliver(&self, id: u32, record: &ReceiverTransmissionRecord, dest: &mut [u8]) -> Result<usize, TransportError> {
        let total = record.total_bytes.load(Ordering::Acquire);
        if dest.len() < total {
            return Err(TransportError::InvalidLength);
        }
        {
            let buffer = record.data_buffer.lock().expect("receiver record buffer mutex poisoned");
            dest[..total].copy_from_slice(&buffer[..total]);
        }
        self.records.remove(id);
        Ok(total)
    }

    /// `free_transport_layer()`'s receiver half. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().expect("receiver thread list poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_drainer(net: Arc<NetworkLayer>, cache_tx: Sender<Vec<u8>>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("receiver-drainer".into())
        .spawn(move || {
            tracing::debug!("receiver drainer thread started");
            while !shutdown.load(Ordering::Acquire) {
                let Some(bytes) = net.receive_packet(Role::Receiver, Duration::from_millis(50)) else {
                    continue;
                };
                // Bounded send: blocks (back-pressure) if the reassembler is behind.
                if cache_tx.send(bytes).is_err() {
                    break;
                }
            }
            tracing::debug!("receiver drainer thread stopped");
        })
        .expect("failed to spawn receiver drainer thread")
}

struct AckTracker {
    since_last_ack: u32,
    last_ack_at: Instant,
}

fn spawn_reassembler(
    net: Arc<NetworkLayer>,
    records: Arc<SparseTable<ReceiverTransmissionRecord>>,
    cache_rx: Receiver<Vec<u8>>,
    completed_ids_tx: Sender<u32>,
    shutdown: Arc<AtomicBool>,
    config: TransportConfig,
    stats: Arc<ReceiverStats>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("receiver-reassembler".into())
        .spawn(move || {
            tracing::debug!("receiver reassembler thread started");
            let mut trackers: HashMap<u32, AckTracker> = HashMap::new();

            while !shutdown.load(Ordering::Acquire) {
                let bytes = match cache_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(bytes) => bytes,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                let mut slice = &bytes[..];
                let Some(packet) = Packet::decode(&mut slice) else {
                    tracing::trace!("receiver discarded an undecodable packet");
                    continue;
                };
                let PacketBody::Data {
                    index_in_transmission,
                    n_packets_in_transmission,
                } = packet.body
                else {
                    tracing::trace!("receiver discarded an unexpected comm packet on its inbound path");
                    continue;
                };

                stats.record_packet_received();
                let (record, _) = records.insert_if_absent(
                    packet.transmission_id,
                    ReceiverTransmissionRecord::new(n_packets_in_transmission),
                );
                let (is_new, complete) = record.apply(index_in_transmission, &packet.payload);
                if !is_new {
                    stats.record_duplicate();
                }

                let tracker = trackers.entry(packet.transmission_id).or_insert_with(|| AckTracker {
                    since_last_ack: 0,
                    last_ack_at: Instant::now(),
                });
                if is_new {
                    tracker.since_last_ack += 1;
                }

                let due = complete
                    || tracker.since_last_ack >= config.ack_every_n_packets
                    || tracker.last_ack_at.elapsed() >= config.ack_every();
                if due {
                    emit_ack(&net, &record, packet.transmission_id, &shutdown, &stats);
                    tracker.since_last_ack = 0;
                    tracker.last_ack_at = Instant::now();
                }

                if complete {
                    trackers.remove(&packet.transmission_id);
                    stats.record_delivered();
                    let _ = completed_ids_tx.send(packet.transmission_id);
                }
            }
            tracing::debug!("receiver reassembler thread stopped");
        })
        .expect("failed to spawn receiver reassembler thread")
}

fn emit_ack(net: &NetworkLayer, record: &ReceiverTransmissionRecord, id: u32, shutdown: &AtomicBool, stats: &ReceiverStats) {
    let chunk_bits = (MAX_PAYLOAD_SIZE * 8) as u32;
    let mut start = 0u32;
    while start < record.n_packets {
        let bits = chunk_bits.min(record.n_packets - start);
        let bytes = record.received.to_bytes(start, bits);
        if let Some(packet) = Packet::new_comm(id, start, bits, Bytes::from(bytes)) {
            let encoded = packet.encode_to_bytes();
            if send_with_backoff(net, &encoded, shutdown) {
                stats.record_ack_sent();
            }
        }
        start += bits;
    }
}
