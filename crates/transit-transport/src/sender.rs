//! Sliding-window sender engine: packetizes a transmission, pushes every
//! packet onto the network layer, and retransmits whatever the receiver
//! hasn't acknowledged until the whole bitmap is set or the send times out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use transit_net::{NetError, NetworkLayer, Role};
use transit_wire::{packet_count_for_len, Packet, PacketBody, MAX_PAYLOAD_SIZE, MAX_TRANSMISSION_ID};

use crate::bitmap::AckBitmap;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::event::Completion;
use crate::sparse::SparseTable;
use crate::stats::{SenderStats, SenderStatsSnapshot};

/// Per-transmission sender-side state: the payload, its ack bitmap, and
/// the completion signal `send_transmission` blocks on.
pub struct SenderTransmissionRecord {
    data: Bytes,
    n_packets: u32,
    acked: AckBitmap,
    completion: Completion,
    outcome: Mutex<Option<Result<(), TransportError>>>,
    cancelled: AtomicBool,
}

impl SenderTransmissionRecord {
    fn new(data: Bytes) -> Self {
        let n_packets = packet_count_for_len(data.len());
        SenderTransmissionRecord {
            data,
            n_packets,
            acked: AckBitmap::new(n_packets),
            completion: Completion::new(),
            outcome: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn payload(&self, index: u32) -> Bytes {
        let start = index as usize * MAX_PAYLOAD_SIZE;
        let end = (start + MAX_PAYLOAD_SIZE).min(self.data.len());
        self.data.slice(start..end)
    }

    fn finish(&self, result: Result<(), TransportError>) {
        let mut outcome = self.outcome.lock().expect("sender record outcome mutex poisoned");
        if outcome.is_some() {
            return;
        }
        *outcome = Some(result);
        drop(outcome);
        self.completion.signal();
    }
}

pub struct SenderEngine {
    net: Arc<NetworkLayer>,
    records: Arc<SparseTable<SenderTransmissionRecord>>,
    config: TransportConfig,
    shutdown: Arc<AtomicBool>,
    jobs_tx: Mutex<Option<Sender<u32>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SenderStats>,
}

impl SenderEngine {
    pub fn new(net: Arc<NetworkLayer>, config: TransportConfig) -> Arc<Self> {
        let records: Arc<SparseTable<SenderTransmissionRecord>> = Arc::new(SparseTable::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SenderStats::default());
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<u32>();

        let mut threads = Vec::with_capacity(config.sender_worker_threads + 1);
        threads.push(spawn_listener(Arc::clone(&net), Arc::clone(&records), Arc::clone(&shutdown)));
        for worker_idx in 0..config.sender_worker_threads.max(1) {
            threads.push(spawn_worker(
                worker_idx,
                jobs_rx.clone(),
                Arc::clone(&net),
                Arc::clone(&records),
                Arc::clone(&shutdown),
                config.retry_interval(),
                Arc::clone(&stats),
            ));
        }

        Arc::new(SenderEngine {
            net,
            records,
            config,
            shutdown,
            jobs_tx: Mutex::new(Some(jobs_tx)),
            threads: Mutex::new(threads),
            stats,
        })
    }

    /// Point-in-time counters for diagnostics/export; not part of the
    /// protocol or the public send contract.
    pub fn stats(&self) -> SenderStatsSnapshot {
        self.stats.snapshot()
    }

    /// `send_transmission(id, data)`: blocks until the receiver has
    /// acknowledged every packet, the overall send budget elapses, or the
    /// engine shuts down.
    pub fn send_transmission(&self, id: u32, data: &[u8]) -> Result<(), TransportError> {
        if id > MAX_TRANSMISSION_ID {
            return Err(TransportError::InvalidId);
        }
        if data.is_empty() {
            return Err(TransportError::InvalidLength);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::ShuttingDown);
        }

        let record = SenderTransmissionRecord::new(Bytes::copy_from_slice(data));
        let (record, inserted) = self.records.insert_if_absent(id, record);
        if !inserted {
            return Err(TransportError::AlreadyInFlight);
        }

        let enqueued = {
            let guard = self.jobs_tx.lock().expect("sender jobs_tx mutex poisoned");
            match guard.as_ref() {
                Some(tx) => tx.send(id).is_ok(),
                None => false,
            }
        };
        if !enqueued {
            self.records.remove(id);
            return Err(TransportError::ShuttingDown);
        }

        let signaled = record.completion.wait_timeout(self.config.send_timeout(), &self.shutdown);
        record.cancelled.store(true, Ordering::Release);
        self.records.remove(id);

        if !signaled {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(TransportError::ShuttingDown);
            }
            return Err(TransportError::Timeout);
        }

        record
            .outcome
            .lock()
            .expect("sender record outcome mutex poisoned")
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// `free_transport_layer()`'s sender half: stop accepting new jobs and
    /// join every worker/listener thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.jobs_tx.lock().expect("sender jobs_tx mutex poisoned").take();
        let mut threads = self.threads.lock().expect("sender thread list poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SenderEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn push_all_unacked(net: &NetworkLayer, record: &SenderTransmissionRecord, id: u32, shutdown: &AtomicBool, stats: &SenderStats) {
    stats.record_retransmit_pass();
    for index in record.acked.unset_in_range(0, record.n_packets) {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let payload = record.payload(index);
        let Some(packet) = Packet::new_data(id, index, record.n_packets, payload) else {
            tracing::error!(id, index, "refused to build an invalid data packet");
            continue;
        };
        let bytes = packet.encode_to_bytes();
        if send_with_backoff(net, &bytes, shutdown) {
            stats.record_packets_sent(1);
        }
    }
}

pub(crate) fn send_with_backoff(net: &NetworkLayer, bytes: &[u8], shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        match net.send_packet(Role::Sender, bytes) {
            Ok(()) => return true,
            Err(NetError::Full) => thread::sleep(Duration::from_millis(1)),
            Err(NetError::ShuttingDown) => return false,
        }
    }
}

fn spawn_worker(
    worker_idx: usize,
    jobs: Receiver<u32>,
    net: Arc<NetworkLayer>,
    records: Arc<SparseTable<SenderTransmissionRecord>>,
    shutdown: Arc<AtomicBool>,
    retry_interval: Duration,
    stats: Arc<SenderStats>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("sender-worker-{worker_idx}"))
        .spawn(move || {
            tracing::debug!(worker_idx, "sender worker thread started");
            while let Ok(id) = jobs.recv() {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(record) = records.get(id) else {
                    continue;
                };
                push_all_unacked(&net, &record, id, &shutdown, &stats);
                let mut last_retransmit = Instant::now();
                loop {
                    if record.acked.all_set() {
                        record.finish(Ok(()));
                        stats.record_completed();
                        break;
                    }
                    if record.cancelled.load(Ordering::Acquire) || shutdown.load(Ordering::Acquire) {
                        if record.cancelled.load(Ordering::Acquire) {
                            stats.record_timed_out();
                        }
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                    if last_retransmit.elapsed() >= retry_interval {
                        push_all_unacked(&net, &record, id, &shutdown, &stats);
                        last_retransmit = Instant::now();
                    }
                }
            }
            tracing::debug!(worker_idx, "sender worker thread stopped");
        })
        .expect("failed to spawn sender worker thread")
}

fn spawn_listener(
    net: Arc<NetworkLayer>,
    records: Arc<SparseTable<SenderTransmissionRecord>>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sender-listener".into())
        .spawn(move || {
            tracing::debug!("sender listener thread started");
            while !shutdown.load(Ordering::Acquire) {
                let Some(bytes) = net.receive_packet(Role::Sender, Duration::from_millis(50)) else {
                    continue;
                };
                let mut slice = &bytes[..];
                let Some(packet) = Packet::decode(&mut slice) else {
                    tracing::trace!("sender listener discarded an undecodable packet");
                    continue;
                };
                if let PacketBody::Comm {
                    first_packet_index,
                    n_bits_in_bitmap,
                } = packet.body
                {
                    if let Some(record) = records.get(packet.transmission_id) {
                        record.acked.merge_from_bytes(first_packet_index, n_bits_in_bitmap, &packet.payload);
                        if record.acked.all_set() {
                            record.finish(Ok(()));
                        }
                    }
                }
            }
            tracing::debug!("sender listener thread stopped");
        })
        .expect("failed to spawn sender listener thread")
}
