//! The four-thread network simulator: per directional pipe, an NIC→wire
//! thread and a wire→NIC thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use transit_ring::{PacketRing, RingError};

use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::impairment;

/// Which side of the simulated network a caller is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Three packet buffers chained NIC → wire → NIC, one direction.
struct DirectionalPipe {
    outbound: PacketRing,
    wire: PacketRing,
    inbound: PacketRing,
}

impl DirectionalPipe {
    fn new(config: &NetworkConfig) -> Self {
        DirectionalPipe {
            outbound: PacketRing::new(config.nic_slot_count, config.nic_arena_bytes()),
            wire: PacketRing::new(config.wire_slot_count, config.wire_arena_bytes),
            inbound: PacketRing::new(config.nic_slot_count, config.nic_arena_bytes()),
        }
    }
}

/// Error returned by [`NetworkLayer::send_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The target outbound NIC ring is full; caller should back off and
    /// retry.
    Full,
    /// The simulator is shutting down.
    ShuttingDown,
}

/// The in-process network simulator: two directional pipes, four worker
/// threads, seeded perturbation.
pub struct NetworkLayer {
    pipe_fwd: Arc<DirectionalPipe>,
    pipe_rev: Arc<DirectionalPipe>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: NetworkConfig,
}

impl NetworkLayer {
    /// `create_network_layer()` — spins up the 4-thread simulator.
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        let pipe_fwd = Arc::new(DirectionalPipe::new(&config));
        let pipe_rev = Arc::new(DirectionalPipe::new(&config));
        let shutdown = Arc::new(AtomicBool::new(false));
        let clock = Clock::new();

        let mut threads = Vec::with_capacity(4);
        threads.push(spawn_nic_to_wire("net-fwd-nic2wire", Arc::clone(&pipe_fwd), Arc::clone(&shutdown), config.clone(), clock.clone()));
        threads.push(spawn_wire_to_nic("net-fwd-wire2nic", Arc::clone(&pipe_fwd), Arc::clone(&shutdown), config.clone(), clock.clone(), config.rng_seed));
        threads.push(spawn_nic_to_wire("net-rev-nic2wire", Arc::clone(&pipe_rev), Arc::clone(&shutdown), config.clone(), clock.clone()));
        threads.push(spawn_wire_to_nic("net-rev-wire2nic", Arc::clone(&pipe_rev), Arc::clone(&shutdown), config.clone(), clock, config.rng_seed.wrapping_add(1)));

        Arc::new(NetworkLayer {
            pipe_fwd,
            pipe_rev,
            shutdown,
            threads: Mutex::new(threads),
            config,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn outbound_for(&self, role: Role) -> &PacketRing {
        match role {
            Role::Sender => &self.pipe_fwd.outbound,
            Role::Receiver => &self.pipe_rev.outbound,
        }
    }

    fn inbound_for(&self, role: Role) -> &PacketRing {
        match role {
            Role::Sender => &self.pipe_rev.inbound,
            Role::Receiver => &self.pipe_fwd.inbound,
        }
    }

    /// Enqueue raw packet bytes onto `role`'s outbound NIC. Bounded
    /// spin-with-yield on `Full`, per the send-path back-off policy;
    /// returns `Full` once the caller's own retry budget should decide
    /// whether to keep trying.
    pub fn send_packet(&self, role: Role, bytes: &[u8]) -> Result<(), NetError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(NetError::ShuttingDown);
        }
        match self.outbound_for(role).reserve(bytes.len()) {
            Ok(mut slot) => {
                slot.as_mut_slice().copy_from_slice(bytes);
                slot.publish();
                Ok(())
            }
            Err(RingError::Full) => Err(NetError::Full),
            Err(_) => Err(NetError::Full),
        }
    }

    /// Poll `role`'s inbound NIC for up to `timeout`, observing shutdown.
    pub fn receive_packet(&self, role: Role, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            match self.inbound_for(role).try_take() {
                Ok(taken) => {
                    if taken.is_empty() {
                        taken.release();
                        continue;
                    }
                    return Some(taken.to_vec_and_release());
                }
                Err(_) => {
                    if std::time::Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(self.config.net_retry_ms.min(5).max(1)));
                }
            }
        }
    }

    /// `free_network_layer()` — signal shutdown and join every thread.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().expect("network layer thread list poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for NetworkLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_nic_to_wire(
    name: &'static str,
    pipe: Arc<DirectionalPipe>,
    shutdown: Arc<AtomicBool>,
    config: NetworkConfig,
    clock: Clock,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || nic_to_wire_loop(&pipe, &shutdown, &config, &clock))
        .expect("failed to spawn network simulator thread")
}

fn spawn_wire_to_nic(
    name: &'static str,
    pipe: Arc<DirectionalPipe>,
    shutdown: Arc<AtomicBool>,
    config: NetworkConfig,
    clock: Clock,
    rng_seed: u64,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || wire_to_nic_loop(&pipe, &shutdown, &config, &clock, rng_seed))
        .expect("failed to spawn network simulator thread")
}

fn nic_to_wire_loop(pipe: &DirectionalPipe, shutdown: &AtomicBool, config: &NetworkConfig, clock: &Clock) {
    tracing::debug!(thread = "nic2wire", "network simulator thread started");
    while !shutdown.load(Ordering::Acquire) {
        match pipe.outbound.try_take() {
            Ok(taken) => {
                if taken.is_empty() {
                    taken.release();
                    continue;
                }
                let size = taken.len();
                if config.enforce_serialization_delay && config.bandwidth_bps > 0 {
                    let stall_secs = (size as f64 * 8.0) / config.bandwidth_bps as f64;
                    if stall_secs > 0.0 {
                        thread::sleep(Duration::from_secs_f64(stall_secs));
                    }
                }
                match pipe.wire.reserve(size) {
                    Ok(mut slot) => {
                        slot.as_mut_slice().copy_from_slice(taken.as_slice());
                        slot.set_arrival_time_ms(clock.now_ms() + config.latency_ms as u64);
                        slot.publish();
                    }
                    Err(_) => {
                        tracing::warn!("wire buffer full, packet dropped on nic→wire edge");
                    }
                }
                taken.release();
            }
            Err(RingError::Empty) => {
                thread::sleep(Duration::from_millis(config.net_retry_ms));
            }
            Err(e) => {
                tracing::error!(?e, "unexpected error draining outbound nic");
            }
        }
    }
    tracing::debug!(thread = "nic2wire", "network simulator thread stopped");
}

fn wire_to_nic_loop(
    pipe: &DirectionalPipe,
    shutdown: &AtomicBool,
    config: &NetworkConfig,
    clock: &Clock,
    rng_seed: u64,
) {
    tracing::debug!(thread = "wire2nic", "network simulator thread started");
    let mut rng = SmallRng::seed_from_u64(rng_seed);

    while !shutdown.load(Ordering::Acquire) {
        let now = clock.now_ms();
        let mut batch: Vec<Vec<u8>> = Vec::new();

        loop {
            match pipe.wire.peek_earliest_arrival_ms() {
                Some(arrival) if arrival <= now => match pipe.wire.try_take() {
                    Ok(taken) => {
                        if !taken.is_empty() {
                            batch.push(taken.to_vec_and_release());
                        } else {
                            taken.release();
                        }
                    }
                    Err(_) => break,
                },
                _ => break,
            }
        }

        if batch.is_empty() {
            let sleep_ms = pipe
                .wire
                .peek_earliest_arrival_ms()
                .map(|arrival| arrival.saturating_sub(now).min(config.net_retry_ms))
                .unwrap_or(config.net_retry_ms)
                .max(1);
            thread::sleep(Duration::from_millis(sleep_ms));
            continue;
        }

        if config.reorder_enabled {
            shuffle(&mut batch, &mut rng);
        }

        for mut bytes in batch {
            impairment::maybe_corrupt(&mut rng, &mut bytes, config.corrupt_rate_pct);
            if impairment::roll_drop(&mut rng, config.drop_rate_pct) {
                tracing::trace!("packet dropped on wire→nic edge");
                continue;
            }
            publish_to_inbound(&pipe.inbound, &bytes);
            if impairment::roll_duplicate(&mut rng, config.duplicate_rate_pct) {
                publish_to_inbound(&pipe.inbound, &bytes);
            }
        }
    }
    tracing::debug!(thread = "wire2nic", "network simulator thread stopped");
}

fn publish_to_inbound(inbound: &PacketRing, bytes: &[u8]) {
    match inbound.reserve(bytes.len()) {
        Ok(mut slot) => {
            slot.as_mut_slice().copy_from_slice(bytes);
            slot.publish();
        }
        Err(_) => {
            tracing::warn!("inbound nic full, packet dropped on wire→nic edge");
        }
    }
}

/// Fisher-Yates shuffle using the simulator's seeded RNG, avoiding a direct
/// dependency on `rand::seq` for this one call site.
fn shuffle<T>(items: &mut [T], rng: &mut SmallRng) {
    use rand::RngExt as _;
    for i in (1..items.len()).rev() {
        let j = (rng.random::<u32>() as usize) % (i + 1);
        items.swap(i, j);
    }
}
