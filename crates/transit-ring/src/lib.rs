//! # Packet Buffer Ring
//!
//! Lock-free, variable-size packet queue shared by a NIC and the simulated
//! wire. Two parallel structures make up a ring:
//!
//! - `metadata[N]`: fixed-size per-slot records, each a CAS-driven state
//!   machine `EMPTY -> RESERVED -> WRITING -> READY -> READING -> EMPTY`.
//! - `arena[C]`: a contiguous byte arena, carved into per-packet regions by
//!   chaining each reservation off the end of the previous one.
//!
//! Producers call [`PacketRing::reserve`], write into the returned slice,
//! then [`Reserved::publish`]. Consumers call [`PacketRing::try_take`], read
//! the slice, then [`Taken::release`]. Multiple producers and multiple
//! consumers may call concurrently.
//!
//! ## Memory ordering
//!
//! `write_cursor` and `read_cursor` are monotonic `u64` sequence numbers
//! (never masked until a slot index is needed), cache-line padded so
//! producer and consumer traffic doesn't false-share. A producer first wins
//! the `EMPTY -> RESERVED` CAS on the slot itself and only then
//! CAS-advances `write_cursor`; losing the `write_cursor` CAS (a stale read
//! racing a faster producer) rolls the slot back to `EMPTY` and retries.
//! This ordering matters because `read_cursor` only advances when the
//! *consumer* releases a slot, not when it takes one: `write_cursor -
//! read_cursor` therefore always measures "published but not yet fully
//! read", so a producer can never believe a slot is free while a consumer
//! is still physically reading it. Because `try_take`'s `READY -> READING`
//! CAS gates which generation `read_cursor` can next belong to, at most one
//! `Taken` is ever outstanding per ring, which is why `release` can
//! `fetch_add` `read_cursor` unconditionally rather than CAS it. `READY` is
//! only ever set after the byte region is fully written (`Release`); a
//! consumer only reads the region after winning the `READY -> READING` CAS
//! (`Acquire`), so it always observes the completed write.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

mod padded;
use padded::CachePadded;

/// Bound on spin attempts while waiting for a neighboring slot's size to
/// become known. Past this we treat the ring as full rather than block
/// forever on a slow producer.
const REGION_SPIN_LIMIT: u32 = 20;

// ─── Slot status ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotStatus {
    Empty = 0,
    Reserved = 1,
    Writing = 2,
    Ready = 3,
    Reading = 4,
}

impl SlotStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotStatus::Empty,
            1 => SlotStatus::Reserved,
            2 => SlotStatus::Writing,
            3 => SlotStatus::Ready,
            4 => SlotStatus::Reading,
            _ => unreachable!("corrupt slot status {v}"),
        }
    }
}

struct Slot {
    status: AtomicU8,
    starting_offset: AtomicUsize,
    packet_size: AtomicUsize,
    arrival_time_ms: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Slot {
            status: AtomicU8::new(SlotStatus::Empty as u8),
            starting_offset: AtomicUsize::new(0),
            packet_size: AtomicUsize::new(0),
            arrival_time_ms: AtomicU64::new(0),
        }
    }

    fn load_status(&self, order: Ordering) -> SlotStatus {
        SlotStatus::from_u8(self.status.load(order))
    }
}

/// Errors surfaced by the ring's producer/consumer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// No free slot, or no room in the arena without overlapping the reader.
    Full,
    /// No published packet to take.
    Empty,
    /// Requested size cannot ever fit in this ring's arena.
    TooLarge,
}

// ─── PacketRing ──────────────────────────────────────────────────────────────

/// A lock-free, bounded, variable-size packet queue.
pub struct PacketRing {
    metadata: Box<[Slot]>,
    capacity: u64,
    arena: UnsafeCell<Box<[u8]>>,
    arena_len: usize,
    write_cursor: CachePadded<AtomicU64>,
    read_cursor: CachePadded<AtomicU64>,
}

// SAFETY: `arena` bytes are only ever touched through the disjoint regions
// handed out by `reserve`/`try_take`, which the slot state machine
// guarantees never overlap while live.
unsafe impl Sync for PacketRing {}
unsafe impl Send for PacketRing {}

impl PacketRing {
    /// Create a ring with `slot_count` metadata slots and an `arena_bytes`
    /// byte circular arena.
    pub fn new(slot_count: usize, arena_bytes: usize) -> Self {
        assert!(slot_count > 0, "ring must have at least one slot");
        assert!(arena_bytes > 0, "ring must have a non-empty arena");
        let metadata = (0..slot_count).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        PacketRing {
            metadata,
            capacity: slot_count as u64,
            arena: UnsafeCell::new(vec![0u8; arena_bytes].into_boxed_slice()),
            arena_len: arena_bytes,
            write_cursor: CachePadded::new(AtomicU64::new(0)),
            read_cursor: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.capacity as usize
    }

    pub fn arena_len(&self) -> usize {
        self.arena_len
    }

    /// Number of published-but-unreleased packets currently in the ring.
    /// Approximate under concurrent access; intended for diagnostics.
    pub fn len(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire).wrapping_sub(self.read_cursor.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn arena_ptr(&self) -> *mut u8 {
        let boxed: &Box<[u8]> = unsafe { &*self.arena.get() };
        boxed.as_ptr() as *mut u8
    }

    /// Reserve room for a `size`-byte packet. On success, the caller must
    /// write exactly `size` bytes into the returned slice and then call
    /// [`Reserved::publish`].
    pub fn reserve(&self, size: usize) -> Result<Reserved<'_>, RingError> {
        if size == 0 || size > self.arena_len {
            return Err(RingError::TooLarge);
        }

        loop {
            let wc = self.write_cursor.load(Ordering::Acquire);
            let rc = self.read_cursor.load(Ordering::Acquire);
            if wc.wrapping_sub(rc) >= self.capacity {
                return Err(RingError::Full);
            }

            // Claim the slot first. Only a winner here is allowed to try to
            // advance `write_cursor`, so a producer can never bump the
            // cursor for a generation it failed to actually claim.
            let idx = (wc % self.capacity) as usize;
            let slot = &self.metadata[idx];
            if !self.claim_slot(slot) {
                // Spin budget exhausted for this generation; re-check
                // fullness and retry rather than orphaning `wc`.
                continue;
            }

            // Holding the slot, try to claim sequence number `wc` itself.
            // A failure here means a stale read raced a faster producer
            // that already advanced past `wc`; back the slot out and retry
            // from a fresh read instead of leaving it claimed forever.
            if self
                .write_cursor
                .compare_exchange(wc, wc.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                slot.status.store(SlotStatus::Empty as u8, Ordering::Release);
                continue;
            }

            let offset = match self.compute_region(wc, rc, size) {
                Some(offset) => offset,
                None => {
                    slot.status.store(SlotStatus::Empty as u8, Ordering::Release);
                    return Err(RingError::Full);
                }
            };

            slot.starting_offset.store(offset, Ordering::Relaxed);
            slot.packet_size.store(size, Ordering::Relaxed);
            slot.status.store(SlotStatus::Writing as u8, Ordering::Release);

            return Ok(Reserved {
                ring: self,
                idx,
                offset,
                size,
                published: false,
            });
        }
    }

    /// Spin, bounded, for the slot to leave its prior `EMPTY` state. In
    /// steady state this succeeds immediately: the slot was freed by
    /// `release` before `write_cursor` could lap it.
    fn claim_slot(&self, slot: &Slot) -> bool {
        for _ in 0..REGION_SPIN_LIMIT {
            if slot
                .status
                .compare_exchange(SlotStatus::Empty as u8, SlotStatus::Reserved as u8, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Determine this reservation's byte region, chaining off the previous
    /// producer's region and rejecting any overlap with the reader's
    /// current region.
    fn compute_region(&self, wc: u64, rc_at_claim: u64, size: usize) -> Option<usize> {
        let prev_end = if wc == 0 {
            0
        } else {
            let prev_idx = (wc.wrapping_sub(1) % self.capacity) as usize;
            let prev_slot = &self.metadata[prev_idx];
            let (prev_offset, prev_size) = self.wait_for_region(prev_slot)?;
            prev_offset + prev_size
        };

        let mut candidate = prev_end;
        if candidate.checked_add(size)? > self.arena_len {
            candidate = 0;
        }
        if candidate + size > self.arena_len {
            return None;
        }

        // Re-read the reader's position; it may have advanced since `rc_at_claim`.
        let rc = self.read_cursor.load(Ordering::Acquire);
        let _ = rc_at_claim;
        if rc == wc {
            // Ring had no live reader region at claim time for this generation.
            return Some(candidate);
        }
        let reader_idx = (rc % self.capacity) as usize;
        let reader_slot = &self.metadata[reader_idx];
        let (reader_offset, reader_size) = match reader_slot.load_status(Ordering::Acquire) {
            SlotStatus::Empty => return Some(candidate),
            SlotStatus::Reserved => self.wait_for_region(reader_slot)?,
            _ => (
                reader_slot.starting_offset.load(Ordering::Acquire),
                reader_slot.packet_size.load(Ordering::Acquire),
            ),
        };

        let candidate_end = candidate + size;
        let reader_end = reader_offset + reader_size;
        let overlaps = candidate < reader_end && reader_offset < candidate_end;
        if overlaps {
            None
        } else {
            Some(candidate)
        }
    }

    /// Bounded spin until `slot` has left `RESERVED`, i.e. its size is
    /// known, returning `(starting_offset, packet_size)`.
    fn wait_for_region(&self, slot: &Slot) -> Option<(usize, usize)> {
        for _ in 0..REGION_SPIN_LIMIT {
            if slot.load_status(Ordering::Acquire) != SlotStatus::Reserved {
                return Some((
                    slot.starting_offset.load(Ordering::Acquire),
                    slot.packet_size.load(Ordering::Acquire),
                ));
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Attempt to dequeue the oldest published packet.
    pub fn try_take(&self) -> Result<Taken<'_>, RingError> {
        loop {
            let rc = self.read_cursor.load(Ordering::Acquire);
            let wc = self.write_cursor.load(Ordering::Acquire);
            if rc == wc {
                return Err(RingError::Empty);
            }
            let idx = (rc % self.capacity) as usize;
            let slot = &self.metadata[idx];
            if slot
                .status
                .compare_exchange(SlotStatus::Ready as u8, SlotStatus::Reading as u8, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
                continue;
            }

            let offset = slot.starting_offset.load(Ordering::Acquire);
            let size = slot.packet_size.load(Ordering::Acquire);
            let arrival_time_ms = slot.arrival_time_ms.load(Ordering::Acquire);
            // `read_cursor` advances on release, not here — see `Taken::release_inner`.

            return Ok(Taken {
                ring: self,
                idx,
                offset,
                size,
                arrival_time_ms,
                released: false,
            });
        }
    }

    /// Peek the arrival time of the oldest published packet, without
    /// taking it. Used by the wire-to-NIC thread to decide how long to
    /// sleep. Returns `None` if the ring is empty or the oldest slot isn't
    /// yet `READY` (still being written).
    pub fn peek_earliest_arrival_ms(&self) -> Option<u64> {
        let rc = self.read_cursor.load(Ordering::Acquire);
        let wc = self.write_cursor.load(Ordering::Acquire);
        if rc == wc {
            return None;
        }
        let idx = (rc % self.capacity) as usize;
        let slot = &self.metadata[idx];
        if slot.load_status(Ordering::Acquire) == SlotStatus::Ready {
            Some(slot.arrival_time_ms.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

// ─── Reserved / Taken handles ────────────────────────────────────────────────

/// A claimed, writable slot awaiting [`Reserved::publish`].
pub struct Reserved<'a> {
    ring: &'a PacketRing,
    idx: usize,
    offset: usize,
    size: usize,
    published: bool,
}

impl<'a> Reserved<'a> {
    /// The writable byte region for this reservation.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ring.arena_ptr().add(self.offset), self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// Stamp the arrival time this packet becomes visible on the far side
    /// of the wire. Only meaningful for rings modeling propagation delay.
    pub fn set_arrival_time_ms(&mut self, arrival_time_ms: u64) {
        self.ring.metadata[self.idx].arrival_time_ms.store(arrival_time_ms, Ordering::Relaxed);
    }

    /// Make the written bytes visible to consumers.
    pub fn publish(mut self) {
        self.ring.metadata[self.idx].status.store(SlotStatus::Ready as u8, Ordering::Release);
        self.published = true;
    }
}

impl<'a> Drop for Reserved<'a> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // Abandoned reservation (e.g. caller panicked mid-write). Publish a
        // zero-length tombstone rather than leaving the slot permanently
        // stuck in WRITING, which would wedge the consumer that eventually
        // reaches this sequence number.
        let slot = &self.ring.metadata[self.idx];
        slot.packet_size.store(0, Ordering::Relaxed);
        slot.status.store(SlotStatus::Ready as u8, Ordering::Release);
    }
}

/// A claimed, readable slot awaiting [`Taken::release`].
pub struct Taken<'a> {
    ring: &'a PacketRing,
    idx: usize,
    offset: usize,
    size: usize,
    arrival_time_ms: u64,
    released: bool,
}

impl<'a> Taken<'a> {
    pub fn as_slice(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ring.arena_ptr().add(self.offset), self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn arrival_time_ms(&self) -> u64 {
        self.arrival_time_ms
    }

    /// Copy the payload into a fresh allocation and free the slot. Useful
    /// when the caller needs to hand the bytes across a thread boundary.
    pub fn to_vec_and_release(mut self) -> Vec<u8> {
        let v = self.as_slice().to_vec();
        self.release_inner();
        v
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        // `try_take`'s READY->READING CAS gates the next generation
        // `read_cursor` can reach, so at most one `Taken` is ever
        // outstanding at a time and this advance is race-free.
        self.ring.read_cursor.fetch_add(1, Ordering::AcqRel);
        self.ring.metadata[self.idx].status.store(SlotStatus::Empty as u8, Ordering::Release);
        self.released = true;
    }
}

impl<'a> Drop for Taken<'a> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reserve_publish_take_release_roundtrip() {
        let ring = PacketRing::new(4, 1024);
        let mut r = ring.reserve(16).unwrap();
        r.as_mut_slice().copy_from_slice(&[7u8; 16]);
        r.publish();

        let t = ring.try_take().unwrap();
        assert_eq!(t.as_slice(), &[7u8; 16]);
        t.release();
        assert!(ring.is_empty());
    }

    #[test]
    fn take_on_empty_ring_fails() {
        let ring = PacketRing::new(2, 64);
        assert_eq!(ring.try_take().unwrap_err(), RingError::Empty);
    }

    #[test]
    fn reserve_fails_when_slots_exhausted() {
        let ring = PacketRing::new(2, 1024);
        let a = ring.reserve(8).unwrap();
        let b = ring.reserve(8).unwrap();
        assert_eq!(ring.reserve(8).unwrap_err(), RingError::Full);
        a.publish();
        b.publish();
    }

    #[test]
    fn reserve_rejects_oversize_payload() {
        let ring = PacketRing::new(4, 64);
        assert_eq!(ring.reserve(128).unwrap_err(), RingError::TooLarge);
    }

    #[test]
    fn arena_wraps_without_overlapping_reader() {
        let ring = PacketRing::new(8, 32);
        // Fill most of the arena, then drain and refill to force wraparound.
        let mut r1 = ring.reserve(20).unwrap();
        r1.as_mut_slice().fill(1);
        r1.publish();

        let t1 = ring.try_take().unwrap();
        assert_eq!(t1.as_slice(), &[1u8; 20]);
        t1.release();

        // This reservation cannot fit after the first (20..32 is only 12
        // bytes) so it must wrap to offset 0.
        let mut r2 = ring.reserve(20).unwrap();
        r2.as_mut_slice().fill(2);
        r2.publish();

        let t2 = ring.try_take().unwrap();
        assert_eq!(t2.as_slice(), &[2u8; 20]);
        t2.release();
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_multiset() {
        let ring = Arc::new(PacketRing::new(16, 4096));
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 200;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let val = (p * PER_PRODUCER + i) as u32;
                        loop {
                            match ring.reserve(4) {
                                Ok(mut slot) => {
                                    slot.as_mut_slice().copy_from_slice(&val.to_le_bytes());
                                    slot.publish();
                                    break;
                                }
                                Err(RingError::Full) => std::thread::yield_now(),
                                Err(e) => panic!("unexpected error: {e:?}"),
                            }
                        }
                    }
                })
            })
            .collect();

        let total = PRODUCERS * PER_PRODUCER;
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(total);
                while seen.len() < total {
                    match ring.try_take() {
                        Ok(slot) => {
                            let mut buf = [0u8; 4];
                            buf.copy_from_slice(slot.as_slice());
                            seen.push(u32::from_le_bytes(buf));
                            slot.release();
                        }
                        Err(RingError::Empty) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected error: {e:?}"),
                    }
                }
                seen
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..total as u32).collect();
        assert_eq!(seen, expected);
    }

    /// Many producers racing a deliberately slow consumer against a small
    /// ring: `reserve` hits `Full` and contends on the same generation
    /// constantly, instead of the mostly-uncontended path a fast consumer
    /// gives the happy case. Exercises the claim-then-advance rollback in
    /// `reserve` and the single-outstanding-`Taken` invariant `release`
    /// relies on.
    #[test]
    fn stress_with_slow_consumer_exercises_reservation_rollback() {
        let ring = Arc::new(PacketRing::new(8, 2048));
        const PRODUCERS: usize = 6;
        const PER_PRODUCER: usize = 150;
        const MAX_ATTEMPTS: usize = 50_000;

        let producers_done = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                let producers_done = Arc::clone(&producers_done);
                thread::spawn(move || {
                    let mut dropped = Vec::new();
                    for i in 0..PER_PRODUCER {
                        let val = (p * PER_PRODUCER + i) as u32;
                        let mut attempts = 0;
                        loop {
                            match ring.reserve(4) {
                                Ok(mut slot) => {
                                    slot.as_mut_slice().copy_from_slice(&val.to_le_bytes());
                                    slot.publish();
                                    break;
                                }
                                Err(RingError::Full) => {
                                    attempts += 1;
                                    if attempts >= MAX_ATTEMPTS {
                                        dropped.push(val);
                                        break;
                                    }
                                    thread::yield_now();
                                }
                                Err(e) => panic!("unexpected error: {e:?}"),
                            }
                        }
                    }
                    producers_done.fetch_add(1, Ordering::Release);
                    dropped
                })
            })
            .collect();

        let consumer = {
            let ring = Arc::clone(&ring);
            let producers_done = Arc::clone(&producers_done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match ring.try_take() {
                        Ok(slot) => {
                            let mut buf = [0u8; 4];
                            buf.copy_from_slice(slot.as_slice());
                            seen.push(u32::from_le_bytes(buf));
                            slot.release();
                            // Pace well behind the producers so write_cursor
                            // keeps running ahead of read_cursor.
                            thread::sleep(Duration::from_micros(50));
                        }
                        Err(RingError::Empty) => {
                            if producers_done.load(Ordering::Acquire) == PRODUCERS && ring.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                        Err(e) => panic!("unexpected error: {e:?}"),
                    }
                }
                seen
            })
        };

        let mut dropped_all = Vec::new();
        for p in producers {
            dropped_all.extend(p.join().unwrap());
        }
        let mut seen = consumer.join().unwrap();

        let mut seen_sorted = seen.clone();
        seen_sorted.sort_unstable();
        let before_dedup = seen_sorted.len();
        seen_sorted.dedup();
        assert_eq!(seen_sorted.len(), before_dedup, "a value was delivered more than once");

        let dropped_set: std::collections::HashSet<u32> = dropped_all.iter().copied().collect();
        for v in &seen {
            assert!(!dropped_set.contains(v), "value {v} was both dropped and delivered");
        }

        seen.sort_unstable();
        let total = PRODUCERS * PER_PRODUCER;
        let expected: Vec<u32> = (0..total as u32).filter(|v| !dropped_set.contains(v)).collect();
        assert_eq!(seen, expected, "delivered set must equal published-minus-dropped set");
    }

    proptest::proptest! {
        #[test]
        fn random_sizes_never_corrupt_data(sizes in proptest::collection::vec(1usize..64, 1..50)) {
            let ring = PacketRing::new(8, 512);
            let mut delivered = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                match ring.reserve(*size) {
                    Ok(mut r) => {
                        let byte = (i % 256) as u8;
                        r.as_mut_slice().fill(byte);
                        r.publish();
                        // Drain eagerly to keep the tiny arena from filling up
                        // faster than it can be reclaimed.
                        if let Ok(t) = ring.try_take() {
                            if !t.is_empty() {
                                delivered.push((t.as_slice().to_vec(), t.as_slice()[0]));
                            }
                            t.release();
                        }
                    }
                    Err(_) => {}
                }
            }
            for (bytes, expected_byte) in delivered {
                prop_assert!(bytes.iter().all(|&b| b == expected_byte));
            }
        }
    }
}
