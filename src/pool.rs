//! Slot pool: lock-minimal record consolidation.
//!
//! Writers reserve disjoint buffer ranges with a single CAS on a
//! per-slot state word, copy their records concurrently, and tally
//! completion on a separate counter. Only rotation, which retires a
//! filled slot and installs a fresh one in its table position, takes a
//! lock.
//!
//! # Architecture
//!
//! ```text
//!                  active table (join targets)
//!                 ┌──────┬──────┬──────┬──────┐
//!    join (CAS) ─▶│ slot │ slot │ slot │ slot │
//!                 └──┬───┴──────┴──────┴──────┘
//!                    │ close: swap to PENDING, rotate a FREE slot in
//!                    ▼
//!               wait until released == group
//!                    ▼
//!               write the group, free the slot back to the pool
//! ```
//!
//! The state word doubles as the reservation watermark: any value at or
//! above `SLOT_READY` means joinable, with `state - SLOT_READY` bytes
//! already claimed. Closing swaps the word to `SLOT_PENDING`; once every
//! joiner has released, the closer publishes `SLOT_DONE` and the whole
//! group is handed to the sink as one write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::slot::{
    Reservation, Slot, SlotFlags, SlotHandle, INVALID_POSITION, SLOT_DONE, SLOT_FREE, SLOT_READY,
};
use crate::stats::{SlotStats, StatsSnapshot};

/// Pool of consolidation slots plus the active table that fronts them.
pub struct SlotPool {
    slots: Box<[Slot]>,
    /// Maps a table position to the pool index of the joinable slot there.
    active: Box<[AtomicUsize]>,
    /// Serializes rotation. Joins, releases, and frees never take it.
    rotation: Mutex<RotationCursor>,
    config: LogConfig,
    /// Per-slot buffer capacity in bytes.
    capacity: usize,
    pub(crate) stats: SlotStats,
}

/// Round-robin scan position for replacement slots.
struct RotationCursor {
    next_free: usize,
}

impl SlotPool {
    /// Build a pool and install the first `active_slots` slots in the
    /// table.
    pub fn new(config: LogConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.effective_buffer_size();
        let slots: Box<[Slot]> = (0..config.pool_slots)
            .map(|_| Slot::new(capacity))
            .collect();
        let active: Box<[AtomicUsize]> = (0..config.active_slots).map(AtomicUsize::new).collect();
        for (position, slot) in slots.iter().take(config.active_slots).enumerate() {
            slot.activate(position);
        }
        info!(
            pool_slots = config.pool_slots,
            active_slots = config.active_slots,
            capacity,
            "slot pool ready"
        );
        Ok(Self {
            slots,
            active,
            rotation: Mutex::new(RotationCursor { next_free: 0 }),
            config,
            capacity,
            stats: SlotStats::default(),
        })
    }

    /// Per-slot buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of table positions accepting joins.
    pub fn active_positions(&self) -> usize {
        self.config.active_slots
    }

    /// Reserve `size` bytes in an active slot.
    ///
    /// Picks a random active position and claims a range by advancing the
    /// slot's state word with a CAS. The returned offset doubles as the
    /// leader marker: the offset-zero joiner is responsible for closing
    /// the slot after it releases.
    ///
    /// Fails with [`Error::TooLarge`] when the record can never fit a
    /// slot buffer, and with [`Error::NoRoom`] when every attempt found
    /// the picked slot too full to take the record.
    pub fn join(&self, size: usize, flags: SlotFlags) -> Result<Reservation> {
        if size >= self.capacity {
            self.stats.too_large.fetch_add(1, Ordering::Relaxed);
            return Err(Error::TooLarge {
                size,
                capacity: self.capacity,
            });
        }
        let mut attempts = 0u32;
        'find: loop {
            let position = rand::thread_rng().gen_range(0..self.config.active_slots);
            let index = self.active[position].load(Ordering::SeqCst);
            let slot = &self.slots[index];
            let generation = slot.generation();
            let mut observed = slot.state();
            loop {
                // Below READY the slot is pending or mid-rotation.
                if observed < SLOT_READY {
                    self.stats.transitions.fetch_add(1, Ordering::Relaxed);
                    continue 'find;
                }
                let next = match observed.checked_add(size as i64) {
                    Some(next) => next,
                    None => {
                        self.stats.too_large.fetch_add(1, Ordering::Relaxed);
                        continue 'find;
                    }
                };
                if next > self.capacity as i64 {
                    attempts += 1;
                    if attempts > self.config.join_attempts {
                        self.stats.no_room.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::NoRoom);
                    }
                    thread::yield_now();
                    continue 'find;
                }
                match slot.cas_state(observed, next) {
                    Ok(prev) => {
                        slot.merge_flags(flags);
                        self.stats.joins.fetch_add(1, Ordering::Relaxed);
                        let offset = (prev - SLOT_READY) as u64;
                        trace!(slot = index, offset, size, "joined slot");
                        return Ok(Reservation {
                            handle: SlotHandle { index, generation },
                            offset,
                            len: size,
                        });
                    }
                    Err(current) => {
                        self.stats.races.fetch_add(1, Ordering::Relaxed);
                        observed = current;
                    }
                }
            }
        }
    }

    /// Copy a record into its reserved range.
    ///
    /// Borrows the reservation exclusively, which keeps each range
    /// single-writer.
    pub fn copy_record(&self, reservation: &mut Reservation, data: &[u8]) {
        assert_eq!(
            data.len(),
            reservation.len,
            "record does not match its reservation"
        );
        self.slots[reservation.handle.index()].write(reservation.offset as usize, data);
    }

    /// Record that a joiner finished copying its reserved range. Consumes
    /// the reservation and returns the slot's new completion tally.
    pub fn release(&self, reservation: Reservation) -> u64 {
        self.slots[reservation.handle.index()].release_add(reservation.len as u64)
    }

    /// Close the slot behind `handle` and rotate a replacement into its
    /// table position.
    ///
    /// Returns the group size, or `None` when a forced rotation already
    /// retired the slot; the group then belongs to whoever forced it, and
    /// the caller has nothing left to do. A handle that outlived its
    /// slot's full free-and-recycle cycle fails the generation check and
    /// also gets `None`, rather than closing the slot's next epoch.
    pub fn close(&self, handle: SlotHandle) -> Option<u64> {
        let mut cursor = self.rotation.lock();
        let slot = &self.slots[handle.index()];
        let position = slot.position();
        if position == INVALID_POSITION
            || self.active[position].load(Ordering::SeqCst) != handle.index()
            || slot.generation() != handle.generation
        {
            return None;
        }
        let (_, group) = self.rotate(&mut cursor, position);
        Some(group)
    }

    /// Rotate the slot at `position` out regardless of how full it is.
    ///
    /// Used to push a partial group to the sink, e.g. on an explicit
    /// flush. The caller owns the retired slot's wait/write/free sequence
    /// even when the group turns out to be empty.
    ///
    /// # Panics
    ///
    /// Panics if `position` is not a valid table position.
    pub fn force_close(&self, position: usize) -> (SlotHandle, u64) {
        assert!(
            position < self.active.len(),
            "position {} out of range for {} active slots",
            position,
            self.active.len()
        );
        let mut cursor = self.rotation.lock();
        self.rotate(&mut cursor, position)
    }

    /// Retire the slot at `position` and install a free replacement.
    /// Caller holds the rotation lock.
    fn rotate(&self, cursor: &mut RotationCursor, position: usize) -> (SlotHandle, u64) {
        let pool = self.slots.len();
        let retiring_index = self.active[position].load(Ordering::SeqCst);
        let retiring = &self.slots[retiring_index];

        // Scan round-robin for a free slot. Frees never take the rotation
        // lock, so in-flight groups keep draining while we spin here.
        let replacement_index = 'scan: loop {
            for step in 0..pool {
                let candidate = (cursor.next_free + step) % pool;
                if self.slots[candidate].state() == SLOT_FREE {
                    cursor.next_free = (candidate + 1) % pool;
                    break 'scan candidate;
                }
            }
            self.stats.switch_fails.fetch_add(1, Ordering::Relaxed);
            retiring.raise_churn(self.config.churn_max);
            thread::yield_now();
        };
        retiring.ease_churn();

        // Pause in proportion to recent replacement pressure so
        // stragglers can still join before the swap seals the slot.
        for _ in 0..=retiring.churn() {
            thread::yield_now();
        }

        // Install the replacement before sealing the old slot so the
        // position always points at something joinable.
        let replacement = &self.slots[replacement_index];
        replacement.activate(position);
        self.active[position].store(replacement_index, Ordering::SeqCst);

        let prior = retiring.swap_pending();
        let group = (prior - SLOT_READY) as u64;
        retiring.set_group(group);
        if group == 0 {
            retiring.publish_done();
            self.stats.empty_closes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
            self.stats
                .consolidated_bytes
                .fetch_add(group, Ordering::Relaxed);
        }
        debug!(
            slot = retiring_index,
            replacement = replacement_index,
            position,
            group,
            "slot rotated out"
        );
        let handle = SlotHandle {
            index: retiring_index,
            generation: retiring.generation(),
        };
        (handle, group)
    }

    /// Wait until every joiner of a closed slot has released, then
    /// publish the slot as done.
    ///
    /// Yields for `wait_spin` iterations before falling back to sleeping
    /// in `wait_sleep_us` steps.
    pub fn wait(&self, handle: SlotHandle) {
        let slot = &self.slots[handle.index()];
        let group = slot.group();
        let mut spins = 0u32;
        while slot.released() < group {
            if spins < self.config.wait_spin {
                spins += 1;
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(self.config.wait_sleep_us));
            }
        }
        slot.publish_done();
    }

    /// Borrow the consolidated bytes of a completed slot.
    ///
    /// Valid between `wait` returning and `free`; the caller must not
    /// free the slot while the borrow lives.
    pub fn consolidated(&self, handle: SlotHandle) -> &[u8] {
        let slot = &self.slots[handle.index()];
        debug_assert_eq!(slot.state(), SLOT_DONE);
        slot.filled(slot.group() as usize)
    }

    /// Durability flags accumulated by the group's joiners.
    pub fn group_flags(&self, handle: SlotHandle) -> SlotFlags {
        self.slots[handle.index()].flags()
    }

    /// Return a completed slot to the free pool.
    pub fn free(&self, handle: SlotHandle) {
        let slot = &self.slots[handle.index()];
        debug_assert_eq!(slot.state(), SLOT_DONE);
        slot.reset();
        debug!(slot = handle.index(), "slot freed");
    }

    /// Snapshot the pool's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::Arc;

    use super::*;

    /// One active position so every join lands on the same slot.
    fn small_config() -> LogConfig {
        LogConfig {
            pool_slots: 4,
            active_slots: 1,
            buffer_size: 256,
            ..Default::default()
        }
    }

    #[test]
    fn test_join_offsets_accumulate() {
        let pool = SlotPool::new(small_config()).unwrap();
        let a = pool.join(10, SlotFlags::empty()).unwrap();
        let b = pool.join(20, SlotFlags::empty()).unwrap();
        let c = pool.join(5, SlotFlags::empty()).unwrap();
        assert_eq!(a.offset(), 0);
        assert!(a.is_leader());
        assert_eq!(b.offset(), 10);
        assert!(!b.is_leader());
        assert_eq!(c.offset(), 30);

        let group = pool.close(a.handle()).unwrap();
        assert_eq!(group, 35);
    }

    #[test]
    fn test_full_lifecycle_round_trip() {
        let pool = SlotPool::new(small_config()).unwrap();
        let mut a = pool.join(10, SlotFlags::empty()).unwrap();
        let mut b = pool.join(20, SlotFlags::empty()).unwrap();
        let mut c = pool.join(5, SlotFlags::empty()).unwrap();

        pool.copy_record(&mut a, b"aaaaaaaaaa");
        pool.copy_record(&mut b, b"bbbbbbbbbbbbbbbbbbbb");
        pool.copy_record(&mut c, b"ccccc");
        let leader = a.handle();
        pool.release(a);
        pool.release(b);
        pool.release(c);

        let group = pool.close(leader).unwrap();
        assert_eq!(group, 35);
        pool.wait(leader);
        assert_eq!(
            pool.consolidated(leader),
            b"aaaaaaaaaabbbbbbbbbbbbbbbbbbbbccccc".as_slice()
        );
        pool.free(leader);

        let stats = pool.stats();
        assert_eq!(stats.joins, 3);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.consolidated_bytes, 35);
        assert_eq!(stats.avg_group_size(), 35);
    }

    #[test]
    fn test_record_larger_than_buffer_is_too_large() {
        let config = LogConfig {
            pool_slots: 4,
            active_slots: 1,
            buffer_size: 1000,
            ..Default::default()
        };
        let pool = SlotPool::new(config).unwrap();
        assert_eq!(pool.capacity(), 1000);

        let err = pool.join(2000, SlotFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            Error::TooLarge {
                size: 2000,
                capacity: 1000
            }
        ));
        assert!(pool.join(1000, SlotFlags::empty()).is_err());
        // The largest record that fits alongside the state baseline.
        assert!(pool.join(997, SlotFlags::empty()).is_ok());
        assert_eq!(pool.stats().too_large, 2);
    }

    #[test]
    fn test_capacity_capped_by_file_max() {
        let config = LogConfig {
            pool_slots: 4,
            active_slots: 1,
            buffer_size: 1 << 20,
            file_max: 4096,
            ..Default::default()
        };
        let pool = SlotPool::new(config).unwrap();
        assert_eq!(pool.capacity(), 4096);
    }

    #[test]
    fn test_unfittable_record_reports_no_room() {
        let pool = SlotPool::new(small_config()).unwrap();
        // 255 passes the size gate but can never fit over the baseline.
        let err = pool.join(255, SlotFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::NoRoom));
        assert_eq!(pool.stats().no_room, 1);

        // The failed joins left the slot untouched.
        let r = pool.join(10, SlotFlags::empty()).unwrap();
        assert_eq!(r.offset(), 0);
    }

    #[test]
    fn test_wait_blocks_until_last_release() {
        let pool = Arc::new(SlotPool::new(small_config()).unwrap());
        let mut a = pool.join(4, SlotFlags::empty()).unwrap();
        let mut b = pool.join(6, SlotFlags::empty()).unwrap();
        pool.copy_record(&mut a, b"aaaa");
        pool.copy_record(&mut b, b"bbbbbb");
        let leader = a.handle();
        pool.release(a);

        let group = pool.close(leader).unwrap();
        assert_eq!(group, 10);

        let (tx, rx) = mpsc::channel();
        let worker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                tx.send(()).unwrap();
                pool.release(b);
            })
        };

        pool.wait(leader);
        // The straggler must have signalled before wait returned.
        rx.try_recv().unwrap();
        assert_eq!(pool.consolidated(leader), b"aaaabbbbbb".as_slice());
        pool.free(leader);
        worker.join().unwrap();
    }

    #[test]
    fn test_forced_close_with_empty_group() {
        let pool = SlotPool::new(small_config()).unwrap();
        let (handle, group) = pool.force_close(0);
        assert_eq!(group, 0);
        assert_eq!(pool.stats().empty_closes, 1);
        assert_eq!(pool.consolidated(handle), b"".as_slice());
        pool.free(handle);

        // The replacement accepts joins at the same position.
        let r = pool.join(10, SlotFlags::empty()).unwrap();
        assert_eq!(r.offset(), 0);
    }

    #[test]
    fn test_close_after_forced_rotation_returns_none() {
        let pool = SlotPool::new(small_config()).unwrap();
        let mut r = pool.join(8, SlotFlags::empty()).unwrap();
        assert!(r.is_leader());
        pool.copy_record(&mut r, b"01234567");
        let leader = r.handle();
        pool.release(r);

        let (handle, group) = pool.force_close(0);
        assert_eq!(handle, leader);
        assert_eq!(group, 8);

        // The leader lost the race; its close finds nothing to do.
        assert_eq!(pool.close(leader), None);

        pool.wait(handle);
        assert_eq!(pool.consolidated(handle), b"01234567".as_slice());
        pool.free(handle);
    }

    #[test]
    fn test_stale_close_misses_a_recycled_slot() {
        let pool = SlotPool::new(small_config()).unwrap();
        let mut r = pool.join(8, SlotFlags::empty()).unwrap();
        pool.copy_record(&mut r, b"01234567");
        let stale = r.handle();
        pool.release(r);

        // A forced rotation retires the leader's slot, and three more
        // walk the round-robin cursor all the way back to it.
        let (handle, group) = pool.force_close(0);
        assert_eq!(handle, stale);
        assert_eq!(group, 8);
        pool.wait(handle);
        pool.free(handle);
        for _ in 0..3 {
            let (handle, group) = pool.force_close(0);
            assert_eq!(group, 0);
            pool.free(handle);
        }

        // The stale handle's slot serves the table again, one generation
        // later. Joins land on it, but the held-over close must miss
        // instead of retiring the new group.
        let mut fresh = pool.join(4, SlotFlags::empty()).unwrap();
        assert_eq!(fresh.handle().index(), stale.index());
        assert_ne!(fresh.handle(), stale);
        assert_eq!(pool.close(stale), None);

        pool.copy_record(&mut fresh, b"wxyz");
        let leader = fresh.handle();
        pool.release(fresh);
        assert_eq!(pool.close(leader), Some(4));
        pool.wait(leader);
        assert_eq!(pool.consolidated(leader), b"wxyz".as_slice());
        pool.free(leader);
    }

    #[test]
    fn test_rotation_reuses_freed_slots() {
        let pool = SlotPool::new(small_config()).unwrap();
        for _ in 0..20 {
            let mut r = pool.join(8, SlotFlags::empty()).unwrap();
            assert!(r.is_leader());
            pool.copy_record(&mut r, b"01234567");
            let handle = r.handle();
            pool.release(r);
            let group = pool.close(handle).unwrap();
            assert_eq!(group, 8);
            pool.wait(handle);
            assert_eq!(pool.consolidated(handle), b"01234567".as_slice());
            pool.free(handle);
        }
        let stats = pool.stats();
        assert_eq!(stats.joins, 20);
        assert_eq!(stats.closes, 20);
        assert_eq!(stats.consolidated_bytes, 160);
    }

    #[test]
    fn test_flags_accumulate_across_joiners() {
        let pool = SlotPool::new(small_config()).unwrap();
        let a = pool.join(4, SlotFlags::SYNC).unwrap();
        let b = pool.join(4, SlotFlags::SYNC_DIR).unwrap();
        let c = pool.join(4, SlotFlags::empty()).unwrap();
        let leader = a.handle();
        for mut r in [a, b, c] {
            pool.copy_record(&mut r, b"xxxx");
            pool.release(r);
        }
        pool.close(leader).unwrap();
        pool.wait(leader);
        assert_eq!(
            pool.group_flags(leader),
            SlotFlags::SYNC | SlotFlags::SYNC_DIR
        );
        pool.free(leader);

        // The next group starts with a clean union.
        let mut d = pool.join(4, SlotFlags::empty()).unwrap();
        pool.copy_record(&mut d, b"yyyy");
        let leader = d.handle();
        pool.release(d);
        pool.close(leader).unwrap();
        pool.wait(leader);
        assert_eq!(pool.group_flags(leader), SlotFlags::empty());
        pool.free(leader);
    }

    #[test]
    fn test_concurrent_joins_stay_disjoint() {
        let config = LogConfig {
            pool_slots: 8,
            active_slots: 2,
            buffer_size: 128,
            ..Default::default()
        };
        let pool = Arc::new(SlotPool::new(config).unwrap());
        let collected = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for thread_id in 0..8 {
            let pool = Arc::clone(&pool);
            let collected = Arc::clone(&collected);
            workers.push(thread::spawn(move || {
                for seq in 0..100 {
                    let record = format!("t{}r{:03};", thread_id, seq);
                    let mut reservation = loop {
                        match pool.join(record.len(), SlotFlags::empty()) {
                            Ok(r) => break r,
                            Err(Error::NoRoom) => thread::sleep(Duration::from_millis(1)),
                            Err(e) => panic!("unexpected join failure: {}", e),
                        }
                    };
                    pool.copy_record(&mut reservation, record.as_bytes());
                    let leader = reservation.is_leader();
                    let handle = reservation.handle();
                    pool.release(reservation);
                    if leader {
                        if let Some(_group) = pool.close(handle) {
                            pool.wait(handle);
                            collected.lock().extend_from_slice(pool.consolidated(handle));
                            pool.free(handle);
                        }
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // Every record shows up exactly once, never torn.
        let bytes = collected.lock();
        assert_eq!(bytes.len(), 8 * 100 * 7);
        let mut seen = HashSet::new();
        for chunk in bytes.chunks(7) {
            assert!(seen.insert(chunk.to_vec()), "duplicate record {:?}", chunk);
        }
        assert_eq!(seen.len(), 800);

        let stats = pool.stats();
        assert_eq!(stats.joins, 800);
        assert_eq!(stats.consolidated_bytes, 8 * 100 * 7);
        assert!(stats.closes >= 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = LogConfig {
            pool_slots: 4,
            active_slots: 4,
            ..Default::default()
        };
        assert!(matches!(SlotPool::new(config), Err(Error::Config(_))));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_force_close_out_of_range_panics() {
        let pool = SlotPool::new(small_config()).unwrap();
        pool.force_close(5);
    }
}
