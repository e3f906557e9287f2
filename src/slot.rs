//! Slots: the unit of log consolidation.
//!
//! A slot owns a fixed record buffer and a single atomic lifecycle word.
//! The word holds one of four sentinels (`DONE < FREE < PENDING < READY`)
//! or, while the slot is joinable, `READY` plus the bytes reserved so far.
//! Joiners move the watermark forward with compare-exchange; the closer
//! swaps in `PENDING` and reads the final watermark as the group size.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize};

use bitflags::bitflags;
use crossbeam_utils::CachePadded;

/// Lifecycle sentinels. Values at or above `SLOT_READY` mean the slot is
/// joinable and `state - SLOT_READY` bytes are reserved.
pub(crate) const SLOT_DONE: i64 = 0;
pub(crate) const SLOT_FREE: i64 = 1;
pub(crate) const SLOT_PENDING: i64 = 2;
pub(crate) const SLOT_READY: i64 = 3;

/// Table position of a slot that is not currently active.
pub(crate) const INVALID_POSITION: usize = usize::MAX;

bitflags! {
    /// Durability requirements carried by a group.
    ///
    /// Joiners OR their flags onto the slot, and the group write honors
    /// the union. Flags reset when the slot returns to the free pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u32 {
        /// Sync the log file after the group write.
        const SYNC = 0b0001;
        /// Sync the log directory after the group write.
        const SYNC_DIR = 0b0010;
    }
}

/// Identifies one activation of a slot within its pool.
///
/// The generation ties the handle to a single Free-to-Free epoch, so a
/// handle held across the slot's recycling no longer matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl SlotHandle {
    /// Pool index of this slot.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot#{}", self.index)
    }
}

/// A successful join: the caller owns `len` bytes at `offset` in the
/// slot's buffer until it releases them.
///
/// Minted by `SlotPool::join`, written through `SlotPool::copy_record`,
/// and consumed by `SlotPool::release`.
#[derive(Debug)]
pub struct Reservation {
    pub(crate) handle: SlotHandle,
    pub(crate) offset: u64,
    pub(crate) len: usize,
}

impl Reservation {
    /// Slot the range was reserved in.
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Byte offset of the range within the slot buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length reservation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The offset-0 joiner leads the group: it closes the slot and flushes
    /// the consolidated buffer.
    pub fn is_leader(&self) -> bool {
        self.offset == 0
    }
}

/// One consolidation slot.
///
/// The buffer is written concurrently by joiners holding disjoint
/// reservations, so it lives behind `UnsafeCell` and the slot asserts
/// `Sync` itself.
pub(crate) struct Slot {
    /// Lifecycle word; padded to keep joiner traffic off neighboring slots.
    state: CachePadded<AtomicI64>,
    /// Bytes released by joiners that finished copying.
    released: AtomicU64,
    /// Final watermark captured at close.
    group_size: AtomicU64,
    /// Union of the joiners' durability flags.
    flags: AtomicU32,
    /// Rotation backoff hint; survives free so contention history sticks.
    churn: AtomicI32,
    /// Active table position while serving joins.
    position: AtomicUsize,
    /// Activation epoch; bumps each time the slot enters the table.
    generation: AtomicU64,
    buf: Box<[UnsafeCell<u8>]>,
}

// Reservations hand out disjoint ranges, so concurrent buffer writes never
// alias; every other field is an atomic.
unsafe impl Sync for Slot {}

impl Slot {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: CachePadded::new(AtomicI64::new(SLOT_FREE)),
            released: AtomicU64::new(0),
            group_size: AtomicU64::new(0),
            flags: AtomicU32::new(SlotFlags::empty().bits()),
            churn: AtomicI32::new(0),
            position: AtomicUsize::new(INVALID_POSITION),
            generation: AtomicU64::new(0),
            buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn state(&self) -> i64 {
        self.state.load(SeqCst)
    }

    /// Try to move the reservation watermark from `observed` to `next`.
    /// On failure returns the state seen instead.
    pub(crate) fn cas_state(&self, observed: i64, next: i64) -> Result<i64, i64> {
        self.state.compare_exchange(observed, next, SeqCst, SeqCst)
    }

    /// Stop accepting joins. Returns the prior state, whose distance from
    /// `SLOT_READY` is the group size.
    pub(crate) fn swap_pending(&self) -> i64 {
        self.state.swap(SLOT_PENDING, SeqCst)
    }

    pub(crate) fn publish_done(&self) {
        self.state.store(SLOT_DONE, SeqCst);
    }

    /// Install the slot at a table position and open it for joins. Each
    /// activation starts a new generation.
    pub(crate) fn activate(&self, position: usize) {
        self.generation.fetch_add(1, SeqCst);
        self.position.store(position, SeqCst);
        self.state.store(SLOT_READY, SeqCst);
    }

    /// Return the slot to the pool. Flags and the completion tally reset;
    /// churn carries over to the next use.
    pub(crate) fn reset(&self) {
        self.flags.store(SlotFlags::empty().bits(), SeqCst);
        self.released.store(0, SeqCst);
        self.state.store(SLOT_FREE, SeqCst);
    }

    pub(crate) fn position(&self) -> usize {
        self.position.load(SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(SeqCst)
    }

    pub(crate) fn merge_flags(&self, flags: SlotFlags) {
        self.flags.fetch_or(flags.bits(), SeqCst);
    }

    pub(crate) fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits_retain(self.flags.load(SeqCst))
    }

    pub(crate) fn churn(&self) -> i32 {
        self.churn.load(SeqCst)
    }

    /// Raise the churn hint, saturating at `cap`. Only the rotation path
    /// mutates churn, always under the rotation lock.
    pub(crate) fn raise_churn(&self, cap: i32) {
        if self.churn.load(SeqCst) < cap {
            self.churn.fetch_add(1, SeqCst);
        }
    }

    pub(crate) fn ease_churn(&self) {
        if self.churn.load(SeqCst) > 0 {
            self.churn.fetch_sub(1, SeqCst);
        }
    }

    pub(crate) fn set_group(&self, group: u64) {
        self.group_size.store(group, SeqCst);
    }

    pub(crate) fn group(&self) -> u64 {
        self.group_size.load(SeqCst)
    }

    /// Add a finished joiner's bytes to the completion tally, returning
    /// the new total.
    pub(crate) fn release_add(&self, size: u64) -> u64 {
        self.released.fetch_add(size, SeqCst) + size
    }

    pub(crate) fn released(&self) -> u64 {
        self.released.load(SeqCst)
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// The range must come from a reservation; reserved ranges are
    /// disjoint, so the raw-pointer write cannot alias another joiner's.
    pub(crate) fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.capacity(),
            "write of {} bytes at offset {} exceeds slot capacity {}",
            data.len(),
            offset,
            self.capacity()
        );
        unsafe {
            let base = self.buf.as_ptr() as *mut u8;
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
        }
    }

    /// The first `len` bytes of the buffer. Only meaningful once the group
    /// completed and before the slot is freed.
    pub(crate) fn filled(&self, len: usize) -> &[u8] {
        assert!(len <= self.capacity());
        if len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const u8, len) }
    }
}
