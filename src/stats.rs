//! Counters for the consolidation hot path.
//!
//! All counters are relaxed atomics. They feed operational visibility
//! only; nothing in the protocol reads them back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters maintained by a pool and its writer.
#[derive(Debug, Default)]
pub struct SlotStats {
    /// Successful joins.
    pub(crate) joins: AtomicU64,
    /// Reservation CAS retries against the same slot.
    pub(crate) races: AtomicU64,
    /// Joins that observed a slot mid-transition and re-picked.
    pub(crate) transitions: AtomicU64,
    /// Records refused because they exceed the slot capacity.
    pub(crate) too_large: AtomicU64,
    /// Joins that exhausted their full-slot retry budget.
    pub(crate) no_room: AtomicU64,
    /// Slots closed with a nonzero group.
    pub(crate) closes: AtomicU64,
    /// Slots closed with no joined bytes.
    pub(crate) empty_closes: AtomicU64,
    /// Rotation scans that found the candidate slot still busy.
    pub(crate) switch_fails: AtomicU64,
    /// Bytes accumulated across all closed groups.
    pub(crate) consolidated_bytes: AtomicU64,
    /// Groups handed to the sink.
    pub(crate) group_writes: AtomicU64,
}

impl SlotStats {
    /// Capture a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            joins: self.joins.load(Ordering::Relaxed),
            races: self.races.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            too_large: self.too_large.load(Ordering::Relaxed),
            no_room: self.no_room.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            empty_closes: self.empty_closes.load(Ordering::Relaxed),
            switch_fails: self.switch_fails.load(Ordering::Relaxed),
            consolidated_bytes: self.consolidated_bytes.load(Ordering::Relaxed),
            group_writes: self.group_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`SlotStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub joins: u64,
    pub races: u64,
    pub transitions: u64,
    pub too_large: u64,
    pub no_room: u64,
    pub closes: u64,
    pub empty_closes: u64,
    pub switch_fails: u64,
    pub consolidated_bytes: u64,
    pub group_writes: u64,
}

impl StatsSnapshot {
    /// Mean bytes per closed group, or zero before the first close.
    pub fn avg_group_size(&self) -> u64 {
        if self.closes == 0 {
            0
        } else {
            self.consolidated_bytes / self.closes
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "slot statistics:")?;
        writeln!(f, "  joins:              {}", self.joins)?;
        writeln!(f, "  races:              {}", self.races)?;
        writeln!(f, "  transitions:        {}", self.transitions)?;
        writeln!(f, "  too large:          {}", self.too_large)?;
        writeln!(f, "  no room:            {}", self.no_room)?;
        writeln!(f, "  closes:             {}", self.closes)?;
        writeln!(f, "  empty closes:       {}", self.empty_closes)?;
        writeln!(f, "  switch fails:       {}", self.switch_fails)?;
        writeln!(f, "  consolidated bytes: {}", self.consolidated_bytes)?;
        writeln!(f, "  group writes:       {}", self.group_writes)?;
        write!(f, "  avg group size:     {}", self.avg_group_size())
    }
}
