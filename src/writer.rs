//! The append path on top of the pool.
//!
//! `append` joins a slot, copies the record, and releases. The
//! offset-zero joiner of each slot additionally closes it and writes the
//! whole group to the sink, so most appends never take a lock or touch
//! the sink at all. A non-leader append returns once its copy is
//! released; its bytes become durable when the leader behind it writes
//! the group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::pool::SlotPool;
use crate::sink::LogSink;
use crate::slot::{SlotFlags, SlotHandle};
use crate::stats::StatsSnapshot;

/// Backoff between join retries when every slot is too full.
const NO_ROOM_RETRY: Duration = Duration::from_millis(1);

/// Appends records through a slot pool and writes consolidated groups
/// to a sink.
pub struct GroupWriter {
    pool: SlotPool,
    sink: Box<dyn LogSink>,
    /// Set when a group write fails; later appends fail fast.
    poisoned: AtomicBool,
}

impl GroupWriter {
    pub fn new(config: LogConfig, sink: Box<dyn LogSink>) -> Result<Self> {
        Ok(Self {
            pool: SlotPool::new(config)?,
            sink,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Append one record.
    ///
    /// Blocks while every slot is too full to take the record, retrying
    /// until a reservation succeeds. Fails with [`Error::TooLarge`] when
    /// the record cannot fit any slot buffer, and with
    /// [`Error::WriteFailure`] when this or an earlier group write
    /// failed.
    pub fn append(&self, record: &[u8], flags: SlotFlags) -> Result<()> {
        self.check_poisoned()?;
        let mut reservation = loop {
            match self.pool.join(record.len(), flags) {
                Ok(reservation) => break reservation,
                Err(Error::NoRoom) => thread::sleep(NO_ROOM_RETRY),
                Err(e) => return Err(e),
            }
        };
        self.pool.copy_record(&mut reservation, record);
        let leader = reservation.is_leader();
        let handle = reservation.handle();
        self.pool.release(reservation);
        if leader {
            if let Some(group) = self.pool.close(handle) {
                self.flush_group(handle, group)?;
            }
        }
        Ok(())
    }

    /// Force every active slot out and write whatever they hold.
    pub fn flush(&self) -> Result<()> {
        self.check_poisoned()?;
        debug!(
            positions = self.pool.active_positions(),
            "forcing active slots out"
        );
        for position in 0..self.pool.active_positions() {
            let (handle, group) = self.pool.force_close(position);
            self.flush_group(handle, group)?;
        }
        Ok(())
    }

    /// Wait out a closed group, hand it to the sink, and free the slot.
    fn flush_group(&self, handle: SlotHandle, group: u64) -> Result<()> {
        if group == 0 {
            self.pool.free(handle);
            return Ok(());
        }
        self.pool.wait(handle);
        let flags = self.pool.group_flags(handle);
        match self.sink.write_group(self.pool.consolidated(handle), flags) {
            Ok(()) => {
                self.pool.stats.group_writes.fetch_add(1, Ordering::Relaxed);
                debug!(slot = %handle, group, "group written");
                self.pool.free(handle);
                Ok(())
            }
            Err(e) => {
                // The slot stays out of circulation; its contents never
                // became durable.
                self.poisoned.store(true, Ordering::SeqCst);
                error!(slot = %handle, error = %e, "group write failed, writer poisoned");
                Err(e)
            }
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::WriteFailure(
                "an earlier group write failed".to_string(),
            ));
        }
        Ok(())
    }

    /// True once a group write has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Snapshot the underlying pool's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }
}
