// slotlog - Consolidated write-ahead logging
// Lock-minimal group commit through slot reservation

#![warn(rust_2018_idioms)]

pub mod bench;
pub mod config;
pub mod pool;
pub mod sink;
pub mod slot;
pub mod stats;
pub mod writer;

// Re-exports for convenience
pub use config::LogConfig;
pub use pool::SlotPool;
pub use sink::{FileSink, LogSink, MemorySink};
pub use slot::{Reservation, SlotFlags, SlotHandle};
pub use stats::{SlotStats, StatsSnapshot};
pub use writer::GroupWriter;

/// Slot operation error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Record too large: {size} bytes (slot capacity {capacity})")]
        TooLarge { size: usize, capacity: usize },

        #[error("No room: every slot was too full to take the record")]
        NoRoom,

        #[error("Group write failed: {0}")]
        WriteFailure(String),

        #[error("Invalid configuration: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
