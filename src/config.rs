//! Pool sizing and backoff tuning.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a slot pool.
///
/// Defaults match the sizing the consolidation algorithm was tuned with:
/// a 16-slot pool serving 4 active positions with 256 KiB buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Total slots in the pool.
    pub pool_slots: usize,
    /// Positions in the active table accepting joins. Must stay below
    /// `pool_slots` so rotation always has spare slots to install.
    pub active_slots: usize,
    /// Record buffer size per slot, in bytes.
    pub buffer_size: usize,
    /// Maximum log file size, in bytes; slot buffers are capped to it.
    pub file_max: usize,
    /// Full-slot retries before a join gives up with `NoRoom`.
    pub join_attempts: u32,
    /// Upper bound on the per-slot churn pause.
    pub churn_max: i32,
    /// Yield iterations before a waiting closer falls back to sleeping.
    pub wait_spin: u32,
    /// Sleep between completion checks after the spin phase, in
    /// microseconds.
    pub wait_sleep_us: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            pool_slots: 16,
            active_slots: 4,
            buffer_size: 256 * 1024,
            file_max: 100 * 1024 * 1024,
            join_attempts: 5,
            churn_max: 5,
            wait_spin: 1000,
            wait_sleep_us: 200,
        }
    }
}

impl LogConfig {
    /// Parse a configuration from TOML. Missing fields keep their defaults.
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let input = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_toml(&input)
    }

    /// Buffer capacity actually allocated per slot.
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.min(self.file_max)
    }

    /// Check the sizing invariants.
    pub fn validate(&self) -> Result<()> {
        if self.pool_slots == 0 {
            return Err(Error::Config("pool_slots must be nonzero".to_string()));
        }
        if self.active_slots == 0 {
            return Err(Error::Config("active_slots must be nonzero".to_string()));
        }
        if self.active_slots >= self.pool_slots {
            return Err(Error::Config(format!(
                "active_slots ({}) must be less than pool_slots ({})",
                self.active_slots, self.pool_slots
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be nonzero".to_string()));
        }
        if self.file_max == 0 {
            return Err(Error::Config("file_max must be nonzero".to_string()));
        }
        if self.churn_max < 0 {
            return Err(Error::Config("churn_max must not be negative".to_string()));
        }
        Ok(())
    }
}
