//! Group destinations.
//!
//! The pool consolidates records; a [`LogSink`] decides where the
//! resulting groups land. [`FileSink`] appends to a log file with
//! flag-controlled durability, [`MemorySink`] captures groups in memory
//! for tests and benchmarks.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::slot::SlotFlags;

/// Destination for consolidated groups.
///
/// Each group arrives as one contiguous write together with the union
/// of the joiners' durability flags.
pub trait LogSink: Send + Sync {
    /// Append one consolidated group.
    fn write_group(&self, group: &[u8], flags: SlotFlags) -> Result<()>;
}

/// Sink that appends groups to a log file.
pub struct FileSink {
    file: Mutex<File>,
    /// Open handle on the log directory, for `SYNC_DIR` groups.
    dir: Option<File>,
    path: PathBuf,
}

impl FileSink {
    /// Create (or truncate) a log file at `path`, creating parent
    /// directories as needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::WriteFailure(format!("failed to create log directory: {}", e))
            })?;
        }
        let file = File::create(&path)
            .map_err(|e| Error::WriteFailure(format!("failed to create log file: {}", e)))?;
        let dir = match parent {
            Some(parent) => Some(File::open(parent).map_err(|e| {
                Error::WriteFailure(format!("failed to open log directory: {}", e))
            })?),
            None => None,
        };
        debug!(path = %path.display(), "file sink created");
        Ok(Self {
            file: Mutex::new(file),
            dir,
            path,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn write_group(&self, group: &[u8], flags: SlotFlags) -> Result<()> {
        let mut file = self.file.lock();
        file.write_all(group)
            .map_err(|e| Error::WriteFailure(e.to_string()))?;
        // Directory first so the file's existence is durable before its
        // data sync lands.
        if flags.contains(SlotFlags::SYNC_DIR) {
            if let Some(dir) = &self.dir {
                dir.sync_all()
                    .map_err(|e| Error::WriteFailure(e.to_string()))?;
            }
        }
        if flags.contains(SlotFlags::SYNC) {
            file.sync_data()
                .map_err(|e| Error::WriteFailure(e.to_string()))?;
        }
        Ok(())
    }
}

/// In-memory sink capturing every group in write order.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

#[derive(Default)]
struct MemorySinkInner {
    groups: Vec<(Vec<u8>, SlotFlags)>,
    fail_next: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups written so far.
    pub fn len(&self) -> usize {
        self.inner.lock().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across all groups.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().groups.iter().map(|(g, _)| g.len()).sum()
    }

    /// Copies of the captured groups, in write order.
    pub fn groups(&self) -> Vec<(Vec<u8>, SlotFlags)> {
        self.inner.lock().groups.clone()
    }

    /// Make the next write fail, for error-path tests.
    pub fn fail_next(&self) {
        self.inner.lock().fail_next = true;
    }
}

impl LogSink for MemorySink {
    fn write_group(&self, group: &[u8], flags: SlotFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next {
            inner.fail_next = false;
            return Err(Error::WriteFailure("injected failure".to_string()));
        }
        inner.groups.push((group.to_vec(), flags));
        Ok(())
    }
}
