//! Session logging.
//!
//! Every catalog writes timestamped records to the configured logfile and to
//! an in-memory ring, so `session_log()` can return exactly what the current
//! session produced. Records also forward to `tracing` at debug level.

use crate::error::{EsgfError, Result};
use chrono::{DateTime, Duration, Local, Utc};
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Most recent records kept in memory per session.
const RING_CAPACITY: usize = 8192;

struct LogEntry {
    at: DateTime<Utc>,
    line: String,
}

struct LogInner {
    file: Option<std::fs::File>,
    ring: VecDeque<LogEntry>,
}

/// A capture-to-stream-plus-file logger scoped to one catalog session.
///
/// Cloning shares the underlying stream; writes from any thread are
/// serialized by an internal mutex.
#[derive(Clone)]
pub struct Log {
    inner: Arc<Mutex<LogInner>>,
}

impl Log {
    /// Open a log appending to `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EsgfError::io_with_path(e, parent))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EsgfError::io_with_path(e, path))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(LogInner {
                file: Some(file),
                ring: VecDeque::new(),
            })),
        })
    }

    /// An in-memory log with no backing file, for tests and cloned catalogs.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                file: None,
                ring: VecDeque::new(),
            })),
        }
    }

    /// Append a record.
    pub fn info(&self, message: impl AsRef<str>) -> Result<()> {
        let message = message.as_ref();
        tracing::debug!(target: "esgf_catalog::session", "{message}");
        let now = Utc::now();
        let line = format!(
            "\x1b[36;20m{}\x1b[0m {}",
            now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            message
        );
        let mut inner = self.lock()?;
        if let Some(file) = inner.file.as_mut() {
            let _ = writeln!(file, "{line}");
        }
        if inner.ring.len() == RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(LogEntry { at: now, line });
        Ok(())
    }

    /// Return every record captured in memory.
    pub fn read(&self) -> Result<String> {
        let inner = self.lock()?;
        Ok(inner
            .ring
            .iter()
            .map(|e| e.line.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Return records at or after `since`, padded backwards by a small skew
    /// allowance so records written while the session timestamp was being
    /// taken are not lost.
    pub fn read_since(&self, since: DateTime<Utc>) -> Result<String> {
        let cutoff = since - Duration::seconds(2);
        let inner = self.lock()?;
        Ok(inner
            .ring
            .iter()
            .filter(|e| e.at >= cutoff)
            .map(|e| e.line.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogInner>> {
        self.inner.lock().map_err(|_| EsgfError::Io {
            message: "session log lock poisoned".to_string(),
            path: None,
            source: None,
        })
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.lock() {
            Ok(inner) => f
                .debug_struct("Log")
                .field("file", &inner.file.is_some())
                .field("records", &inner.ring.len())
                .finish(),
            Err(_) => f.debug_struct("Log").field("poisoned", &true).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capture_and_read() {
        let log = Log::in_memory();
        log.info("accessed /some/file.nc").unwrap();
        log.info("download failed https://example.org/file.nc").unwrap();
        let text = log.read().unwrap();
        assert!(text.contains("accessed /some/file.nc"));
        assert!(text.contains("download failed"));
    }

    #[test]
    fn test_read_since_slices() {
        let log = Log::in_memory();
        log.info("early record").unwrap();
        let text = log.read_since(Utc::now() + Duration::seconds(30)).unwrap();
        assert!(text.is_empty());
        let text = log.read_since(Utc::now()).unwrap();
        assert!(text.contains("early record"));
    }

    #[test]
    fn test_file_backed_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("esgf.log");
        let log = Log::open(&path).unwrap();
        log.info("transfer_time=1.20 [s] at 8.00 [Mb s-1] https://example.org/f.nc")
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[Mb s-1]"));
    }
}
