//! Append-only audit log with size-triggered rotation.
//!
//! The supervisor keeps an on-disk audit trail separate from its tracing
//! diagnostics: one line per record, rotated by renaming the file once it
//! reaches the size cap. The handle is reopened for every record so a
//! writer never points at a renamed file, and a failed write can never
//! take the supervisor down.

use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::MAX_LOG_SIZE;

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// Size-rotated audit log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    max_size: u64,
    degraded: AtomicBool,
}

impl AuditLog {
    /// Create a log writing to `path` with the default rotation threshold.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_size(path, MAX_LOG_SIZE)
    }

    /// Create a log with an explicit rotation threshold.
    pub fn with_max_size(path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            path: path.into(),
            max_size,
            degraded: AtomicBool::new(false),
        }
    }

    /// Append one record, rotating first if the file has reached the cap.
    ///
    /// Failures are swallowed: the log must never crash the supervisor.
    /// They latch the degraded flag instead.
    pub fn emit(&self, level: Level, message: &str) {
        if let Err(e) = self.write_record(level, message) {
            self.degraded.store(true, Ordering::Relaxed);
            tracing::debug!(error = %e, path = %self.path.display(), "audit log write failed");
        }
    }

    /// Whether any emit has failed since this log was created.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// The active log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, level: Level, message: &str) -> std::io::Result<()> {
        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        writeln!(file, "[{}] {} {}", level, timestamp, message)
    }

    /// Rename the active file aside once it reaches the cap. The rename is
    /// atomic on the same filesystem and the next write opens a fresh
    /// file, so no record is ever split across the rotation.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_size {
            return Ok(());
        }

        std::fs::rename(&self.path, self.rotated_path())
    }

    /// Pick `<path>.<unix_seconds>`, suffixing a counter when several
    /// rotations land in the same second.
    fn rotated_path(&self) -> PathBuf {
        let seconds = Utc::now().timestamp();
        let base = format!("{}.{}", self.path.display(), seconds);
        let mut candidate = PathBuf::from(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = PathBuf::from(format!("{}.{}", base, n));
            n += 1;
        }
        candidate
    }
}
