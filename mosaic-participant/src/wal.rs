//! Durable lock-transition log and its replay.
//!
//! The participant records every lock transition as one line of
//! `<source_file>:<commit_id>:<STATUS>` in `log/log.txt`, `fsync`ed before
//! the transition becomes externally observable. Replay nets the
//! transitions per `(source_file, commit_id)` pair: `PREPARED` counts +1,
//! `ABORTED` and `COMMITTED` count -1, and a pair with a positive net count
//! whose backing file still exists is restored as a lock.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use mosaic_core::{fsio, CommitId, LOG_DIR};

const LOG_FILE: &str = "log.txt";

/// Durable status of a source file with respect to one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Tentatively locked, waiting for the coordinator's decision.
    Prepared,
    /// Released without being consumed.
    Aborted,
    /// Consumed by a successful commit and deleted from disk.
    Committed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Prepared => "PREPARED",
            FileStatus::Aborted => "ABORTED",
            FileStatus::Committed => "COMMITTED",
        };
        f.write_str(s)
    }
}

impl FromStr for FileStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARED" => Ok(FileStatus::Prepared),
            "ABORTED" => Ok(FileStatus::Aborted),
            "COMMITTED" => Ok(FileStatus::Committed),
            _ => Err(()),
        }
    }
}

/// Failure reading or writing the lock log.
#[derive(Debug)]
pub enum WalError {
    Io(io::Error),
    /// Replay refuses to continue past a line it cannot parse.
    Malformed { line: usize, text: String },
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io(e) => write!(f, "lock log IO error: {e}"),
            WalError::Malformed { line, text } => {
                write!(f, "malformed lock log line {line}: {text:?}")
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WalError::Io(e) => Some(e),
            WalError::Malformed { .. } => None,
        }
    }
}

impl From<io::Error> for WalError {
    fn from(e: io::Error) -> Self {
        WalError::Io(e)
    }
}

struct LogInner {
    file: Mutex<File>,
}

impl LogInner {
    fn append_sync(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().expect("lock log mutex poisoned");
        fsio::append_line(&mut file, line)
    }
}

/// Handle to the participant's append-only lock log.
#[derive(Clone)]
pub struct LockLog {
    inner: Arc<LogInner>,
}

impl LockLog {
    /// Path of the log file under `root`.
    #[must_use]
    pub fn path(root: &Path) -> PathBuf {
        root.join(LOG_DIR).join(LOG_FILE)
    }

    /// Open (creating if missing) the lock log under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory or file cannot be created.
    pub fn open(root: &Path) -> io::Result<Self> {
        let file = fsio::open_append(&Self::path(root))?;
        Ok(Self {
            inner: Arc::new(LogInner {
                file: Mutex::new(file),
            }),
        })
    }

    /// Durably append one lock transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or `fsync` fails.
    pub async fn append(
        &self,
        source: &str,
        commit: &CommitId,
        status: FileStatus,
    ) -> io::Result<()> {
        let inner = self.inner.clone();
        let line = format!("{source}:{commit}:{status}");
        tokio::task::spawn_blocking(move || inner.append_sync(&line))
            .await
            .expect("spawn_blocking panicked")
    }
}

/// Replay the lock log under `root` into a lock table.
///
/// Only pairs with a positive net count whose source file still exists on
/// disk produce a lock entry. If a source file has positive counts under
/// several commits (which the protocol forbids), the commit seen first in
/// the log wins, deterministically.
///
/// # Errors
///
/// Returns [`WalError::Malformed`] on any line that is not a three-field
/// `source:commit:STATUS` triple; a log this process cannot account for
/// is not one it should rebuild locks from.
pub fn replay(root: &Path) -> Result<HashMap<String, CommitId>, WalError> {
    let path = LockLog::path(root);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    // Net count per (source, commit), remembering first-appearance order.
    let mut counts: HashMap<(String, String), i64> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = || WalError::Malformed {
            line: idx + 1,
            text: raw.to_owned(),
        };

        let mut parts = line.splitn(3, ':');
        let source = parts.next().ok_or_else(malformed)?;
        let commit = parts.next().ok_or_else(malformed)?;
        let status: FileStatus = parts
            .next()
            .ok_or_else(malformed)?
            .parse()
            .map_err(|()| malformed())?;
        if source.is_empty() || commit.is_empty() {
            return Err(malformed());
        }

        let key = (source.to_owned(), commit.to_owned());
        if !counts.contains_key(&key) {
            order.push(key.clone());
        }
        let delta = match status {
            FileStatus::Prepared => 1,
            FileStatus::Aborted | FileStatus::Committed => -1,
        };
        *counts.entry(key).or_insert(0) += delta;
    }

    let mut table = HashMap::new();
    for key in order {
        if counts[&key] > 0 && !table.contains_key(&key.0) && root.join(&key.0).exists() {
            table.insert(key.0, CommitId::new(key.1));
        }
    }
    Ok(table)
}
