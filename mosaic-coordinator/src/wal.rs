//! Per-commit write-ahead log and the startup scan that replays it.
//!
//! Each commit owns one append-only text file, `log/log_<stem>.txt` under
//! the coordinator root, with lines out of the fixed grammar
//! `File Name:<name>`, `Sources:<s1>,<s2>,…`, `Phase One`,
//! `Phase Two:<YES|NO|ABORT>`, `DONE`. Every append is `fsync`ed before
//! the state change it records becomes externally observable.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mosaic_core::{fsio, CommitId, Decision, LOG_DIR};
use tracing::warn;

const FILE_NAME_STR: &str = "File Name";
const SOURCES_STR: &str = "Sources";
const PHASE_ONE_STR: &str = "Phase One";
const PHASE_TWO_STR: &str = "Phase Two";
const DONE_STR: &str = "DONE";
const LOG_FILE_PREFIX: &str = "log_";
const TXT_SUFFIX: &str = ".txt";

/// Failure reading a commit log during recovery.
#[derive(Debug)]
pub enum WalError {
    Io(io::Error),
    /// A `Phase Two` marker whose decision does not parse.
    BadDecision { path: PathBuf, text: String },
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io(e) => write!(f, "commit log IO error: {e}"),
            WalError::BadDecision { path, text } => {
                write!(f, "bad decision in {}: {text:?}", path.display())
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WalError::Io(e) => Some(e),
            WalError::BadDecision { .. } => None,
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
        let mut file = self.file.lock().expect("commit log mutex poisoned");
        fsio::append_line(&mut file, line)
    }
}

/// Handle to one commit's write-ahead log.
#[derive(Clone)]
pub struct CommitLog {
    inner: Arc<LogInner>,
}

impl CommitLog {
    /// Path of the log file for `commit` under `root`.
    #[must_use]
    pub fn path(root: &Path, commit: &CommitId) -> PathBuf {
        root.join(LOG_DIR)
            .join(format!("{LOG_FILE_PREFIX}{}{TXT_SUFFIX}", commit.stem()))
    }

    /// Open (creating if missing) the log for `commit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be created.
    pub fn open(root: &Path, commit: &CommitId) -> io::Result<Self> {
        let file = fsio::open_append(&Self::path(root, commit))?;
        Ok(Self {
            inner: Arc::new(LogInner {
                file: Mutex::new(file),
            }),
        })
    }

    async fn append(&self, line: String) -> io::Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.append_sync(&line))
            .await
            .expect("spawn_blocking panicked")
    }

    /// Durably record the commit's name and source list.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or `fsync` fails.
    pub async fn record_manifest(&self, manifest: &crate::CommitManifest) -> io::Result<()> {
        self.append(format!("{FILE_NAME_STR}:{}", manifest.file_name()))
            .await?;
        self.append(format!("{SOURCES_STR}:{}", manifest.sources_line()))
            .await
    }

    /// Durably mark the start of Phase I.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or `fsync` fails.
    pub async fn phase_one(&self) -> io::Result<()> {
        self.append(PHASE_ONE_STR.to_owned()).await
    }

    /// Durably record the decision, opening Phase II.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or `fsync` fails.
    pub async fn phase_two(&self, decision: Decision) -> io::Result<()> {
        self.append(format!("{PHASE_TWO_STR}:{decision}")).await
    }

    /// Durably mark the commit finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or `fsync` fails.
    pub async fn done(&self) -> io::Result<()> {
        self.append(DONE_STR.to_owned()).await
    }
}

/// Close out a log whose first line never made it to disk whole: append a
/// `DONE` marker so recovery skips it from now on.
///
/// # Errors
///
/// Returns an error if the write or `fsync` fails.
pub fn close_orphan(path: &Path) -> io::Result<()> {
    let mut file = fsio::open_append(path)?;
    fsio::append_line(&mut file, DONE_STR)
}

/// What one commit's log says about how far it got.
#[derive(Debug, Clone, Default)]
pub struct ReplayedCommit {
    pub file_name: Option<String>,
    pub sources: Vec<String>,
    pub phase_one: bool,
    pub decision: Option<Decision>,
    pub done: bool,
}

/// Parse one commit log.
///
/// Unrecognized lines are skipped; only an unparsable decision is fatal,
/// because resuming Phase II with the wrong decision would break the
/// protocol's monotonicity.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a `Phase Two` line
/// carries an unknown decision.
pub fn replay_file(path: &Path) -> Result<ReplayedCommit, WalError> {
    let text = std::fs::read_to_string(path)?;
    let mut replay = ReplayedCommit::default();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(FILE_NAME_STR) {
            replay.file_name = rest.strip_prefix(':').map(str::to_owned);
        } else if let Some(rest) = line.strip_prefix(SOURCES_STR) {
            if let Some(joined) = rest.strip_prefix(':') {
                replay.sources = joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
        } else if line.starts_with(PHASE_TWO_STR) {
            let text = line
                .strip_prefix(PHASE_TWO_STR)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or_default();
            replay.decision = Some(text.parse().map_err(|_| WalError::BadDecision {
                path: path.to_owned(),
                text: line.to_owned(),
            })?);
        } else if line.starts_with(PHASE_ONE_STR) {
            replay.phase_one = true;
        } else if line.starts_with(DONE_STR) {
            replay.done = true;
        }
    }
    Ok(replay)
}

/// Scan the log directory under `root` for commit logs, recursively (log
/// names mirror composite names, which may contain directories).
///
/// A missing log directory means a fresh coordinator: nothing to recover.
///
/// # Errors
///
/// Returns an error if the directory walk or any log parse fails.
pub fn scan(root: &Path) -> Result<Vec<(PathBuf, ReplayedCommit)>, WalError> {
    let log_dir = root.join(LOG_DIR);
    if !log_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut pending = vec![log_dir];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file()
                && path.extension().is_some_and(|ext| ext == "txt")
            {
                let replay = replay_file(&path)?;
                if replay.file_name.is_none() && !replay.done {
                    warn!(path = %path.display(), "commit log without a file name");
                }
                entries.push((path, replay));
            }
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommitManifest;
    use tempfile::TempDir;

    async fn write_log(root: &Path, name: &str, stages: &[&str]) -> CommitLog {
        let commit = CommitId::new(name);
        let log = CommitLog::open(root, &commit).unwrap();
        let manifest = CommitManifest::parse(
            commit,
            &["a:1.jpg".to_owned(), "b:3.jpg".to_owned()],
        )
        .unwrap();
        log.record_manifest(&manifest).await.unwrap();
        for stage in stages {
            log.append((*stage).to_owned()).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn replay_reads_back_all_markers() {
        let dir = TempDir::new().unwrap();
        write_log(
            dir.path(),
            "c.jpg",
            &["Phase One", "Phase Two:YES", "DONE"],
        )
        .await;

        let replay = replay_file(&CommitLog::path(dir.path(), &CommitId::new("c.jpg"))).unwrap();
        assert_eq!(replay.file_name.as_deref(), Some("c.jpg"));
        assert_eq!(replay.sources, ["a:1.jpg", "b:3.jpg"]);
        assert!(replay.phase_one);
        assert_eq!(replay.decision, Some(Decision::Yes));
        assert!(replay.done);
    }

    #[tokio::test]
    async fn replay_of_interrupted_commit() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), "c.jpg", &["Phase One"]).await;

        let replay = replay_file(&CommitLog::path(dir.path(), &CommitId::new("c.jpg"))).unwrap();
        assert!(replay.phase_one);
        assert_eq!(replay.decision, None);
        assert!(!replay.done);
    }

    #[tokio::test]
    async fn bad_decision_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), "c.jpg", &["Phase One", "Phase Two:PERHAPS"]).await;

        let err =
            replay_file(&CommitLog::path(dir.path(), &CommitId::new("c.jpg"))).unwrap_err();
        assert!(matches!(err, WalError::BadDecision { .. }));
    }

    #[tokio::test]
    async fn scan_walks_nested_log_names() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), "composites/1.jpg", &["Phase One"]).await;
        write_log(dir.path(), "2.jpg", &[]).await;

        let entries = scan(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        let names: Vec<_> = entries
            .iter()
            .map(|(_, r)| r.file_name.clone().unwrap())
            .collect();
        assert!(names.contains(&"composites/1.jpg".to_owned()));
        assert!(names.contains(&"2.jpg".to_owned()));
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scan(dir.path()).unwrap().is_empty());
    }
}
