//! Participant state machine.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mosaic_core::{fsio, CommitId, Envelope, MessageKind, NodeId};
use tracing::{debug, info, instrument, warn};

use crate::config::ParticipantConfig;
use crate::oracle::Oracle;
use crate::wal::{self, FileStatus, LockLog, WalError};

/// How long to sleep between checks of the recovery flag.
const RECOVER_POLL: Duration = Duration::from_millis(50);

/// A participant node: lock table, durable lock log, and the reactive
/// message handlers.
///
/// Handlers are serialized by the delivery loop; the lock table is still
/// behind a mutex so recovery and test introspection stay safe.
pub struct Participant<O> {
    id: NodeId,
    root: PathBuf,
    oracle: O,
    locks: Mutex<HashMap<String, CommitId>>,
    wal: LockLog,
    recovered: AtomicBool,
}

impl<O: Oracle> Participant<O> {
    /// Open the node's lock log under `config.root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory or file cannot be created.
    pub fn open(config: ParticipantConfig, oracle: O) -> io::Result<Self> {
        let wal = LockLog::open(&config.root)?;
        Ok(Self {
            id: config.node,
            root: config.root,
            oracle,
            locks: Mutex::new(HashMap::new()),
            wal,
            recovered: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replay the lock log into the in-memory lock table and open the
    /// delivery gate. Must complete before any message is handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or contains a malformed
    /// line.
    #[instrument(skip_all, fields(node = %self.id))]
    pub async fn recover(&self) -> Result<(), WalError> {
        let root = self.root.clone();
        let table = tokio::task::spawn_blocking(move || wal::replay(&root))
            .await
            .expect("spawn_blocking panicked")?;
        info!(locks = table.len(), "recovered lock table");
        *self.locks.lock().expect("lock table mutex poisoned") = table;
        self.recovered.store(true, Ordering::Release);
        Ok(())
    }

    /// Block until [`recover`](Self::recover) has completed.
    pub async fn wait_recovered(&self) {
        while !self.recovered.load(Ordering::Acquire) {
            tokio::time::sleep(RECOVER_POLL).await;
        }
    }

    /// Snapshot of the current lock table.
    #[must_use]
    pub fn locked_files(&self) -> HashMap<String, CommitId> {
        self.locks.lock().expect("lock table mutex poisoned").clone()
    }

    /// Handle one inbound message, returning the reply to send (if any).
    ///
    /// # Errors
    ///
    /// Returns an error if a log write or file operation fails; the caller
    /// drops the reply so the coordinator's Phase II retry re-runs the
    /// handler.
    pub async fn handle(&self, env: Envelope) -> io::Result<Option<Envelope>> {
        match env.kind {
            MessageKind::CommitQuery => self.handle_query(&env).await.map(Some),
            MessageKind::CommitDecision => self.handle_decision(&env).await.map(Some),
            MessageKind::CommitAbort => self.handle_abort(&env).await.map(Some),
            MessageKind::CommitAgreement | MessageKind::CommitAck => {
                warn!(kind = %env.kind, sender = %env.sender, "unexpected message kind");
                Ok(None)
            }
        }
    }

    fn lock_holder(&self, source: &str) -> Option<CommitId> {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .get(source)
            .cloned()
    }

    fn install_lock(&self, source: &str, commit: &CommitId) {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .insert(source.to_owned(), commit.clone());
    }

    fn drop_lock(&self, source: &str) {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .remove(source);
    }

    /// Phase I: consult the oracle, tentatively lock the named files, and
    /// vote.
    ///
    /// The file scan stops at the first missing or conflicting file; an
    /// oracle denial does not stop it, so locks taken during the scan are
    /// released again below before the no-vote is sent.
    #[instrument(skip_all, fields(node = %self.id, commit = %env.commit_id))]
    async fn handle_query(&self, env: &Envelope) -> io::Result<Envelope> {
        let commit = &env.commit_id;
        let files = env.files();
        let image = env.image.as_deref().unwrap_or_default();

        let mut ok = self.oracle.approve(image, files).await;
        debug!(ok, files = files.len(), "oracle consulted");

        for source in files {
            if !self.root.join(source).exists() {
                debug!(source, "source file missing");
                ok = false;
                break;
            }
            match self.lock_holder(source) {
                Some(holder) if holder != *commit => {
                    debug!(source, holder = %holder, "source file locked by another commit");
                    ok = false;
                    break;
                }
                Some(_) => {}
                None => {
                    self.wal
                        .append(source, commit, FileStatus::Prepared)
                        .await?;
                    self.install_lock(source, commit);
                }
            }
        }

        if ok {
            // Conflicts force a no-vote above, so every file is lockable
            // here; pick up any the scan has not logged yet.
            for source in files {
                if self.lock_holder(source).is_none() {
                    self.wal
                        .append(source, commit, FileStatus::Prepared)
                        .await?;
                    self.install_lock(source, commit);
                }
            }
        } else {
            self.release(files, commit).await?;
        }

        debug!(vote = ok, "replying to commit query");
        Ok(Envelope::agreement(commit.clone(), self.id.clone(), ok))
    }

    /// Phase II: consume or release the files, then acknowledge.
    #[instrument(skip_all, fields(node = %self.id, commit = %env.commit_id))]
    async fn handle_decision(&self, env: &Envelope) -> io::Result<Envelope> {
        let commit = &env.commit_id;
        let files = env.files();

        if env.agreement == Some(true) {
            for source in files {
                // Delete and log unconditionally: on a retry or after a
                // crash-replay the lock entry may already be gone, but the
                // deletion must still be durable and the log must record
                // the consumption.
                let path = self.root.join(source);
                tokio::task::spawn_blocking(move || fsio::remove_durable(&path))
                    .await
                    .expect("spawn_blocking panicked")?;
                self.wal
                    .append(source, commit, FileStatus::Committed)
                    .await?;
                self.drop_lock(source);
            }
            info!(files = files.len(), "commit confirmed, files consumed");
        } else {
            self.release(files, commit).await?;
            info!("commit denied, locks released");
        }

        Ok(Envelope::ack(commit.clone(), self.id.clone()))
    }

    /// Phase II abort: release whatever this commit still holds.
    #[instrument(skip_all, fields(node = %self.id, commit = %env.commit_id))]
    async fn handle_abort(&self, env: &Envelope) -> io::Result<Envelope> {
        self.release(env.files(), &env.commit_id).await?;
        info!("commit aborted, locks released");
        Ok(Envelope::ack(env.commit_id.clone(), self.id.clone()))
    }

    /// Release every listed file currently locked by `commit`.
    async fn release(&self, files: &[String], commit: &CommitId) -> io::Result<()> {
        for source in files {
            if self.lock_holder(source).as_ref() == Some(commit) {
                self.wal.append(source, commit, FileStatus::Aborted).await?;
                self.drop_lock(source);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::oracle::ApproveAll;

    /// Oracle with a settable verdict, recording whether it was asked.
    #[derive(Clone, Default)]
    struct FlagOracle {
        verdict: Arc<AtomicBool>,
        asked: Arc<AtomicBool>,
    }

    impl Oracle for FlagOracle {
        async fn approve(&self, _image: &[u8], _files: &[String]) -> bool {
            self.asked.store(true, Ordering::SeqCst);
            self.verdict.load(Ordering::SeqCst)
        }
    }

    fn node_with(
        dir: &TempDir,
        oracle: FlagOracle,
        files: &[&str],
    ) -> Participant<FlagOracle> {
        for name in files {
            std::fs::write(dir.path().join(name), b"img").unwrap();
        }
        Participant::open(
            ParticipantConfig::new(NodeId::new("a"), dir.path()),
            oracle,
        )
        .unwrap()
    }

    fn query(commit: &str, files: &[&str]) -> Envelope {
        Envelope::query(
            CommitId::new(commit),
            NodeId::new("a"),
            files.iter().map(|f| (*f).to_owned()).collect(),
            vec![1, 2, 3],
        )
    }

    fn log_lines(root: &Path) -> Vec<String> {
        std::fs::read_to_string(LockLog::path(root))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[tokio::test]
    async fn approving_query_locks_files() {
        let dir = TempDir::new().unwrap();
        let oracle = FlagOracle::default();
        oracle.verdict.store(true, Ordering::SeqCst);
        let node = node_with(&dir, oracle.clone(), &["1.jpg", "2.jpg"]);

        let reply = node
            .handle(query("c.jpg", &["1.jpg", "2.jpg"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.kind, MessageKind::CommitAgreement);
        assert_eq!(reply.agreement, Some(true));
        assert!(oracle.asked.load(Ordering::SeqCst));
        assert_eq!(node.locked_files().len(), 2);
    }

    #[tokio::test]
    async fn missing_file_votes_no() {
        let dir = TempDir::new().unwrap();
        let oracle = FlagOracle::default();
        oracle.verdict.store(true, Ordering::SeqCst);
        let node = node_with(&dir, oracle, &["1.jpg"]);

        let reply = node
            .handle(query("c.jpg", &["1.jpg", "nope.jpg"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.agreement, Some(false));
        assert!(node.locked_files().is_empty());
    }

    /// The scan stops at the first missing file, but files locked before
    /// that point must be released, and files after it never touched.
    #[tokio::test]
    async fn early_exit_releases_only_scanned_files() {
        let dir = TempDir::new().unwrap();
        let oracle = FlagOracle::default();
        oracle.verdict.store(true, Ordering::SeqCst);
        let node = node_with(&dir, oracle, &["first.jpg", "last.jpg"]);

        let reply = node
            .handle(query("c.jpg", &["first.jpg", "gone.jpg", "last.jpg"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.agreement, Some(false));
        assert!(node.locked_files().is_empty());
        let lines = log_lines(dir.path());
        assert_eq!(
            lines,
            [
                "first.jpg:c.jpg:PREPARED".to_owned(),
                "first.jpg:c.jpg:ABORTED".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn conflicting_lock_votes_no_without_mutation() {
        let dir = TempDir::new().unwrap();
        let oracle = FlagOracle::default();
        oracle.verdict.store(true, Ordering::SeqCst);
        let node = node_with(&dir, oracle, &["1.jpg"]);

        let first = node.handle(query("one.jpg", &["1.jpg"])).await.unwrap();
        assert_eq!(first.unwrap().agreement, Some(true));
        let before = node.locked_files();

        let reply = node
            .handle(query("two.jpg", &["1.jpg"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.agreement, Some(false));
        assert_eq!(node.locked_files(), before);
    }

    #[tokio::test]
    async fn oracle_denial_still_scans_then_releases() {
        let dir = TempDir::new().unwrap();
        let oracle = FlagOracle::default();
        let node = node_with(&dir, oracle.clone(), &["1.jpg"]);

        let reply = node
            .handle(query("c.jpg", &["1.jpg"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.agreement, Some(false));
        assert!(oracle.asked.load(Ordering::SeqCst));
        assert!(node.locked_files().is_empty());
        // The scan logged a tentative lock and the denial released it.
        let lines = log_lines(dir.path());
        assert_eq!(
            lines,
            [
                "1.jpg:c.jpg:PREPARED".to_owned(),
                "1.jpg:c.jpg:ABORTED".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn confirmed_decision_deletes_and_acks() {
        let dir = TempDir::new().unwrap();
        let node = node_with(&dir, FlagOracle::default(), &["1.jpg"]);
        node.install_lock("1.jpg", &CommitId::new("c.jpg"));

        let decision = Envelope::decision(
            CommitId::new("c.jpg"),
            NodeId::new("a"),
            vec!["1.jpg".to_owned()],
            true,
        );
        let reply = node.handle(decision).await.unwrap().unwrap();

        assert_eq!(reply.kind, MessageKind::CommitAck);
        assert!(!dir.path().join("1.jpg").exists());
        assert!(node.locked_files().is_empty());
    }

    /// Re-delivering a decision must be a no-op on disk and lock state.
    #[tokio::test]
    async fn redelivered_decision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = node_with(&dir, FlagOracle::default(), &["1.jpg"]);
        node.install_lock("1.jpg", &CommitId::new("c.jpg"));

        let decision = Envelope::decision(
            CommitId::new("c.jpg"),
            NodeId::new("a"),
            vec!["1.jpg".to_owned()],
            true,
        );
        let first = node.handle(decision.clone()).await.unwrap().unwrap();
        let second = node.handle(decision).await.unwrap().unwrap();

        assert_eq!(first.kind, MessageKind::CommitAck);
        assert_eq!(second.kind, MessageKind::CommitAck);
        assert!(!dir.path().join("1.jpg").exists());
        assert!(node.locked_files().is_empty());
    }

    #[tokio::test]
    async fn abort_releases_only_this_commits_locks() {
        let dir = TempDir::new().unwrap();
        let node = node_with(&dir, FlagOracle::default(), &["1.jpg", "2.jpg"]);
        node.install_lock("1.jpg", &CommitId::new("mine.jpg"));
        node.install_lock("2.jpg", &CommitId::new("other.jpg"));

        let abort = Envelope::abort(
            CommitId::new("mine.jpg"),
            NodeId::new("a"),
            vec!["1.jpg".to_owned(), "2.jpg".to_owned()],
        );
        let reply = node.handle(abort).await.unwrap().unwrap();

        assert_eq!(reply.kind, MessageKind::CommitAck);
        let locks = node.locked_files();
        assert!(!locks.contains_key("1.jpg"));
        assert_eq!(locks.get("2.jpg"), Some(&CommitId::new("other.jpg")));
    }

    #[tokio::test]
    async fn recover_gates_until_replay_completes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1.jpg"), b"img").unwrap();
        let node = Participant::open(
            ParticipantConfig::new(NodeId::new("a"), dir.path()),
            ApproveAll,
        )
        .unwrap();
        node.wal
            .append("1.jpg", &CommitId::new("c.jpg"), FileStatus::Prepared)
            .await
            .unwrap();

        node.recover().await.unwrap();
        node.wait_recovered().await;
        assert_eq!(
            node.locked_files().get("1.jpg"),
            Some(&CommitId::new("c.jpg"))
        );
    }
}
