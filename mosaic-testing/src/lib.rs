//! Test utilities for mosaic integration tests.
//!
//! Spins up a coordinator and participants inside one test process, each
//! on its own temp root. The coordinator runs on a dedicated runtime so a
//! test can "crash" it - every driver, connection, and router task dies at
//! once - and restart it against the same root to exercise recovery.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mosaic_coordinator::wal::CommitLog;
use mosaic_coordinator::{Coordinator, CoordinatorConfig};
use mosaic_core::{CommitId, Envelope, Hello, HelloAck, MessageKind, NodeId, PostcardCodec};
use mosaic_participant::wal::LockLog;
use mosaic_participant::{connector, BackoffConfig, Oracle, Participant, ParticipantConfig};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mosaic=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Operator oracle with a scripted verdict sequence.
#[derive(Clone)]
pub struct ScriptedOracle {
    verdicts: Arc<Mutex<VecDeque<bool>>>,
    fallback: bool,
    delay: Option<Duration>,
    asked: Arc<AtomicUsize>,
}

impl ScriptedOracle {
    #[must_use]
    pub fn approving() -> Self {
        Self::new([], true)
    }

    #[must_use]
    pub fn denying() -> Self {
        Self::new([], false)
    }

    #[must_use]
    pub fn new(verdicts: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(verdicts.into_iter().collect())),
            fallback,
            delay: None,
            asked: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delay every answer, e.g. to make a vote arrive after the window.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Oracle for ScriptedOracle {
    async fn approve(&self, _image: &[u8], _files: &[String]) -> bool {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.asked.fetch_add(1, Ordering::SeqCst);
        let scripted = self.verdicts.lock().unwrap().pop_front();
        scripted.unwrap_or(self.fallback)
    }
}

/// A coordinator on its own runtime, crashable and restartable.
pub struct TestCoordinator {
    pub addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    runtime: Option<tokio::runtime::Runtime>,
}

/// Start a coordinator over `root` with short test timeouts.
///
/// # Panics
///
/// Panics if the listener cannot be bound.
pub async fn spawn_coordinator(
    root: &Path,
    phase_one_timeout: Duration,
    phase_two_timeout: Duration,
) -> TestCoordinator {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build coordinator runtime");

    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
    std_listener.set_nonblocking(true).expect("nonblocking");
    let addr = std_listener.local_addr().expect("local addr");

    let coordinator = Coordinator::new(CoordinatorConfig {
        root: root.to_owned(),
        phase_one_timeout,
        phase_two_timeout,
    });

    let setup = runtime.spawn({
        let coordinator = coordinator.clone();
        async move {
            let listener =
                tokio::net::TcpListener::from_std(std_listener).expect("register listener");
            tokio::spawn(coordinator.clone().serve(listener));
            // Recovery may need participant traffic to finish, so it runs
            // in the background; `start_commit` gates on its completion.
            tokio::spawn(async move {
                if let Err(e) = coordinator.recover().await {
                    tracing::error!(error = ?e, "recovery failed");
                }
            });
        }
    });
    setup.await.expect("coordinator setup");

    TestCoordinator {
        addr,
        coordinator,
        runtime: Some(runtime),
    }
}

impl TestCoordinator {
    /// Start a commit and wait until its driver is spawned.
    pub async fn start_commit(&self, file_name: &str, image: &[u8], sources: &[&str]) {
        let coordinator = self.coordinator.clone();
        let file_name = file_name.to_owned();
        let image = image.to_vec();
        let sources: Vec<String> = sources.iter().map(|s| (*s).to_owned()).collect();
        self.runtime
            .as_ref()
            .expect("coordinator already crashed")
            .spawn(async move {
                coordinator.start_commit(&file_name, image, &sources).await;
            })
            .await
            .expect("start_commit task");
    }

    #[must_use]
    pub fn connected_peers(&self) -> usize {
        self.coordinator.connected_peers().len()
    }

    /// Kill every coordinator task at once, leaving disk state behind.
    pub fn crash(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// A participant node plus its connector task.
pub struct TestParticipant {
    pub node: Arc<Participant<ScriptedOracle>>,
    task: JoinHandle<()>,
}

/// Start a participant over `root`, connected to `coordinator`.
///
/// # Panics
///
/// Panics if the lock log cannot be opened or replayed.
pub async fn spawn_participant(
    root: &Path,
    id: &str,
    coordinator: SocketAddr,
    oracle: ScriptedOracle,
) -> TestParticipant {
    let node = Arc::new(
        Participant::open(ParticipantConfig::new(NodeId::new(id), root), oracle)
            .expect("open lock log"),
    );
    node.recover().await.expect("replay lock log");

    let backoff = BackoffConfig {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(250),
        multiplier: 2.0,
    };
    let task = tokio::spawn({
        let node = node.clone();
        async move {
            let _ = connector::run(node, coordinator, backoff).await;
        }
    });

    TestParticipant { node, task }
}

impl TestParticipant {
    /// Kill the connector, leaving the node's disk state behind.
    pub fn crash(self) {
        self.task.abort();
    }
}

impl Drop for TestParticipant {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A peer that registers, votes yes on the first query, then drops dead:
/// the shape of a participant that crashes after Phase I.
///
/// # Panics
///
/// Panics on any transport failure.
pub async fn vote_then_crash(coordinator: SocketAddr, id: &str) {
    let stream = TcpStream::connect(coordinator).await.expect("connect");
    let (read_half, write_half) = stream.into_split();

    let mut writer = FramedWrite::new(write_half, PostcardCodec::<Hello>::new());
    writer
        .send(Hello {
            node: NodeId::new(id),
        })
        .await
        .expect("send hello");
    let mut reader = FramedRead::new(read_half, PostcardCodec::<HelloAck>::new());
    reader.next().await.expect("hello ack").expect("decode ack");

    let mut reader = reader.map_decoder(|_| PostcardCodec::<Envelope>::new());
    let mut writer = FramedWrite::new(writer.into_inner(), PostcardCodec::<Envelope>::new());

    while let Some(frame) = reader.next().await {
        let env = frame.expect("decode envelope");
        if env.kind == MessageKind::CommitQuery {
            writer
                .send(Envelope::agreement(env.commit_id, NodeId::new(id), true))
                .await
                .expect("send vote");
            return; // connection drops here
        }
    }
}

/// Write a source file under a participant root.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn seed_file(root: &Path, name: &str, bytes: &[u8]) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

/// Append raw lines to a participant's lock log, creating it if needed.
///
/// # Panics
///
/// Panics if the log cannot be written.
pub fn seed_participant_log(root: &Path, lines: &[&str]) {
    let path = LockLog::path(root);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut text = std::fs::read_to_string(&path).unwrap_or_default();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    std::fs::write(path, text).unwrap();
}

/// Append raw lines to a coordinator commit log, creating it if needed.
///
/// # Panics
///
/// Panics if the log cannot be written.
pub fn seed_coordinator_log(root: &Path, commit: &str, lines: &[&str]) {
    let path = CommitLog::path(root, &CommitId::new(commit));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut text = std::fs::read_to_string(&path).unwrap_or_default();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    std::fs::write(path, text).unwrap();
}

/// Full text of a coordinator commit log (empty if absent).
#[must_use]
pub fn coordinator_log(root: &Path, commit: &str) -> String {
    std::fs::read_to_string(CommitLog::path(root, &CommitId::new(commit))).unwrap_or_default()
}

/// Full text of a participant lock log (empty if absent).
#[must_use]
pub fn participant_log(root: &Path) -> String {
    std::fs::read_to_string(LockLog::path(root)).unwrap_or_default()
}

/// Poll `cond` until it holds or `timeout` expires.
///
/// # Panics
///
/// Panics with `what` if the deadline passes.
pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Temp roots for one coordinator and `n` participants.
///
/// # Panics
///
/// Panics if temp directories cannot be created.
#[must_use]
pub fn cluster_roots(n: usize) -> (tempfile::TempDir, Vec<tempfile::TempDir>) {
    let coordinator = tempfile::TempDir::new().unwrap();
    let participants = (0..n).map(|_| tempfile::TempDir::new().unwrap()).collect();
    (coordinator, participants)
}
