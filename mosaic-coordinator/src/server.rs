//! Coordinator server: participant connections, message routing, and the
//! `start_commit` entry point.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::{SinkExt, StreamExt};
use mosaic_core::{CommitId, Envelope, Hello, HelloAck, PostcardCodec, WireError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::driver::{CommitDriver, StartMode};
use crate::manifest::CommitManifest;
use crate::recovery::{self, RecoveryError};
use crate::registry::Registry;
use crate::wal::CommitLog;

/// How long to sleep between checks of the recovery flag.
const RECOVER_POLL: Duration = Duration::from_millis(50);

/// The coordinator process: connected participants, live commits, and the
/// recovery gate.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<Registry>,
    recovered: AtomicBool,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(Registry::new()),
            recovered: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Names of currently connected participants.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<mosaic_core::NodeId> {
        self.registry.connected_peers()
    }

    /// Replay the log directory and finish or abort every unfinished
    /// commit, then open the gate for new commits.
    ///
    /// The server should already be accepting connections: recovery
    /// drivers converse with participants through the same router.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be scanned or a log is
    /// corrupt.
    pub async fn recover(&self) -> Result<(), Report<RecoveryError>> {
        recovery::run(&self.registry, &self.config).await?;
        self.recovered.store(true, Ordering::Release);
        info!("recovery complete");
        Ok(())
    }

    /// Block until [`recover`](Self::recover) has completed.
    pub async fn wait_recovered(&self) {
        while !self.recovered.load(Ordering::Acquire) {
            tokio::time::sleep(RECOVER_POLL).await;
        }
    }

    /// Start a two-phase commit producing `file_name` from the given
    /// `<node>:<source>` contributions.
    ///
    /// There is no failure return: success is observable only by the
    /// appearance of `file_name` on disk. Invalid input (malformed sources,
    /// or a live commit already owning the name) is diagnosed and refused.
    #[instrument(skip_all, fields(commit = file_name))]
    pub async fn start_commit(&self, file_name: &str, image: Vec<u8>, sources: &[String]) {
        self.wait_recovered().await;

        let commit = CommitId::new(file_name);
        let manifest = match CommitManifest::parse(commit.clone(), sources) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(error = %e, "refusing commit with malformed sources");
                return;
            }
        };

        let Some(queues) = self.registry.register_commit(&commit) else {
            error!("a live commit already owns this file name, refusing");
            return;
        };

        let log = match CommitLog::open(&self.config.root, &commit) {
            Ok(log) => log,
            Err(e) => {
                error!(error = %e, "cannot open commit log");
                self.registry.remove_commit(&commit);
                return;
            }
        };
        if let Err(e) = log.record_manifest(&manifest).await {
            error!(error = %e, "cannot record commit manifest");
            self.registry.remove_commit(&commit);
            return;
        }
        if let Err(e) = log.phase_one().await {
            error!(error = %e, "cannot mark phase one");
            self.registry.remove_commit(&commit);
            return;
        }

        info!(participants = manifest.num_participants(), "commit started");
        let driver = CommitDriver::new(
            manifest,
            log,
            self.registry.clone(),
            self.config.clone(),
            queues,
        );
        tokio::spawn(async move {
            if let Err(e) = driver.run(StartMode::Full { image }).await {
                error!(error = %e, "commit driver failed");
            }
        });
    }

    /// Accept participant connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(addr = ?listener.local_addr().ok(), "listening for participants");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            debug!(peer = %addr, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One participant connection: handshake, then route inbound messages
    /// and drain this node's outbound queue until the socket closes.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), WireError> {
        let (read_half, write_half) = stream.into_split();

        let mut reader = FramedRead::new(read_half, PostcardCodec::<Hello>::new());
        let hello = reader
            .next()
            .await
            .ok_or_else(|| WireError::Connect("closed before hello".to_owned()))??;

        let mut writer = FramedWrite::new(write_half, PostcardCodec::<HelloAck>::new());
        if hello.node.as_str().is_empty() {
            let reason = "empty node name".to_owned();
            writer.send(HelloAck::Rejected(reason.clone())).await?;
            return Err(WireError::Handshake(reason));
        }
        writer.send(HelloAck::Ok).await?;
        info!(node = %hello.node, "participant connected");

        // Same framing, envelope payloads from here on. `map_decoder`
        // keeps any bytes already buffered past the handshake frame.
        let mut reader = reader.map_decoder(|_| PostcardCodec::<Envelope>::new());
        let mut writer = FramedWrite::new(writer.into_inner(), PostcardCodec::<Envelope>::new());

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        self.registry.register_peer(&hello.node, tx.clone());

        let result: Result<(), WireError> = async {
            loop {
                tokio::select! {
                    frame = reader.next() => match frame {
                        None => return Ok(()),
                        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                            warn!(error = %e, "dropping undecodable frame");
                        }
                        Some(Err(e)) => return Err(WireError::from(e)),
                        Some(Ok(env)) => self.registry.route(env),
                    },
                    out = rx.recv() => match out {
                        Some(env) => writer.send(env).await?,
                        None => return Ok(()),
                    },
                }
            }
        }
        .await;

        self.registry.unregister_peer(&hello.node, &tx);
        info!(node = %hello.node, "participant disconnected");
        result
    }
}
