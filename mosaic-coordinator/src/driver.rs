//! Per-commit driver task.
//!
//! One driver owns each commit from the moment it is registered until its
//! `DONE` marker is durable. Three shapes exist over the shared Phase II
//! routine: a full run (Phase I vote, persist, Phase II), a Phase II
//! recovery (decision already durable), and a Phase I abort (the commit
//! died before its decision was durable, so abort is the only safe
//! outcome).

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::Arc;

use mosaic_core::{fsio, Decision, Envelope, NodeId};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::manifest::CommitManifest;
use crate::registry::{CommitQueues, Registry};
use crate::wal::CommitLog;

/// Where a driver starts from.
pub(crate) enum StartMode {
    /// Fresh commit: run Phase I, then Phase II.
    Full { image: Vec<u8> },
    /// Recovered commit whose decision is already durable: redo Phase II.
    PhaseTwoRecover { decision: Decision },
    /// Recovered commit that died in Phase I: no participant can have seen
    /// a yes, so abort.
    PhaseOneAbort,
}

pub(crate) struct CommitDriver {
    manifest: CommitManifest,
    log: CommitLog,
    registry: Arc<Registry>,
    config: CoordinatorConfig,
    queues: CommitQueues,
}

impl CommitDriver {
    pub(crate) fn new(
        manifest: CommitManifest,
        log: CommitLog,
        registry: Arc<Registry>,
        config: CoordinatorConfig,
        queues: CommitQueues,
    ) -> Self {
        Self {
            manifest,
            log,
            registry,
            config,
            queues,
        }
    }

    /// Drive the commit to `DONE`.
    ///
    /// # Errors
    ///
    /// Returns an error if a log write or composite file operation fails;
    /// the commit then stays live (refusing name reuse) and is re-driven
    /// by recovery after a restart.
    #[instrument(skip_all, name = "commit", fields(commit = %self.manifest.file_name()))]
    pub(crate) async fn run(mut self, mode: StartMode) -> io::Result<()> {
        match mode {
            StartMode::Full { image } => {
                let decision = self.phase_one(&image).await;
                info!(%decision, "phase one complete");

                // The composite must be durable before the decision is:
                // recovery treats a log without a Phase Two marker as an
                // abort and deletes any partial composite.
                if decision == Decision::Yes {
                    self.write_composite(image).await?;
                }
                self.log.phase_two(decision).await?;

                self.phase_two(decision).await;
                self.log.done().await?;
            }
            StartMode::PhaseTwoRecover { decision } => {
                info!(%decision, "resuming phase two");
                self.phase_two(decision).await;
                self.log.done().await?;
            }
            StartMode::PhaseOneAbort => {
                info!("aborting commit interrupted in phase one");
                self.remove_composite().await?;
                self.phase_two(Decision::Abort).await;
                self.log.phase_two(Decision::Abort).await?;
                self.log.done().await?;
            }
        }

        self.registry.remove_commit(self.manifest.file_name());
        info!("commit done");
        Ok(())
    }

    /// Phase I: query every distinct participant, then aggregate votes.
    async fn phase_one(&mut self, image: &[u8]) -> Decision {
        for node in self.manifest.participants() {
            self.registry.send(Envelope::query(
                self.manifest.file_name().clone(),
                node.clone(),
                self.manifest.files_for(node).to_vec(),
                image.to_vec(),
            ));
        }
        self.collect_votes().await
    }

    /// Wait for a vote from every distinct participant.
    ///
    /// Silence is a no: if any wait or the cumulative window expires with
    /// a participant missing, the decision is `Abort`.
    async fn collect_votes(&mut self) -> Decision {
        let window = self.config.phase_one_timeout;
        let started = Instant::now();
        let mut approvals: HashSet<NodeId> = HashSet::new();
        let mut denials: HashSet<NodeId> = HashSet::new();

        while approvals.len() + denials.len() < self.manifest.num_participants() {
            let vote = match timeout(window, self.queues.votes.recv()).await {
                Ok(Some(env)) => env,
                Ok(None) | Err(_) => {
                    debug!("vote wait expired");
                    return Decision::Abort;
                }
            };
            if started.elapsed() > window {
                debug!("phase one window exceeded");
                return Decision::Abort;
            }
            if !self.manifest.is_participant(&vote.sender) {
                warn!(sender = %vote.sender, "vote from non-participant dropped");
                continue;
            }
            match vote.agreement {
                Some(true) => {
                    approvals.insert(vote.sender);
                }
                Some(false) => {
                    denials.insert(vote.sender);
                }
                None => warn!(sender = %vote.sender, "vote without agreement dropped"),
            }
        }

        if denials.is_empty() {
            Decision::Yes
        } else {
            Decision::No
        }
    }

    /// Phase II: broadcast the decision and retry until every participant
    /// has acknowledged. The decision never changes across retries.
    async fn phase_two(&mut self, decision: Decision) {
        let mut missing: BTreeSet<NodeId> = self.manifest.participants().cloned().collect();

        loop {
            for node in &missing {
                self.send_decision(decision, node);
            }
            let acked = self.collect_acks().await;
            missing.retain(|node| !acked.contains(node));
            if missing.is_empty() {
                return;
            }
            debug!(missing = missing.len(), "acks outstanding, resending decision");
        }
    }

    fn send_decision(&self, decision: Decision, node: &NodeId) {
        let commit = self.manifest.file_name().clone();
        let files = self.manifest.files_for(node).to_vec();
        let env = match decision {
            Decision::Yes => Envelope::decision(commit, node.clone(), files, true),
            Decision::No => Envelope::decision(commit, node.clone(), files, false),
            Decision::Abort => Envelope::abort(commit, node.clone(), files),
        };
        self.registry.send(env);
    }

    /// Collect acks for one window. A late ack past the cumulative window
    /// is left for the next round.
    async fn collect_acks(&mut self) -> HashSet<NodeId> {
        let window = self.config.phase_two_timeout;
        let started = Instant::now();
        let mut acked = HashSet::new();

        while acked.len() < self.manifest.num_participants() {
            let ack = match timeout(window, self.queues.acks.recv()).await {
                Ok(Some(env)) => env,
                Ok(None) | Err(_) => break,
            };
            if started.elapsed() > window {
                break;
            }
            if self.manifest.is_participant(&ack.sender) {
                acked.insert(ack.sender);
            } else {
                warn!(sender = %ack.sender, "ack from non-participant dropped");
            }
        }
        acked
    }

    async fn write_composite(&self, image: Vec<u8>) -> io::Result<()> {
        let path = self.config.root.join(self.manifest.file_name().as_str());
        tokio::task::spawn_blocking(move || fsio::write_durable(&path, &image))
            .await
            .expect("spawn_blocking panicked")
    }

    async fn remove_composite(&self) -> io::Result<()> {
        let path = self.config.root.join(self.manifest.file_name().as_str());
        tokio::task::spawn_blocking(move || fsio::remove_durable(&path))
            .await
            .expect("spawn_blocking panicked")
    }
}
