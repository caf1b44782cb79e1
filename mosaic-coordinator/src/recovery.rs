//! Startup recovery: replay the log directory and re-drive every
//! unfinished commit.
//!
//! For each commit log:
//! - `DONE` present: nothing to do.
//! - `Phase Two:<decision>` present: the decision is durable; rebroadcast
//!   it and collect acks.
//! - only `Phase One` present: no participant can have seen a yes, so the
//!   composite (possibly partially written) is deleted and the commit is
//!   aborted towards every participant.
//! - neither: the commit died before any outbound effect; it is closed out
//!   without participant traffic.
//!
//! All recovery drivers run concurrently and are awaited before the
//! coordinator accepts new commits.

use std::fmt;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use mosaic_core::{CommitId, Decision};
use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::driver::{CommitDriver, StartMode};
use crate::manifest::CommitManifest;
use crate::registry::Registry;
use crate::wal::{self, CommitLog};

/// Marker error for recovery failures; context travels in the report.
#[derive(Debug)]
pub struct RecoveryError;

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("coordinator recovery failed")
    }
}

impl std::error::Error for RecoveryError {}

pub(crate) async fn run(
    registry: &Arc<Registry>,
    config: &CoordinatorConfig,
) -> Result<(), Report<RecoveryError>> {
    let root = config.root.clone();
    let entries = tokio::task::spawn_blocking(move || wal::scan(&root))
        .await
        .expect("spawn_blocking panicked")
        .change_context(RecoveryError)
        .attach("scanning commit logs")?;

    let mut drivers = Vec::new();
    for (path, replay) in entries {
        if replay.done {
            continue;
        }
        let Some(name) = replay.file_name.clone() else {
            // The commit died before its first log line was complete; it
            // had no name and reached nobody. Close the log out.
            warn!(path = %path.display(), "closing out nameless commit log");
            let orphan = path.clone();
            tokio::task::spawn_blocking(move || wal::close_orphan(&orphan))
                .await
                .expect("spawn_blocking panicked")
                .change_context(RecoveryError)
                .attach("closing orphan log")?;
            continue;
        };

        let commit = CommitId::new(name);
        let manifest = CommitManifest::parse(commit.clone(), &replay.sources)
            .change_context(RecoveryError)
            .attach("parsing logged sources")?;
        let Some(queues) = registry.register_commit(&commit) else {
            warn!(commit = %commit, "duplicate commit log ignored");
            continue;
        };
        let log = CommitLog::open(&config.root, &commit)
            .change_context(RecoveryError)
            .attach("reopening commit log")?;

        let mode = if let Some(decision) = replay.decision {
            info!(commit = %commit, %decision, "recovering commit from phase two");
            StartMode::PhaseTwoRecover { decision }
        } else if replay.phase_one {
            info!(commit = %commit, "aborting commit interrupted in phase one");
            StartMode::PhaseOneAbort
        } else {
            // Logged its manifest but never opened Phase I: no query was
            // sent, so abort without participant traffic.
            info!(commit = %commit, "closing out commit that never started phase one");
            log.phase_two(Decision::Abort)
                .await
                .change_context(RecoveryError)?;
            log.done().await.change_context(RecoveryError)?;
            registry.remove_commit(&commit);
            continue;
        };

        let driver = CommitDriver::new(
            manifest,
            log,
            registry.clone(),
            config.clone(),
            queues,
        );
        drivers.push(tokio::spawn(driver.run(mode)));
    }

    let recovering = drivers.len();
    if recovering > 0 {
        info!(commits = recovering, "waiting for recovery drivers");
    }
    for task in drivers {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "recovery driver failed"),
            Err(e) => error!(error = %e, "recovery driver panicked"),
        }
    }
    Ok(())
}
