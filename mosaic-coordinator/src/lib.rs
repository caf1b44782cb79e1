//! Mosaic Coordinator
//!
//! Drives composite commits through two-phase commit: Phase I queries every
//! contributing participant and aggregates votes into a decision, Phase II
//! broadcasts the decision and retries until every participant has
//! acknowledged it. Per-commit write-ahead logs make the whole exchange
//! crash-safe; startup recovery replays them and finishes or aborts every
//! commit that was in flight when the process died.

#![warn(clippy::pedantic)]

pub mod config;
pub mod control;
mod driver;
pub mod manifest;
pub mod recovery;
mod registry;
pub mod server;
pub mod wal;

pub use config::CoordinatorConfig;
pub use manifest::{CommitManifest, InvalidSource, SourceRef};
pub use server::Coordinator;
