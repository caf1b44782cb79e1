//! Mosaic participant node.
//!
//! Serves local source files to the two-phase-commit coordinator: votes on
//! commit queries and executes commit/abort decisions against the working
//! directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use error_stack::{Report, ResultExt};
use mosaic_participant::{
    connector, ApproveAll, BackoffConfig, Participant, ParticipantConfig,
};
use mosaic_core::NodeId;
use tracing::info;

/// Mosaic participant node
#[derive(Parser, Debug)]
#[command(name = "participant")]
#[command(about = "Run a mosaic two-phase-commit participant")]
struct Args {
    /// Port the coordinator listens on
    port: u16,

    /// This node's name on the message substrate
    node_id: String,

    /// Coordinator host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Working directory holding source files and the log/ directory
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

/// Participant startup or protocol failure.
#[derive(Debug)]
struct NodeError;

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("participant failed")
    }
}

impl std::error::Error for NodeError {}

#[tokio::main]
async fn main() -> Result<(), Report<NodeError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let coordinator: SocketAddr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .change_context(NodeError)
        .attach("resolving coordinator address")?
        .next()
        .ok_or_else(|| Report::new(NodeError).attach("coordinator address did not resolve"))?;

    let config = ParticipantConfig::new(NodeId::new(args.node_id), args.root);
    info!(node = %config.node, root = ?config.root, "starting participant");

    let node = Arc::new(
        Participant::open(config, ApproveAll)
            .change_context(NodeError)
            .attach("opening lock log")?,
    );

    node.recover()
        .await
        .change_context(NodeError)
        .attach("replaying lock log")?;

    connector::run(node, coordinator, BackoffConfig::default())
        .await
        .change_context(NodeError)
        .attach("serving coordinator connection")
}
