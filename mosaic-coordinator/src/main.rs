//! Mosaic coordinator server.
//!
//! Listens for participant connections, recovers any commits left
//! unfinished by a previous run, then drives new commits from the stdin
//! control loop.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use error_stack::{Report, ResultExt};
use mosaic_coordinator::{control, Coordinator, CoordinatorConfig};
use mosaic_core::{fsio, LOG_DIR};
use tokio::net::TcpListener;
use tracing::info;

/// Mosaic coordinator server
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Run the mosaic two-phase-commit coordinator")]
struct Args {
    /// Port to listen on for participants
    port: u16,

    /// Working directory holding the log/ directory and committed composites
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Phase I vote window in milliseconds
    #[arg(long, default_value_t = 6000)]
    phase_one_timeout_ms: u64,

    /// Phase II ack window in milliseconds
    #[arg(long, default_value_t = 6000)]
    phase_two_timeout_ms: u64,
}

/// Coordinator startup failure.
#[derive(Debug)]
struct ServerError;

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("coordinator failed")
    }
}

impl std::error::Error for ServerError {}

#[tokio::main]
async fn main() -> Result<(), Report<ServerError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CoordinatorConfig {
        root: args.root,
        phase_one_timeout: Duration::from_millis(args.phase_one_timeout_ms),
        phase_two_timeout: Duration::from_millis(args.phase_two_timeout_ms),
    };

    fsio::create_dir_durable(&config.root.join(LOG_DIR))
        .change_context(ServerError)
        .attach("creating log directory")?;

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .change_context(ServerError)
        .attach("binding listener")?;
    info!(port = args.port, root = ?config.root, "starting coordinator");

    let coordinator = Coordinator::new(config);
    tokio::spawn(coordinator.clone().serve(listener));

    // Participants can already connect; recovery drivers need them.
    coordinator
        .recover()
        .await
        .change_context(ServerError)
        .attach("recovering commit logs")?;

    control::run(coordinator)
        .await
        .change_context(ServerError)
        .attach("running control loop")
}
