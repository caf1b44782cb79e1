//! Interactive control loop for the coordinator binary.
//!
//! Commits are driven by an operator (or a wrapping script) over stdin:
//!
//! ```text
//! commit composites/1.jpg ./collage.jpg a:1.jpg b:3.jpg c:6.jpg
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::server::Coordinator;

/// Read commands from stdin until `exit` or end of input.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn run(coordinator: Arc<Coordinator>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("mosaic coordinator ready; type 'help' for commands");

    while let Some(line) = lines.next_line().await? {
        match execute(&coordinator, &line).await {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            Err(e) if e == "exit" => break,
            Err(e) => eprintln!("{e}"),
        }
    }
    info!("control loop finished");
    Ok(())
}

/// Execute one command line.
///
/// # Errors
///
/// Returns an error string on failure, and the sentinel `"exit"` when the
/// operator asks to quit.
async fn execute(coordinator: &Coordinator, line: &str) -> Result<String, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(String::new());
    }

    match parts[0] {
        "help" | "?" => Ok(help()),
        "exit" | "quit" => Err("exit".to_owned()),
        "commit" => {
            if parts.len() < 4 {
                return Err(
                    "Usage: commit <file_name> <image_path> <node:source>...".to_owned()
                );
            }
            let image = tokio::fs::read(parts[2])
                .await
                .map_err(|e| format!("cannot read image {}: {e}", parts[2]))?;
            let sources: Vec<String> = parts[3..].iter().map(|s| (*s).to_owned()).collect();
            coordinator.start_commit(parts[1], image, &sources).await;
            Ok(format!("commit {} started", parts[1]))
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn help() -> String {
    [
        "Commands:",
        "  commit <file_name> <image_path> <node:source>...",
        "      start a two-phase commit of the image at <image_path>",
        "  help | ?",
        "  exit | quit",
    ]
    .join("\n")
}
