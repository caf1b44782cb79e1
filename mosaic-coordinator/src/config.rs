//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Static configuration for the coordinator.
///
/// The two timeouts default to the protocol's historical 6 seconds; tests
/// shrink them to keep fault scenarios fast.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding the `log/` directory and committed composites.
    pub root: PathBuf,
    /// Phase I vote window. Expiry converts the commit to an abort.
    pub phase_one_timeout: Duration,
    /// Phase II ack window. Expiry triggers a resend to the silent nodes.
    pub phase_two_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            phase_one_timeout: Duration::from_secs(6),
            phase_two_timeout: Duration::from_secs(6),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}
