//! Participant configuration.

use std::path::PathBuf;
use std::time::Duration;

use mosaic_core::NodeId;
use rand::Rng;

/// Static configuration for a participant node.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// This node's name on the message substrate.
    pub node: NodeId,
    /// Directory holding the node's source files and its `log/` directory.
    pub root: PathBuf,
}

impl ParticipantConfig {
    #[must_use]
    pub fn new(node: NodeId, root: impl Into<PathBuf>) -> Self {
        Self {
            node,
            root: root.into(),
        }
    }
}

/// Configuration for exponential backoff with jitter, used by the
/// reconnecting coordinator connection.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // Jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}
