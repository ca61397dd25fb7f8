//! Migration configuration.

use std::time::Duration;

/// Default bound on finalization handshakes (`join` and `stop`).
pub const DEFAULT_FINALIZATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for an incoming migration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Wall-clock bound enforced by `join` and `stop`.
    pub finalization_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            finalization_timeout: DEFAULT_FINALIZATION_TIMEOUT,
        }
    }
}

impl MigrationConfig {
    /// Creates a configuration with an explicit finalization timeout.
    #[must_use]
    pub fn new(finalization_timeout: Duration) -> Self {
        Self {
            finalization_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_is_seconds_scale() {
        let config = MigrationConfig::default();
        assert!(config.finalization_timeout >= Duration::from_secs(1));
    }
}
