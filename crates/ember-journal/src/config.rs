//! Journal configuration.

use crate::error::JournalError;

/// Default number of entries kept in the LSN ring buffer.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Default aggregate byte budget of the LSN ring buffer.
pub const DEFAULT_RING_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Configuration for a journal slice.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum number of entries the ring retains.
    pub ring_capacity: usize,
    /// Aggregate byte budget of the ring.
    pub ring_max_bytes: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            ring_max_bytes: DEFAULT_RING_MAX_BYTES,
        }
    }
}

impl JournalConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> JournalConfigBuilder {
        JournalConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either ring bound is zero.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.ring_capacity == 0 {
            return Err(JournalError::InvalidConfig(
                "ring_capacity must be > 0".to_string(),
            ));
        }
        if self.ring_max_bytes == 0 {
            return Err(JournalError::InvalidConfig(
                "ring_max_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`JournalConfig`].
#[derive(Debug, Default)]
pub struct JournalConfigBuilder {
    ring_capacity: Option<usize>,
    ring_max_bytes: Option<usize>,
}

impl JournalConfigBuilder {
    /// Sets the maximum number of ring entries.
    #[must_use]
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = Some(capacity);
        self
    }

    /// Sets the aggregate byte budget of the ring.
    #[must_use]
    pub fn ring_max_bytes(mut self, max_bytes: usize) -> Self {
        self.ring_max_bytes = Some(max_bytes);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<JournalConfig, JournalError> {
        let config = JournalConfig {
            ring_capacity: self.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY),
            ring_max_bytes: self.ring_max_bytes.unwrap_or(DEFAULT_RING_MAX_BYTES),
        };
        config.validate()?;
        Ok(config)
    }
}
