//! Configuration for peer synchronization.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on the events shipped to one peer in one batch.
    pub max_events_to_synchronize_at_the_same_time: usize,
    /// Age after which an unconfirmed transfer is considered lost.
    pub transfer_stale_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_events_to_synchronize_at_the_same_time: 1_000,
            transfer_stale_timeout: Duration::from_secs(120),
        }
    }

    /// Sets the batch size.
    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events_to_synchronize_at_the_same_time = max.max(1);
        self
    }

    /// Sets the stale transfer timeout.
    pub fn with_transfer_stale_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_stale_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_max_events(50)
            .with_transfer_stale_timeout(Duration::from_secs(5));
        assert_eq!(config.max_events_to_synchronize_at_the_same_time, 50);
        assert_eq!(config.transfer_stale_timeout, Duration::from_secs(5));
    }

    #[test]
    fn batch_size_is_never_zero() {
        let config = SyncConfig::default().with_max_events(0);
        assert_eq!(config.max_events_to_synchronize_at_the_same_time, 1);
    }
}
