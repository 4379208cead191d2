//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig};

/// Builder for creating test configurations.
///
/// Defaults to an in-memory SQLite catalog and short peer timeouts so that
/// fail-closed paths do not slow tests down.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_peer_url(&server.base_url())
///     .with_chunk_size(2)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = Configuration {
            database: DatabaseConfig::in_memory(),
            ..Configuration::default()
        };
        config.peers.timeout = Duration::from_millis(500);
        config.peers.connect_timeout = Duration::from_millis(200);
        Self { config }
    }

    /// Point probes at a (mock) peer service.
    pub fn with_peer_url(mut self, url: &str) -> Self {
        self.config.peers.assets_url = url.to_string();
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.config.peers.timeout = timeout;
        self
    }

    pub fn with_max_ids(mut self, max_ids: usize) -> Self {
        self.config.guard.max_ids = max_ids;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.guard.chunk_size = chunk_size;
        self
    }

    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.config.guard.probe_concurrency = concurrency;
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.config.guard.sample_limit = limit;
        self
    }

    /// Enable hard delete behind the given operator key.
    pub fn with_hard_delete_key(mut self, key: &str) -> Self {
        self.config.guard.hard_delete_key = Some(key.to_string());
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_are_valid() {
        let config = TestConfigBuilder::new().build();
        assert_eq!(config.database.dsn, "sqlite::memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = TestConfigBuilder::new()
            .with_peer_url("http://127.0.0.1:9999")
            .with_max_ids(10)
            .with_chunk_size(3)
            .with_hard_delete_key("k")
            .build();
        assert_eq!(config.peers.assets_url, "http://127.0.0.1:9999");
        assert_eq!(config.guard.max_ids, 10);
        assert_eq!(config.guard.chunk_size, 3);
        assert!(config.hard_delete_enabled());
    }
}
