use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/refguard.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Peer services that hold records referencing our context entities
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base URL of the service owning assets, components, repairs and products
    pub assets_url: String,
    /// Upper bound for a single peer request, including reading the body
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound for establishing the TCP connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            assets_url: String::from("http://localhost:8001/api/v1"),
            timeout: Duration::from_secs(6),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Limits and capabilities of the bulk delete path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Hard ceiling on distinct ids per bulk request.
    ///
    /// Env: REFGUARD__GUARD__MAX_IDS
    pub max_ids: usize,

    /// Ids per probe/commit round.
    ///
    /// Env: REFGUARD__GUARD__CHUNK_SIZE
    pub chunk_size: usize,

    /// Probes in flight at once inside one chunk.
    ///
    /// Env: REFGUARD__GUARD__PROBE_CONCURRENCY
    pub probe_concurrency: usize,

    /// Page size for direct reference queries and the number of identifiers
    /// kept per reference kind.
    ///
    /// Env: REFGUARD__GUARD__SAMPLE_LIMIT
    pub sample_limit: usize,

    /// Page size for product and nested listings when following two-hop references.
    ///
    /// Env: REFGUARD__GUARD__TWO_HOP_PAGE_SIZE
    pub two_hop_page_size: usize,

    /// Operator credential enabling hard delete. Hard delete is refused when unset.
    ///
    /// Env: REFGUARD__GUARD__HARD_DELETE_KEY
    #[serde(default)]
    pub hard_delete_key: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_ids: 500,
            chunk_size: 50,
            probe_concurrency: 8,
            sample_limit: 5,
            two_hop_page_size: 100,
            hard_delete_key: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("database DSN cannot be empty")]
    EmptyDsn,

    #[error("invalid peer URL '{url}': {reason}")]
    InvalidPeerUrl { url: String, reason: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("chunk_size ({chunk_size}) cannot exceed max_ids ({max_ids})")]
    ChunkLargerThanCeiling { chunk_size: usize, max_ids: usize },

    #[error("hard_delete_key cannot be an empty string; unset it to disable hard delete")]
    EmptyHardDeleteKey,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Local storage of context entities
    pub database: DatabaseConfig,
    /// Peer services queried for references
    pub peers: PeerConfig,
    /// Bulk delete limits and capabilities
    pub guard: GuardConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("refguard.toml"))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path)).extract().map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("REFGUARD__").split("__"))
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.dsn.trim().is_empty() {
            return Err(ConfigError::EmptyDsn);
        }

        url::Url::parse(&self.peers.assets_url).map_err(|e| ConfigError::InvalidPeerUrl {
            url: self.peers.assets_url.clone(),
            reason: e.to_string(),
        })?;

        if self.peers.timeout.is_zero() {
            return Err(ConfigError::Zero("peers.timeout"));
        }
        if self.guard.max_ids == 0 {
            return Err(ConfigError::Zero("guard.max_ids"));
        }
        if self.guard.chunk_size == 0 {
            return Err(ConfigError::Zero("guard.chunk_size"));
        }
        if self.guard.probe_concurrency == 0 {
            return Err(ConfigError::Zero("guard.probe_concurrency"));
        }
        if self.guard.sample_limit == 0 {
            return Err(ConfigError::Zero("guard.sample_limit"));
        }
        if self.guard.two_hop_page_size == 0 {
            return Err(ConfigError::Zero("guard.two_hop_page_size"));
        }
        if self.guard.chunk_size > self.guard.max_ids {
            return Err(ConfigError::ChunkLargerThanCeiling {
                chunk_size: self.guard.chunk_size,
                max_ids: self.guard.max_ids,
            });
        }
        if matches!(&self.guard.hard_delete_key, Some(key) if key.is_empty()) {
            return Err(ConfigError::EmptyHardDeleteKey);
        }

        Ok(())
    }

    /// Whether an operator credential for hard delete is configured.
    pub fn hard_delete_enabled(&self) -> bool {
        self.guard.hard_delete_key.is_some()
    }

    /// Copy suitable for printing: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.guard.hard_delete_key.is_some() {
            config.guard.hard_delete_key = Some("********".to_string());
        }
        config
    }
}
