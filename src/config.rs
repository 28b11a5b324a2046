//! Configuration management

use anyhow::Result;
use serde::Deserialize;

use crate::directory::StaticDirectory;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    /// Node-owned shards registered at startup.
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub fanout: FanoutConfig,
    pub geoip: GeoIpConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub directory: StaticDirectory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

/// The primary database, used as the fallback shard.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub node_id: i64,
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Upper bound on shard tasks in flight for one query.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_shard_timeout_ms")]
    pub shard_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            shard_timeout_ms: default_shard_timeout_ms(),
        }
    }
}

fn default_max_concurrency() -> usize {
    32
}

fn default_shard_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    /// Empty disables region lookups.
    #[serde(default)]
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// `ACCESSLOG_<SECTION>__<KEY>` overrides, e.g. `ACCESSLOG_SERVER__HTTP_PORT=9090`.
fn environment() -> config::Environment {
    config::Environment::with_prefix("ACCESSLOG")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(environment());

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.path.is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be at least 1");
        }

        let mut seen = std::collections::HashSet::new();
        for shard in &self.shards {
            if shard.node_id <= 0 {
                anyhow::bail!("Shard node_id must be positive, got {}", shard.node_id);
            }
            if !seen.insert(shard.node_id) {
                anyhow::bail!("Shard node_id {} is configured twice", shard.node_id);
            }
            if shard.path.is_empty() {
                anyhow::bail!("Shard {} has an empty path", shard.node_id);
            }
        }

        if self.fanout.max_concurrency == 0 {
            anyhow::bail!("fanout.max_concurrency must be at least 1");
        }
        if self.fanout.shard_timeout_ms == 0 {
            anyhow::bail!("fanout.shard_timeout_ms must be at least 1");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}
