//! Edge access-log store - query API over time-sharded access logs
//!
//! Serves listing, search, lookup and attack statistics over:
//! - The primary database, used whenever no node shards are registered
//! - Node-owned shards configured under `[[shards]]`

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use edge_accesslog::config::Config;
use edge_accesslog::db::{ShardConnection, Shards, DEFAULT_NODE_ID};
use edge_accesslog::geoip::GeoIp;
use edge_accesslog::{web, LogStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration first so the log level can come from it
    let config = Config::load()?;

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting edge access-log store...");

    let primary = ShardConnection::connect(DEFAULT_NODE_ID, &config.database.path, config.database.max_connections).await?;
    info!(path = %config.database.path, "Primary database opened");

    let geoip = if config.geoip.database.is_empty() {
        GeoIp::disabled()
    } else {
        GeoIp::new(&config.geoip.database)
    };
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found)");
    }

    let store = Arc::new(LogStore::new(
        Shards::new(primary),
        Arc::new(config.directory.clone()),
        Arc::new(geoip),
        &config.fanout,
    ));

    for shard in &config.shards {
        let connection = ShardConnection::connect(shard.node_id, &shard.path, shard.max_connections).await?;
        store.register_shard(connection);
    }
    if store.shards().registry.is_empty() {
        info!("No node shards configured, serving from the primary database");
    } else {
        info!(shards = store.shards().registry.len(), "Shards registered");
    }

    web::start_server(&config, store).await?;

    Ok(())
}
