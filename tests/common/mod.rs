//! Shared fixtures for multi-shard scenarios
#![allow(dead_code)]

use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::Arc;

use edge_accesslog::config::FanoutConfig;
use edge_accesslog::db::{ShardConnection, Shards};
use edge_accesslog::directory::{Region, RegionResolver, StaticDirectory};
use edge_accesslog::record::AccessLogRecord;
use edge_accesslog::LogStore;

pub const DAY: &str = "20240101";

/// Day-table as written before `remoteAddr` and `domain` were projected.
pub const LEGACY_TABLE: &str = "CREATE TABLE accessLogs_20240101 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serverId INTEGER NOT NULL DEFAULT 0,
    nodeId INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 0,
    createdAt INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    requestId TEXT NOT NULL,
    firewallPolicyId INTEGER NOT NULL DEFAULT 0,
    firewallRuleGroupId INTEGER NOT NULL DEFAULT 0,
    firewallRuleSetId INTEGER NOT NULL DEFAULT 0,
    firewallRuleId INTEGER NOT NULL DEFAULT 0
)";

/// Private in-memory database; the single pinned connection keeps it alive.
pub async fn memory_shard(node_id: i64) -> ShardConnection {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    ShardConnection::new(node_id, pool)
}

pub async fn legacy_shard(node_id: i64) -> ShardConnection {
    let shard = memory_shard(node_id).await;
    shard.execute(LEGACY_TABLE).await.unwrap();
    shard
}

/// Request id issued on 2024-01-01 with sequence `n`.
pub fn request_id(n: u32) -> String {
    format!("1704067200{:07}", n)
}

pub fn record(n: u32, server_id: i64) -> AccessLogRecord {
    AccessLogRecord::new(request_id(n), server_id, 200)
        .with_remote_addr("10.0.0.1")
        .with_request("GET", "example.com", "/")
}

#[derive(Default)]
pub struct FakeResolver {
    regions: HashMap<String, Region>,
}

impl FakeResolver {
    pub fn with(mut self, ip: &str, country: &str, city: &str) -> Self {
        self.regions.insert(ip.to_string(), Region::new(country, "", city));
        self
    }
}

impl RegionResolver for FakeResolver {
    fn resolve(&self, ip: &str) -> Region {
        self.regions.get(ip).cloned().unwrap_or_default()
    }
}

pub struct Fixture {
    pub store: LogStore,
    pub shards: Vec<ShardConnection>,
}

/// Store over a throwaway default shard (node 0) with `shards` registered.
pub async fn store_with(shards: Vec<ShardConnection>, directory: StaticDirectory, resolver: FakeResolver) -> Fixture {
    let store = LogStore::new(
        Shards::new(memory_shard(0).await),
        Arc::new(directory),
        Arc::new(resolver),
        &FanoutConfig::default(),
    );
    for shard in &shards {
        store.register_shard(shard.clone());
    }
    Fixture { store, shards }
}

pub async fn store(shards: Vec<ShardConnection>) -> Fixture {
    store_with(shards, StaticDirectory::default(), FakeResolver::default()).await
}

pub async fn memory_shards(count: i64) -> Vec<ShardConnection> {
    let mut shards = Vec::new();
    for node_id in 1..=count {
        shards.push(memory_shard(node_id).await);
    }
    shards
}

impl Fixture {
    /// Write each record to the shard `shard_of(record index)`.
    pub async fn spread(&self, records: &[AccessLogRecord], shard_of: impl Fn(usize) -> usize) {
        for (i, record) in records.iter().enumerate() {
            let shard = self.shards[shard_of(i)].clone();
            self.store.write_to(shard, std::slice::from_ref(record)).await.unwrap();
        }
    }

    pub async fn row_count(&self, shard: usize) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accessLogs_20240101")
            .fetch_one(self.shards[shard].pool())
            .await
            .unwrap();
        count
    }
}
