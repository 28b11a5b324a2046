//! Edge access-log store
//!
//! Access logs are written into per-day tables spread over node-owned
//! SQLite shards. Reads fan out over every shard and merge by request id:
//! - Day-tables are created on demand and their columns introspected
//! - Legacy tables without native projections are queried through JSON
//! - Aggregations rank hosts, URIs, addresses and regions per tenant

pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod geoip;
pub mod ingest;
pub mod query;
pub mod record;
pub mod stats;
pub mod web;

use std::sync::Arc;

use crate::config::FanoutConfig;
use crate::db::{ShardConnection, Shards};
use crate::directory::{Directory, RegionResolver};
use crate::error::Result;
use crate::fanout::Fanout;
use crate::ingest::WriteRouter;
use crate::query::{Page, QueryExecutor, QueryFilter, SearchPage};
use crate::record::AccessLogRecord;
use crate::stats::AggregationEngine;

/// Write, query and aggregation paths over one set of shards.
pub struct LogStore {
    shards: Shards,
    writer: WriteRouter,
    queries: QueryExecutor,
    stats: AggregationEngine,
}

impl LogStore {
    pub fn new(
        shards: Shards,
        directory: Arc<dyn Directory>,
        resolver: Arc<dyn RegionResolver>,
        fanout: &FanoutConfig,
    ) -> Self {
        let fanout = Fanout::new(fanout);
        Self {
            writer: WriteRouter::new(shards.clone()),
            queries: QueryExecutor::new(shards.clone(), directory.clone(), fanout),
            stats: AggregationEngine::new(shards.clone(), directory, resolver, fanout),
            shards,
        }
    }

    pub fn shards(&self) -> &Shards {
        &self.shards
    }

    /// Register a node's shard so it receives writes and is visited by reads.
    pub fn register_shard(&self, shard: ShardConnection) {
        self.shards.registry.register(shard.node_id(), shard);
    }

    pub async fn write(&self, batch: &[AccessLogRecord]) -> Result<()> {
        self.writer.write(batch, None).await
    }

    /// Write to a specific shard instead of a randomly picked one.
    pub async fn write_to(&self, shard: ShardConnection, batch: &[AccessLogRecord]) -> Result<()> {
        self.writer.write(batch, Some(shard)).await
    }

    pub async fn list(&self, filter: &QueryFilter) -> Result<Page> {
        self.queries.list(filter).await
    }

    pub async fn search(&self, filter: &QueryFilter) -> Result<SearchPage> {
        self.queries.search(filter).await
    }

    pub async fn find(&self, request_id: &str) -> Result<Option<AccessLogRecord>> {
        self.queries.find(request_id).await
    }

    pub fn stats(&self) -> &AggregationEngine {
        &self.stats
    }
}
