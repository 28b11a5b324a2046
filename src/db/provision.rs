//! Lazy, idempotent day-table provisioning and per-table column capability

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{schema, ShardConnection};
use crate::error::StoreError;
use crate::record::LogDay;

/// Which optional columns one (shard, day) table was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCapability {
    pub exists: bool,
    pub has_remote_addr_column: bool,
    pub has_domain_column: bool,
}

impl TableCapability {
    /// Capability of a table created by the current DDL.
    pub const CURRENT: TableCapability = TableCapability {
        exists: true,
        has_remote_addr_column: true,
        has_domain_column: true,
    };

    fn from_columns(columns: &[String]) -> Self {
        let has = |wanted: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(wanted));
        Self {
            exists: true,
            has_remote_addr_column: has(schema::REMOTE_ADDR_COLUMN),
            has_domain_column: has(schema::DOMAIN_COLUMN),
        }
    }
}

#[derive(Debug, Clone)]
struct KnownTable {
    name: String,
    capability: TableCapability,
}

/// Capability cache plus the provisioning logic that fills it.
///
/// Entries are keyed by canonical table name and shard node id and are only
/// ever added or overwritten by a forced re-check.
#[derive(Default)]
pub struct TableProvisioner {
    known: Mutex<HashMap<(String, i64), KnownTable>>,
}

impl TableProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the day-table exists on `shard`, creating it if needed.
    ///
    /// Returns the physical table name and its capability. With `force` the
    /// cache is bypassed and the shard is asked again.
    pub async fn ensure_table(
        &self,
        shard: &ShardConnection,
        day: LogDay,
        force: bool,
    ) -> Result<(String, TableCapability), StoreError> {
        let table = day.table_name();
        if !force {
            if let Some(known) = self.cached(&table, shard) {
                return Ok((known.name, known.capability));
            }
        }

        if let Some(known) = self.discover(shard, &table).await? {
            ensure_indexes(shard, &known.name, known.capability).await;
            return Ok((known.name, known.capability));
        }

        let capability = match shard.execute(&schema::create_table(&table)).await {
            Ok(()) => {
                info!(shard = %shard, table = %table, "Created day table");
                ensure_indexes(shard, &table, TableCapability::CURRENT).await;
                TableCapability::CURRENT
            }
            Err(StoreError::TableExists) => {
                debug!(shard = %shard, table = %table, "Day table created concurrently");
                let columns = shard.columns(&table).await?;
                TableCapability::from_columns(&columns)
            }
            Err(e) => return Err(e),
        };

        self.remember(&table, shard, table.clone(), capability);
        Ok((table, capability))
    }

    /// Read-path lookup: never creates, reports `None` for a missing table.
    pub async fn lookup_table(
        &self,
        shard: &ShardConnection,
        day: LogDay,
    ) -> Result<Option<(String, TableCapability)>, StoreError> {
        let table = day.table_name();
        if let Some(known) = self.cached(&table, shard) {
            return Ok(Some((known.name, known.capability)));
        }
        Ok(self
            .discover(shard, &table)
            .await?
            .map(|known| (known.name, known.capability)))
    }

    /// List the shard's tables and, on a case-insensitive match, introspect its
    /// columns since it may predate the current schema.
    async fn discover(&self, shard: &ShardConnection, table: &str) -> Result<Option<KnownTable>, StoreError> {
        let tables = shard.list_tables().await?;
        let Some(name) = tables.into_iter().find(|t| t.eq_ignore_ascii_case(table)) else {
            return Ok(None);
        };
        let columns = shard.columns(&name).await?;
        let capability = TableCapability::from_columns(&columns);
        debug!(shard = %shard, table = %name, ?capability, "Discovered day table");
        self.remember(table, shard, name.clone(), capability);
        Ok(Some(KnownTable { name, capability }))
    }

    fn cached(&self, table: &str, shard: &ShardConnection) -> Option<KnownTable> {
        self.lock().get(&(table.to_string(), shard.node_id())).cloned()
    }

    fn remember(&self, table: &str, shard: &ShardConnection, name: String, capability: TableCapability) {
        self.lock()
            .insert((table.to_string(), shard.node_id()), KnownTable { name, capability });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, i64), KnownTable>> {
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Apply the index DDL a table should have. Failures only cost query speed,
/// so they are logged and the next provisioning of the table tries again.
async fn ensure_indexes(shard: &ShardConnection, table: &str, capability: TableCapability) {
    let indexes = schema::create_indexes(table, capability.has_remote_addr_column, capability.has_domain_column);
    for index in indexes {
        if let Err(e) = shard.execute(&index).await {
            warn!(shard = %shard, table = %table, error = %e, "Failed to create day table index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_shard(node_id: i64) -> ShardConnection {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ShardConnection::new(node_id, pool)
    }

    fn day() -> LogDay {
        LogDay::parse("20240101").unwrap()
    }

    #[tokio::test]
    async fn creates_missing_table_with_current_schema() {
        let shard = memory_shard(1).await;
        let provisioner = TableProvisioner::new();

        let (name, capability) = provisioner.ensure_table(&shard, day(), false).await.unwrap();
        assert_eq!(name, "accessLogs_20240101");
        assert_eq!(capability, TableCapability::CURRENT);
        assert!(shard.list_tables().await.unwrap().contains(&name));
    }

    #[tokio::test]
    async fn concurrent_first_writers_agree() {
        let shard = memory_shard(1).await;
        let provisioner = TableProvisioner::new();

        let (a, b) = tokio::join!(
            provisioner.ensure_table(&shard, day(), false),
            provisioner.ensure_table(&shard, day(), true),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(a.1, TableCapability::CURRENT);
    }

    #[tokio::test]
    async fn legacy_table_columns_are_discovered() {
        let shard = memory_shard(1).await;
        shard
            .execute(
                "CREATE TABLE AccessLogs_20240101 (id INTEGER PRIMARY KEY, serverId INTEGER, nodeId INTEGER, \
                 status INTEGER, createdAt INTEGER, content TEXT, requestId TEXT, firewallPolicyId INTEGER, \
                 firewallRuleGroupId INTEGER, firewallRuleSetId INTEGER, firewallRuleId INTEGER, remoteAddr TEXT)",
            )
            .await
            .unwrap();
        let provisioner = TableProvisioner::new();

        let (name, capability) = provisioner.ensure_table(&shard, day(), false).await.unwrap();
        assert_eq!(name, "AccessLogs_20240101");
        assert!(capability.has_remote_addr_column);
        assert!(!capability.has_domain_column);
    }

    async fn index_count(shard: &ShardConnection, table: &str) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND name LIKE 'idx_%'")
                .bind(table)
                .fetch_one(shard.pool())
                .await
                .unwrap();
        count
    }

    #[tokio::test]
    async fn unindexed_table_gets_its_indexes_on_discovery() {
        let shard = memory_shard(1).await;
        let table = day().table_name();
        shard.execute(&schema::create_table(&table)).await.unwrap();
        assert_eq!(index_count(&shard, &table).await, 0);

        let provisioner = TableProvisioner::new();
        provisioner.ensure_table(&shard, day(), false).await.unwrap();
        assert_eq!(index_count(&shard, &table).await, 5);
    }

    #[tokio::test]
    async fn read_path_leaves_indexes_alone() {
        let shard = memory_shard(1).await;
        let table = day().table_name();
        shard.execute(&schema::create_table(&table)).await.unwrap();

        TableProvisioner::new().lookup_table(&shard, day()).await.unwrap();
        assert_eq!(index_count(&shard, &table).await, 0);
    }

    #[tokio::test]
    async fn lookup_never_creates() {
        let shard = memory_shard(1).await;
        let provisioner = TableProvisioner::new();

        assert!(provisioner.lookup_table(&shard, day()).await.unwrap().is_none());
        assert!(shard.list_tables().await.unwrap().is_empty());

        provisioner.ensure_table(&shard, day(), false).await.unwrap();
        let (_, capability) = provisioner.lookup_table(&shard, day()).await.unwrap().unwrap();
        assert!(capability.exists);
    }

    #[tokio::test]
    async fn forced_check_recreates_dropped_table() {
        let shard = memory_shard(1).await;
        let provisioner = TableProvisioner::new();
        let (name, _) = provisioner.ensure_table(&shard, day(), false).await.unwrap();

        shard.execute(&format!("DROP TABLE {name}")).await.unwrap();
        // The cache still answers without touching the shard.
        provisioner.ensure_table(&shard, day(), false).await.unwrap();
        assert!(!shard.list_tables().await.unwrap().contains(&name));

        provisioner.ensure_table(&shard, day(), true).await.unwrap();
        assert!(shard.list_tables().await.unwrap().contains(&name));
    }
}
