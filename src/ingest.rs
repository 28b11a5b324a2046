//! Routing of ingested log batches onto shard day-tables

use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use crate::db::{schema, ColumnValue, ShardConnection, Shards, TableCapability};
use crate::error::{Result, StoreError};
use crate::record::{AccessLogRecord, LogDay};

/// Turns a record into the column set a given table can hold.
pub struct RowBuilder {
    capability: TableCapability,
}

impl RowBuilder {
    pub fn new(capability: TableCapability) -> Self {
        Self { capability }
    }

    pub fn build(&self, record: &AccessLogRecord) -> Result<Vec<(&'static str, ColumnValue)>> {
        let content = serde_json::to_string(record)?;
        let mut columns = vec![
            ("serverId", ColumnValue::Int(record.server_id)),
            ("nodeId", ColumnValue::Int(record.node_id)),
            ("status", ColumnValue::Int(record.status as i64)),
            ("createdAt", ColumnValue::Int(record.created_at)),
            ("content", ColumnValue::Text(content)),
            ("requestId", ColumnValue::Text(record.request_id.clone())),
            ("firewallPolicyId", ColumnValue::Int(record.firewall_policy_id)),
            ("firewallRuleGroupId", ColumnValue::Int(record.firewall_rule_group_id)),
            ("firewallRuleSetId", ColumnValue::Int(record.firewall_rule_set_id)),
            ("firewallRuleId", ColumnValue::Int(record.firewall_rule_id)),
        ];
        if self.capability.has_remote_addr_column {
            columns.push((schema::REMOTE_ADDR_COLUMN, ColumnValue::Text(record.remote_addr.clone())));
        }
        if self.capability.has_domain_column {
            columns.push((schema::DOMAIN_COLUMN, ColumnValue::Text(record.host.clone())));
        }
        Ok(columns)
    }
}

/// Where the current day-table stands in the provision-and-retry-once cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provisioning {
    /// Table info came from `ensure_table` without forcing.
    Unverified,
    /// A forced re-check already ran for this batch; no more retries.
    Reprovisioned,
}

pub struct WriteRouter {
    shards: Shards,
}

impl WriteRouter {
    pub fn new(shards: Shards) -> Self {
        Self { shards }
    }

    /// Persist a batch of records.
    ///
    /// Records that fail individually are logged and skipped; the batch only
    /// fails when a day-table cannot be provisioned or stays missing after
    /// one forced re-provisioning.
    pub async fn write(&self, batch: &[AccessLogRecord], preferred: Option<ShardConnection>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut by_day: BTreeMap<LogDay, Vec<&AccessLogRecord>> = BTreeMap::new();
        for record in batch {
            match record.day() {
                Ok(day) => by_day.entry(day).or_default().push(record),
                Err(e) => warn!(request_id = %record.request_id, error = %e, "Skipping log record without a valid day"),
            }
        }

        let shard = self.shards.pick_for_write(preferred);
        debug!(shard = %shard, records = batch.len(), days = by_day.len(), "Writing log batch");

        for (day, records) in by_day {
            if let Err(e) = self.write_day(&shard, day, &records).await {
                error!(shard = %shard, day = %day, error = %e, "Failed to write log batch");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn write_day(&self, shard: &ShardConnection, day: LogDay, records: &[&AccessLogRecord]) -> Result<()> {
        let (mut table, capability) = self.shards.tables.ensure_table(shard, day, false).await?;
        let mut builder = RowBuilder::new(capability);
        let mut state = Provisioning::Unverified;

        for record in records {
            let row = match builder.build(record) {
                Ok(row) => row,
                Err(e) => {
                    warn!(request_id = %record.request_id, error = %e, "Skipping unencodable log record");
                    continue;
                }
            };

            match shard.insert(&table, &row).await {
                Ok(()) => {}
                Err(StoreError::TableMissing) if state == Provisioning::Unverified => {
                    warn!(shard = %shard, table = %table, "Day table vanished, provisioning again");
                    let (name, capability) = self.shards.tables.ensure_table(shard, day, true).await?;
                    table = name;
                    builder = RowBuilder::new(capability);
                    state = Provisioning::Reprovisioned;

                    let row = builder.build(record)?;
                    shard.insert(&table, &row).await?;
                }
                Err(StoreError::TableMissing) => return Err(StoreError::TableMissing.into()),
                Err(e) => {
                    warn!(shard = %shard, request_id = %record.request_id, error = %e, "Skipping log record that failed to insert");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogStoreError;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_shard() -> ShardConnection {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ShardConnection::new(1, pool)
    }

    fn record() -> AccessLogRecord {
        AccessLogRecord::new("17040672000000001", 3, 404)
            .with_remote_addr("1.2.3.4")
            .with_request("GET", "example.com", "/x")
    }

    fn names(row: &[(&'static str, ColumnValue)]) -> Vec<&'static str> {
        row.iter().map(|(name, _)| *name).collect()
    }

    #[test]
    fn current_tables_get_native_projections() {
        let row = RowBuilder::new(TableCapability::CURRENT).build(&record()).unwrap();
        let names = names(&row);
        assert!(names.contains(&"remoteAddr"));
        assert!(names.contains(&"domain"));
        assert!(row.contains(&("domain", ColumnValue::Text("example.com".into()))));
    }

    #[test]
    fn legacy_tables_only_get_base_columns() {
        let capability = TableCapability {
            exists: true,
            has_remote_addr_column: false,
            has_domain_column: false,
        };
        let row = RowBuilder::new(capability).build(&record()).unwrap();
        assert_eq!(names(&row), schema::BASE_COLUMNS.to_vec());
        assert!(row.contains(&("status", ColumnValue::Int(404))));
    }

    #[tokio::test]
    async fn table_missing_after_reprovisioning_fails_the_batch() {
        let shard = memory_shard().await;
        let shards = Shards::new(shard.clone());
        let day = record().day().unwrap();
        let (table, _) = shards.tables.ensure_table(&shard, day, false).await.unwrap();
        // Every insert now reports a missing table even though the day-table
        // itself is present.
        shard
            .execute(&format!(
                "CREATE TRIGGER {table}_mirror AFTER INSERT ON {table} \
                 BEGIN INSERT INTO accessLogMirror (requestId) VALUES (NEW.requestId); END"
            ))
            .await
            .unwrap();

        let err = WriteRouter::new(shards).write(&[record()], None).await.unwrap_err();
        assert!(matches!(err, LogStoreError::Store(StoreError::TableMissing)));
    }
}
