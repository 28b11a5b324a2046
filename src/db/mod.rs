//! Shard connections and the day-table lifecycle on top of them

mod provision;
mod registry;
pub mod schema;

pub use provision::{TableCapability, TableProvisioner};
pub use registry::ShardRegistry;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StoreError;

/// Node id the primary database is registered under.
pub const DEFAULT_NODE_ID: i64 = 0;

/// A value bound into one column of an insert.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    Text(String),
}

/// One physical database holding day-tables, identified by its owning node.
#[derive(Clone)]
pub struct ShardConnection {
    node_id: i64,
    pool: Pool<Sqlite>,
}

impl ShardConnection {
    pub fn new(node_id: i64, pool: SqlitePool) -> Self {
        Self { node_id, pool }
    }

    /// Open (creating if needed) the SQLite database at `path`.
    pub async fn connect(node_id: i64, path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { node_id, pool })
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(schema::LIST_TABLES)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    pub async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&schema::table_info(table))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    pub async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert(&self, table: &str, columns: &[(&'static str, ColumnValue)]) -> Result<(), StoreError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT INTO ");
        builder.push(table).push(" (");
        let mut names = builder.separated(", ");
        for (name, _) in columns {
            names.push(*name);
        }
        builder.push(") VALUES (");
        let mut values = builder.separated(", ");
        for (_, value) in columns {
            match value {
                ColumnValue::Int(v) => values.push_bind(*v),
                ColumnValue::Text(v) => values.push_bind(v.clone()),
            };
        }
        builder.push(")");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn fetch_all(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Vec<SqliteRow>, StoreError> {
        Ok(builder.build().fetch_all(&self.pool).await?)
    }
}

/// Registry, capability cache and the primary database, shared by the write,
/// query and aggregation paths.
#[derive(Clone)]
pub struct Shards {
    pub registry: Arc<ShardRegistry>,
    pub tables: Arc<TableProvisioner>,
    default_shard: ShardConnection,
}

impl Shards {
    pub fn new(default_shard: ShardConnection) -> Self {
        Self {
            registry: Arc::new(ShardRegistry::new()),
            tables: Arc::new(TableProvisioner::new()),
            default_shard,
        }
    }

    pub fn default_shard(&self) -> &ShardConnection {
        &self.default_shard
    }

    /// Shards a query must visit: every registered shard, or the default
    /// shard while none are registered.
    pub fn active(&self) -> Vec<ShardConnection> {
        let shards = self.registry.list_all();
        if shards.is_empty() {
            vec![self.default_shard.clone()]
        } else {
            shards
        }
    }

    /// Shard for an incoming batch. Pure load distribution, never derived
    /// from record contents.
    pub fn pick_for_write(&self, preferred: Option<ShardConnection>) -> ShardConnection {
        preferred
            .or_else(|| self.registry.pick_random())
            .unwrap_or_else(|| self.default_shard.clone())
    }
}

impl fmt::Display for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.node_id)
    }
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
