use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::sync::Arc;
use tracing::{debug, warn};

use super::filter::Conditions;
use super::{merge, Direction, Page, QueryFilter, SearchPage, MAX_LIST_SIZE, MAX_SEARCH_SIZE};
use crate::db::{ShardConnection, Shards};
use crate::directory::{Directory, ServerScope};
use crate::error::{LogStoreError, Result, StoreError};
use crate::fanout::Fanout;
use crate::record::{AccessLogRecord, LogDay};

/// Dispatches one logical query to every active shard and merges the answers.
pub struct QueryExecutor {
    shards: Shards,
    directory: Arc<dyn Directory>,
    fanout: Fanout,
}

/// One page request against one day, after validation and scoping.
struct PageRequest<'a> {
    day: LogDay,
    conditions: &'a Conditions,
    cursor: Option<&'a str>,
    direction: Direction,
    size: usize,
}

impl QueryExecutor {
    pub fn new(shards: Shards, directory: Arc<dyn Directory>, fanout: Fanout) -> Self {
        Self {
            shards,
            directory,
            fanout,
        }
    }

    /// List one day's logs, newest first for forward paging.
    pub async fn list(&self, filter: &QueryFilter) -> Result<Page> {
        let size = filter.page_size(MAX_LIST_SIZE);
        let Some((day, conditions)) = self.prepare(filter).await? else {
            return Ok(Page::empty(filter.cursor()));
        };

        let request = PageRequest {
            day,
            conditions: &conditions,
            cursor: filter.cursor(),
            direction: filter.direction,
            size,
        };
        let (records, cursor) = merge::merge(self.fetch(&request).await, size, filter.direction);

        let has_more = match cursor.as_deref() {
            Some(next) => {
                let look_ahead = PageRequest {
                    cursor: Some(next),
                    size: 1,
                    ..request
                };
                self.fetch(&look_ahead).await.iter().any(|rows| !rows.is_empty())
            }
            None => false,
        };

        Ok(Page {
            records: merge::present(records, filter.direction),
            next_cursor: cursor.or_else(|| filter.cursor().map(str::to_string)),
            has_more,
        })
    }

    /// Like [`list`](Self::list) with the smaller search cap and no look-ahead.
    pub async fn search(&self, filter: &QueryFilter) -> Result<SearchPage> {
        let size = filter.page_size(MAX_SEARCH_SIZE);
        let Some((day, conditions)) = self.prepare(filter).await? else {
            return Ok(SearchPage {
                records: Vec::new(),
                next_cursor: filter.cursor().map(str::to_string),
            });
        };

        let request = PageRequest {
            day,
            conditions: &conditions,
            cursor: filter.cursor(),
            direction: filter.direction,
            size,
        };
        let (records, cursor) = merge::merge(self.fetch(&request).await, size, filter.direction);
        Ok(SearchPage {
            records: merge::present(records, filter.direction),
            next_cursor: cursor.or_else(|| filter.cursor().map(str::to_string)),
        })
    }

    /// Find one record by request id on whichever shard holds it.
    pub async fn find(&self, request_id: &str) -> Result<Option<AccessLogRecord>> {
        let day = LogDay::from_request_id(request_id)?;
        let found = self
            .fanout
            .run("find", self.shards.active(), |shard| self.find_on_shard(shard, day, request_id))
            .await;
        Ok(found.into_iter().flatten().next())
    }

    /// Validate the filter and resolve its scoping. `None` means nothing can
    /// match, so no shard needs to be asked.
    async fn prepare(&self, filter: &QueryFilter) -> Result<Option<(LogDay, Conditions)>> {
        if filter.day.trim().is_empty() {
            return Err(LogStoreError::InvalidFilter("day is required".to_string()));
        }
        let day = LogDay::parse(&filter.day)?;
        let mut conditions = Conditions::parse(filter)?;

        let scope = ServerScope::resolve(self.directory.as_ref(), filter.user_id, filter.server_id)
            .await
            .map_err(LogStoreError::directory)?;
        if scope.is_empty() {
            debug!(user_id = ?filter.user_id, "No servers in scope, skipping query");
            return Ok(None);
        }
        if let ServerScope::Servers(ids) = scope {
            conditions.server_ids = Some(ids);
        }

        if let Some(code) = filter.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let groups = self
                .directory
                .rule_group_ids_for_category(code)
                .await
                .map_err(LogStoreError::directory)?;
            if groups.is_empty() {
                debug!(category = code, "WAF category has no rule groups, skipping query");
                return Ok(None);
            }
            conditions.rule_group_ids = Some(groups);
        }

        Ok(Some((day, conditions)))
    }

    async fn fetch(&self, request: &PageRequest<'_>) -> Vec<Vec<AccessLogRecord>> {
        self.fanout
            .run("list", self.shards.active(), |shard| self.fetch_from_shard(shard, request))
            .await
    }

    async fn fetch_from_shard(&self, shard: ShardConnection, request: &PageRequest<'_>) -> Result<Vec<AccessLogRecord>> {
        let Some((table, capability)) = self.shards.tables.lookup_table(&shard, request.day).await? else {
            return Ok(Vec::new());
        };

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT content FROM ");
        builder.push(&table).push(" WHERE 1 = 1");
        request.conditions.push_conditions(&mut builder, capability);
        if let Some(cursor) = request.cursor {
            builder.push(request.direction.cursor_sql()).push_bind(cursor.to_string());
        }
        builder
            .push(" ORDER BY requestId ")
            .push(request.direction.order_sql())
            .push(" LIMIT ")
            .push_bind(request.size as i64);

        let rows = fetch_tolerating_missing(&shard, &mut builder).await?;
        Ok(decode_rows(&shard, &rows))
    }

    async fn find_on_shard(&self, shard: ShardConnection, day: LogDay, request_id: &str) -> Result<Option<AccessLogRecord>> {
        let Some((table, _)) = self.shards.tables.lookup_table(&shard, day).await? else {
            return Ok(None);
        };
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT content FROM ");
        builder
            .push(&table)
            .push(" WHERE requestId = ")
            .push_bind(request_id.to_string())
            .push(" LIMIT 1");
        let rows = fetch_tolerating_missing(&shard, &mut builder).await?;
        Ok(decode_rows(&shard, &rows).into_iter().next())
    }
}

/// A table dropped between lookup and query reads as empty.
async fn fetch_tolerating_missing(shard: &ShardConnection, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Vec<SqliteRow>> {
    match shard.fetch_all(builder).await {
        Ok(rows) => Ok(rows),
        Err(StoreError::TableMissing) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn decode_rows(shard: &ShardConnection, rows: &[SqliteRow]) -> Vec<AccessLogRecord> {
    rows.iter()
        .filter_map(|row| {
            let decoded = row
                .try_get::<String, _>("content")
                .map_err(LogStoreError::from)
                .and_then(|content| serde_json::from_str(&content).map_err(LogStoreError::from));
            match decoded {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Skipping undecodable log row");
                    None
                }
            }
        })
        .collect()
}
