//! Cross-shard listing, search and lookup of access logs

mod executor;
pub mod filter;
pub mod merge;

pub use executor::QueryExecutor;

use serde::{Deserialize, Serialize};

use crate::record::AccessLogRecord;

/// Hard cap on a listing page.
pub const MAX_LIST_SIZE: usize = 1000;
/// Hard cap on a search page.
pub const MAX_SEARCH_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Pagination direction relative to the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Older records first from the cursor, pages newest-first.
    #[default]
    Forward,
    /// Newer records from the cursor.
    Reverse,
}

impl Direction {
    fn order_sql(self) -> &'static str {
        match self {
            Direction::Forward => "DESC",
            Direction::Reverse => "ASC",
        }
    }

    fn cursor_sql(self) -> &'static str {
        match self {
            Direction::Forward => " AND requestId < ",
            Direction::Reverse => " AND requestId > ",
        }
    }
}

/// Filter shared by listing and search.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilter {
    /// Day as `YYYYMMDD`; required.
    pub day: String,
    pub server_id: Option<i64>,
    pub user_id: Option<i64>,
    /// Single address, comma list, `a-b` range or CIDR block.
    pub ip: Option<String>,
    /// Exact host, or a pattern using `*`.
    pub domain: Option<String>,
    pub keyword: Option<String>,
    pub method: Option<String>,
    pub status: Option<i32>,
    /// Inclusive `createdAt` bounds in Unix seconds.
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
    pub has_error: bool,
    pub has_firewall_policy: bool,
    pub firewall_policy_id: Option<i64>,
    /// WAF category code, e.g. `sqlInjection`.
    pub category: Option<String>,
    pub last_request_id: Option<String>,
    pub direction: Direction,
    pub size: Option<usize>,
}

impl QueryFilter {
    pub fn for_day(day: impl Into<String>) -> Self {
        Self {
            day: day.into(),
            ..Default::default()
        }
    }

    fn page_size(&self, cap: usize) -> usize {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, cap)
    }

    fn cursor(&self) -> Option<&str> {
        self.last_request_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub records: Vec<AccessLogRecord>,
    /// Pass back as `lastRequestId` to continue.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl Page {
    fn empty(cursor: Option<&str>) -> Self {
        Self {
            records: Vec::new(),
            next_cursor: cursor.map(str::to_string),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub records: Vec<AccessLogRecord>,
    pub next_cursor: Option<String>,
}
