//! Access log records and the calendar day they belong to

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LogStoreError, Result};

/// Prefix of every day-table; the suffix is the day as `YYYYMMDD`.
pub const TABLE_PREFIX: &str = "accessLogs_";

/// One HTTP request as logged by an edge node.
///
/// The whole record is persisted as the JSON `content` column, so field
/// names here double as the JSON paths used by fallback predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub request_id: String,
    #[serde(default)]
    pub server_id: i64,
    #[serde(default)]
    pub node_id: i64,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, rename = "requestURI")]
    pub request_uri: String,
    #[serde(default)]
    pub request_method: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub firewall_policy_id: i64,
    #[serde(default)]
    pub firewall_rule_group_id: i64,
    #[serde(default)]
    pub firewall_rule_set_id: i64,
    #[serde(default)]
    pub firewall_rule_id: i64,
}

impl AccessLogRecord {
    pub fn new(request_id: impl Into<String>, server_id: i64, status: i32) -> Self {
        let request_id = request_id.into();
        let created_at = request_id
            .get(..10)
            .and_then(|prefix| prefix.parse().ok())
            .unwrap_or_default();
        Self {
            request_id,
            server_id,
            node_id: 0,
            status,
            created_at,
            remote_addr: String::new(),
            host: String::new(),
            request_uri: String::new(),
            request_method: String::new(),
            user_agent: String::new(),
            tags: Vec::new(),
            firewall_policy_id: 0,
            firewall_rule_group_id: 0,
            firewall_rule_set_id: 0,
            firewall_rule_id: 0,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self
    }

    pub fn with_request(
        mut self,
        method: impl Into<String>,
        host: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        self.request_method = method.into();
        self.host = host.into();
        self.request_uri = uri.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_firewall(mut self, policy_id: i64, rule_group_id: i64, rule_set_id: i64, rule_id: i64) -> Self {
        self.firewall_policy_id = policy_id;
        self.firewall_rule_group_id = rule_group_id;
        self.firewall_rule_set_id = rule_set_id;
        self.firewall_rule_id = rule_id;
        self
    }

    /// Day this record is stored under, derived from its request id.
    pub fn day(&self) -> Result<LogDay> {
        LogDay::from_request_id(&self.request_id)
    }
}

/// A calendar day (UTC) naming one day-table on every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogDay(NaiveDate);

impl LogDay {
    /// Parse a `YYYYMMDD` day string.
    pub fn parse(day: &str) -> Result<Self> {
        let day = day.trim();
        if day.len() != 8 || !day.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LogStoreError::InvalidDay(day.to_string()));
        }
        NaiveDate::parse_from_str(day, "%Y%m%d")
            .map(Self)
            .map_err(|_| LogStoreError::InvalidDay(day.to_string()))
    }

    /// Request ids start with the Unix second they were issued in; at least
    /// one more digit follows.
    pub fn from_request_id(request_id: &str) -> Result<Self> {
        if request_id.len() < 11 || !request_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LogStoreError::InvalidRequestId(request_id.to_string()));
        }
        let seconds: i64 = request_id[..10]
            .parse()
            .map_err(|_| LogStoreError::InvalidRequestId(request_id.to_string()))?;
        DateTime::from_timestamp(seconds, 0)
            .map(|at| Self(at.date_naive()))
            .ok_or_else(|| LogStoreError::InvalidRequestId(request_id.to_string()))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }

    pub fn table_name(&self) -> String {
        format!("{}{}", TABLE_PREFIX, self)
    }
}

impl fmt::Display for LogDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_from_request_id_uses_timestamp_prefix() {
        // 1704067200 = 2024-01-01T00:00:00Z
        let day = LogDay::from_request_id("17040672000000001").unwrap();
        assert_eq!(day.to_string(), "20240101");
        assert_eq!(day.table_name(), "accessLogs_20240101");

        let late = LogDay::from_request_id("17041535990000001").unwrap();
        assert_eq!(late.to_string(), "20240101");
    }

    #[test]
    fn request_id_must_be_long_and_numeric() {
        assert!(LogDay::from_request_id("1704067200").is_err());
        assert!(LogDay::from_request_id("17040672x0000001").is_err());
        assert!(LogDay::from_request_id("").is_err());
    }

    #[test]
    fn parse_rejects_malformed_days() {
        assert!(LogDay::parse("20240101").is_ok());
        assert!(LogDay::parse("2024-01-01").is_err());
        assert!(LogDay::parse("20241301").is_err());
        assert!(LogDay::parse("2024011").is_err());
    }

    #[test]
    fn content_uses_camel_case_paths() {
        let record = AccessLogRecord::new("17040672000000001", 7, 200)
            .with_remote_addr("10.0.0.1")
            .with_request("GET", "example.com", "/index.html");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["remoteAddr"], "10.0.0.1");
        assert_eq!(json["requestURI"], "/index.html");
        assert_eq!(json["serverId"], 7);
        assert_eq!(json["createdAt"], 1704067200);
    }
}
