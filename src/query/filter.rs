//! Translation of a query filter into SQL conditions for one day-table
//!
//! Conditions on `remoteAddr` and `host` use the native columns when the
//! table has them and fall back to `json_extract` over `content` otherwise,
//! so legacy and current tables answer the same filter identically.

use sqlx::{QueryBuilder, Sqlite};
use std::net::{IpAddr, Ipv4Addr};

use super::QueryFilter;
use crate::db::TableCapability;
use crate::error::{LogStoreError, Result};

/// Widest IP range a filter may expand to.
pub const MAX_IP_RANGE: u64 = 4096;

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

pub(crate) const URI_EXPR: &str = "json_extract(content, '$.requestURI')";
const USER_AGENT_EXPR: &str = "json_extract(content, '$.userAgent')";
const METHOD_EXPR: &str = "json_extract(content, '$.requestMethod')";

pub(crate) fn remote_addr_expr(capability: TableCapability) -> &'static str {
    if capability.has_remote_addr_column {
        "remoteAddr"
    } else {
        "json_extract(content, '$.remoteAddr')"
    }
}

pub(crate) fn host_expr(capability: TableCapability) -> &'static str {
    if capability.has_domain_column {
        "domain"
    } else {
        "json_extract(content, '$.host')"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum DomainMatch {
    Exact(String),
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Keyword {
    pattern: String,
    raw: String,
    method: Option<String>,
    status: Option<(i32, i32)>,
}

/// Validated filter conditions, independent of any particular table.
#[derive(Debug, Clone, Default)]
pub(crate) struct Conditions {
    pub server_ids: Option<Vec<i64>>,
    pub rule_group_ids: Option<Vec<i64>>,
    ips: Option<Vec<String>>,
    domain: Option<DomainMatch>,
    keyword: Option<Keyword>,
    method: Option<String>,
    status: Option<i32>,
    start_at: Option<i64>,
    end_at: Option<i64>,
    has_error: bool,
    has_firewall_policy: bool,
    firewall_policy_id: Option<i64>,
}

impl Conditions {
    /// Validate the caller-supplied parts of `filter`. Server and rule-group
    /// scoping are filled in afterwards by the executor.
    pub fn parse(filter: &QueryFilter) -> Result<Self> {
        if let (Some(start), Some(end)) = (filter.start_at, filter.end_at) {
            if start > end {
                return Err(LogStoreError::InvalidFilter(format!(
                    "startAt {start} is after endAt {end}"
                )));
            }
        }

        let method = match non_empty(&filter.method) {
            Some(method) => {
                let method = method.to_uppercase();
                if !HTTP_METHODS.contains(&method.as_str()) {
                    return Err(LogStoreError::InvalidFilter(format!("unknown HTTP method '{method}'")));
                }
                Some(method)
            }
            None => None,
        };

        Ok(Self {
            server_ids: None,
            rule_group_ids: None,
            ips: non_empty(&filter.ip).map(parse_ips).transpose()?,
            domain: non_empty(&filter.domain).map(parse_domain),
            keyword: non_empty(&filter.keyword).map(parse_keyword),
            method,
            status: filter.status,
            start_at: filter.start_at,
            end_at: filter.end_at,
            has_error: filter.has_error,
            has_firewall_policy: filter.has_firewall_policy,
            firewall_policy_id: filter.firewall_policy_id,
        })
    }

    /// Append ` AND ...` clauses for a table with the given capability. The
    /// builder must already contain a `WHERE` clause.
    pub fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>, capability: TableCapability) {
        let remote_addr = remote_addr_expr(capability);
        let host = host_expr(capability);

        if let Some(server_ids) = &self.server_ids {
            push_in_list(builder, "serverId", server_ids.iter().copied());
        }
        if let Some(rule_group_ids) = &self.rule_group_ids {
            push_in_list(builder, "firewallRuleGroupId", rule_group_ids.iter().copied());
        }
        if let Some(ips) = &self.ips {
            if let [ip] = ips.as_slice() {
                builder.push(" AND ").push(remote_addr).push(" = ").push_bind(ip.clone());
            } else {
                push_in_list(builder, remote_addr, ips.iter().cloned());
            }
        }
        match &self.domain {
            Some(DomainMatch::Exact(domain)) => {
                builder.push(" AND ").push(host).push(" = ").push_bind(domain.clone());
            }
            Some(DomainMatch::Pattern(pattern)) => {
                builder
                    .push(" AND ")
                    .push(host)
                    .push(" LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            None => {}
        }
        if let Some(method) = &self.method {
            builder.push(" AND ").push(METHOD_EXPR).push(" = ").push_bind(method.clone());
        }
        if let Some(status) = self.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(start_at) = self.start_at {
            builder.push(" AND createdAt >= ").push_bind(start_at);
        }
        if let Some(end_at) = self.end_at {
            builder.push(" AND createdAt <= ").push_bind(end_at);
        }
        if self.has_error {
            builder.push(" AND status >= 400");
        }
        if self.has_firewall_policy {
            builder.push(" AND firewallPolicyId > 0");
        }
        if let Some(policy_id) = self.firewall_policy_id {
            builder.push(" AND firewallPolicyId = ").push_bind(policy_id);
        }
        if let Some(keyword) = &self.keyword {
            push_keyword(builder, keyword, remote_addr, host);
        }
    }
}

fn push_keyword(builder: &mut QueryBuilder<'_, Sqlite>, keyword: &Keyword, remote_addr: &str, host: &str) {
    builder.push(" AND (");
    for (i, expr) in [remote_addr, URI_EXPR, host, USER_AGENT_EXPR].into_iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder
            .push(expr)
            .push(" LIKE ")
            .push_bind(keyword.pattern.clone())
            .push(" ESCAPE '\\'");
    }
    builder
        .push(" OR EXISTS (SELECT 1 FROM json_each(content, '$.tags') WHERE json_each.value = ")
        .push_bind(keyword.raw.clone())
        .push(")");
    if let Some(method) = &keyword.method {
        builder.push(" OR ").push(METHOD_EXPR).push(" = ").push_bind(method.clone());
    }
    match keyword.status {
        Some((low, high)) if low == high => {
            builder.push(" OR status = ").push_bind(low);
        }
        Some((low, high)) => {
            builder
                .push(" OR (status >= ")
                .push_bind(low)
                .push(" AND status <= ")
                .push_bind(high)
                .push(")");
        }
        None => {}
    }
    builder.push(")");
}

fn push_in_list<T>(builder: &mut QueryBuilder<'_, Sqlite>, column: &str, values: impl Iterator<Item = T>)
where
    T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Send + 'static,
{
    builder.push(" AND ").push(column).push(" IN (");
    let mut separated = builder.separated(", ");
    let mut any = false;
    for value in values {
        separated.push_bind(value);
        any = true;
    }
    if !any {
        separated.push("NULL");
    }
    builder.push(")");
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`.
pub(crate) fn like_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn parse_domain(domain: &str) -> DomainMatch {
    if domain.contains('*') {
        let pattern = domain
            .split('*')
            .map(like_escape)
            .collect::<Vec<_>>()
            .join("%");
        DomainMatch::Pattern(pattern)
    } else {
        DomainMatch::Exact(domain.to_string())
    }
}

fn parse_keyword(keyword: &str) -> Keyword {
    let upper = keyword.to_uppercase();
    Keyword {
        pattern: format!("%{}%", like_escape(keyword)),
        raw: keyword.to_string(),
        method: HTTP_METHODS.contains(&upper.as_str()).then_some(upper),
        status: parse_status_range(keyword),
    }
}

/// `404` → 404..=404, `4-5` → 400..=599, `400-403` → 400..=403.
fn parse_status_range(keyword: &str) -> Option<(i32, i32)> {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if keyword.len() == 3 && all_digits(keyword) {
        let code = keyword.parse().ok()?;
        return Some((code, code));
    }
    let (low, high) = keyword.split_once('-')?;
    if !all_digits(low) || !all_digits(high) {
        return None;
    }
    let (low, high): (i32, i32) = match (low.len(), high.len()) {
        (1, 1) => (low.parse::<i32>().ok()? * 100, high.parse::<i32>().ok()? * 100 + 99),
        (3, 3) => (low.parse().ok()?, high.parse().ok()?),
        _ => return None,
    };
    (low <= high).then_some((low, high))
}

/// Accepts single addresses, comma lists, `a-b` IPv4 ranges and IPv4 CIDR
/// blocks, expanded into the set of matching addresses.
fn parse_ips(input: &str) -> Result<Vec<String>> {
    let mut ips = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((network, prefix)) = part.split_once('/') {
            let network = parse_v4(network)?;
            let prefix: u32 = prefix
                .trim()
                .parse()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| invalid_ip(part))?;
            let size = 1u64 << (32 - prefix);
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let start = u32::from(network) & mask;
            push_range(&mut ips, start as u64, start as u64 + size - 1)?;
        } else if let Some((from, to)) = part.split_once('-') {
            let (from, to) = (u32::from(parse_v4(from)?), u32::from(parse_v4(to)?));
            if from > to {
                return Err(invalid_ip(part));
            }
            push_range(&mut ips, from as u64, to as u64)?;
        } else {
            part.parse::<IpAddr>().map_err(|_| invalid_ip(part))?;
            ips.push(part.to_string());
        }
        if ips.len() as u64 > MAX_IP_RANGE {
            return Err(range_too_wide(input));
        }
    }
    if ips.is_empty() {
        return Err(invalid_ip(input));
    }
    Ok(ips)
}

fn push_range(ips: &mut Vec<String>, from: u64, to: u64) -> Result<()> {
    if to - from + 1 + ips.len() as u64 > MAX_IP_RANGE {
        return Err(LogStoreError::InvalidFilter(format!(
            "IP range {}-{} covers more than {MAX_IP_RANGE} addresses",
            Ipv4Addr::from(from as u32),
            Ipv4Addr::from(to as u32)
        )));
    }
    ips.extend((from..=to).map(|n| Ipv4Addr::from(n as u32).to_string()));
    Ok(())
}

fn parse_v4(text: &str) -> Result<Ipv4Addr> {
    text.trim().parse().map_err(|_| invalid_ip(text))
}

fn invalid_ip(text: &str) -> LogStoreError {
    LogStoreError::InvalidFilter(format!("invalid IP filter '{}'", text.trim()))
}

fn range_too_wide(text: &str) -> LogStoreError {
    LogStoreError::InvalidFilter(format!("IP filter '{text}' covers more than {MAX_IP_RANGE} addresses"))
}
