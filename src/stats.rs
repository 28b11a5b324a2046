//! Grouped counts across servers and shards, reduced into top-N rankings

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::db::{ShardConnection, Shards, TableCapability};
use crate::directory::{Directory, Region, RegionResolver, ServerScope};
use crate::error::{LogStoreError, Result, StoreError};
use crate::fanout::Fanout;
use crate::query::filter::{host_expr, remote_addr_expr, URI_EXPR};
use crate::record::LogDay;

/// WAF attack categories reported by [`AggregationEngine::waf_categories`].
pub const WAF_CATEGORIES: &[&str] = &[
    "sqlInjection",
    "xss",
    "fileUpload",
    "webShell",
    "commandInjection",
    "pathTraversal",
    "cc",
];

pub const DEFAULT_TOP: usize = 10;
pub const MAX_TOP: usize = 1000;
/// Longest day range accepted by [`AggregationEngine::daily_totals`].
pub const MAX_DAY_RANGE: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket<K> {
    pub key: K,
    pub count: i64,
}

/// Buckets merged across all servers in scope, and per server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranking<K> {
    pub global: Vec<Bucket<K>>,
    pub per_server: BTreeMap<i64, Vec<Bucket<K>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct IpRegion {
    pub ip: String,
    #[serde(flatten)]
    pub region: Region,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub access: i64,
    pub attack: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyTotals {
    pub day: String,
    #[serde(flatten)]
    pub totals: Totals,
}

/// Parameters shared by every aggregation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsQuery {
    /// Day as `YYYYMMDD`.
    pub day: String,
    pub user_id: Option<i64>,
    pub server_id: Option<i64>,
    pub top: Option<usize>,
    /// Only count requests that matched a firewall policy.
    pub attacks_only: bool,
}

impl StatsQuery {
    pub fn for_day(day: impl Into<String>) -> Self {
        Self {
            day: day.into(),
            ..Default::default()
        }
    }

    fn top(&self) -> usize {
        self.top.unwrap_or(DEFAULT_TOP).clamp(1, MAX_TOP)
    }
}

#[derive(Debug, Clone, Copy)]
enum Dimension {
    RemoteAddr,
    Host,
    Uri,
    Status,
    RuleGroup,
}

impl Dimension {
    fn expr(self, capability: TableCapability) -> &'static str {
        match self {
            Dimension::RemoteAddr => remote_addr_expr(capability),
            Dimension::Host => host_expr(capability),
            Dimension::Uri => URI_EXPR,
            Dimension::Status => "status",
            Dimension::RuleGroup => "firewallRuleGroupId",
        }
    }

    fn is_text(self) -> bool {
        matches!(self, Dimension::RemoteAddr | Dimension::Host | Dimension::Uri)
    }
}

#[derive(Debug, Clone)]
enum RowFilter {
    All,
    Attacks,
    RuleGroups(Vec<i64>),
}

/// One innermost unit of work: a shard, optionally narrowed to one server.
struct Target {
    server_id: Option<i64>,
    shard: ShardConnection,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_id {
            Some(server_id) => write!(f, "server#{}@{}", server_id, self.shard),
            None => write!(f, "{}", self.shard),
        }
    }
}

/// Partial count: (server id, group key, rows).
type Partial = (i64, String, i64);

pub struct AggregationEngine {
    shards: Shards,
    directory: Arc<dyn Directory>,
    resolver: Arc<dyn RegionResolver>,
    fanout: Fanout,
}

impl AggregationEngine {
    pub fn new(shards: Shards, directory: Arc<dyn Directory>, resolver: Arc<dyn RegionResolver>, fanout: Fanout) -> Self {
        Self {
            shards,
            directory,
            resolver,
            fanout,
        }
    }

    /// Busiest client addresses with their regions.
    pub async fn top_ips(&self, query: &StatsQuery) -> Result<Ranking<IpRegion>> {
        let partials = self
            .partials(query, Dimension::RemoteAddr, attack_filter(query))
            .await?;
        let keyed = partials.into_iter().map(|(server_id, ip, count)| {
            let region = self.resolver.resolve(&ip);
            (server_id, IpRegion { ip, region }, count)
        });
        Ok(rank(keyed, Some(query.top())))
    }

    /// Busiest regions, resolved from each grouped client address.
    pub async fn top_regions(&self, query: &StatsQuery) -> Result<Ranking<Region>> {
        let partials = self
            .partials(query, Dimension::RemoteAddr, attack_filter(query))
            .await?;
        let keyed = partials
            .into_iter()
            .map(|(server_id, ip, count)| (server_id, self.resolver.resolve(&ip), count));
        Ok(rank(keyed, Some(query.top())))
    }

    pub async fn top_attacked_hosts(&self, query: &StatsQuery) -> Result<Ranking<String>> {
        let partials = self.partials(query, Dimension::Host, RowFilter::Attacks).await?;
        Ok(rank(partials, Some(query.top())))
    }

    pub async fn top_attacked_uris(&self, query: &StatsQuery) -> Result<Ranking<String>> {
        let partials = self.partials(query, Dimension::Uri, RowFilter::Attacks).await?;
        Ok(rank(partials, Some(query.top())))
    }

    /// Full status-code histogram; never trimmed.
    pub async fn status_codes(&self, query: &StatsQuery) -> Result<Ranking<i32>> {
        let partials = self
            .partials(query, Dimension::Status, attack_filter(query))
            .await?;
        let keyed = partials
            .into_iter()
            .filter_map(|(server_id, status, count)| Some((server_id, status.parse::<i32>().ok()?, count)));
        Ok(rank(keyed, None))
    }

    /// Matching rows per WAF category. A rule group listed under several
    /// categories counts towards each of them.
    pub async fn waf_categories(&self, query: &StatsQuery) -> Result<Ranking<String>> {
        let groups = try_join_all(WAF_CATEGORIES.iter().map(|code| async move {
            self.directory
                .rule_group_ids_for_category(code)
                .await
                .map(|ids| (*code, ids))
        }))
        .await
        .map_err(LogStoreError::directory)?;

        let mut categories_by_group: BTreeMap<i64, Vec<&str>> = BTreeMap::new();
        for (code, ids) in groups {
            for id in ids {
                categories_by_group.entry(id).or_default().push(code);
            }
        }
        if categories_by_group.is_empty() {
            debug!("No WAF rule groups configured for any category");
            return Ok(rank(std::iter::empty::<(i64, String, i64)>(), None));
        }

        let ids = categories_by_group.keys().copied().collect();
        let partials = self
            .partials(query, Dimension::RuleGroup, RowFilter::RuleGroups(ids))
            .await?;
        let keyed = partials.into_iter().flat_map(|(server_id, group, count)| {
            let codes = group
                .parse::<i64>()
                .ok()
                .and_then(|id| categories_by_group.get(&id))
                .cloned()
                .unwrap_or_default();
            codes
                .into_iter()
                .map(move |code| (server_id, code.to_string(), count))
        });
        Ok(rank(keyed, None))
    }

    /// All requests and firewall-matched requests for one day.
    pub async fn totals(&self, query: &StatsQuery) -> Result<Totals> {
        let day = LogDay::parse(&query.day)?;
        let Some(targets) = self.targets(query).await? else {
            return Ok(Totals::default());
        };
        let partials = self
            .fanout
            .run("totals", targets, |target| self.count_totals(target, day))
            .await;
        Ok(partials.into_iter().fold(Totals::default(), |sum, part| Totals {
            access: sum.access + part.access,
            attack: sum.attack + part.attack,
        }))
    }

    /// Per-day totals for every day in `from..=to`.
    pub async fn daily_totals(&self, from: &str, to: &str, query: &StatsQuery) -> Result<Vec<DailyTotals>> {
        let (from, to) = (LogDay::parse(from)?, LogDay::parse(to)?);
        if from > to {
            return Err(LogStoreError::InvalidFilter(format!("day range {from}..{to} is inverted")));
        }
        let span = (to.date() - from.date()).num_days() as usize + 1;
        if span > MAX_DAY_RANGE {
            return Err(LogStoreError::InvalidFilter(format!(
                "day range spans {span} days, at most {MAX_DAY_RANGE} allowed"
            )));
        }

        let mut days = Vec::with_capacity(span);
        let mut day = Some(from);
        while let Some(current) = day.filter(|d| *d <= to) {
            let totals = self
                .totals(&StatsQuery {
                    day: current.to_string(),
                    ..query.clone()
                })
                .await?;
            days.push(DailyTotals {
                day: current.to_string(),
                totals,
            });
            day = current.succ();
        }
        Ok(days)
    }

    /// Resolve scoping into (server × shard) targets; `None` when the scope
    /// is empty.
    async fn targets(&self, query: &StatsQuery) -> Result<Option<Vec<Target>>> {
        let scope = ServerScope::resolve(self.directory.as_ref(), query.user_id, query.server_id)
            .await
            .map_err(LogStoreError::directory)?;
        if scope.is_empty() {
            return Ok(None);
        }
        let shards = self.shards.active();
        let targets = match scope {
            ServerScope::All => shards
                .into_iter()
                .map(|shard| Target { server_id: None, shard })
                .collect(),
            ServerScope::Servers(ids) => ids
                .iter()
                .flat_map(|server_id| {
                    shards.iter().map(move |shard| Target {
                        server_id: Some(*server_id),
                        shard: shard.clone(),
                    })
                })
                .collect(),
        };
        Ok(Some(targets))
    }

    async fn partials(&self, query: &StatsQuery, dimension: Dimension, filter: RowFilter) -> Result<Vec<Partial>> {
        let day = LogDay::parse(&query.day)?;
        let Some(targets) = self.targets(query).await? else {
            return Ok(Vec::new());
        };
        let results = self
            .fanout
            .run("aggregate", targets, |target| self.group_counts(target, day, dimension, &filter))
            .await;
        Ok(results.into_iter().flatten().collect())
    }

    async fn group_counts(&self, target: Target, day: LogDay, dimension: Dimension, filter: &RowFilter) -> Result<Vec<Partial>> {
        let Some((table, capability)) = self.shards.tables.lookup_table(&target.shard, day).await? else {
            return Ok(Vec::new());
        };
        let key = dimension.expr(capability);

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT serverId, CAST(");
        builder
            .push(key)
            .push(" AS TEXT) AS bucket, COUNT(*) AS hits FROM ")
            .push(&table)
            .push(" WHERE ")
            .push(key)
            .push(" IS NOT NULL");
        if dimension.is_text() {
            builder.push(" AND ").push(key).push(" != ''");
        }
        push_target_filter(&mut builder, &target, filter);
        builder.push(" GROUP BY serverId, bucket");

        let rows = match target.shard.fetch_all(&mut builder).await {
            Ok(rows) => rows,
            Err(StoreError::TableMissing) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<i64, _>("serverId")?,
                    row.try_get::<String, _>("bucket")?,
                    row.try_get::<i64, _>("hits")?,
                ))
            })
            .collect()
    }

    async fn count_totals(&self, target: Target, day: LogDay) -> Result<Totals> {
        let Some((table, _)) = self.shards.tables.lookup_table(&target.shard, day).await? else {
            return Ok(Totals::default());
        };
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS access, COALESCE(SUM(CASE WHEN firewallPolicyId > 0 THEN 1 ELSE 0 END), 0) AS attack FROM ",
        );
        builder.push(&table).push(" WHERE 1 = 1");
        push_target_filter(&mut builder, &target, &RowFilter::All);

        let rows = match target.shard.fetch_all(&mut builder).await {
            Ok(rows) => rows,
            Err(StoreError::TableMissing) => return Ok(Totals::default()),
            Err(e) => return Err(e.into()),
        };
        let Some(row) = rows.first() else {
            return Ok(Totals::default());
        };
        Ok(Totals {
            access: row.try_get("access")?,
            attack: row.try_get("attack")?,
        })
    }
}

fn attack_filter(query: &StatsQuery) -> RowFilter {
    if query.attacks_only {
        RowFilter::Attacks
    } else {
        RowFilter::All
    }
}

fn push_target_filter(builder: &mut QueryBuilder<'_, Sqlite>, target: &Target, filter: &RowFilter) {
    if let Some(server_id) = target.server_id {
        builder.push(" AND serverId = ").push_bind(server_id);
    }
    match filter {
        RowFilter::All => {}
        RowFilter::Attacks => {
            builder.push(" AND firewallPolicyId > 0");
        }
        RowFilter::RuleGroups(ids) => {
            builder.push(" AND firewallRuleGroupId IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            builder.push(")");
        }
    }
}

/// Sum partial counts per key, per server and globally, then order by count
/// descending with ties broken by key, keeping at most `top` buckets.
fn rank<K: Ord + Clone>(partials: impl IntoIterator<Item = (i64, K, i64)>, top: Option<usize>) -> Ranking<K> {
    let mut global: BTreeMap<K, i64> = BTreeMap::new();
    let mut per_server: BTreeMap<i64, BTreeMap<K, i64>> = BTreeMap::new();
    for (server_id, key, count) in partials {
        *global.entry(key.clone()).or_default() += count;
        *per_server.entry(server_id).or_default().entry(key).or_default() += count;
    }
    Ranking {
        global: ordered(global, top),
        per_server: per_server
            .into_iter()
            .map(|(server_id, counts)| (server_id, ordered(counts, top)))
            .collect(),
    }
}

fn ordered<K: Ord>(counts: BTreeMap<K, i64>, top: Option<usize>) -> Vec<Bucket<K>> {
    let mut buckets: Vec<Bucket<K>> = counts
        .into_iter()
        .map(|(key, count)| Bucket { key, count })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    if let Some(top) = top {
        buckets.truncate(top);
    }
    buckets
}
