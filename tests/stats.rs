mod common;

use common::{legacy_shard, memory_shard, request_id, store_with, FakeResolver, Fixture, DAY};
use edge_accesslog::directory::{Region, StaticDirectory};
use edge_accesslog::record::AccessLogRecord;
use edge_accesslog::stats::{Bucket, IpRegion, StatsQuery, Totals};

fn hit(n: u32, server_id: i64, ip: &str, status: i32) -> AccessLogRecord {
    AccessLogRecord::new(request_id(n), server_id, status)
        .with_remote_addr(ip)
        .with_request("GET", "example.com", "/")
}

fn attack(n: u32, server_id: i64, ip: &str, status: i32, rule_group: i64, host: &str, uri: &str) -> AccessLogRecord {
    hit(n, server_id, ip, status)
        .with_request("GET", host, uri)
        .with_firewall(server_id, rule_group, 1, 1)
}

/// Eight requests over a legacy shard and two current ones; five are attacks.
async fn fixture() -> Fixture {
    let directory = StaticDirectory::default()
        .with_user(7, vec![1])
        .with_user(8, Vec::new())
        .with_category("xss", vec![5, 7])
        .with_category("sqlInjection", vec![6])
        .with_category("cc", vec![7]);
    let resolver = FakeResolver::default()
        .with("1.1.1.1", "AU", "Sydney")
        .with("2.2.2.2", "AU", "Sydney")
        .with("3.3.3.3", "US", "Austin");
    let fixture = store_with(
        vec![legacy_shard(1).await, memory_shard(2).await, memory_shard(3).await],
        directory,
        resolver,
    )
    .await;

    let records = vec![
        hit(1, 1, "1.1.1.1", 200),
        hit(2, 1, "1.1.1.1", 200),
        hit(3, 2, "1.1.1.1", 200),
        attack(4, 1, "2.2.2.2", 404, 5, "a.com", "/login"),
        attack(5, 1, "2.2.2.2", 404, 5, "a.com", "/login"),
        attack(6, 2, "3.3.3.3", 403, 6, "b.com", "/login"),
        attack(7, 2, "3.3.3.3", 403, 6, "b.com", "/wp-admin"),
        attack(8, 2, "4.4.4.4", 500, 7, "a.com", "/admin"),
    ];
    fixture.spread(&records, |i| i % 3).await;
    fixture
}

fn bucket<K>(key: K, count: i64) -> Bucket<K> {
    Bucket { key, count }
}

fn ip(ip: &str, country: &str, city: &str) -> IpRegion {
    IpRegion {
        ip: ip.to_string(),
        region: Region::new(country, "", city),
    }
}

#[tokio::test]
async fn top_ips_sum_across_shards_and_break_ties_by_key() {
    let fixture = fixture().await;
    let ranking = fixture
        .store
        .stats()
        .top_ips(&StatsQuery {
            top: Some(2),
            ..StatsQuery::for_day(DAY)
        })
        .await
        .unwrap();

    assert_eq!(
        ranking.global,
        vec![bucket(ip("1.1.1.1", "AU", "Sydney"), 3), bucket(ip("2.2.2.2", "AU", "Sydney"), 2)]
    );
    assert_eq!(
        ranking.per_server[&1],
        vec![bucket(ip("1.1.1.1", "AU", "Sydney"), 2), bucket(ip("2.2.2.2", "AU", "Sydney"), 2)]
    );
    assert_eq!(
        ranking.per_server[&2],
        vec![bucket(ip("3.3.3.3", "US", "Austin"), 2), bucket(ip("1.1.1.1", "AU", "Sydney"), 1)]
    );
}

#[tokio::test]
async fn attacks_only_ignores_clean_traffic() {
    let fixture = fixture().await;
    let ranking = fixture
        .store
        .stats()
        .top_ips(&StatsQuery {
            attacks_only: true,
            ..StatsQuery::for_day(DAY)
        })
        .await
        .unwrap();

    let ips: Vec<(&str, i64)> = ranking.global.iter().map(|b| (b.key.ip.as_str(), b.count)).collect();
    assert_eq!(ips, vec![("2.2.2.2", 2), ("3.3.3.3", 2), ("4.4.4.4", 1)]);
}

#[tokio::test]
async fn regions_group_addresses_by_resolved_location() {
    let fixture = fixture().await;
    let ranking = fixture.store.stats().top_regions(&StatsQuery::for_day(DAY)).await.unwrap();

    assert_eq!(
        ranking.global,
        vec![
            bucket(Region::new("AU", "", "Sydney"), 5),
            bucket(Region::new("US", "", "Austin"), 2),
            bucket(Region::default(), 1),
        ]
    );
}

#[tokio::test]
async fn attacked_hosts_and_uris() {
    let fixture = fixture().await;
    let stats = fixture.store.stats();
    let query = StatsQuery::for_day(DAY);

    let hosts = stats.top_attacked_hosts(&query).await.unwrap();
    assert_eq!(hosts.global, vec![bucket("a.com".to_string(), 3), bucket("b.com".to_string(), 2)]);

    let uris = stats.top_attacked_uris(&query).await.unwrap();
    assert_eq!(
        uris.global,
        vec![
            bucket("/login".to_string(), 3),
            bucket("/admin".to_string(), 1),
            bucket("/wp-admin".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn status_histogram_is_complete() {
    let fixture = fixture().await;
    let histogram = fixture
        .store
        .stats()
        .status_codes(&StatsQuery {
            top: Some(1),
            ..StatsQuery::for_day(DAY)
        })
        .await
        .unwrap();

    assert_eq!(
        histogram.global,
        vec![bucket(200, 3), bucket(403, 2), bucket(404, 2), bucket(500, 1)]
    );
}

#[tokio::test]
async fn waf_categories_count_each_listed_group() {
    let fixture = fixture().await;
    let categories = fixture.store.stats().waf_categories(&StatsQuery::for_day(DAY)).await.unwrap();

    assert_eq!(
        categories.global,
        vec![
            bucket("xss".to_string(), 3),
            bucket("sqlInjection".to_string(), 2),
            bucket("cc".to_string(), 1),
        ]
    );
    assert_eq!(categories.per_server[&1], vec![bucket("xss".to_string(), 2)]);
}

#[tokio::test]
async fn totals_respect_user_scope() {
    let fixture = fixture().await;
    let stats = fixture.store.stats();

    let all = stats.totals(&StatsQuery::for_day(DAY)).await.unwrap();
    assert_eq!(all, Totals { access: 8, attack: 5 });

    let user = stats
        .totals(&StatsQuery {
            user_id: Some(7),
            ..StatsQuery::for_day(DAY)
        })
        .await
        .unwrap();
    assert_eq!(user, Totals { access: 4, attack: 2 });

    let nobody = stats
        .totals(&StatsQuery {
            user_id: Some(8),
            ..StatsQuery::for_day(DAY)
        })
        .await
        .unwrap();
    assert_eq!(nobody, Totals::default());
}

#[tokio::test]
async fn daily_totals_cover_every_day_in_range() {
    let fixture = fixture().await;
    let stats = fixture.store.stats();
    let query = StatsQuery::default();

    let days = stats.daily_totals("20240101", "20240103", &query).await.unwrap();
    let summary: Vec<(&str, i64, i64)> = days
        .iter()
        .map(|d| (d.day.as_str(), d.totals.access, d.totals.attack))
        .collect();
    assert_eq!(
        summary,
        vec![("20240101", 8, 5), ("20240102", 0, 0), ("20240103", 0, 0)]
    );

    assert!(stats.daily_totals("20240103", "20240101", &query).await.is_err());
    assert!(stats.daily_totals("20240101", "20240301", &query).await.is_err());
}
