//! Merging per-shard result lists into one ordered page

use std::cmp::Ordering;

use super::Direction;
use crate::record::AccessLogRecord;

/// Order two records by request id in the given direction.
fn compare(a: &AccessLogRecord, b: &AccessLogRecord, direction: Direction) -> Ordering {
    match direction {
        Direction::Forward => b.request_id.cmp(&a.request_id),
        Direction::Reverse => a.request_id.cmp(&b.request_id),
    }
}

/// Combine per-shard rows, sort them by request id (descending for forward,
/// ascending for reverse) and keep the first `size`.
///
/// The returned cursor is the request id of the last kept row in merge
/// order.
pub fn merge(per_shard: Vec<Vec<AccessLogRecord>>, size: usize, direction: Direction) -> (Vec<AccessLogRecord>, Option<String>) {
    let mut rows: Vec<AccessLogRecord> = per_shard.into_iter().flatten().collect();
    rows.sort_by(|a, b| compare(a, b, direction));
    rows.truncate(size);
    let cursor = rows.last().map(|r| r.request_id.clone());
    (rows, cursor)
}

/// Reverse pages are handed back in the opposite of merge order; the
/// cursor is unaffected.
pub fn present(mut rows: Vec<AccessLogRecord>, direction: Direction) -> Vec<AccessLogRecord> {
    if direction == Direction::Reverse {
        rows.reverse();
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[u64]) -> Vec<AccessLogRecord> {
        ids.iter()
            .map(|n| AccessLogRecord::new(format!("{}", 17040672000000000u64 + n), 1, 200))
            .collect()
    }

    fn ids(rows: &[AccessLogRecord]) -> Vec<String> {
        rows.iter().map(|r| r.request_id[13..].to_string()).collect()
    }

    #[test]
    fn forward_merge_is_descending_and_truncated() {
        let shards = vec![rows(&[9, 5, 1]), rows(&[8, 2]), vec![], rows(&[7])];
        let (merged, cursor) = merge(shards, 4, Direction::Forward);
        assert_eq!(ids(&merged), vec!["0009", "0008", "0007", "0005"]);
        assert_eq!(cursor.as_deref(), Some("17040672000000005"));
    }

    #[test]
    fn reverse_merge_is_exact_reverse_of_forward() {
        let shards = || vec![rows(&[9, 5, 1]), rows(&[8, 2]), rows(&[7, 3])];
        let (forward, _) = merge(shards(), usize::MAX, Direction::Forward);
        let (mut reverse, _) = merge(shards(), usize::MAX, Direction::Reverse);
        reverse.reverse();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn present_flips_reverse_pages_only() {
        let (page, cursor) = merge(vec![rows(&[3, 1, 2])], 2, Direction::Reverse);
        assert_eq!(cursor.as_deref(), Some("17040672000000002"));
        assert_eq!(ids(&present(page.clone(), Direction::Reverse)), vec!["0002", "0001"]);
        assert_eq!(ids(&present(page, Direction::Forward)), vec!["0001", "0002"]);
    }

    #[test]
    fn empty_input_has_no_cursor() {
        let (merged, cursor) = merge(vec![vec![], vec![]], 10, Direction::Forward);
        assert!(merged.is_empty());
        assert!(cursor.is_none());
    }
}
