//! Day-table schema definitions

/// Columns every day-table has had since the first schema version.
pub const BASE_COLUMNS: &[&str] = &[
    "serverId",
    "nodeId",
    "status",
    "createdAt",
    "content",
    "requestId",
    "firewallPolicyId",
    "firewallRuleGroupId",
    "firewallRuleSetId",
    "firewallRuleId",
];

/// Native projection of `content.remoteAddr`, added in a later schema version.
pub const REMOTE_ADDR_COLUMN: &str = "remoteAddr";

/// Native projection of `content.host`, added in a later schema version.
pub const DOMAIN_COLUMN: &str = "domain";

pub const LIST_TABLES: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'";

/// Current-schema DDL for one day-table.
///
/// Deliberately not `IF NOT EXISTS`: a concurrent creator must surface as
/// an "already exists" failure so the race is observable.
pub fn create_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serverId INTEGER NOT NULL DEFAULT 0,
    nodeId INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 0,
    createdAt INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    requestId TEXT NOT NULL,
    firewallPolicyId INTEGER NOT NULL DEFAULT 0,
    firewallRuleGroupId INTEGER NOT NULL DEFAULT 0,
    firewallRuleSetId INTEGER NOT NULL DEFAULT 0,
    firewallRuleId INTEGER NOT NULL DEFAULT 0,
    remoteAddr TEXT,
    domain TEXT
)
"#
    )
}

// === INDEXES ===

/// Index DDL for a day-table; projection indexes only where the column exists.
pub fn create_indexes(table: &str, has_remote_addr: bool, has_domain: bool) -> Vec<String> {
    let mut indexes = vec![
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_request_id ON {table}(requestId)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_server_request ON {table}(serverId, requestId)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_rule_group ON {table}(firewallRuleGroupId)"),
    ];
    if has_remote_addr {
        indexes.push(format!("CREATE INDEX IF NOT EXISTS idx_{table}_remote_addr ON {table}(remoteAddr)"));
    }
    if has_domain {
        indexes.push(format!("CREATE INDEX IF NOT EXISTS idx_{table}_domain ON {table}(domain)"));
    }
    indexes
}

pub fn table_info(table: &str) -> String {
    format!("PRAGMA table_info({table})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_carries_every_base_column() {
        let ddl = create_table("accessLogs_20240101");
        for column in BASE_COLUMNS.iter().chain([REMOTE_ADDR_COLUMN, DOMAIN_COLUMN].iter()) {
            assert!(ddl.contains(&format!("    {column} ")), "missing {column}");
        }
        assert!(!ddl.contains("IF NOT EXISTS"));
    }

    #[test]
    fn legacy_tables_skip_projection_indexes() {
        assert_eq!(create_indexes("t", false, false).len(), 3);
        let all = create_indexes("t", true, true);
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|ddl| ddl.contains("IF NOT EXISTS")));
    }
}
