//! Lookups answered by the rest of the control plane

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tenant and firewall metadata owned by the control plane's CRUD side.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Ids of every server owned by `user_id`.
    async fn server_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>>;

    /// Firewall rule-group ids belonging to the WAF category `code`.
    async fn rule_group_ids_for_category(&self, code: &str) -> Result<Vec<i64>>;
}

/// Geographic region of a client address.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    pub country: String,
    pub province: String,
    pub city: String,
}

impl Region {
    pub fn new(country: impl Into<String>, province: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            province: province.into(),
            city: city.into(),
        }
    }
}

/// Resolves a client address to a region; unknown addresses map to the
/// empty region.
pub trait RegionResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Region;
}

/// Directory backed by fixed lists, loaded from the `[directory]` config section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticDirectory {
    #[serde(default)]
    pub users: Vec<UserServers>,
    #[serde(default)]
    pub categories: Vec<CategoryRuleGroups>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserServers {
    pub user_id: i64,
    pub server_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRuleGroups {
    pub code: String,
    pub rule_group_ids: Vec<i64>,
}

impl StaticDirectory {
    pub fn with_user(mut self, user_id: i64, server_ids: Vec<i64>) -> Self {
        self.users.push(UserServers { user_id, server_ids });
        self
    }

    pub fn with_category(mut self, code: &str, rule_group_ids: Vec<i64>) -> Self {
        self.categories.push(CategoryRuleGroups {
            code: code.to_string(),
            rule_group_ids,
        });
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn server_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.user_id == user_id)
            .flat_map(|u| u.server_ids.iter().copied())
            .collect())
    }

    async fn rule_group_ids_for_category(&self, code: &str) -> Result<Vec<i64>> {
        Ok(self
            .categories
            .iter()
            .filter(|c| c.code == code)
            .flat_map(|c| c.rule_group_ids.iter().copied())
            .collect())
    }
}

/// Which servers a query or aggregation may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerScope {
    All,
    /// Only these servers; an empty list matches nothing.
    Servers(Vec<i64>),
}

impl ServerScope {
    /// Combine user and server scoping. A server outside the user's set
    /// yields an empty scope rather than an error.
    pub async fn resolve(directory: &dyn Directory, user_id: Option<i64>, server_id: Option<i64>) -> Result<Self> {
        let scope = match (user_id, server_id) {
            (Some(user_id), server_id) => {
                let mut owned = directory.server_ids_for_user(user_id).await?;
                if let Some(server_id) = server_id {
                    owned.retain(|id| *id == server_id);
                }
                owned.sort_unstable();
                owned.dedup();
                ServerScope::Servers(owned)
            }
            (None, Some(server_id)) => ServerScope::Servers(vec![server_id]),
            (None, None) => ServerScope::All,
        };
        Ok(scope)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ServerScope::Servers(ids) if ids.is_empty())
    }
}
