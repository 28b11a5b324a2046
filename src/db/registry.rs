//! Registry of the shard connections currently accepting logs

use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use super::ShardConnection;

/// Active shards keyed by owning node id. Owned by the store instance.
#[derive(Default)]
pub struct ShardRegistry {
    shards: Mutex<HashMap<i64, ShardConnection>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the shard owned by `node_id`.
    pub fn register(&self, node_id: i64, connection: ShardConnection) {
        let replaced = self.lock().insert(node_id, connection).is_some();
        info!(node_id, replaced, "Shard registered");
    }

    pub fn unregister(&self, node_id: i64) -> Option<ShardConnection> {
        let removed = self.lock().remove(&node_id);
        if removed.is_some() {
            info!(node_id, "Shard unregistered");
        }
        removed
    }

    /// Snapshot of every registered shard, ordered by node id.
    pub fn list_all(&self) -> Vec<ShardConnection> {
        let mut shards: Vec<ShardConnection> = self.lock().values().cloned().collect();
        shards.sort_by_key(|shard| shard.node_id());
        shards
    }

    /// Any registered shard, or `None` when the registry is empty.
    pub fn pick_random(&self) -> Option<ShardConnection> {
        self.lock().values().choose(&mut rand::thread_rng()).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ShardConnection>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.shards.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
