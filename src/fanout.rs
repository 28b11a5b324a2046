//! Bounded parallel dispatch of per-shard work

use futures::stream::{self, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::FanoutConfig;
use crate::error::Result;

/// Runs one task per shard (or per server×shard pair) with a concurrency cap
/// and a per-task deadline, then waits for all of them.
#[derive(Debug, Clone, Copy)]
pub struct Fanout {
    max_concurrency: usize,
    shard_timeout: Duration,
}

impl Fanout {
    pub fn new(config: &FanoutConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            shard_timeout: Duration::from_millis(config.shard_timeout_ms),
        }
    }

    /// Results of every task that finished in time without error. Failed and
    /// timed-out targets are logged and contribute nothing.
    pub async fn run<I, T, F, Fut>(&self, operation: &'static str, targets: Vec<I>, task: F) -> Vec<T>
    where
        I: Display,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.shard_timeout;
        stream::iter(targets)
            .map(|target| {
                let label = target.to_string();
                let work = task(target);
                async move { (label, tokio::time::timeout(timeout, work).await) }
            })
            .buffer_unordered(self.max_concurrency)
            .filter_map(|(label, outcome)| async move {
                match outcome {
                    Ok(Ok(value)) => Some(value),
                    Ok(Err(e)) => {
                        warn!(target = %label, operation, error = %e, "Shard task failed, skipping its contribution");
                        None
                    }
                    Err(_) => {
                        warn!(target = %label, operation, timeout_ms = timeout.as_millis() as u64, "Shard task timed out, skipping its contribution");
                        None
                    }
                }
            })
            .collect()
            .await
    }
}
