use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::context::Context;

use super::cache::Cache;
use super::key::{ExecutionKey, KeyKind};
use super::outcome::{Extra, MemoizedFn, Outcome};
use super::promise::Promise;

/// The shard count used when the caller does not pick one.
const DEFAULT_CONCURRENCY_LEVEL: usize = 10;

/// A hash-routed assembly of independent cache shards.
///
/// Each shard has its own lock, so executions for keys landing on different
/// shards never contend with each other. Routing is deterministic: the same
/// key always reaches the same shard for the lifetime of the cache.
pub(crate) struct ConcurrentCache {
    shards: Vec<Cache>,
}

impl ConcurrentCache {
    pub(crate) fn new(root: Context, concurrency_level: usize) -> Self {
        let concurrency_level = if concurrency_level == 0 {
            DEFAULT_CONCURRENCY_LEVEL
        } else {
            concurrency_level
        };

        Self {
            shards: (0..concurrency_level)
                .map(|_| Cache::new(root.clone()))
                .collect(),
        }
    }

    fn shard(&self, key: &ExecutionKey) -> &Cache {
        &self.shards[self.shard_index(key)]
    }

    fn shard_index(&self, key: &ExecutionKey) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);

        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub(crate) async fn execute(
        &self,
        ctx: &Context,
        key: ExecutionKey,
        function: MemoizedFn,
    ) -> (Outcome, Extra) {
        self.shard(&key).execute(ctx, key, function).await
    }

    /// Partitions the entries by shard and installs each partition into the
    /// shard that owns it.
    pub(crate) fn take(&self, entries: Vec<(ExecutionKey, Outcome)>) {
        let mut partitions: Vec<Vec<(ExecutionKey, Outcome)>> =
            (0..self.shards.len()).map(|_| Vec::new()).collect();
        for (key, outcome) in entries {
            partitions[self.shard_index(&key)].push((key, outcome));
        }

        for (shard, partition) in self.shards.iter().zip(partitions) {
            if !partition.is_empty() {
                shard.take(partition);
            }
        }
    }

    /// Merges the matching promises of every shard.
    pub(crate) fn find_promises(
        &self,
        kind: Option<KeyKind>,
    ) -> Option<Vec<(ExecutionKey, Arc<Promise>)>> {
        let mut merged = Vec::new();
        for shard in &self.shards {
            merged.extend(shard.find_promises(kind)?);
        }

        Some(merged)
    }

    pub(crate) fn destroy(&self) {
        for shard in &self.shards {
            shard.destroy();
        }
    }
}
