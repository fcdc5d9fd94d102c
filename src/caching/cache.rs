use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;

use super::concurrent::ConcurrentCache;
use super::error::CacheError;
use super::key::{ExecutionKey, KeyKind};
use super::outcome::{Extra, MemoizedFn, Outcome};
use super::promise::{run_guarded, Promise};

/// A single-shard map from execution keys to promises.
///
/// The lock covers the destroy flag, map allocation, lookups, and inserts.
/// It is never held across the execution of a function or the wait on a
/// promise.
pub(crate) struct Cache {
    /// The context that initialized this cache; it is the cancellation
    /// source for every promise created here.
    root: Context,
    inner: Mutex<CacheState>,
}

struct CacheState {
    destroyed: bool,
    promises: Option<HashMap<ExecutionKey, Arc<Promise>>>,
}

impl Cache {
    pub(crate) fn new(root: Context) -> Self {
        Self {
            root,
            inner: Mutex::new(CacheState {
                destroyed: false,
                promises: Some(HashMap::new()),
            }),
        }
    }

    /// Clears existing items and marks the cache as destroyed. Subsequent
    /// executions fail with [`CacheError::Destroyed`]; in-flight work is not
    /// cancelled, that is the root context's job.
    pub(crate) fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        state.promises = None;
    }

    /// Installs pre-completed promises for the given entries, overwriting
    /// any promise already at the same key. No-op once destroyed.
    pub(crate) fn take(&self, entries: Vec<(ExecutionKey, Outcome)>) {
        let mut state = self.inner.lock();
        if state.destroyed {
            return;
        }

        let promises = state.promises.get_or_insert_with(HashMap::new);
        for (key, outcome) in entries {
            let promise = Promise::completed(key.kind(), outcome);
            promises.insert(key, promise);
        }
    }

    /// Runs `function` through the promise table: the first caller for a key
    /// starts the execution, every concurrent caller shares its outcome.
    pub(crate) async fn execute(
        &self,
        ctx: &Context,
        key: ExecutionKey,
        function: MemoizedFn,
    ) -> (Outcome, Extra) {
        let promise = match self.promise(key, function) {
            Ok(promise) => promise,
            Err(err) => return (Outcome::from_error(err), Extra::default()),
        };

        let outcome = Arc::clone(&promise).get(ctx).await;
        let extra = Extra {
            is_memoized: true,
            is_executed: promise.is_executed(),
        };

        (outcome, extra)
    }

    /// Resolves the promise for a key, creating and installing one with the
    /// given function if the key is new. Calls with the same key return the
    /// same promise; the function of a latecomer is dropped unused.
    fn promise(&self, key: ExecutionKey, function: MemoizedFn) -> Result<Arc<Promise>, CacheError> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(CacheError::Destroyed);
        }

        let promises = state.promises.get_or_insert_with(HashMap::new);
        let promise = promises
            .entry(key)
            .or_insert_with_key(|key| Promise::new(key.kind(), self.root.clone(), function));

        Ok(Arc::clone(promise))
    }

    /// Returns a snapshot of the installed promises, restricted to keys of
    /// the given kind, or all of them when `kind` is `None`. Returns `None`
    /// once destroyed.
    pub(crate) fn find_promises(
        &self,
        kind: Option<KeyKind>,
    ) -> Option<Vec<(ExecutionKey, Arc<Promise>)>> {
        let state = self.inner.lock();
        if state.destroyed {
            return None;
        }

        let promises = state.promises.as_ref()?;
        Some(
            promises
                .iter()
                .filter(|(_, promise)| kind.map_or(true, |kind| promise.key_kind() == kind))
                .map(|(key, promise)| (key.clone(), Arc::clone(promise)))
                .collect(),
        )
    }
}

/// The cache a context carries: a single shard, a sharded assembly, or the
/// disabled placeholder used when no cache was ever attached.
///
/// The disabled variant keeps call sites free of null checks: it executes
/// functions pass-through, without memoization, and ignores everything else.
#[derive(Clone)]
pub(crate) enum MemoCache {
    Single(Arc<Cache>),
    Sharded(Arc<ConcurrentCache>),
    Disabled,
}

impl MemoCache {
    pub(crate) async fn execute(
        &self,
        ctx: &Context,
        key: ExecutionKey,
        function: MemoizedFn,
    ) -> (Outcome, Extra) {
        match self {
            Self::Single(cache) => cache.execute(ctx, key, function).await,
            Self::Sharded(cache) => cache.execute(ctx, key, function).await,
            Self::Disabled => {
                let outcome = run_guarded(function, ctx.clone()).await;
                let extra = Extra {
                    is_memoized: false,
                    is_executed: true,
                };
                (outcome, extra)
            }
        }
    }

    pub(crate) fn take(&self, entries: Vec<(ExecutionKey, Outcome)>) {
        match self {
            Self::Single(cache) => cache.take(entries),
            Self::Sharded(cache) => cache.take(entries),
            Self::Disabled => {}
        }
    }

    pub(crate) fn find_promises(
        &self,
        kind: Option<KeyKind>,
    ) -> Option<Vec<(ExecutionKey, Arc<Promise>)>> {
        match self {
            Self::Single(cache) => cache.find_promises(kind),
            Self::Sharded(cache) => cache.find_promises(kind),
            Self::Disabled => None,
        }
    }

    pub(crate) fn destroy(&self) {
        match self {
            Self::Single(cache) => cache.destroy(),
            Self::Sharded(cache) => cache.destroy(),
            Self::Disabled => {}
        }
    }
}
