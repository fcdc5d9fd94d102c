//! # Request-scoped memoization
//!
//! The cache attached by [`with_cache`] guarantees that a memoized function
//! bound to a key runs at most once per request, that concurrent callers
//! share the in-flight result, and that one caller bailing out does not
//! abort work still needed by the others.
//!
//! ## Lifecycle
//!
//! A handler attaches a cache near the top of a request:
//!
//! ```
//! # use memoflight::{with_cache, Context};
//! let (ctx, _destroy) = with_cache(&Context::background());
//! ```
//!
//! Nested code then calls [`execute`] with a key and a function. The first
//! caller for a key starts the function on a background worker; every
//! concurrent caller with the same key blocks on the same promise. The
//! worker runs under a delegated context: its cancellation signal comes from
//! the context the cache was created with, while value lookups go to the
//! caller that started it. Cancelling an individual caller's context only
//! abandons that caller's wait.
//!
//! When the returned [`DestroyHandle`] fires (explicitly or on drop), the
//! cache becomes terminal: later executions fail with
//! [`CacheError::Destroyed`], while work already in flight keeps running
//! until the root context says otherwise.
//!
//! ## Keys
//!
//! Keys are compared by value *and* dynamic type, so two packages hashing
//! the same strings into one request cache cannot collide as long as each
//! wraps its keys in its own type. Define a small key struct per call site
//! rather than passing bare strings.
//!
//! ## Warming
//!
//! [`populate_cache`] installs already-completed outcomes, which is how
//! handlers warm a request from a durable side store. A populated entry
//! wins over execution: functions for that key are never invoked and the
//! result reports `is_executed: false`.
//!
//! ## Harvesting
//!
//! [`find_outcomes`] collects the outcomes of every promise whose key type
//! matches, blocking until each resolves. This is useful at the end of a
//! request to flush computed values back out to a durable store.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

mod cache;
mod concurrent;
mod error;
mod key;
mod outcome;
mod promise;
#[cfg(test)]
mod tests;

pub use error::CacheError;
pub use key::ExecutionKey;
pub use outcome::{CacheValue, Extra, MemoizedFn, Outcome, SharedError, TypedOutcome};

use crate::context::Context;

use cache::{Cache, MemoCache};
use concurrent::ConcurrentCache;
use key::KeyKind;

/// Destroys the cache it was created together with.
///
/// Destroying is idempotent and also happens when the handle is dropped, so
/// a handler holding it for the duration of the request releases the cache
/// automatically on every exit path. Destroying does not cancel in-flight
/// executions; it only refuses new callers.
pub struct DestroyHandle {
    cache: MemoCache,
}

impl DestroyHandle {
    /// Marks the cache as destroyed and releases its promises.
    pub fn destroy(&self) {
        self.cache.destroy();
    }
}

impl Drop for DestroyHandle {
    fn drop(&mut self) {
        self.cache.destroy();
    }
}

impl fmt::Debug for DestroyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyHandle").finish_non_exhaustive()
    }
}

/// Derives a context carrying a fresh single-shard memoization cache.
///
/// The given context becomes the cache's root: cancelling it cancels every
/// execution started through the cache. The cache lives until the returned
/// [`DestroyHandle`] fires.
pub fn with_cache(ctx: &Context) -> (Context, DestroyHandle) {
    let cache = MemoCache::Single(Arc::new(Cache::new(ctx.clone())));
    attach(ctx, cache)
}

/// Derives a context carrying a sharded memoization cache.
///
/// `concurrency_level` is the number of independently locked shards; `0`
/// picks a default of 10. Keys are routed to shards by a deterministic hash,
/// so executions for unrelated keys proceed without contending.
pub fn with_concurrent_cache(ctx: &Context, concurrency_level: usize) -> (Context, DestroyHandle) {
    let cache = MemoCache::Sharded(Arc::new(ConcurrentCache::new(ctx.clone(), concurrency_level)));
    attach(ctx, cache)
}

fn attach(ctx: &Context, cache: MemoCache) -> (Context, DestroyHandle) {
    tracing::trace!("attaching request memoization cache");
    (ctx.with_value(cache.clone()), DestroyHandle { cache })
}

/// Looks for the cache stored in this context. If there is none, the
/// disabled placeholder is returned and nothing gets memoized.
fn extract_cache(ctx: &Context) -> MemoCache {
    ctx.value::<MemoCache>()
        .map(|cache| (*cache).clone())
        .unwrap_or(MemoCache::Disabled)
}

/// Executes `function` at most once per request for the given key.
///
/// Every concurrent and subsequent call with the same key receives the same
/// outcome. The function's success value must not depend on anything that is
/// not captured by the key, since only the first caller's function runs and
/// its result is served to all of them.
///
/// The outcome is viewed through the caller's expected value type `V`; a
/// stored value of a different type yields `None`. If the context carries no
/// cache, `function` runs directly and nothing is memoized.
pub async fn execute<K, V, E, F, Fut>(ctx: &Context, key: K, function: F) -> (TypedOutcome<V>, Extra)
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Any + Send + Sync,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    let function: MemoizedFn = Box::new(move |ctx| {
        Box::pin(async move {
            match function(ctx).await {
                Ok(value) => Outcome::from_value(value),
                Err(error) => Outcome::from_error(error),
            }
        })
    });

    let (outcome, extra) = extract_cache(ctx)
        .execute(ctx, ExecutionKey::new(key), function)
        .await;

    (outcome.typed(), extra)
}

/// Like [`execute`], for functions that produce a raw [`Outcome`].
///
/// This is the escape hatch for computations that legitimately return a
/// value and an error at the same time, or whose value type varies.
pub async fn execute_outcome<K, F, Fut>(ctx: &Context, key: K, function: F) -> (Outcome, Extra)
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    let function: MemoizedFn = Box::new(move |ctx| Box::pin(function(ctx)));

    extract_cache(ctx)
        .execute(ctx, ExecutionKey::new(key), function)
        .await
}

/// Installs already-completed outcomes into the cache attached to `ctx`.
///
/// Entries overwrite any promise already installed at the same key. Does
/// nothing if the context carries no cache or the cache was destroyed.
pub fn populate_cache<K>(ctx: &Context, entries: impl IntoIterator<Item = (K, Outcome)>)
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    let entries = entries
        .into_iter()
        .map(|(key, outcome)| (ExecutionKey::new(key), outcome))
        .collect();

    extract_cache(ctx).take(entries);
}

/// Collects the outcomes of all promises whose keys are of type `K`,
/// blocking until each one resolves.
///
/// Returns `None` if the context carries no cache, the cache was destroyed,
/// or `ctx` is cancelled before the collection completes.
pub async fn find_outcomes<K, V>(ctx: &Context) -> Option<HashMap<K, TypedOutcome<V>>>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Any + Send + Sync,
{
    let promises = extract_cache(ctx).find_promises(Some(KeyKind::of::<K>()))?;

    let mut outcomes = HashMap::with_capacity(promises.len());
    for (key, promise) in promises {
        let outcome = promise.get(ctx).await;
        if ctx.is_cancelled() {
            return None;
        }

        let key = key.downcast_ref::<K>()?.clone();
        outcomes.insert(key, outcome.typed());
    }

    Some(outcomes)
}

/// Collects the outcomes of every installed promise, regardless of key type.
///
/// Returns `None` under the same conditions as [`find_outcomes`].
pub async fn find_all_outcomes(ctx: &Context) -> Option<HashMap<ExecutionKey, Outcome>> {
    let promises = extract_cache(ctx).find_promises(None)?;

    let mut outcomes = HashMap::with_capacity(promises.len());
    for (key, promise) in promises {
        let outcome = promise.get(ctx).await;
        if ctx.is_cancelled() {
            return None;
        }

        outcomes.insert(key, outcome);
    }

    Some(outcomes)
}
