//! Request-scoped memoization with single-flight execution.
//!
//! A cache attached to a request's [`Context`] guarantees that a function
//! bound to a key executes at most once per request, that concurrent callers
//! share the in-flight result, and that one caller cancelling its wait does
//! not abort work other callers still need. The cache rides along inside the
//! context, so deeply nested code can memoize expensive calls (remote
//! lookups, aggregations, pricing computations) without a cache parameter
//! threaded through every call site.
//!
//! ```
//! use memoflight::{execute, with_cache, Context};
//!
//! # async fn scope() {
//! let (ctx, _destroy) = with_cache(&Context::background());
//!
//! let (outcome, extra) = execute(&ctx, PriceKey(42), |_ctx| async {
//!     fetch_price(42).await
//! })
//! .await;
//! # }
//! # #[derive(Debug, PartialEq, Eq, Hash)]
//! # struct PriceKey(u64);
//! # async fn fetch_price(_id: u64) -> Result<u64, std::io::Error> { Ok(100) }
//! ```
//!
//! Beyond the cache itself, the crate ships the context plumbing the cache
//! is built from, usable on its own:
//!
//! - [`Context::detach`] / [`Context::delegate`] recombine cancellation and
//!   values from different contexts;
//! - [`with_acyclic_breadcrumb`] detects cyclic execution along a logical
//!   call path;
//! - [`with_overwritten_variables`] carries per-request variable overrides.
//!
//! The cache lives and dies with one request: there is no persistence, no
//! expiration, and no eviction.

#![warn(missing_docs)]

pub mod breadcrumb;
pub mod caching;
pub mod context;
pub mod overwrite;

pub use breadcrumb::{with_acyclic_breadcrumb, BreadcrumbId};
pub use caching::{
    execute, execute_outcome, find_all_outcomes, find_outcomes, populate_cache, with_cache,
    with_concurrent_cache, CacheError, CacheValue, DestroyHandle, ExecutionKey, Extra, MemoizedFn,
    Outcome, SharedError, TypedOutcome,
};
pub use context::{CancelHandle, Context, ContextError};
pub use overwrite::{
    overwriting_storage, overwritten_value, with_overwritten_variables, OverwritingStorage,
    OverwrittenValue,
};
