use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Instrument;

use crate::context::{Context, ContextError};

use super::error::CacheError;
use super::key::KeyKind;
use super::outcome::{MemoizedFn, Outcome};

/// The promise has been created but its function has not started yet.
const CREATED: u8 = 0;
/// The function has been handed to an executor worker.
const EXECUTED: u8 = 1;
/// The outcome was pre-populated; no function ever existed.
const POPULATED: u8 = 2;

/// The future result of one memoized computation.
///
/// All calls to [`Promise::get`] on a given promise resolve to the same
/// [`Outcome`], and the underlying function runs to completion at most once,
/// regardless of how many waiters join or bail out along the way.
pub(crate) struct Promise {
    key_kind: KeyKind,
    /// The context that was used to initialize the cache. It provides the
    /// cancellation signal for the execution; pre-populated promises have
    /// none.
    root: Option<Context>,
    /// Set when execution starts so that the function does not run twice.
    state: AtomicU8,
    /// Taken by the executor exactly once, freeing the closure and all of
    /// its captures as soon as the outcome exists.
    function: Mutex<Option<MemoizedFn>>,
    /// Written exactly once, before the done signal fires.
    outcome: OnceLock<Outcome>,
    /// Flips to `true` when execution completes, waking concurrent waiters.
    done: watch::Sender<bool>,
}

impl Promise {
    /// Creates a promise for the future result of calling `function`.
    pub(crate) fn new(key_kind: KeyKind, root: Context, function: MemoizedFn) -> Arc<Self> {
        let (done, _) = watch::channel(false);

        Arc::new(Self {
            key_kind,
            root: Some(root),
            state: AtomicU8::new(CREATED),
            function: Mutex::new(Some(function)),
            outcome: OnceLock::new(),
            done,
        })
    }

    /// Creates a promise that has already completed with the given outcome.
    pub(crate) fn completed(key_kind: KeyKind, outcome: Outcome) -> Arc<Self> {
        let (done, _) = watch::channel(true);
        let cell = OnceLock::new();
        let _ = cell.set(outcome);

        Arc::new(Self {
            key_kind,
            root: None,
            state: AtomicU8::new(POPULATED),
            function: Mutex::new(None),
            outcome: cell,
            done,
        })
    }

    pub(crate) fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    /// Whether this promise has resolved by actually running its function,
    /// as opposed to being pre-populated.
    pub(crate) fn is_executed(&self) -> bool {
        *self.done.borrow() && self.state.load(Ordering::Acquire) == EXECUTED
    }

    /// Returns the outcome of this promise, starting the computation if it
    /// has not started yet.
    ///
    /// If `ctx` is cancelled the call returns the context's error without
    /// affecting other waiters or the running computation.
    pub(crate) async fn get(self: Arc<Self>, ctx: &Context) -> Outcome {
        if let Some(err) = ctx.error() {
            return Outcome::from_error(err);
        }

        if self
            .state
            .compare_exchange(CREATED, EXECUTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Self::start(&self, ctx);
        }

        self.wait(ctx).await
    }

    /// Spawns the executor worker. Called by exactly one waiter, the one
    /// that won the `CREATED -> EXECUTED` transition.
    fn start(this: &Arc<Self>, caller: &Context) {
        let Some(root) = &this.root else { return };
        let Some(function) = this.function.lock().take() else {
            return;
        };

        // One waiter bailing out must not cancel an execution that is still
        // meaningful to the others, so the worker runs under the cache's
        // root context for cancellation while value lookups keep going to
        // the caller that started it.
        let ctx = Context::delegate(root, caller);

        let this = Arc::clone(this);
        let span = tracing::trace_span!("promise_run", key_type = this.key_kind.type_name());
        tokio::spawn(
            async move {
                let outcome = run_guarded(function, ctx).await;

                let _ = this.outcome.set(outcome);
                this.done.send_replace(true);
            }
            .instrument(span),
        );
    }

    /// Waits for the outcome to be published, or for `ctx` to be cancelled.
    async fn wait(&self, ctx: &Context) -> Outcome {
        let mut done = self.done.subscribe();

        tokio::select! {
            biased;
            _ = done.wait_for(|finished| *finished) => self
                .outcome
                .get()
                .cloned()
                .expect("outcome is published before the done signal fires"),
            () = ctx.cancelled() => {
                Outcome::from_error(ctx.error().unwrap_or(ContextError::Cancelled))
            }
        }
    }
}

/// Runs a memoized function, converting a panic into a structured outcome so
/// that clients can handle it like any other error.
pub(super) async fn run_guarded(function: MemoizedFn, ctx: Context) -> Outcome {
    match AssertUnwindSafe(function(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            let backtrace = Backtrace::force_capture().to_string();
            tracing::error!(message = %message, "recovered panic in memoized function");

            Outcome::from_error(CacheError::Panicked { message, backtrace })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
