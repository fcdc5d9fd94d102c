//! Request contexts carrying cancellation, deadlines, and typed values.
//!
//! A [`Context`] is a cheaply clonable, immutable handle. Deriving a new
//! context (via [`Context::with_value`], [`Context::with_cancellation`],
//! [`Context::detach`], ...) never mutates the original; values live in an
//! immutable parent-linked chain and cancellation is backed by
//! [`CancellationToken`]s, so a derived context can be handed to any number
//! of concurrent tasks.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The reason a [`Context`] stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context (or one of its ancestors) was explicitly cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A request-scoped context.
///
/// Carries three independent concerns:
///
/// - a cancellation signal, propagated from parent to child;
/// - an optional deadline, observed lazily (no timer task is spawned);
/// - a chain of type-keyed values, nearest attachment wins.
///
/// [`Context::detach`] and [`Context::delegate`] recombine these concerns:
/// the former strips cancellation while keeping values, the latter sources
/// cancellation and values from two different contexts.
#[derive(Clone)]
pub struct Context {
    cancel: CancelSignal,
    deadline: Option<Instant>,
    values: Option<Arc<ValueNode>>,
}

#[derive(Clone)]
enum CancelSignal {
    /// Never signals cancellation. Used by background and detached contexts.
    Never,
    Token(CancellationToken),
}

struct ValueNode {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueNode>>,
}

/// Cancels the [`Context`] it was created together with.
///
/// Cancelling is idempotent and also reaches every context derived from the
/// cancelled one.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Signals cancellation to the associated context and its descendants.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Context {
    /// Returns an empty root context: never cancelled, no deadline, no values.
    pub fn background() -> Self {
        Self {
            cancel: CancelSignal::Never,
            deadline: None,
            values: None,
        }
    }

    /// Derives a cancellable child context.
    ///
    /// Cancelling the parent cancels the child as well; cancelling the child
    /// leaves the parent untouched.
    pub fn with_cancellation(&self) -> (Self, CancelHandle) {
        let token = match &self.cancel {
            CancelSignal::Never => CancellationToken::new(),
            CancelSignal::Token(token) => token.child_token(),
        };

        let ctx = Self {
            cancel: CancelSignal::Token(token.clone()),
            ..self.clone()
        };

        (ctx, CancelHandle { token })
    }

    /// Derives a child context that expires at `deadline`.
    ///
    /// If the parent already has an earlier deadline, the earlier one wins.
    /// The deadline is checked lazily by [`Context::error`] and
    /// [`Context::cancelled`]; no background timer is spawned.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        let (mut ctx, handle) = self.with_cancellation();
        ctx.deadline = Some(match ctx.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });

        (ctx, handle)
    }

    /// Derives a child context that expires after `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context with `value` attached under its type.
    ///
    /// A later attachment of the same type shadows an earlier one.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let node = ValueNode {
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
            parent: self.values.clone(),
        };

        Self {
            values: Some(Arc::new(node)),
            ..self.clone()
        }
    }

    /// Looks up the nearest attached value of type `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut current = self.values.as_ref();
        while let Some(node) = current {
            if node.type_id == TypeId::of::<T>() {
                return Arc::clone(&node.value).downcast::<T>().ok();
            }
            current = node.parent.as_ref();
        }

        None
    }

    /// Returns a context that keeps all values of `self` but detaches from
    /// its cancellation signal and deadline.
    ///
    /// The returned context never reports an error, which lets background
    /// work outlive the caller that started it.
    pub fn detach(&self) -> Self {
        Self {
            cancel: CancelSignal::Never,
            deadline: None,
            values: self.values.clone(),
        }
    }

    /// Returns a context that takes its cancellation signal and deadline from
    /// `cancel_ctx` while delegating all value lookups to `value_ctx`.
    pub fn delegate(cancel_ctx: &Context, value_ctx: &Context) -> Self {
        Self {
            cancel: cancel_ctx.cancel.clone(),
            deadline: cancel_ctx.deadline,
            values: value_ctx.values.clone(),
        }
    }

    /// The instant at which this context expires, if it has a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context has been cancelled or has passed its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }

    /// Returns the reason this context is no longer valid, or `None` while it
    /// still is.
    pub fn error(&self) -> Option<ContextError> {
        if let CancelSignal::Token(token) = &self.cancel {
            if token.is_cancelled() {
                return Some(ContextError::Cancelled);
            }
        }

        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(ContextError::DeadlineExceeded);
        }

        None
    }

    /// Completes when this context is cancelled or its deadline passes.
    ///
    /// Never completes for contexts without a cancellation source, such as
    /// [`Context::background`] or detached contexts.
    pub async fn cancelled(&self) {
        let token_cancelled = async {
            match &self.cancel {
                CancelSignal::Token(token) => token.cancelled().await,
                CancelSignal::Never => pending().await,
            }
        };
        let deadline_passed = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending().await,
            }
        };

        tokio::select! {
            () = token_cancelled => {}
            () = deadline_passed => {}
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancellable", &matches!(self.cancel, CancelSignal::Token(_)))
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
