use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;

/// The value half of an [`Outcome`]: an opaque, shareable payload.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// The error half of an [`Outcome`], clonable to every waiter.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A memoized function, type-erased for storage inside a promise.
pub type MemoizedFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, Outcome> + Send + 'static>;

/// The outcome of executing a memoized function.
///
/// Value and error are independent: a prepopulated entry may carry both, the
/// way a fallible lookup can return a partial result alongside the error that
/// truncated it. Outcomes are immutable once published and shared between all
/// waiters of the same promise.
#[derive(Clone, Default)]
pub struct Outcome {
    /// The computed value, if any.
    pub value: Option<CacheValue>,
    /// The error the computation surfaced, if any.
    pub error: Option<SharedError>,
}

impl Outcome {
    /// An outcome carrying only a value.
    pub fn from_value<V: Any + Send + Sync>(value: V) -> Self {
        Self {
            value: Some(Arc::new(value)),
            error: None,
        }
    }

    /// An outcome carrying only an error.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            value: None,
            error: Some(Arc::new(error)),
        }
    }

    /// Attaches an error, keeping the value.
    pub fn with_error<E>(mut self, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(error));
        self
    }

    /// The value downcast to `V`, or `None` if it is absent or of a
    /// different type.
    pub fn value_as<V: Any + Send + Sync>(&self) -> Option<Arc<V>> {
        Arc::clone(self.value.as_ref()?).downcast::<V>().ok()
    }

    /// Converts into a caller-typed view.
    pub fn typed<V: Any + Send + Sync>(self) -> TypedOutcome<V> {
        TypedOutcome {
            value: self.value.and_then(|value| value.downcast::<V>().ok()),
            error: self.error,
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("has_value", &self.value.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// An [`Outcome`] viewed through the caller's expected value type.
///
/// A stored value whose dynamic type is not `V` shows up as `None`.
pub struct TypedOutcome<V> {
    /// The computed value, if present and of type `V`.
    pub value: Option<Arc<V>>,
    /// The error the computation surfaced, if any.
    pub error: Option<SharedError>,
}

impl<V> Clone for TypedOutcome<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for TypedOutcome<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedOutcome")
            .field("value", &self.value)
            .field("error", &self.error)
            .finish()
    }
}

/// Additional details about how an outcome was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extra {
    /// Whether the outcome was served from (or through) the promise table.
    pub is_memoized: bool,
    /// Whether the outcome came from actually invoking the function, as
    /// opposed to being pre-populated into the cache.
    pub is_executed: bool,
}
