use thiserror::Error;

/// Errors produced by the memoization cache itself.
///
/// Errors returned by memoized functions travel through
/// [`Outcome::error`](super::Outcome::error) untouched; this enum only covers
/// the failures the engine can add on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache was already destroyed and cannot be used anymore.
    #[error("cache already destroyed, cannot be used anymore")]
    Destroyed,
    /// A memoized function panicked; the panic was contained and converted.
    #[error("panic executing memoized function: {message}")]
    Panicked {
        /// The panic payload, rendered as a string.
        message: String,
        /// The backtrace captured when the panic was recovered.
        backtrace: String,
    },
}
