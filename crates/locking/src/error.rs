use std::sync::Arc;

use thiserror::Error;

/// The call arguments could not be turned into a [`CacheKey`](crate::CacheKey).
///
/// This only affects the single call that supplied the arguments, it is never
/// shared with other callers.
#[derive(Debug, Error)]
#[error("failed to derive cache key: {0}")]
pub struct KeyDerivationError(#[from] serde_json::Error);

/// An invalid [`LockingConfig`](crate::LockingConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The store needs room for at least one entry.
    #[error("max_entries must be greater than zero")]
    ZeroCapacity,
    /// A configured freshness window must not be empty.
    #[error("time_to_live must be greater than zero")]
    ZeroTimeToLive,
}

/// The outcome of a failed call to a [`Locking`](crate::Locking) orchestrator.
#[derive(Debug, Error)]
pub enum LockingError<E> {
    /// The arguments of this call could not be serialized into a key.
    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),
    /// The producer failed.
    ///
    /// Every caller that was coalesced onto the failing invocation receives the
    /// very same error instance.
    #[error("producer failed: {0}")]
    Producer(Arc<E>),
    /// The producer invocation went away without settling, for example because it
    /// panicked or the runtime shut down.
    #[error("producer invocation was interrupted")]
    Interrupted,
    /// The producer could not be invoked because the call was made outside of a
    /// Tokio runtime.
    #[error("no Tokio runtime to run the producer invocation on")]
    NoRuntime,
}

impl<E> LockingError<E> {
    /// Returns the producer error, if this is a [`Producer`](Self::Producer) failure.
    pub fn producer_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }
}
