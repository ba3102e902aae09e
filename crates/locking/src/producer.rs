use std::future::Future;

use futures::future::BoxFuture;

/// The asynchronous function whose results are memoized and whose concurrent
/// invocations are coalesced.
///
/// This is implemented for every `Fn(A) -> impl Future<Output = Result<T, E>>`, so plain
/// async closures can be wrapped directly. Implement it by hand for types that carry
/// their own state, like clients or connection pools.
///
/// A failed invocation is rejected to every coalesced caller at once and the next call
/// starts a fresh invocation, so producers have to be safe to retry.
pub trait Producer<A>: Send + Sync + 'static {
    /// The value produced on success.
    type Output: Send + Sync + 'static;
    /// The error produced on failure.
    type Error: Send + Sync + 'static;

    /// Produces the value for `args`.
    fn produce(&self, args: A) -> BoxFuture<'static, Result<Self::Output, Self::Error>>;
}

impl<F, A, Fut, T, E> Producer<A> for F
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Output = T;
    type Error = E;

    fn produce(&self, args: A) -> BoxFuture<'static, Result<T, E>> {
        Box::pin(self(args))
    }
}
