use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::LockingError;
use crate::key::CacheKey;

/// What a caller eventually receives.
pub type Outcome<T, E> = Result<Arc<T>, LockingError<E>>;

type Callback<T, E> = Box<dyn FnOnce(Outcome<T, E>) + Send + 'static>;

/// One caller's pending completion.
///
/// Completing a waiter consumes it, so it can never be resolved twice.
pub(crate) enum Waiter<T, E> {
    /// The caller awaits a [`Pending`] future.
    Channel(oneshot::Sender<Outcome<T, E>>),
    /// The caller passed a completion callback.
    Callback(Callback<T, E>),
}

impl<T, E> Waiter<T, E> {
    /// Creates a waiter together with the future that observes its completion.
    pub fn channel() -> (Self, Pending<T, E>) {
        let (sender, receiver) = oneshot::channel();
        (Self::Channel(sender), Pending { receiver })
    }

    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce(Outcome<T, E>) + Send + 'static,
    {
        Self::Callback(Box::new(callback))
    }

    pub fn complete(self, outcome: Outcome<T, E>) {
        match self {
            // The caller may have dropped its `Pending`, nobody is interested then.
            Self::Channel(sender) => {
                let _ = sender.send(outcome);
            }
            Self::Callback(callback) => callback(outcome),
        }
    }
}

/// Completes waiters in order.
///
/// Waiters that are still queued when this is dropped are rejected with
/// [`LockingError::Interrupted`], so a panicking callback does not strand the callers
/// behind it.
struct Completion<T, E> {
    waiters: std::vec::IntoIter<Waiter<T, E>>,
}

impl<T, E> Completion<T, E> {
    fn new(waiters: Vec<Waiter<T, E>>) -> Self {
        Self {
            waiters: waiters.into_iter(),
        }
    }

    fn complete_with(mut self, outcome: impl Fn() -> Outcome<T, E>) {
        while let Some(waiter) = self.waiters.next() {
            waiter.complete(outcome());
        }
    }
}

impl<T, E> Drop for Completion<T, E> {
    fn drop(&mut self) {
        for waiter in self.waiters.by_ref() {
            waiter.complete(Err(LockingError::Interrupted));
        }
    }
}

/// Resolves all `waiters` in order with the same shared `value`.
pub(crate) fn resolve_all<T, E>(waiters: Vec<Waiter<T, E>>, value: &Arc<T>) {
    Completion::new(waiters).complete_with(|| Ok(Arc::clone(value)));
}

/// Rejects all `waiters` in order with the same shared producer `err`.
pub(crate) fn reject_all<T, E>(waiters: Vec<Waiter<T, E>>, err: &Arc<E>) {
    Completion::new(waiters).complete_with(|| Err(LockingError::Producer(Arc::clone(err))));
}

/// Rejects all `waiters` with the error produced by `err`.
pub(crate) fn fail_all<T, E>(waiters: Vec<Waiter<T, E>>, err: impl Fn() -> LockingError<E>) {
    Completion::new(waiters).complete_with(|| Err(err()));
}

/// Rejects all `waiters` because their producer invocation went away.
pub(crate) fn interrupt_all<T, E>(waiters: Vec<Waiter<T, E>>) {
    drop(Completion::new(waiters));
}

/// How a waiter was added to the [`WaiterRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// No invocation was outstanding for the key; the caller has to start one.
    First,
    /// The waiter was queued behind an outstanding invocation.
    Queued,
}

/// The set of keys with an outstanding producer invocation, and who is waiting on them.
///
/// A key is present as long as it has at least one waiter.
pub(crate) struct WaiterRegistry<T, E> {
    waiters: HashMap<CacheKey, Vec<Waiter<T, E>>>,
}

impl<T, E> Default for WaiterRegistry<T, E> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }
}

impl<T, E> WaiterRegistry<T, E> {
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.waiters.contains_key(key)
    }

    pub fn register(&mut self, key: CacheKey, waiter: Waiter<T, E>) -> Registration {
        match self.waiters.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(waiter);
                Registration::Queued
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![waiter]);
                Registration::First
            }
        }
    }

    /// Removes `key`, handing out its waiters in registration order.
    pub fn take(&mut self, key: &CacheKey) -> Vec<Waiter<T, E>> {
        self.waiters.remove(key).unwrap_or_default()
    }

    /// Number of keys with an outstanding invocation.
    pub fn in_flight(&self) -> usize {
        self.waiters.len()
    }

    /// Total number of queued waiters across all keys.
    pub fn active(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

/// A call that has been looked up and registered, waiting for its outcome.
///
/// Returned by [`Locking::get`](crate::Locking::get). Dropping it does not cancel the
/// producer invocation, other callers may still be waiting for it.
#[must_use = "the outcome of the call is only observed by awaiting it"]
pub struct Pending<T, E> {
    receiver: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> Future for Pending<T, E> {
    type Output = Outcome<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(LockingError::Interrupted)))
    }
}
