use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::LockingConfig;
use crate::error::{ConfigurationError, LockingError};
use crate::key::CacheKey;
use crate::producer::Producer;
use crate::stats::{Gauges, Stats, StatsSnapshot};
use crate::store::{Lookup, ResultStore};
use crate::waiters::{
    Outcome, Pending, Registration, Waiter, WaiterRegistry, fail_all, interrupt_all, reject_all,
    resolve_all,
};

/// Wraps a [`Producer`] with bounded, time-limited memoization and request coalescing.
///
/// Every call derives a [`CacheKey`] from its arguments and then:
///
/// - returns a fresh stored value right away,
/// - with [`allow_stale`](LockingConfig::allow_stale), returns a stale stored value right
///   away and refreshes it in the background, at most once per key at a time,
/// - queues behind an outstanding producer invocation for the same key, or
/// - registers as the first waiter and invokes the producer.
///
/// Once the producer settles, a success is stored and handed to every queued caller in
/// the order they arrived. A failure is never stored; it is handed to every queued caller
/// and the next call for that key invokes the producer anew.
///
/// The orchestrator is cheap to clone, all clones share the same store and waiters.
pub struct Locking<A, P: Producer<A>> {
    inner: Arc<Inner<A, P>>,
}

struct Inner<A, P: Producer<A>> {
    config: LockingConfig,
    producer: Arc<P>,
    store: ResultStore<P::Output>,
    /// Waiters and running refreshes, guarded together with store lookups and writes.
    flights: Mutex<Flights<P::Output, P::Error>>,
    stats: Stats,
    _args: PhantomData<fn(A)>,
}

impl<A, P: Producer<A>> Inner<A, P> {
    fn flights(&self) -> MutexGuard<'_, Flights<P::Output, P::Error>> {
        // Waiters are only ever completed outside of the lock, so a poisoned lock still
        // holds consistent state.
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Ends the flight of `kind` for `key`, returning whoever waits for it.
    ///
    /// A produced `value` is stored in the same critical section, so a new caller
    /// either finds the value or joins the flight, never neither.
    fn finish_flight(
        &self,
        key: &CacheKey,
        kind: FlightKind,
        value: Option<&Arc<P::Output>>,
    ) -> Vec<Waiter<P::Output, P::Error>> {
        let (waiters, in_flight) = {
            let mut flights = self.flights();
            if let Some(value) = value {
                self.store.set(key.clone(), Arc::clone(value));
            }
            let waiters = flights.finish(key, kind);
            (waiters, flights.waiters.in_flight())
        };
        metric!(gauge("locking.in_flight") = in_flight as u64, "cache" => self.name());
        waiters
    }
}

struct Flights<T, E> {
    /// Callers waiting on an outstanding producer invocation, per key.
    waiters: WaiterRegistry<T, E>,
    /// Keys with a running background refresh.
    refreshes: HashSet<CacheKey>,
}

impl<T, E> Default for Flights<T, E> {
    fn default() -> Self {
        Self {
            waiters: WaiterRegistry::default(),
            refreshes: HashSet::new(),
        }
    }
}

impl<T, E> Flights<T, E> {
    /// Ends the invocation of `kind` for `key`, returning whoever waits for it.
    fn finish(&mut self, key: &CacheKey, kind: FlightKind) -> Vec<Waiter<T, E>> {
        match kind {
            FlightKind::Waiters => self.waiters.take(key),
            FlightKind::Refresh => {
                self.refreshes.remove(key);
                Vec::new()
            }
        }
    }
}

/// Who a producer invocation is run for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    /// Callers are queued in the [`WaiterRegistry`].
    Waiters,
    /// Nobody waits, the invocation only updates the store.
    Refresh,
}

impl<A, P: Producer<A>> Clone for Locking<A, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, P: Producer<A>> fmt::Debug for Locking<A, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (in_flight, refreshes) = self
            .inner
            .flights
            .try_lock()
            .map(|flights| (flights.waiters.in_flight(), flights.refreshes.len()))
            .unwrap_or_default();
        f.debug_struct("Locking")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("in-flight keys", &in_flight)
            .field("running refreshes", &refreshes)
            .finish()
    }
}

impl<A, P> Locking<A, P>
where
    A: Serialize + 'static,
    P: Producer<A>,
{
    /// Wraps `producer` according to `config`.
    pub fn new(producer: P, config: LockingConfig) -> Result<Self, ConfigurationError> {
        Self::with_producer(Arc::new(producer), config)
    }

    /// Wraps a shared `producer` according to `config`.
    pub fn with_producer(
        producer: Arc<P>,
        config: LockingConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let store = ResultStore::new(&config);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                producer,
                store,
                flights: Mutex::default(),
                stats: Stats::default(),
                _args: PhantomData,
            }),
        })
    }

    /// Calls the wrapped producer for `args`, or joins a call already in progress.
    ///
    /// The lookup and registration happen right away, the returned [`Pending`] only
    /// waits for the outcome. Dropping it does not affect other callers.
    ///
    /// Invoking the producer spawns a task. On a cache miss outside of a Tokio runtime,
    /// the producer is not invoked and every caller queued on the key receives
    /// [`LockingError::NoRuntime`].
    pub fn get(&self, args: A) -> Pending<P::Output, P::Error> {
        let (waiter, pending) = Waiter::channel();
        self.dispatch(args, waiter);
        pending
    }

    /// Calls the wrapped producer for `args` and hands the outcome to `callback`.
    ///
    /// On a cache hit, `callback` runs before this returns. Otherwise it runs once the
    /// outstanding producer invocation for `args` settles.
    ///
    /// Like [`get`](Self::get), a cache miss outside of a Tokio runtime completes with
    /// [`LockingError::NoRuntime`].
    pub fn call<F>(&self, args: A, callback: F)
    where
        F: FnOnce(Outcome<P::Output, P::Error>) + Send + 'static,
    {
        self.dispatch(args, Waiter::callback(callback));
    }

    /// Returns a snapshot of the statistics of this orchestrator.
    pub fn stats(&self) -> StatsSnapshot {
        let gauges = {
            let flights = self.inner.flights();
            Gauges {
                active_waiters: flights.waiters.active(),
                in_flight: flights.waiters.in_flight(),
                refreshes: flights.refreshes.len(),
                size: 0,
            }
        };
        let size = self.inner.store.size();

        self.inner.stats.snapshot(Gauges { size, ..gauges })
    }

    /// The store holding the produced values.
    pub fn store(&self) -> &ResultStore<P::Output> {
        &self.inner.store
    }

    /// The configuration this orchestrator was created with.
    pub fn config(&self) -> &LockingConfig {
        &self.inner.config
    }

    /// Returns `true` if both handles refer to the same orchestrator.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn dispatch(&self, args: A, waiter: Waiter<P::Output, P::Error>) {
        let inner = &*self.inner;
        let name = inner.name();
        inner.stats.call();
        metric!(counter("locking.access") += 1, "cache" => name);

        let key = match CacheKey::from_args(&args) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(
                    cache = name,
                    error = &err as &dyn std::error::Error,
                    "Failed to derive cache key"
                );
                return waiter.complete(Err(err.into()));
            }
        };

        // Lookup, in-flight check and registration form one critical section.
        let mut flights = inner.flights();
        match inner.store.get(&key) {
            Some(Lookup {
                value,
                is_fresh: true,
            }) => {
                drop(flights);
                inner.stats.hit();
                metric!(counter("locking.memory.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, %key, "Serving fresh entry");

                waiter.complete(Ok(value));
            }
            Some(Lookup {
                value,
                is_fresh: false,
            }) => {
                // Keep serving the stale value to everyone until the refresh lands.
                inner.store.set(key.clone(), Arc::clone(&value));
                let refresh =
                    !flights.refreshes.contains(&key) && !flights.waiters.is_in_flight(&key);
                if refresh {
                    flights.refreshes.insert(key.clone());
                }
                drop(flights);

                inner.stats.stale_hit();
                metric!(counter("locking.stale_hit") += 1, "cache" => name);
                tracing::trace!(cache = name, %key, refresh, "Serving stale entry");

                // Started before the caller's callback runs, which may panic.
                if refresh {
                    self.spawn_flight(key, args, FlightKind::Refresh);
                }
                waiter.complete(Ok(value));
            }
            None => {
                let registration = flights.waiters.register(key.clone(), waiter);
                let in_flight = flights.waiters.in_flight();
                drop(flights);

                inner.stats.miss();
                metric!(counter("locking.miss") += 1, "cache" => name);
                metric!(gauge("locking.in_flight") = in_flight as u64, "cache" => name);

                match registration {
                    Registration::Queued => {
                        inner.stats.coalesced();
                        metric!(counter("locking.coalesced") += 1, "cache" => name);
                        tracing::trace!(cache = name, %key, "Joined outstanding invocation");
                    }
                    Registration::First => self.spawn_flight(key, args, FlightKind::Waiters),
                }
            }
        }
    }

    /// Invokes the producer for `key` and settles the outcome in a spawned task.
    ///
    /// The caller must have registered the flight, either as the first waiter or as a
    /// running refresh.
    fn spawn_flight(&self, key: CacheKey, args: A, kind: FlightKind) {
        // Created before invoking the producer, so a panic in there releases the flight.
        let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key: Some(key.clone()),
            kind,
        };
        let Ok(runtime) = Handle::try_current() else {
            guard.abandon();
            return;
        };

        let name = self.inner.name();
        let is_refresh = kind == FlightKind::Refresh;
        metric!(
            counter("locking.computation") += 1,
            "cache" => name,
            "is_refresh" => &is_refresh.to_string(),
        );
        if is_refresh {
            metric!(counter("locking.refresh") += 1, "cache" => name);
        }
        tracing::debug!(cache = name, %key, is_refresh, "Invoking producer");

        let computation = self.inner.producer.produce(args);

        let task = async move {
            let start = Instant::now();
            let result = computation.await;
            metric!(
                timer("locking.computation.duration") = start.elapsed(),
                "cache" => guard.inner.name(),
                "is_refresh" => &is_refresh.to_string(),
            );
            guard.settle(result);
        };
        runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Owns one outstanding producer invocation until it settles.
///
/// If it is dropped before settling, the flight is released and its waiters are
/// rejected with [`LockingError::Interrupted`].
struct FlightGuard<A, P: Producer<A>> {
    inner: Arc<Inner<A, P>>,
    key: Option<CacheKey>,
    kind: FlightKind,
}

impl<A, P: Producer<A>> FlightGuard<A, P> {
    /// Releases the flight without invoking the producer, there is no runtime to run it.
    fn abandon(mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let waiters = self.inner.finish_flight(&key, self.kind, None);
        tracing::error!(
            cache = self.inner.name(),
            %key,
            waiters = waiters.len(),
            "Cannot invoke producer outside of a Tokio runtime"
        );

        fail_all(waiters, || LockingError::NoRuntime);
    }

    fn settle(mut self, result: Result<P::Output, P::Error>) {
        let Some(key) = self.key.take() else {
            return;
        };
        let inner = &*self.inner;
        let name = inner.name();

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                let waiters = inner.finish_flight(&key, self.kind, Some(&value));
                tracing::debug!(
                    cache = name,
                    %key,
                    waiters = waiters.len(),
                    "Producer invocation succeeded"
                );

                resolve_all(waiters, &value);
            }
            Err(err) => {
                let err = Arc::new(err);
                let waiters = inner.finish_flight(&key, self.kind, None);
                metric!(
                    counter("locking.computation.error") += 1,
                    "cache" => name,
                    "is_refresh" => &(self.kind == FlightKind::Refresh).to_string(),
                );
                match self.kind {
                    FlightKind::Waiters => tracing::debug!(
                        cache = name,
                        %key,
                        waiters = waiters.len(),
                        "Producer invocation failed"
                    ),
                    FlightKind::Refresh => tracing::warn!(
                        cache = name,
                        %key,
                        "Background refresh failed, keeping the stale entry"
                    ),
                }

                reject_all(waiters, &err);
            }
        }
    }
}

impl<A, P: Producer<A>> Drop for FlightGuard<A, P> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let waiters = self.inner.finish_flight(&key, self.kind, None);
        tracing::error!(
            cache = self.inner.name(),
            %key,
            waiters = waiters.len(),
            "Producer invocation went away without settling"
        );

        interrupt_all(waiters);
    }
}
