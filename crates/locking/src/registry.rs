use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::config::LockingConfig;
use crate::error::ConfigurationError;
use crate::locking::Locking;
use crate::producer::Producer;

/// Identifies one wrapped producer: the orchestrator type plus the address of the shared
/// producer.
type RegistryKey = (TypeId, usize);

struct Registered {
    locking: Box<dyn Any + Send + Sync>,
    /// Keeps the producer alive, so its address cannot be reused by another one.
    _producer: Arc<dyn Any + Send + Sync>,
}

/// Hands out one [`Locking`] orchestrator per producer.
///
/// Wrapping the same producer twice returns the same orchestrator, sharing its store
/// and waiters, instead of building an independent one.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<RegistryKey, Registered>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the orchestrator wrapping `producer`, creating it with `config` on first use.
    ///
    /// Producers are identified by their [`Arc`], clones of the same `Arc` refer to the
    /// same producer. The configuration of the first call wins, later calls with a
    /// different configuration get the existing orchestrator.
    pub fn wrap<A, P>(
        &self,
        producer: &Arc<P>,
        config: LockingConfig,
    ) -> Result<Locking<A, P>, ConfigurationError>
    where
        A: Serialize + 'static,
        P: Producer<A>,
    {
        let key = (
            TypeId::of::<Locking<A, P>>(),
            Arc::as_ptr(producer) as *const () as usize,
        );
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(registered) = entries.get(&key)
            && let Some(locking) = registered.locking.downcast_ref::<Locking<A, P>>()
        {
            if locking.config() != &config {
                tracing::warn!(
                    cache = locking.config().name.as_str(),
                    requested = config.name.as_str(),
                    "Producer is already wrapped with a different configuration"
                );
            }
            return Ok(locking.clone());
        }

        let locking = Locking::with_producer(Arc::clone(producer), config)?;
        tracing::debug!(cache = locking.config().name.as_str(), "Wrapped new producer");
        entries.insert(
            key,
            Registered {
                locking: Box::new(locking.clone()),
                _producer: Arc::clone(producer) as Arc<dyn Any + Send + Sync>,
            },
        );

        Ok(locking)
    }

    /// Number of wrapped producers.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets all wrapped producers.
    ///
    /// Orchestrators handed out before keep working, but the next
    /// [`wrap`](Self::wrap) creates a new one.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
