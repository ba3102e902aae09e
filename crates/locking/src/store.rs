use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use tokio::time::Instant;

use crate::config::LockingConfig;
use crate::key::CacheKey;

/// An item saved in the in-memory moka cache.
#[derive(Debug)]
struct StoredItem<T> {
    /// The actual data.
    value: Arc<T>,
    /// When this item was written.
    inserted_at: Instant,
    /// When this item stops being fresh, if ever.
    deadline: Option<Instant>,
}

impl<T> Clone for StoredItem<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
            deadline: self.deadline,
        }
    }
}

impl<T> StoredItem<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }
}

/// The result of a successful [`ResultStore::get`].
#[derive(Debug)]
pub struct Lookup<T> {
    /// The stored value.
    pub value: Arc<T>,
    /// `false` if the value outlived its freshness deadline and is only retained for
    /// stale serving.
    pub is_fresh: bool,
}

/// A snapshot of one entry of the [`ResultStore`], see [`ResultStore::dump`].
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub value: Arc<T>,
    pub inserted_at: Instant,
    pub deadline: Option<Instant>,
}

/// A bounded map from [`CacheKey`] to produced values.
///
/// Entries are evicted in least recently used order once `max_entries` is reached.
/// Freshness is tracked per entry: an entry past its deadline is dropped on lookup,
/// unless stale serving is enabled, in which case it is retained and reported as stale.
pub struct ResultStore<T> {
    items: moka::sync::Cache<CacheKey, StoredItem<T>>,
    time_to_live: Option<Duration>,
    allow_stale: bool,
}

impl<T> fmt::Debug for ResultStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStore")
            .field("entries", &self.items.entry_count())
            .field("time_to_live", &self.time_to_live)
            .field("allow_stale", &self.allow_stale)
            .finish()
    }
}

impl<T: Send + Sync + 'static> ResultStore<T> {
    /// Creates an empty store bounded according to `config`.
    ///
    /// The config is expected to be [validated](LockingConfig::validate) already.
    pub fn new(config: &LockingConfig) -> Self {
        let items = moka::sync::Cache::builder()
            .name(&config.name)
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            items,
            time_to_live: config.time_to_live,
            allow_stale: config.allow_stale,
        }
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<Lookup<T>> {
        let item = self.items.get(key)?;
        let is_fresh = item.is_fresh(Instant::now());

        if !is_fresh && !self.allow_stale {
            self.items.invalidate(key);
            return None;
        }

        Some(Lookup {
            value: item.value,
            is_fresh,
        })
    }

    /// Stores `value` under `key` with a fresh deadline, replacing any previous entry.
    pub fn set(&self, key: CacheKey, value: Arc<T>) {
        let inserted_at = Instant::now();
        let deadline = self.time_to_live.map(|ttl| inserted_at + ttl);
        let item = StoredItem {
            value,
            inserted_at,
            deadline,
        };

        self.items.insert(key, item);
        // Apply evictions right away, so that the entry count never exceeds the bound.
        self.items.run_pending_tasks();
    }

    /// Returns the number of entries currently held, fresh or stale.
    pub fn size(&self) -> u64 {
        self.items.run_pending_tasks();
        self.items.entry_count()
    }

    /// Returns all entries currently held, ordered by insertion time.
    pub fn dump(&self) -> Vec<CacheEntry<T>> {
        self.items.run_pending_tasks();

        let mut entries: Vec<_> = self
            .items
            .iter()
            .map(|(key, item)| CacheEntry {
                key: CacheKey::clone(&key),
                value: item.value,
                inserted_at: item.inserted_at,
                deadline: item.deadline,
            })
            .collect();
        entries.sort_by_key(|entry| entry.inserted_at);
        entries
    }
}
