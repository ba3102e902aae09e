//! Request coalescing and bounded, time-limited memoization for async producers.
//!
//! A [`Locking`] orchestrator wraps a [`Producer`], an async function that computes or
//! fetches a value for some arguments. Calls with structurally equal arguments map to
//! the same [`CacheKey`]:
//!
//! - concurrent calls for a key share a single producer invocation,
//! - successful results are kept in a bounded LRU store for `time_to_live`,
//! - with `allow_stale`, expired results are served right away while a single
//!   background invocation refreshes them.
//!
//! Failures are never stored. Every caller waiting on a failed invocation receives the
//! same error, and the next call tries again.
//!
//! ```no_run
//! # async fn fetch(id: u32) -> Result<String, std::io::Error> { Ok(id.to_string()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use locking::{Locking, LockingConfig};
//!
//! let config = LockingConfig {
//!     time_to_live: Some(std::time::Duration::from_secs(30)),
//!     ..Default::default()
//! };
//! let locking = Locking::new(fetch, config)?;
//!
//! let (a, b) = futures::join!(locking.get(1u32), locking.get(1u32));
//! assert_eq!(a?, b?);
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

mod config;
mod error;
mod key;
mod locking;
mod producer;
mod registry;
mod stats;
mod store;
mod waiters;

pub use config::LockingConfig;
pub use error::{ConfigurationError, KeyDerivationError, LockingError};
pub use key::CacheKey;
pub use locking::Locking;
pub use producer::Producer;
pub use registry::Registry;
pub use stats::StatsSnapshot;
pub use store::{CacheEntry, Lookup, ResultStore};
pub use waiters::{Outcome, Pending};
