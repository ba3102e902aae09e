use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigurationError;

/// Configuration of a single [`Locking`](crate::Locking) orchestrator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockingConfig {
    /// Name used to tag logs and metrics of this orchestrator.
    pub name: String,

    /// Maximum number of results kept in memory.
    ///
    /// Once full, the least recently used entry is evicted. Defaults to `1000`.
    pub max_entries: u64,

    /// How long a stored result is considered fresh.
    ///
    /// `None` means results never go stale and only leave the store through eviction.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,

    /// Serve stale results immediately while refreshing them in the background.
    ///
    /// This has no effect without a [`time_to_live`](Self::time_to_live).
    pub allow_stale: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            max_entries: 1000,
            time_to_live: None,
            allow_stale: false,
        }
    }
}

impl LockingConfig {
    /// Checks the bounds of this configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_entries == 0 {
            return Err(ConfigurationError::ZeroCapacity);
        }
        if self.time_to_live == Some(Duration::ZERO) {
            return Err(ConfigurationError::ZeroTimeToLive);
        }
        Ok(())
    }
}
