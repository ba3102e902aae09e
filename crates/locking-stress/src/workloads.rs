use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use locking::{Locking, LockingConfig, LockingError, Producer};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// Number of calls kept in flight at any time.
    pub concurrency: usize,
    /// Number of distinct keys the calls are spread over.
    pub keys: u64,
    /// How long the simulated I/O takes per producer invocation.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Fails every n-th producer invocation.
    #[serde(default)]
    pub fail_every: Option<u64>,
}

#[derive(Debug, Clone, Error)]
#[error("simulated failure of invocation {invocation} for key {key}")]
pub struct SimulatedFailure {
    pub invocation: u64,
    pub key: u64,
}

/// A producer that pretends to fetch a payload over the network.
#[derive(Debug)]
pub struct SimulatedIo {
    latency: Duration,
    fail_every: Option<u64>,
    invocations: AtomicU64,
}

impl SimulatedIo {
    pub fn new(workload: &Workload) -> Self {
        Self {
            latency: workload.latency,
            fail_every: workload.fail_every.filter(|n| *n > 0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Producer<u64> for SimulatedIo {
    type Output = String;
    type Error = SimulatedFailure;

    fn produce(&self, key: u64) -> BoxFuture<'static, Result<String, SimulatedFailure>> {
        let invocation = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        let fails = self.fail_every.is_some_and(|n| invocation % n == 0);
        let latency = self.latency;

        Box::pin(async move {
            tokio::time::sleep(latency).await;
            if fails {
                return Err(SimulatedFailure { invocation, key });
            }
            Ok(format!("payload-{key}"))
        })
    }
}

/// A workload ready to be driven: its orchestrator and the key sequence.
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub producer: Arc<SimulatedIo>,
    pub locking: Locking<u64, SimulatedIo>,
    keys: u64,
    next_key: AtomicU64,
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    cache: &LockingConfig,
) -> Result<PreparedWorkload> {
    let producer = Arc::new(SimulatedIo::new(&workload));
    let config = LockingConfig {
        name: format!("workload-{index}"),
        ..cache.clone()
    };
    let locking = Locking::with_producer(Arc::clone(&producer), config)
        .with_context(|| format!("invalid cache configuration for workload {index}"))?;

    Ok(PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        producer,
        locking,
        keys: workload.keys.max(1),
        next_key: AtomicU64::new(0),
    })
}

impl PreparedWorkload {
    /// Issues one call for the next key, cycling over all keys of the workload.
    pub async fn process(&self) -> Result<Arc<String>, LockingError<SimulatedFailure>> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) % self.keys;
        self.locking.get(key).await
    }
}
