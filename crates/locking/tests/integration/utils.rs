use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use locking::{Locking, LockingConfig, Producer};

/// Setup the test environment.
///
/// Initializes logs so that all console output is captured by the test runner.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("locking=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A shared counter of producer invocations.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    /// Records one invocation and returns how many happened before it.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Answers `out:{color}` after `delay`, and fails for the color `"fail"`.
#[derive(Debug, Clone)]
pub struct Echo {
    pub calls: Calls,
    pub delay: Duration,
}

impl Echo {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: Calls::default(),
            delay,
        }
    }
}

impl Producer<String> for Echo {
    type Output = String;
    type Error = String;

    fn produce(&self, color: String) -> BoxFuture<'static, Result<String, String>> {
        self.calls.bump();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if color == "fail" {
                Err(format!("cannot produce {color}"))
            } else {
                Ok(format!("out:{color}"))
            }
        })
    }
}

/// Wraps an [`Echo`] producer with a 100ms delay, returning its invocation counter.
pub fn echo(config: LockingConfig) -> (Locking<String, Echo>, Calls) {
    let producer = Echo::new(Duration::from_millis(100));
    let calls = producer.calls.clone();
    let locking = Locking::new(producer, config).unwrap();
    (locking, calls)
}
