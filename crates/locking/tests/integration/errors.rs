use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use locking::{ConfigurationError, Locking, LockingConfig, LockingError};

use crate::{Calls, echo, setup};

#[tokio::test(start_paused = true)]
async fn test_failure_is_shared_and_not_cached() {
    setup();
    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |color: String| {
            let attempt = calls.bump();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                match attempt {
                    0 => Err(format!("cannot read {color}")),
                    _ => Ok(format!("out:{color}")),
                }
            }
        }
    };
    let locking: Locking<String, _> = Locking::new(producer, LockingConfig::default()).unwrap();

    let (first, second) = futures::join!(locking.get("red".into()), locking.get("red".into()));
    let (first, second) = (first.unwrap_err(), second.unwrap_err());

    let err = first.producer_error().unwrap();
    assert_eq!(err.as_str(), "cannot read red");
    assert!(Arc::ptr_eq(err, second.producer_error().unwrap()));
    assert_eq!(first.to_string(), "producer failed: cannot read red");
    assert_eq!(locking.stats().size, 0);

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "out:red");
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_affect_other_keys() {
    setup();
    let (locking, calls) = echo(LockingConfig::default());

    let (fail, red) = futures::join!(locking.get("fail".into()), locking.get("red".into()));
    assert!(matches!(fail, Err(LockingError::Producer(_))));
    assert_eq!(red.unwrap().as_str(), "out:red");
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_key_derivation_error() {
    setup();
    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |_: BTreeMap<(u32, u32), u32>| {
            calls.bump();
            async { Ok::<_, String>(()) }
        }
    };
    let locking = Locking::new(producer, LockingConfig::default()).unwrap();

    let args = BTreeMap::from([((1, 2), 3)]);
    let err = locking.get(args).await.unwrap_err();
    assert!(matches!(err, LockingError::KeyDerivation(_)));
    assert_eq!(calls.count(), 0);

    let stats = locking.stats();
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_panicking_producer_interrupts_waiters() {
    setup();
    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |n: u32| {
            let attempt = calls.bump();
            async move {
                tokio::task::yield_now().await;
                if attempt == 0 {
                    panic!("producer blew up");
                }
                Ok::<_, String>(n)
            }
        }
    };
    let locking: Locking<u32, _> = Locking::new(producer, LockingConfig::default()).unwrap();

    let (first, second) = futures::join!(locking.get(1), locking.get(1));
    assert!(matches!(first, Err(LockingError::Interrupted)));
    assert!(matches!(second, Err(LockingError::Interrupted)));
    assert_eq!(locking.stats().in_flight, 0);

    assert_eq!(*locking.get(1).await.unwrap(), 1);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_miss_outside_of_runtime() {
    setup();
    let (locking, calls) = echo(LockingConfig::default());

    let outcome = futures::executor::block_on(locking.get("red".into()));
    assert!(matches!(outcome, Err(LockingError::NoRuntime)));

    let (sender, receiver) = std::sync::mpsc::channel();
    locking.call("red".into(), move |outcome| sender.send(outcome).unwrap());
    assert!(matches!(receiver.try_recv().unwrap(), Err(LockingError::NoRuntime)));

    assert_eq!(calls.count(), 0);
    let stats = locking.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.size, 0);

    // the key is released, a call from within a runtime goes through
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let value = runtime.block_on(locking.get("red".into())).unwrap();
    assert_eq!(value.as_str(), "out:red");
    assert_eq!(calls.count(), 1);
}

#[test]
fn test_invalid_config() {
    let config = LockingConfig {
        max_entries: 0,
        ..Default::default()
    };
    let err = Locking::<String, _>::new(crate::Echo::new(Duration::ZERO), config).unwrap_err();
    assert_eq!(err, ConfigurationError::ZeroCapacity);

    let config = LockingConfig {
        time_to_live: Some(Duration::ZERO),
        ..Default::default()
    };
    let err = Locking::<String, _>::new(crate::Echo::new(Duration::ZERO), config).unwrap_err();
    assert_eq!(err.to_string(), "time_to_live must be greater than zero");
}
