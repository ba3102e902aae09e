use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use locking::{Locking, LockingConfig, Producer};

use crate::{Calls, setup};

/// Answers `{color}:{attempt}` after 10ms, failing the attempts listed in `failures`.
fn versioned(
    failures: &'static [usize],
) -> (Locking<String, impl Producer<String, Output = String, Error = String>>, Calls) {
    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |color: String| {
            let attempt = calls.bump();
            async move {
                time::sleep(Duration::from_millis(10)).await;
                if failures.contains(&attempt) {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok(format!("{color}:{attempt}"))
                }
            }
        }
    };
    let config = LockingConfig {
        name: "stale".into(),
        time_to_live: Some(Duration::from_millis(100)),
        allow_stale: true,
        ..Default::default()
    };

    (Locking::new(producer, config).unwrap(), calls)
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate() {
    setup();
    let (locking, calls) = versioned(&[]);

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");

    time::sleep(Duration::from_millis(200)).await;

    // served stale right away, refreshed in the background
    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");
    assert_eq!(calls.count(), 2);

    let stats = locking.stats();
    assert_eq!(stats.stale_hits, 1);
    assert_eq!(stats.refreshes, 1);
    assert_eq!(stats.in_flight, 0);

    // the stale entry was re-inserted, so this does not start another refresh
    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");
    assert_eq!(calls.count(), 2);

    time::sleep(Duration::from_millis(20)).await;

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:1");
    assert_eq!(calls.count(), 2);

    insta::assert_debug_snapshot!(locking.stats(), @r###"
    StatsSnapshot {
        calls: 4,
        hits: 3,
        misses: 1,
        coalesced: 0,
        stale_hits: 1,
        active_waiters: 0,
        in_flight: 0,
        refreshes: 0,
        size: 1,
    }
    "###);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_stale_entry() {
    setup();
    let (locking, calls) = versioned(&[1]);

    locking.get("red".into()).await.unwrap();
    time::sleep(Duration::from_millis(200)).await;

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");

    time::sleep(Duration::from_millis(20)).await;
    assert_eq!(locking.stats().refreshes, 0);

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");
    assert_eq!(calls.count(), 2);

    // once the re-inserted entry goes stale again, the next refresh goes through
    time::sleep(Duration::from_millis(200)).await;
    locking.get("red".into()).await.unwrap();
    time::sleep(Duration::from_millis(20)).await;

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:2");
    assert_eq!(calls.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stale_callback_runs_synchronously() {
    setup();
    let (locking, calls) = versioned(&[]);

    locking.get("red".into()).await.unwrap();
    time::sleep(Duration::from_millis(200)).await;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    locking.call("red".into(), move |outcome| {
        sender.send(outcome.unwrap()).unwrap();
    });

    let value = receiver.try_recv().unwrap();
    assert_eq!(value.as_str(), "red:0");
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_entries_are_dropped_without_stale_serving() {
    setup();
    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |color: String| {
            let attempt = calls.bump();
            async move { Ok::<_, String>(format!("{color}:{attempt}")) }
        }
    };
    let config = LockingConfig {
        time_to_live: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let locking: Locking<String, _> = Locking::new(producer, config).unwrap();

    locking.get("red".into()).await.unwrap();
    time::sleep(Duration::from_millis(200)).await;

    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:1");
    assert_eq!(locking.stats().stale_hits, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_and_waiter_flight_for_the_same_key() {
    setup();
    // producer latency per attempt, in milliseconds
    const LATENCIES: [u64; 4] = [10, 50, 10, 500];

    let calls = Calls::default();
    let producer = {
        let calls = calls.clone();
        move |color: String| {
            let attempt = calls.bump();
            let latency = Duration::from_millis(LATENCIES.get(attempt).copied().unwrap_or(10));
            async move {
                time::sleep(latency).await;
                Ok::<_, String>(format!("{color}:{attempt}"))
            }
        }
    };
    let config = LockingConfig {
        name: "stale".into(),
        max_entries: 1,
        time_to_live: Some(Duration::from_millis(100)),
        allow_stale: true,
    };
    let locking: Locking<String, _> = Locking::new(producer, config).unwrap();

    locking.get("red".into()).await.unwrap();
    time::sleep(Duration::from_millis(200)).await;

    // stale hit, starts a refresh of red that takes 50ms
    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:0");

    // evicts red while its refresh is still running
    let value = locking.get("blue".into()).await.unwrap();
    assert_eq!(value.as_str(), "blue:2");

    // a miss starts a separate waiter flight next to the running refresh
    let pending = locking.get("red".into());
    assert_eq!(calls.count(), 4);
    let stats = locking.stats();
    assert_eq!(stats.refreshes, 1);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.active_waiters, 1);

    // the refresh lands and stores red, the waiter flight is still running
    time::sleep(Duration::from_millis(50)).await;
    let stats = locking.stats();
    assert_eq!(stats.refreshes, 0);
    assert_eq!(stats.in_flight, 1);

    // the refreshed entry goes stale, serving it does not start another invocation
    time::sleep(Duration::from_millis(100)).await;
    let value = locking.get("red".into()).await.unwrap();
    assert_eq!(value.as_str(), "red:1");
    assert_eq!(calls.count(), 4);
    assert_eq!(locking.stats().refreshes, 0);

    let value = pending.await.unwrap();
    assert_eq!(value.as_str(), "red:3");
    assert_eq!(calls.count(), 4);

    insta::assert_debug_snapshot!(locking.stats(), @r###"
    StatsSnapshot {
        calls: 5,
        hits: 2,
        misses: 3,
        coalesced: 0,
        stale_hits: 2,
        active_waiters: 0,
        in_flight: 0,
        refreshes: 0,
        size: 1,
    }
    "###);
}
