//! Integration Tests for Read-Through and Refresh Behaviour
//!
//! Drives the public client surface with a manual clock: miss
//! deduplication, background refreshes, refresh buffering, negative caching,
//! passthrough and cancellation.

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sturdy_cache::{
    batch_key_fn, CacheError, CacheOptions, Client, Result, StatsRecorder, TestClock,
};
use tokio::sync::{Notify, Semaphore};

// == Helper Functions ==

type BatchCalls = Arc<Mutex<Vec<Vec<String>>>>;

fn base_options(clock: &TestClock) -> CacheOptions {
    CacheOptions::new().with_clock(Arc::new(clock.clone()))
}

fn refreshing(clock: &TestClock) -> CacheOptions {
    base_options(clock).with_background_refreshes(
        Duration::from_secs(1),
        Duration::from_secs(1),
        Duration::from_millis(100),
    )
}

fn client(ttl: Duration, options: CacheOptions) -> Client<String> {
    Client::new(100, 2, ttl, 10, options).unwrap()
}

/// Batch source answering `{version}-{id}` for every id except "missing".
fn batch_source(
    calls: BatchCalls,
    version: &'static str,
) -> impl Fn(Vec<String>) -> Ready<Result<HashMap<String, String>>> + Send + Sync + 'static {
    move |ids: Vec<String>| {
        calls.lock().push(ids.clone());
        ready(Ok(ids
            .into_iter()
            .filter(|id| id != "missing")
            .map(|id| {
                let value = format!("{}-{}", version, id);
                (id, value)
            })
            .collect()))
    }
}

/// Waits until `condition` holds, failing the test after about a second.
async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// == Miss Deduplication ==

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(10), base_options(&clock));
    let calls = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("hot", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("value".to_string())
                        }
                    })
                    .await
            })
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), "value");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("hot"), Some("value".to_string()));
}

#[tokio::test]
async fn test_overlapping_batches_fetch_each_id_once() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(10), base_options(&clock));
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(Semaphore::new(0));

    let slow_source = |calls: BatchCalls, release: Arc<Semaphore>| {
        move |ids: Vec<String>| {
            calls.lock().push(ids.clone());
            let release = release.clone();
            async move {
                let _permit = release.acquire().await;
                Ok::<_, CacheError>(
                    ids.into_iter()
                        .map(|id| (id.clone(), format!("v-{}", id)))
                        .collect::<HashMap<_, _>>(),
                )
            }
        }
    };

    let first = {
        let cache = cache.clone();
        let key_fn = key_fn.clone();
        let fetch = slow_source(calls.clone(), release.clone());
        tokio::spawn(async move { cache.get_or_fetch_batch(&["1", "2"], &key_fn, fetch).await })
    };
    eventually(|| calls.lock().len() == 1).await;

    let second = {
        let cache = cache.clone();
        let key_fn = key_fn.clone();
        let fetch = slow_source(calls.clone(), release.clone());
        tokio::spawn(async move { cache.get_or_fetch_batch(&["2", "3"], &key_fn, fetch).await })
    };
    eventually(|| calls.lock().len() == 2).await;

    release.add_permits(2);
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second["2"], "v-2");
    assert_eq!(second["3"], "v-3");
    let calls = calls.lock();
    assert_eq!(calls[0], vec!["1".to_string(), "2".to_string()]);
    assert_eq!(calls[1], vec!["3".to_string()]);
}

// == Background Refreshes ==

#[tokio::test]
async fn test_refresh_window_then_expiry() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(2), refreshing(&clock));
    cache.set("key", "v1".to_string());

    // Inside the refresh window: stale value now, new value shortly after
    clock.add(Duration::from_millis(1500));
    let value = cache
        .get_or_fetch("key", || async { Ok("v2".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "v1");
    eventually(|| cache.get("key") == Some("v2".to_string())).await;

    // The refreshed entry gets a full TTL of its own
    clock.add(Duration::from_millis(1900));
    assert_eq!(cache.get("key"), Some("v2".to_string()));
    clock.add(Duration::from_millis(100));
    assert_eq!(cache.get("key"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_reads_share_one_refresh() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(2), refreshing(&clock));
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Semaphore::new(0));
    cache.set("key", "v1".to_string());

    clock.add(Duration::from_millis(1500));
    let readers: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            let release = release.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("key", move || {
                        let calls = calls.clone();
                        let release = release.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            let _permit = release.acquire().await;
                            Ok("v2".to_string())
                        }
                    })
                    .await
            })
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), "v1");
    }

    // The refresh only completes once every reader has its stale value
    release.add_permits(1);
    eventually(|| cache.get("key") == Some("v2".to_string())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_refresh_does_not_outlive_ttl() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(2), refreshing(&clock));
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("key", "v1".to_string());

    let failing = |calls: Arc<AtomicUsize>| {
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CacheError::fetch(anyhow::anyhow!("source down")))
            }
        }
    };

    clock.add(Duration::from_millis(1500));
    let value = cache.get_or_fetch("key", failing(calls.clone())).await.unwrap();
    assert_eq!(value, "v1");
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;

    // Retry is not due before the backoff delay
    clock.add(Duration::from_millis(50));
    cache.get_or_fetch("key", failing(calls.clone())).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.add(Duration::from_millis(50));
    assert_eq!(
        cache.get_or_fetch("key", failing(calls.clone())).await.unwrap(),
        "v1"
    );
    eventually(|| calls.load(Ordering::SeqCst) == 2).await;

    // Past the original TTL the read becomes a synchronous miss
    clock.add(Duration::from_millis(400));
    let result = cache.get_or_fetch("key", failing(calls.clone())).await;
    assert!(matches!(result, Err(CacheError::Fetch(_))));
}

// == Refresh Buffering ==

#[tokio::test]
async fn test_buffered_refreshes_coalesce() {
    let clock = TestClock::default();
    let stats = Arc::new(StatsRecorder::new());
    let cache = client(
        Duration::from_secs(10),
        refreshing(&clock)
            .with_metrics(stats.clone())
            .with_refresh_buffering(3, Duration::from_secs(5)),
    );
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));
    for id in ["a", "b", "c"] {
        cache.set(key_fn(id), format!("old-{}", id));
    }

    clock.add(Duration::from_secs(1));
    for id in ["a", "b", "c"] {
        let records = cache
            .get_or_fetch_batch(&[id], &key_fn, batch_source(calls.clone(), "new"))
            .await
            .unwrap();
        assert_eq!(records[id], format!("old-{}", id));
    }

    eventually(|| cache.get(&key_fn("c")) == Some("new-c".to_string())).await;
    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec!["a".to_string(), "b".to_string(), "c".to_string()]);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.batch_refreshes, 1);
    assert_eq!(snapshot.batch_refresh_ids, 3);
}

#[tokio::test]
async fn test_buffer_timeout_dispatches_partial_batch() {
    let clock = TestClock::default();
    let stats = Arc::new(StatsRecorder::new());
    let cache = client(
        Duration::from_secs(10),
        refreshing(&clock)
            .with_metrics(stats.clone())
            .with_refresh_buffering(10, Duration::from_secs(5)),
    );
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));
    for id in ["a", "b", "c"] {
        cache.set(key_fn(id), format!("old-{}", id));
    }

    clock.add(Duration::from_secs(1));
    for id in ["a", "b", "c"] {
        let records = cache
            .get_or_fetch_batch(&[id], &key_fn, batch_source(calls.clone(), "new"))
            .await
            .unwrap();
        assert_eq!(records[id], format!("old-{}", id));
    }

    // Below batch size: the ids wait for the buffer timer
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.lock().is_empty());

    clock.add(Duration::from_secs(5));
    eventually(|| {
        ["a", "b", "c"]
            .iter()
            .all(|id| cache.get(&key_fn(id)) == Some(format!("new-{}", id)))
    })
    .await;

    assert_eq!(
        *calls.lock(),
        vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
    );
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.batch_refreshes, 1);
    assert_eq!(snapshot.batch_refresh_ids, 3);
}

#[tokio::test]
async fn test_buffer_timeout_dispatches_single_id() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        refreshing(&clock).with_refresh_buffering(10, Duration::from_secs(5)),
    );
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));
    cache.set(key_fn("a"), "old-a".to_string());

    clock.add(Duration::from_secs(1));
    cache
        .get_or_fetch_batch(&["a"], &key_fn, batch_source(calls.clone(), "new"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.lock().is_empty());

    clock.add(Duration::from_secs(5));
    eventually(|| cache.get(&key_fn("a")) == Some("new-a".to_string())).await;
    assert_eq!(*calls.lock(), vec![vec!["a".to_string()]]);
}

// == Negative Caching ==

#[tokio::test]
async fn test_missing_records_are_fetched_once() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        base_options(&clock).with_missing_record_storage(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let result = cache
            .get_or_fetch("ghost", move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(CacheError::NotFound)
                }
            })
            .await;
        assert!(matches!(result, Err(CacheError::MissingRecord)));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("ghost"), None);
    assert_eq!(cache.size(), 1);
}

#[tokio::test]
async fn test_batch_ids_absent_from_response_are_cached_as_missing() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        base_options(&clock).with_missing_record_storage(),
    );
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let records = cache
            .get_or_fetch_batch(&["x", "missing"], &key_fn, batch_source(calls.clone(), "v"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records["x"], "v-x");
    }

    assert_eq!(calls.lock().len(), 1);
    assert_eq!(cache.size(), 2);
}

// == Passthrough ==

#[tokio::test]
async fn test_full_passthrough_bypasses_cache() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        base_options(&clock).with_passthrough_percentage(0),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        cache
            .get_or_fetch("key", move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("live".to_string())
                }
            })
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn test_passthrough_falls_back_to_cached_value() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        base_options(&clock).with_passthrough_percentage(0),
    );
    cache.set("key", "cached".to_string());

    let value = cache
        .get_or_fetch("key", || async {
            Err::<String, _>(CacheError::fetch(anyhow::anyhow!("source down")))
        })
        .await
        .unwrap();
    assert_eq!(value, "cached");

    let key_fn = batch_key_fn("item");
    cache.set(key_fn("1"), "cached-1".to_string());
    let err = cache
        .get_or_fetch_batch(&["1", "2"], &key_fn, |_ids: Vec<String>| async {
            Err::<HashMap<String, String>, _>(CacheError::fetch(anyhow::anyhow!("source down")))
        })
        .await
        .unwrap_err();
    assert_eq!(err.cached.len(), 1);
    assert_eq!(err.cached["1"], "cached-1");
}

#[tokio::test]
async fn test_buffered_passthrough_does_not_persist() {
    let clock = TestClock::default();
    let cache = client(
        Duration::from_secs(10),
        refreshing(&clock)
            .with_refresh_buffering(2, Duration::from_secs(5))
            .with_passthrough_percentage(0)
            .with_passthrough_buffering(),
    );
    let key_fn = batch_key_fn("item");
    let calls: BatchCalls = Arc::new(Mutex::new(Vec::new()));

    let records = cache
        .get_or_fetch_batch(&["1", "2"], &key_fn, batch_source(calls.clone(), "live"))
        .await
        .unwrap();

    assert_eq!(records["1"], "live-1");
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(cache.size(), 0);
}

// == Cancellation and Failures ==

#[tokio::test]
async fn test_cancelled_waiter_does_not_cancel_fetch() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(10), base_options(&clock));
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let gated = |release: Arc<Notify>, calls: Arc<AtomicUsize>| {
        move || {
            let release = release.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<_, CacheError>("value".to_string())
            }
        }
    };

    let impatient = {
        let cache = cache.clone();
        let fetch = gated(release.clone(), calls.clone());
        tokio::spawn(async move { cache.get_or_fetch("key", fetch).await })
    };
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;

    let patient = {
        let cache = cache.clone();
        let fetch = gated(release.clone(), calls.clone());
        tokio::spawn(async move { cache.get_or_fetch("key", fetch).await })
    };
    tokio::task::yield_now().await;

    impatient.abort();
    assert!(impatient.await.unwrap_err().is_cancelled());

    release.notify_one();
    assert_eq!(patient.await.unwrap().unwrap(), "value");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("key"), Some("value".to_string()));
}

#[tokio::test]
async fn test_panicking_fetch_is_contained() {
    let clock = TestClock::default();
    let cache = client(Duration::from_secs(10), base_options(&clock));

    let result = cache
        .get_or_fetch("key", || async {
            if true {
                panic!("source exploded");
            }
            Ok("never".to_string())
        })
        .await;
    assert!(matches!(result, Err(CacheError::Internal(_))));

    // The failed flight is gone; the next read fetches again
    let value = cache
        .get_or_fetch("key", || async { Ok("value".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "value");
}

// == Eviction Scheduler ==

#[tokio::test]
async fn test_scheduler_reclaims_expired_entries() {
    let clock = TestClock::default();
    let stats = Arc::new(StatsRecorder::new());
    let cache = client(
        Duration::from_secs(2),
        base_options(&clock).with_metrics(stats.clone()),
    );
    for i in 0..10 {
        cache.set(format!("key-{}", i), "v".to_string());
    }

    // Two shards, one per tick at ttl / 2
    clock.add(Duration::from_secs(2));
    clock.add(Duration::from_secs(1));
    eventually(|| cache.size() == 0).await;
    assert!(stats.snapshot().evictions >= 2);

    cache.stop_evictions();
    cache.set("late", "v".to_string());
    clock.add(Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.size(), 1);
}
