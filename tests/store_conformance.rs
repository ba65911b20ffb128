//! Store contract conformance, run against the in-memory backend through a
//! trait object the way the pipeline consumes it. A remote backend can be
//! dropped into `store()` and must pass unchanged.

use serde_json::{json, Value};
use shield::{ManualClock, MemoryStore, Store, TTL_MISSING, TTL_NONE};
use std::sync::Arc;
use std::time::Duration;

fn store(clock: &ManualClock) -> Arc<dyn Store> {
    Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())))
}

#[tokio::test]
async fn counters_are_atomic_across_tasks() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.incr_by("counter", 1).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(store.incr_by("counter", 0).await.unwrap(), 800);
}

#[tokio::test]
async fn ttl_semantics_match_the_contract() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    assert_eq!(store.ttl("missing").await.unwrap(), TTL_MISSING);

    store.set("eternal", json!(1), None).await.unwrap();
    assert_eq!(store.ttl("eternal").await.unwrap(), TTL_NONE);

    store.set("brief", json!(1), Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(store.ttl("brief").await.unwrap(), 5);

    clock.advance(5_000);
    assert_eq!(store.ttl("brief").await.unwrap(), TTL_MISSING);
    assert!(!store.exists("brief").await.unwrap());
}

#[tokio::test]
async fn expire_attaches_ttl_to_live_keys_only() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
    store.incr_by("window", 1).await.unwrap();
    assert!(store.expire("window", Duration::from_secs(5)).await.unwrap());

    clock.advance(5_000);
    // A fresh increment starts a new counter after expiry.
    assert_eq!(store.incr_by("window", 1).await.unwrap(), 1);
}

#[tokio::test]
async fn scan_uses_glob_semantics() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    for key in ["rate_limit:ip:1.2.3.4:0", "rate_limit:ip:5.6.7.8:0", "block:1.2.3.4"] {
        store.set(key, json!(1), None).await.unwrap();
    }

    assert_eq!(store.scan("rate_limit:*").await.unwrap().len(), 2);
    assert_eq!(store.scan("*:1.2.3.4").await.unwrap(), vec!["block:1.2.3.4".to_string()]);
    assert_eq!(store.scan("rate_limit:*:0").await.unwrap().len(), 2);
    assert!(store.scan("node:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn structured_records_round_trip() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    let record = json!({"count": 3, "first_request_millis": 12_000});
    store.set("throttle:ip:1.2.3.4", record.clone(), Some(Duration::from_secs(60))).await.unwrap();
    assert_eq!(store.get("throttle:ip:1.2.3.4").await.unwrap(), Some(record));

    let values: Vec<Option<Value>> = store
        .mget(&["throttle:ip:1.2.3.4".to_string(), "nope".to_string()])
        .await
        .unwrap();
    assert!(values[0].is_some());
    assert!(values[1].is_none());
}

#[tokio::test]
async fn advisory_locks_serialise_critical_sections() {
    let clock = ManualClock::new(0);
    let store = store(&clock);

    assert!(store.try_lock("throttle:flush", Duration::from_secs(5)).await.unwrap());
    assert!(!store.try_lock("throttle:flush", Duration::from_secs(5)).await.unwrap());
    store.unlock("throttle:flush").await.unwrap();
    assert!(store.try_lock("throttle:flush", Duration::from_secs(5)).await.unwrap());
}
