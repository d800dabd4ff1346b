//! End-to-end behavior of the registry through its public API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use viewcache_core::{
    loader_fn, CacheKey, CacheRegistry, ManualClock, ResourceConfig, SharedStorage, Staleness,
};

/// Poll `cond` for up to a second.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn key() -> CacheKey {
    CacheKey::new("roster", "org-1")
}

/// A fake server holding one JSON document, counting reads.
#[derive(Clone, Default)]
struct Server {
    state: Arc<Mutex<Value>>,
    reads: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl Server {
    fn new(state: Value) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            ..Default::default()
        }
    }

    fn set(&self, state: Value) {
        *self.state.lock().unwrap() = state;
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn resource(&self, name: &str) -> ResourceConfig {
        let server = self.clone();
        ResourceConfig::new(
            name,
            loader_fn(move |_| {
                let server = server.clone();
                async move {
                    server.reads.fetch_add(1, Ordering::SeqCst);
                    if server.failing.load(Ordering::SeqCst) {
                        anyhow::bail!("503 Service Unavailable");
                    }
                    let state = server.state.lock().unwrap().clone();
                    Ok(state)
                }
            }),
        )
    }
}

#[tokio::test]
async fn test_staleness_timeline() {
    let clock = Arc::new(ManualClock::at_epoch());
    let registry = CacheRegistry::with_clock(&SharedStorage::in_memory(), clock.clone());
    let server = Server::new(json!({"version": 1}));
    registry
        .register(
            server
                .resource("roster")
                .ttl(Duration::from_millis(1000), Duration::from_millis(5000)),
        )
        .unwrap();

    // t=0: first write
    registry.refresh(&key()).await.unwrap();
    assert_eq!(server.reads(), 1);

    // t=500: fresh, served without a refresh
    clock.advance_millis(500);
    let entry = registry.load(&key()).await.unwrap();
    assert_eq!(entry.payload(), &json!({"version": 1}));
    tokio::task::yield_now().await;
    assert_eq!(server.reads(), 1);

    // t=2000: stale, old payload now and one refresh behind it (which fails)
    clock.advance_millis(1500);
    server.failing.store(true, Ordering::SeqCst);
    server.set(json!({"version": 2}));
    let entry = registry.load(&key()).await.unwrap();
    assert_eq!(entry.payload(), &json!({"version": 1}));
    assert!(eventually(|| server.reads() == 2).await);

    // t=6000: expired, the caller waits for the loader
    clock.advance_millis(4000);
    server.failing.store(false, Ordering::SeqCst);
    assert!(registry.age_display(&key()).is_some());
    let entry = registry.load(&key()).await.unwrap();
    assert_eq!(entry.payload(), &json!({"version": 2}));
    assert_eq!(server.reads(), 3);
}

#[tokio::test]
async fn test_failed_refresh_keeps_showing_stale_entry() {
    let clock = Arc::new(ManualClock::at_epoch());
    let registry = CacheRegistry::with_clock(&SharedStorage::in_memory(), clock.clone());
    let server = Server::new(json!({"members": ["ana"]}));
    registry
        .register(
            server
                .resource("roster")
                .ttl(Duration::from_millis(1000), Duration::from_millis(5000)),
        )
        .unwrap();
    registry.refresh(&key()).await.unwrap();

    clock.advance_millis(2000);
    server.failing.store(true, Ordering::SeqCst);
    let snapshot = registry.snapshot(&key()).unwrap();
    assert_eq!(snapshot.staleness, Staleness::Stale);
    assert!(eventually(|| server.reads() == 2).await);

    // The failed refresh left the entry in place
    let snapshot = registry.snapshot(&key()).unwrap();
    let shown = snapshot.displayable().unwrap();
    assert_eq!(shown.payload(), &json!({"members": ["ana"]}));

    // A blocking refresh surfaces the error to its caller only
    let err = registry.refresh(&key()).await.unwrap_err();
    assert!(err.is_load_error());
}

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch() {
    let registry = CacheRegistry::new(&SharedStorage::in_memory());
    let server = Server::new(json!([1, 2, 3]));
    registry.register(server.resource("roster")).unwrap();

    let loads: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.load(&key()).await })
        })
        .collect();
    for load in loads {
        assert_eq!(load.await.unwrap().unwrap().payload(), &json!([1, 2, 3]));
    }
    assert_eq!(server.reads(), 1);
    assert_eq!(registry.loader_calls(), 1);
}

#[tokio::test]
async fn test_optimistic_update_then_reconcile() {
    let registry = CacheRegistry::new(&SharedStorage::in_memory());
    let server = Server::new(json!({"count": 5, "total": 12}));
    registry.register(server.resource("counter")).unwrap();
    let counter = CacheKey::new("counter", "user-1");

    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&published);
    let _sub = registry.subscribe(&counter, move |entry| sink.lock().unwrap().push(entry.clone()));

    let optimistic = registry.apply(&counter, json!({"count": 5})).unwrap();
    assert_eq!(optimistic.payload(), &json!({"count": 5}));
    assert_eq!(published.lock().unwrap().len(), 1);

    assert!(eventually(|| published.lock().unwrap().len() == 2).await);
    let published = published.lock().unwrap();
    assert_eq!(published[1].payload(), &json!({"count": 5, "total": 12}));
    assert!(published[1].captured_at() > published[0].captured_at());
}

#[tokio::test]
async fn test_contexts_converge_without_echo() {
    let storage = SharedStorage::in_memory();
    let server = Server::new(json!({"title": "draft"}));
    let first = CacheRegistry::new(&storage);
    let second = CacheRegistry::new(&storage);
    first.register(server.resource("doc")).unwrap();
    second.register(server.resource("doc")).unwrap();
    let doc = CacheKey::new("doc", "user-1");

    first.load(&doc).await.unwrap();
    // Second context reads the persisted entry without a fetch
    assert_eq!(second.load(&doc).await.unwrap().payload(), &json!({"title": "draft"}));
    assert_eq!(server.reads(), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = second.subscribe(&doc, move |entry| sink.lock().unwrap().push(entry.payload().clone()));

    let remote = server.clone();
    first
        .apply_with(&doc, json!({"title": "final"}), async move {
            remote.set(json!({"title": "final"}));
            Ok(())
        })
        .await
        .unwrap();

    assert!(eventually(|| seen.lock().unwrap().last() == Some(&json!({"title": "final"}))).await);

    // Let any echo play out, then check the loader has gone quiet
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = server.reads();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.reads(), settled);

    first.shutdown();
    second.shutdown();
}

#[tokio::test]
async fn test_entries_survive_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(json!({"depth": 4}));
    let queue = CacheKey::new("queue", "org-1");

    {
        let registry = CacheRegistry::new(&SharedStorage::on_disk(dir.path().to_path_buf()).unwrap());
        registry.register(server.resource("queue")).unwrap();
        registry.load(&queue).await.unwrap();
        registry.shutdown();
    }

    let registry = CacheRegistry::new(&SharedStorage::on_disk(dir.path().to_path_buf()).unwrap());
    registry.register(server.resource("queue")).unwrap();
    let snapshot = registry.snapshot(&queue).unwrap();
    assert_eq!(snapshot.staleness, Staleness::Fresh);
    assert_eq!(snapshot.displayable().unwrap().payload(), &json!({"depth": 4}));
    assert_eq!(server.reads(), 1);
}

#[tokio::test]
async fn test_sign_out_discards_inflight_fetch() {
    let registry = CacheRegistry::new(&SharedStorage::in_memory());
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = Arc::clone(&gate);
    registry
        .register(ResourceConfig::new(
            "roster",
            loader_fn(move |_| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(json!({"private": true}))
                }
            }),
        ))
        .unwrap();

    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.load(&key()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.clear_scope("org-1");
    release.notify_one();

    assert!(pending.await.unwrap().is_err());
    assert!(registry.age_display(&key()).is_none());
}

#[tokio::test]
async fn test_clearing_one_key_keeps_other_fetches() {
    let registry = CacheRegistry::new(&SharedStorage::in_memory());
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = Arc::clone(&gate);
    registry
        .register(ResourceConfig::new(
            "roster",
            loader_fn(move |_| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(json!({"members": 3}))
                }
            }),
        ))
        .unwrap();
    let events = Server::new(json!([]));
    registry.register(events.resource("events")).unwrap();
    let other = CacheKey::new("events", "org-2");
    registry.load(&other).await.unwrap();

    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.load(&key()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.clear(&other);
    registry.clear_scope("org-2");
    release.notify_one();

    let entry = pending.await.unwrap().unwrap();
    assert_eq!(entry.payload(), &json!({"members": 3}));
    assert!(registry.age_display(&key()).is_some());
    assert!(registry.age_display(&other).is_none());
}
