/// Drives the namespace watch coordinator against the in-memory cluster
use kubemirror::k8s::cache::{
    notification_channel, CacheNotification, MemoryCache, Watch, WatchConfig,
};
use kubemirror::k8s::cluster::{ApiResourceDescriptor, FakeClusterClient};
use kubemirror::k8s::object::{CacheKey, Object};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn resource(group: &str, kind: &str, plural: &str) -> ApiResourceDescriptor {
    ApiResourceDescriptor {
        group: group.to_string(),
        version: "v1".to_string(),
        kind: kind.to_string(),
        resource: plural.to_string(),
        namespaced: true,
        verbs: vec!["list".to_string(), "watch".to_string()],
        categories: vec!["all".to_string()],
    }
}

fn deployments() -> ApiResourceDescriptor {
    resource("apps", "Deployment", "deployments")
}

fn services() -> ApiResourceDescriptor {
    resource("", "Service", "services")
}

fn deployment(name: &str) -> Object {
    Object::new("apps/v1", "Deployment", "default", name)
}

fn fast_config() -> WatchConfig {
    WatchConfig {
        max_restarts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        restart_delay: Duration::from_millis(10),
    }
}

async fn next_notification(rx: &mut mpsc::Receiver<CacheNotification>, secs: u64, what: &str) {
    match timeout(Duration::from_secs(secs), rx.recv()).await {
        Ok(Some(_)) => {}
        Ok(None) => panic!("notification channel closed waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what} to notify"),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Give the handlers time to act, then check nothing else was notified
async fn assert_quiet(rx: &mut mpsc::Receiver<CacheNotification>, after: &str) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "extra notification after {after}");
}

fn count(cache: &MemoryCache) -> usize {
    cache
        .retrieve(&CacheKey::namespace("default"))
        .expect("retrieve failed")
        .len()
}

#[tokio::test]
async fn test_watch_mirrors_create_and_update() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![deployment("deploy3")]).unwrap();

    let done = CancellationToken::new();
    let (notifications, mut rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());

    let stop = watch.start().await.unwrap();

    next_notification(&mut rx, 2, "initial object").await;
    assert_eq!(count(&cache), 1);
    assert_quiet(&mut rx, "seed").await;

    let mut obj = deployment("deploy2");
    cluster.create(obj.clone()).unwrap();
    next_notification(&mut rx, 10, "create object").await;
    assert_eq!(count(&cache), 2);
    assert_quiet(&mut rx, "create").await;

    let annotations = BTreeMap::from([("update".to_string(), "update".to_string())]);
    obj.set_annotations(annotations.clone());
    cluster.update(obj.clone()).unwrap();
    next_notification(&mut rx, 2, "update object").await;
    assert_quiet(&mut rx, "update").await;

    let found = cache.retrieve(&CacheKey::namespace("default")).unwrap();
    assert_eq!(found.len(), 2);

    let target = obj.identity().unwrap();
    let updated = found
        .iter()
        .find(|o| o.identity().is_ok_and(|id| id == target))
        .expect("unable to find object from fetched results");
    assert_eq!(updated.annotations(), annotations);

    done.cancel();
    stop.stop().await;
}

#[tokio::test]
async fn test_watch_mirrors_delete() {
    let cluster = FakeClusterClient::new(
        vec![deployments()],
        vec![deployment("a"), deployment("b")],
    )
    .unwrap();

    let done = CancellationToken::new();
    let (notifications, mut rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    next_notification(&mut rx, 2, "seed").await;
    assert_eq!(count(&cache), 2);
    assert_quiet(&mut rx, "seed").await;

    cluster.delete(&deployment("a").identity().unwrap()).unwrap();
    next_notification(&mut rx, 2, "delete").await;
    assert_quiet(&mut rx, "delete").await;

    let found = cache.retrieve(&CacheKey::namespace("default")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name(), Some("b"));

    done.cancel();
    stop.stop().await;
}

#[tokio::test]
async fn test_stop_completes_and_is_idempotent() {
    let cluster = FakeClusterClient::new(
        vec![deployments(), services()],
        vec![deployment("deploy3")],
    )
    .unwrap();

    let done = CancellationToken::new();
    let (notifications, _rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache, fast_config());

    let stop = watch.start().await.unwrap();
    assert!(!stop.is_stopped());

    let stopped = timeout(Duration::from_secs(2), async {
        done.cancel();
        stop.stop().await;
    })
    .await;
    assert!(stopped.is_ok(), "timed out waiting for watchers to stop");
    assert!(stop.is_stopped());
    assert_eq!(cluster.active_watches(), 0);

    timeout(Duration::from_millis(100), stop.stop())
        .await
        .expect("second stop should return immediately");
}

#[tokio::test]
async fn test_stop_releases_handler_blocked_on_notification() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![deployment("deploy3")]).unwrap();

    let done = CancellationToken::new();
    let (notifications, _rx) = notification_channel(done);
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    // nobody reads, so the handler parks delivering the seed notification
    wait_until("seed to be stored", || count(&cache) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.active_watches(), 0);

    timeout(Duration::from_secs(2), stop.stop())
        .await
        .expect("stop blocked behind an undelivered notification");
    assert!(stop.is_stopped());
}

#[tokio::test]
async fn test_handler_waits_for_consumer_between_events() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![]).unwrap();

    let done = CancellationToken::new();
    let (notifications, mut rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    wait_until("watch to open", || cluster.active_watches() == 1).await;
    cluster.create(deployment("one")).unwrap();
    cluster.create(deployment("two")).unwrap();

    // the second event stays unapplied while the first notification is unread
    wait_until("first create", || count(&cache) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count(&cache), 1);

    next_notification(&mut rx, 2, "first create").await;
    next_notification(&mut rx, 2, "second create").await;
    assert_eq!(count(&cache), 2);
    assert_quiet(&mut rx, "second create").await;

    done.cancel();
    stop.stop().await;
}

#[tokio::test]
async fn test_discovery_failure_leaves_watch_idle() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![deployment("deploy3")]).unwrap();
    cluster.fail_discovery(true);

    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());

    assert!(watch.start().await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.active_watches(), 0);
    assert!(cache.is_empty().unwrap());

    // still idle, so a later start goes through
    cluster.fail_discovery(false);
    let stop = watch.start().await.unwrap();
    wait_until("seed", || count(&cache) == 1).await;
    stop.stop().await;
}

#[tokio::test]
async fn test_failed_seed_skips_only_that_type() {
    let cluster = FakeClusterClient::new(
        vec![deployments(), services()],
        vec![
            deployment("deploy3"),
            Object::new("v1", "Service", "default", "svc"),
        ],
    )
    .unwrap();
    cluster.fail_list("services");

    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    wait_until("deployment watch", || cluster.active_watches() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.active_watches(), 1);

    let found = cache.retrieve(&CacheKey::namespace("default")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind(), Some("Deployment"));

    stop.stop().await;
}

#[tokio::test]
async fn test_dropped_stream_is_reopened() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![deployment("deploy3")]).unwrap();

    let done = CancellationToken::new();
    let (notifications, mut rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    next_notification(&mut rx, 2, "seed").await;
    wait_until("watch to open", || cluster.active_watches() == 1).await;

    cluster.disconnect_watchers();
    cluster.create(deployment("while-disconnected")).unwrap();

    next_notification(&mut rx, 2, "replayed create").await;
    assert_eq!(count(&cache), 2);
    wait_until("watch to reopen", || cluster.active_watches() == 1).await;

    done.cancel();
    stop.stop().await;
}

#[tokio::test]
async fn test_expired_resume_point_relists() {
    let cluster = FakeClusterClient::new(
        vec![deployments()],
        vec![deployment("deploy3"), deployment("doomed")],
    )
    .unwrap();

    let done = CancellationToken::new();
    let (notifications, mut rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));
    let config = WatchConfig {
        restart_delay: Duration::from_millis(200),
        ..fast_config()
    };
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), config);
    let stop = watch.start().await.unwrap();

    next_notification(&mut rx, 2, "seed").await;
    assert_eq!(count(&cache), 2);
    wait_until("watch to open", || cluster.active_watches() == 1).await;

    // the delete happens unobserved and its history is gone before the handler reconnects
    cluster.disconnect_watchers();
    cluster.delete(&deployment("doomed").identity().unwrap()).unwrap();
    cluster.compact();

    next_notification(&mut rx, 3, "relist").await;
    let found = cache.retrieve(&CacheKey::namespace("default")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name(), Some("deploy3"));

    done.cancel();
    stop.stop().await;
}

#[tokio::test]
async fn test_second_start_is_rejected_until_stopped() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![]).unwrap();
    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster), cache, fast_config());

    let stop = watch.start().await.unwrap();
    assert!(watch.start().await.is_err());

    stop.stop().await;
    let stop = watch.start().await.unwrap();
    stop.stop().await;
}

#[tokio::test]
async fn test_stale_stop_handle_leaves_newer_session_running() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![]).unwrap();
    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache, fast_config());

    let first = watch.start().await.unwrap();
    first.stop().await;

    let second = watch.start().await.unwrap();
    wait_until("second session watch", || cluster.active_watches() == 1).await;

    // repeating the old stop, or dropping the old handle, is a no-op
    first.stop().await;
    drop(first);
    assert!(watch.start().await.is_err());
    assert!(!second.is_stopped());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.active_watches(), 1);

    second.stop().await;
    assert_eq!(cluster.active_watches(), 0);
}

#[tokio::test]
async fn test_restart_picks_up_new_resource_types() {
    let cluster = FakeClusterClient::new(
        vec![deployments()],
        vec![
            deployment("deploy3"),
            Object::new("v1", "Service", "default", "svc"),
        ],
    )
    .unwrap();
    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());

    let stop = watch.start().await.unwrap();
    wait_until("deployments", || count(&cache) == 1).await;
    stop.stop().await;

    cluster.set_resources(vec![deployments(), services()]);
    let stop = watch.start().await.unwrap();
    wait_until("services after restart", || count(&cache) == 2).await;
    wait_until("both watches", || cluster.active_watches() == 2).await;
    stop.stop().await;
}

#[tokio::test]
async fn test_unnotified_cache_never_blocks() {
    let cluster = FakeClusterClient::new(vec![deployments()], vec![deployment("deploy3")]).unwrap();
    let cache = Arc::new(MemoryCache::new());
    let watch = Watch::with_config("default", Arc::new(cluster.clone()), cache.clone(), fast_config());
    let stop = watch.start().await.unwrap();

    wait_until("watch to open", || cluster.active_watches() == 1).await;
    for i in 0..20 {
        cluster.create(deployment(&format!("d{i}"))).unwrap();
    }
    wait_until("all creates", || count(&cache) == 21).await;

    stop.stop().await;
}
