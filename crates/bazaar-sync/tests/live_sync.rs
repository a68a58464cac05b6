use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde_json::json;

use bazaar_db::Database;
use bazaar_sync::{
    CachedView, ChannelState, MarkerStore, MemoryBackend, NotificationTracker, SyncConfig,
    SyncContext, SyncError, ThumbnailGenerator, ViewHandle,
};
use bazaar_types::{CollectionSpec, NotificationRecord};

struct CountingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ThumbnailGenerator for CountingGenerator {
    async fn generate(&self, source: &str) -> bazaar_sync::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(format!("{}.jpg", source))
    }
}

fn context(backend: &MemoryBackend) -> (SyncContext, Arc<CountingGenerator>) {
    let generator = Arc::new(CountingGenerator {
        calls: AtomicUsize::new(0),
    });
    let markers: Arc<dyn MarkerStore> = Arc::new(Database::open_in_memory().unwrap());
    let ctx = SyncContext::with_generator(
        SyncConfig::default(),
        Arc::new(backend.clone()),
        markers,
        generator.clone(),
    );
    (ctx, generator)
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
}

/// Wait (bounded) for a snapshot satisfying `ready`.
async fn wait_for_view(handle: &mut ViewHandle, ready: impl Fn(&CachedView) -> bool) -> Arc<CachedView> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = handle.current();
            if ready(&view) {
                return view;
            }
            handle.changed().await.expect("dispatcher dropped");
        }
    })
    .await
    .expect("view never reached the expected state")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn expired_all_day_entry_is_deleted_exactly_once() {
    let backend = MemoryBackend::from_seed(&json!({
        "schedules": [
            {"id": "s1", "user_id": "u1", "date": "2024-01-01", "start_time": null},
            {"id": "s2", "user_id": "u1", "date": "2024-01-03", "start_time": null},
        ]
    }))
    .unwrap();
    let (ctx, _) = context(&backend);

    let view = ctx.views.refetch("u1", &CollectionSpec::schedules()).await.unwrap();
    assert_eq!(view.data.len(), 2);

    let now = at("2024-01-02T00:00:01");
    let first = ctx.schedules.sweep_view(&view, now);
    let second = ctx.schedules.sweep_view(&view, now);
    assert_eq!(first.issued, vec!["s1".to_string()]);
    assert!(second.issued.is_empty());
    assert_eq!(second.already_pending, vec!["s1".to_string()]);

    ctx.schedules.drain().await;
    assert_eq!(backend.delete_count("s1"), 1);
    assert_eq!(backend.delete_count("s2"), 0);
    assert_eq!(backend.rows("schedules").len(), 1);
    assert_eq!(ctx.schedules.pending_count(), 0);
}

#[tokio::test]
async fn failed_deletion_is_retried_on_next_pass() {
    let backend = MemoryBackend::from_seed(&json!({
        "schedules": [{"id": "s1", "user_id": "u1", "date": "2024-01-01"}]
    }))
    .unwrap();
    backend.fail_deletes("s1");
    let (ctx, _) = context(&backend);

    let view = ctx.views.refetch("u1", &CollectionSpec::schedules()).await.unwrap();
    let now = at("2024-01-05T08:00:00");

    assert_eq!(ctx.schedules.sweep_view(&view, now).issued.len(), 1);
    ctx.schedules.drain().await;
    assert_eq!(backend.rows("schedules").len(), 1);

    backend.allow_deletes("s1");
    assert_eq!(ctx.schedules.sweep_view(&view, now).issued.len(), 1);
    ctx.schedules.drain().await;
    assert!(backend.rows("schedules").is_empty());
    assert_eq!(backend.delete_count("s1"), 2);
}

#[tokio::test]
async fn watched_schedule_view_sweeps_on_load() {
    let backend = MemoryBackend::from_seed(&json!({
        "schedules": [
            {"id": "old", "user_id": "u1", "date": "2020-01-01"},
            {"id": "future", "user_id": "u1", "date": "2999-01-01", "start_time": "10:00"},
        ]
    }))
    .unwrap();
    let (ctx, _) = context(&backend);

    let mounted = ctx.views.mount("u1", &CollectionSpec::schedules());
    let sweeping = ctx.schedules.watch(mounted.handle().clone());

    wait_until(|| backend.rows("schedules").len() == 1).await;
    assert_eq!(backend.delete_count("old"), 1);
    assert_eq!(backend.delete_count("future"), 0);

    ctx.views.unmount(mounted);
    sweeping.abort();
}

#[tokio::test]
async fn concurrent_product_views_share_one_fetch() {
    let backend = MemoryBackend::from_seed(&json!({
        "products": [{"id": "p1", "title": "Lamp"}, {"id": "p2", "title": "Chair"}]
    }))
    .unwrap();
    backend.set_latency(Duration::from_millis(50));
    let (ctx, _) = context(&backend);
    let spec = CollectionSpec::products();

    let (a, b) = tokio::join!(ctx.views.refetch("u1", &spec), ctx.views.refetch("u1", &spec));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(backend.query_count("products"), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a.data, &ctx.views.get_view("u1", &spec).data));
    assert_eq!(a.data.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn focus_within_window_does_not_refetch() {
    let backend = MemoryBackend::from_seed(&json!({"favorites": [{"id": "f1", "user_id": "u1"}]})).unwrap();
    let (ctx, _) = context(&backend);
    let spec = CollectionSpec::favorites();

    ctx.views.on_focus("u1", &spec).await.unwrap();
    tokio::time::advance(Duration::from_secs(60)).await;
    ctx.views.on_focus("u1", &spec).await.unwrap();
    assert_eq!(backend.query_count("favorites"), 1);

    tokio::time::advance(Duration::from_secs(241)).await;
    ctx.views.on_focus("u1", &spec).await.unwrap();
    assert_eq!(backend.query_count("favorites"), 2);
}

#[tokio::test]
async fn change_event_refreshes_mounted_view() {
    let backend = MemoryBackend::from_seed(&json!({"favorites": [{"id": "f1", "user_id": "u1"}]})).unwrap();
    let (ctx, _) = context(&backend);
    let spec = CollectionSpec::favorites();

    let mounted = ctx.views.mount("u1", &spec);
    let mut handle = mounted.handle().clone();
    wait_for_view(&mut handle, |v| v.has_loaded() && !v.is_loading).await;

    let mut state = ctx.channels.watch_state("favorites").unwrap();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ChannelState::Open))
        .await
        .unwrap()
        .unwrap();

    // Another user's row is still a change on the table; the view refetches
    // and keeps only its owner's rows.
    backend.insert("favorites", json!({"id": "f2", "user_id": "u2"}));
    backend.insert("favorites", json!({"id": "f3", "user_id": "u1"}));

    let view = wait_for_view(&mut handle, |v| v.data.len() == 2 && !v.is_loading).await;
    assert!(view.last_error.is_none());
    assert!(backend.query_count("favorites") >= 2);

    ctx.views.unmount(mounted);
    assert!(ctx.channels.open_channels().is_empty());
}

#[tokio::test]
async fn views_on_one_table_share_a_channel() {
    let backend = MemoryBackend::new();
    let (ctx, _) = context(&backend);

    let all = ctx.views.mount("u1", &CollectionSpec::products());
    let mine = ctx.views.mount("u1", &CollectionSpec::seller_products());
    assert_eq!(ctx.channels.open_channels(), vec!["products".to_string()]);
    assert_eq!(ctx.channels.subscriber_count("products"), 2);

    wait_until(|| backend.open_feed_count("products") == 1).await;
    assert_eq!(backend.subscribe_count("products"), 1);

    ctx.views.unmount(all);
    assert_eq!(ctx.channels.subscriber_count("products"), 1);
    ctx.views.unmount(mine);
    wait_until(|| backend.open_feed_count("products") == 0).await;
}

#[tokio::test]
async fn failed_refresh_keeps_previous_rows() {
    let backend = MemoryBackend::from_seed(&json!({"orders": [{"id": "o1", "buyer_id": "u1"}]})).unwrap();
    let (ctx, _) = context(&backend);
    let spec = CollectionSpec::orders();

    ctx.views.refetch("u1", &spec).await.unwrap();
    backend.fail_queries("orders", 1);

    let err = ctx.views.refetch("u1", &spec).await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { .. }));

    let view = ctx.views.get_view("u1", &spec);
    assert_eq!(view.data.len(), 1);
    assert_eq!(view.last_error, Some(err));
    assert!(!view.is_loading);
}

#[tokio::test]
async fn acknowledgement_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let now = Utc::now();
    let window = chrono::Duration::hours(24);
    let seen = NotificationRecord {
        id: "n1".into(),
        triggered_at: now - chrono::Duration::hours(1),
        acknowledged: false,
    };
    let unseen = NotificationRecord {
        id: "n2".into(),
        ..seen.clone()
    };

    {
        let tracker = NotificationTracker::new(Arc::new(Database::open(&path).unwrap()), window);
        tracker.track(&seen, now).await;
        tracker.track(&unseen, now).await;
        tracker.acknowledge("n1").await.unwrap();
        tracker.teardown();
    }

    let tracker = NotificationTracker::new(Arc::new(Database::open(&path).unwrap()), window);
    tracker.track(&seen, now).await;
    tracker.track(&unseen, now).await;
    assert!(!tracker.is_new("n1"));
    assert!(tracker.is_new("n2"));
    tracker.teardown();
}

#[tokio::test]
async fn thumbnails_are_generated_once_per_source() {
    let (ctx, generator) = context(&MemoryBackend::new());

    let results = futures_util::future::join_all((0..5).map(|_| ctx.thumbnails.get_or_generate("clip.mp4"))).await;
    assert!(results.iter().all(|r| r.as_deref() == Ok("clip.mp4.jpg")));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    ctx.thumbnails.get_or_generate("clip.mp4").await.unwrap();
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_closes_channels_and_timers() {
    let backend = MemoryBackend::new();
    let (ctx, _) = context(&backend);
    let now = Utc::now();

    let _mounted = ctx.views.mount("u1", &CollectionSpec::balances());
    ctx.notifications
        .track(
            &NotificationRecord {
                id: "n1".into(),
                triggered_at: now,
                acknowledged: false,
            },
            now,
        )
        .await;
    assert_eq!(ctx.notifications.armed_timers(), 1);

    ctx.shutdown().await;
    assert!(ctx.channels.open_channels().is_empty());
    assert_eq!(ctx.notifications.armed_timers(), 0);
}
