//! View refresh dispatcher.
//!
//! Owns the last known snapshot of every (owner, collection) view and is the
//! single place that re-fetches them. Focus (pull) and change events (push)
//! feed the same coalescing fetch path: at most one fetch per view is in
//! flight, later triggers join it. Focus respects the freshness window; change
//! events and manual refetches bypass it. A failed fetch keeps the previous
//! data and only records `last_error`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bazaar_types::{ChangeEvent, CollectionSpec, Record};

use crate::backend::{Backend, Filter};
use crate::channels::{ChannelManager, SubscriptionHandle};
use crate::error::{Result, SyncError};
use crate::flight::{Flight, is_settled, spawn_flight};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub owner: String,
    pub collection: CollectionSpec,
}

impl ViewKey {
    pub fn new(owner: impl Into<String>, collection: CollectionSpec) -> Self {
        Self {
            owner: owner.into(),
            collection,
        }
    }
}

/// Immutable snapshot of a view. Every refresh publishes a new one.
#[derive(Debug, Clone)]
pub struct CachedView {
    pub key: ViewKey,
    pub data: Arc<Vec<Record>>,
    pub is_loading: bool,
    pub last_error: Option<SyncError>,
    /// Wall-clock time of the last successful fetch.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Bumped on every publish.
    pub version: u64,
}

impl CachedView {
    fn empty(key: ViewKey) -> Self {
        Self {
            key,
            data: Arc::new(Vec::new()),
            is_loading: false,
            last_error: None,
            fetched_at: None,
            version: 0,
        }
    }

    fn loading(&self) -> Self {
        Self {
            is_loading: true,
            version: self.version + 1,
            ..self.clone()
        }
    }

    fn succeeded(&self, rows: Vec<Record>) -> Self {
        Self {
            key: self.key.clone(),
            data: Arc::new(rows),
            is_loading: false,
            last_error: None,
            fetched_at: Some(Utc::now()),
            version: self.version + 1,
        }
    }

    fn failed(&self, error: SyncError) -> Self {
        Self {
            is_loading: false,
            last_error: Some(error),
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn has_loaded(&self) -> bool {
        self.fetched_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Screen became visible; skipped while the view is fresh.
    Focus,
    /// Backend reported a mutation; always fetches.
    Change,
    /// Explicit user retry; always fetches.
    Manual,
}

struct ViewSlot {
    tx: watch::Sender<Arc<CachedView>>,
    fresh_until: Option<Instant>,
    in_flight: Option<Flight<Arc<CachedView>>>,
}

impl ViewSlot {
    fn new(key: &ViewKey) -> Self {
        let (tx, _) = watch::channel(Arc::new(CachedView::empty(key.clone())));
        Self {
            tx,
            fresh_until: None,
            in_flight: None,
        }
    }

    fn current(&self) -> Arc<CachedView> {
        Arc::clone(&self.tx.borrow())
    }
}

#[derive(Clone)]
pub struct ViewDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    backend: Arc<dyn Backend>,
    channels: ChannelManager,
    freshness_window: Duration,
    slots: Mutex<HashMap<ViewKey, ViewSlot>>,
}

impl DispatcherInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<ViewKey, ViewSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ViewDispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        channels: ChannelManager,
        freshness_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                backend,
                channels,
                freshness_window,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Last known snapshot, possibly empty. Never fetches.
    pub fn get_view(&self, owner: &str, spec: &CollectionSpec) -> Arc<CachedView> {
        let key = ViewKey::new(owner, spec.clone());
        let mut slots = self.inner.slots();
        slots.entry(key.clone()).or_insert_with(|| ViewSlot::new(&key)).current()
    }

    pub fn handle(&self, owner: &str, spec: &CollectionSpec) -> ViewHandle {
        let key = ViewKey::new(owner, spec.clone());
        let rx = {
            let mut slots = self.inner.slots();
            slots
                .entry(key.clone())
                .or_insert_with(|| ViewSlot::new(&key))
                .tx
                .subscribe()
        };
        ViewHandle {
            dispatcher: self.clone(),
            key,
            rx,
        }
    }

    /// Revalidate on focus. Returns the current snapshot without fetching
    /// while it is fresh.
    pub async fn on_focus(&self, owner: &str, spec: &CollectionSpec) -> Result<Arc<CachedView>> {
        self.refresh(ViewKey::new(owner, spec.clone()), Trigger::Focus).await
    }

    /// Unconditional refetch, joining one already in flight.
    pub async fn refetch(&self, owner: &str, spec: &CollectionSpec) -> Result<Arc<CachedView>> {
        self.refresh(ViewKey::new(owner, spec.clone()), Trigger::Manual).await
    }

    /// Force a refetch of every known view on `table`, then wait for them.
    pub async fn on_change_event(&self, table: &str) -> Vec<Result<Arc<CachedView>>> {
        let flights = self.invalidate(table);
        join_all(flights).await
    }

    /// Start a forced refetch of every known view on `table` without waiting.
    pub fn invalidate(&self, table: &str) -> Vec<Flight<Arc<CachedView>>> {
        let keys: Vec<ViewKey> = self
            .inner
            .slots()
            .keys()
            .filter(|k| k.collection.table == table)
            .cloned()
            .collect();

        keys.iter()
            .filter_map(|key| self.start_refresh(key, Trigger::Change))
            .collect()
    }

    pub async fn refresh(&self, key: ViewKey, trigger: Trigger) -> Result<Arc<CachedView>> {
        match self.start_refresh(&key, trigger) {
            Some(flight) => flight.await,
            None => Ok(self.get_view(&key.owner, &key.collection)),
        }
    }

    /// Mount a view: subscribe to its table's change channel and kick off the
    /// initial load. Change events refetch only this view, and stop doing so
    /// once it is unmounted.
    pub fn mount(&self, owner: &str, spec: &CollectionSpec) -> ViewSubscription {
        let handle = self.handle(owner, spec);
        let key = handle.key.clone();

        let weak: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        let watched = key.clone();
        let subscription = self.inner.channels.subscribe(spec, move |event: &ChangeEvent| {
            let Some(inner) = weak.upgrade() else { return };
            debug!(
                "{:?} on {} -> refetching {} for {}",
                event.kind, event.table, watched.collection, watched.owner
            );
            let dispatcher = ViewDispatcher { inner };
            // Flight runs on its own task; nothing to await here.
            let _ = dispatcher.start_refresh(&watched, Trigger::Change);
        });

        let _ = self.start_refresh(&key, Trigger::Focus);
        info!("Mounted {} for {}", key.collection, key.owner);

        ViewSubscription {
            handle,
            subscription,
        }
    }

    /// Release a mounted view. A fetch already in flight still completes and
    /// publishes; only fetches from future events are cancelled.
    pub fn unmount(&self, view: ViewSubscription) {
        let ViewSubscription {
            handle,
            subscription,
        } = view;
        self.inner.channels.unsubscribe(subscription);
        info!("Unmounted {} for {}", handle.key.collection, handle.key.owner);
    }

    /// Kick off a fetch for `key` unless one can be skipped or joined.
    /// Returns `None` when the view is fresh and the trigger respects freshness.
    pub fn start_refresh(&self, key: &ViewKey, trigger: Trigger) -> Option<Flight<Arc<CachedView>>> {
        let mut slots = self.inner.slots();
        let slot = slots.entry(key.clone()).or_insert_with(|| ViewSlot::new(key));

        if let Some(flight) = slot.in_flight.as_ref().filter(|f| !is_settled(f)) {
            debug!("Joining in-flight fetch of {} for {}", key.collection, key.owner);
            return Some(flight.clone());
        }

        if trigger == Trigger::Focus && slot.fresh_until.is_some_and(|until| Instant::now() < until) {
            debug!("{} for {} is fresh, skipping fetch", key.collection, key.owner);
            return None;
        }

        let loading = slot.current().loading();
        slot.tx.send_replace(Arc::new(loading));

        let flight = spawn_flight(fetch(self.inner.clone(), key.clone(), trigger));
        slot.in_flight = Some(flight.clone());
        Some(flight)
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }
}

async fn fetch(inner: Arc<DispatcherInner>, key: ViewKey, trigger: Trigger) -> Result<Arc<CachedView>> {
    let filter = Filter::for_owner(&key.collection, &key.owner);
    let result = inner.backend.query(&key.collection.table, &filter).await;

    let mut slots = inner.slots();
    let slot = slots.entry(key.clone()).or_insert_with(|| ViewSlot::new(&key));
    slot.in_flight = None;
    let previous = slot.current();

    match result {
        Ok(rows) => {
            slot.fresh_until = Some(Instant::now() + inner.freshness_window);
            let view = Arc::new(previous.succeeded(rows));
            slot.tx.send_replace(view.clone());
            info!(
                "Refreshed {} for {} ({} rows, {:?})",
                key.collection,
                key.owner,
                view.data.len(),
                trigger
            );
            Ok(view)
        }
        Err(e) => {
            let error = SyncError::Fetch {
                collection: key.collection.to_string(),
                owner: key.owner.clone(),
                reason: e.to_string(),
            };
            warn!("{} (keeping {} cached rows)", error, previous.data.len());
            slot.tx.send_replace(Arc::new(previous.failed(error.clone())));
            Err(error)
        }
    }
}

/// What a screen holds: `data`, `is_loading`, `last_error` and `refetch()`.
#[derive(Clone)]
pub struct ViewHandle {
    dispatcher: ViewDispatcher,
    key: ViewKey,
    rx: watch::Receiver<Arc<CachedView>>,
}

impl ViewHandle {
    pub fn key(&self) -> &ViewKey {
        &self.key
    }

    pub fn current(&self) -> Arc<CachedView> {
        Arc::clone(&self.rx.borrow())
    }

    pub fn data(&self) -> Arc<Vec<Record>> {
        self.current().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.rx.borrow().is_loading
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.rx.borrow().last_error.clone()
    }

    pub async fn refetch(&self) -> Result<Arc<CachedView>> {
        self.dispatcher.refresh(self.key.clone(), Trigger::Manual).await
    }

    pub async fn focus(&self) -> Result<Arc<CachedView>> {
        self.dispatcher.refresh(self.key.clone(), Trigger::Focus).await
    }

    /// Wait for the next published snapshot. `None` once the dispatcher is gone.
    pub async fn changed(&mut self) -> Option<Arc<CachedView>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}

/// A mounted view; hand it back to [`ViewDispatcher::unmount`].
pub struct ViewSubscription {
    handle: ViewHandle,
    subscription: SubscriptionHandle,
}

impl ViewSubscription {
    pub fn handle(&self) -> &ViewHandle {
        &self.handle
    }
}
