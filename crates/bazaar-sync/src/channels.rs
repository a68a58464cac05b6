//! Change channel manager.
//!
//! One physical change feed per watched table, shared by every subscriber of
//! that table. Each channel is pumped by a single task, so events reach the
//! subscribers in the order the backend emitted them. A dropped transport is
//! re-established with capped exponential backoff, after which subscribers get
//! a `Resync`; a channel that exhausts its attempts is marked failed and left stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bazaar_types::{ChangeEvent, ChangeFilter, CollectionSpec};

use crate::backend::Backend;
use crate::config::ReconnectPolicy;

/// Callback invoked for every change event on a subscribed table.
pub type OnChange = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; no further events will arrive.
    Failed,
    Closed,
}

/// Returned by [`ChannelManager::subscribe`]; pass it back to unsubscribe.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    table: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

type Subscribers = Arc<RwLock<Vec<(u64, OnChange)>>>;

struct Channel {
    subscribers: Subscribers,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelManagerInner>,
}

struct ChannelManagerInner {
    backend: Arc<dyn Backend>,
    policy: ReconnectPolicy,
    /// table -> channel
    channels: Mutex<HashMap<String, Channel>>,
    next_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(backend: Arc<dyn Backend>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(ChannelManagerInner {
                backend,
                policy,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch `spec`'s table. Opens the physical channel if this is its first
    /// subscriber, otherwise joins the existing one. Must be called inside a
    /// tokio runtime.
    pub fn subscribe<F>(&self, spec: &CollectionSpec, on_change: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let table = spec.table.clone();
        let on_change: OnChange = Arc::new(on_change);

        let mut channels = self.channels();
        match channels.get_mut(&table) {
            Some(channel) => {
                write_subscribers(&channel.subscribers).push((id, on_change));
                if channel.task.is_finished() {
                    info!("Reopening change channel for {} after it stopped", table);
                    let (state, cancel, task) = self.spawn_pump(&table, channel.subscribers.clone());
                    channel.state = state;
                    channel.cancel = cancel;
                    channel.task = task;
                }
                debug!(
                    "Joined change channel for {} ({} subscribers)",
                    table,
                    read_subscribers(&channel.subscribers).len()
                );
            }
            None => {
                let subscribers: Subscribers = Arc::new(RwLock::new(vec![(id, on_change)]));
                let (state, cancel, task) = self.spawn_pump(&table, subscribers.clone());
                channels.insert(
                    table.clone(),
                    Channel {
                        subscribers,
                        state,
                        cancel,
                        task,
                    },
                );
                info!("Opened change channel for {}", table);
            }
        }

        SubscriptionHandle { id, table }
    }

    /// Drop a subscription. Closes the physical channel when it was the last one.
    /// Returns false if the handle was already released.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels.get(&handle.table) else {
            return false;
        };

        let remaining = {
            let mut subscribers = write_subscribers(&channel.subscribers);
            let before = subscribers.len();
            subscribers.retain(|(id, _)| *id != handle.id);
            if subscribers.len() == before {
                return false;
            }
            subscribers.len()
        };

        if remaining == 0 {
            if let Some(channel) = channels.remove(&handle.table) {
                channel.cancel.cancel();
                info!("Closed change channel for {}", handle.table);
            }
        }
        true
    }

    pub fn state(&self, table: &str) -> Option<ChannelState> {
        self.channels().get(table).map(|c| *c.state.borrow())
    }

    /// Receiver that observes `table`'s connection state changes.
    pub fn watch_state(&self, table: &str) -> Option<watch::Receiver<ChannelState>> {
        self.channels().get(table).map(|c| c.state.clone())
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        self.channels()
            .get(table)
            .map_or(0, |c| read_subscribers(&c.subscribers).len())
    }

    pub fn open_channels(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.channels().keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Close every channel and forget all subscribers.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Channel)> = self.channels().drain().collect();
        for (table, channel) in drained {
            channel.cancel.cancel();
            debug!("Closed change channel for {} on shutdown", table);
        }
    }

    fn spawn_pump(
        &self,
        table: &str,
        subscribers: Subscribers,
    ) -> (watch::Receiver<ChannelState>, CancellationToken, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_channel(
            self.inner.backend.clone(),
            self.inner.policy,
            table.to_string(),
            subscribers,
            state_tx,
            cancel.clone(),
        ));
        (state_rx, cancel, task)
    }
}

/// Connect, pump, and reconnect until cancelled or out of attempts.
async fn run_channel(
    backend: Arc<dyn Backend>,
    policy: ReconnectPolicy,
    table: String,
    subscribers: Subscribers,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            if policy.exhausted(attempt) {
                error!(
                    "Change channel for {} failed after {} reconnect attempts; views stay stale",
                    table,
                    attempt - 1
                );
                state.send_replace(ChannelState::Failed);
                return;
            }

            let delay = policy.delay_for(attempt);
            state.send_replace(ChannelState::Reconnecting { attempt });
            debug!("Reconnecting {} in {:?} (attempt {})", table, delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => break,
            result = backend.subscribe_changes(&table, ChangeFilter::All) => result,
        };

        let mut feed = match subscribed {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Subscribing to {} failed: {}", table, e);
                attempt += 1;
                continue;
            }
        };

        let reconnected = attempt > 0;
        attempt = 0;
        state.send_replace(ChannelState::Open);
        if reconnected {
            // Events emitted while the transport was down are lost.
            info!("Change channel for {} re-established", table);
            deliver(&subscribers, &ChangeEvent::resync(table.as_str()));
        }

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    state.send_replace(ChannelState::Closed);
                    return;
                }
                received = feed.recv() => received,
            };

            match received {
                Ok(event) => deliver(&subscribers, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Change channel for {} lagged by {} events", table, n);
                    deliver(&subscribers, &ChangeEvent::resync(table.as_str()));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Change channel for {} dropped", table);
                    break;
                }
            }
        }

        attempt = 1;
    }

    state.send_replace(ChannelState::Closed);
}

fn deliver(subscribers: &Subscribers, event: &ChangeEvent) {
    // Snapshot so callbacks may (un)subscribe without deadlocking.
    let callbacks: Vec<OnChange> = read_subscribers(subscribers)
        .iter()
        .map(|(_, cb)| cb.clone())
        .collect();
    for callback in callbacks {
        callback(event);
    }
}

fn read_subscribers(
    subscribers: &Subscribers,
) -> std::sync::RwLockReadGuard<'_, Vec<(u64, OnChange)>> {
    subscribers.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_subscribers(
    subscribers: &Subscribers,
) -> std::sync::RwLockWriteGuard<'_, Vec<(u64, OnChange)>> {
    subscribers.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use bazaar_types::ChangeKind;
    use serde_json::json;
    use std::time::Duration;

    fn manager(backend: &MemoryBackend) -> ChannelManager {
        ChannelManager::new(
            Arc::new(backend.clone()),
            ReconnectPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_attempts: Some(3),
            },
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event: &ChangeEvent| sink.lock().unwrap().push(event.clone()))
    }

    async fn wait_for_state(manager: &ChannelManager, table: &str, wanted: ChannelState) {
        let mut rx = manager.watch_state(table).unwrap();
        rx.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[tokio::test]
    async fn shared_table_opens_one_physical_channel() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);

        let first = manager.subscribe(&CollectionSpec::products(), |_| {});
        let second = manager.subscribe(&CollectionSpec::seller_products(), |_| {});
        wait_for_state(&manager, "products", ChannelState::Open).await;

        assert_eq!(backend.subscribe_count("products"), 1);
        assert_eq!(manager.subscriber_count("products"), 2);

        assert!(manager.unsubscribe(first));
        assert_eq!(manager.open_channels(), vec!["products".to_string()]);

        assert!(manager.unsubscribe(second));
        assert!(manager.open_channels().is_empty());
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let (seen, on_change) = recorder();

        let _handle = manager.subscribe(&CollectionSpec::favorites(), on_change);
        wait_for_state(&manager, "favorites", ChannelState::Open).await;

        backend.insert("favorites", json!({"id": "f1", "user_id": "u1"}));
        backend.update("favorites", "f1", json!({"note": "x"}));
        backend.remove("favorites", "f1");

        for _ in 0..50 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_the_feed() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);

        let handle = manager.subscribe(&CollectionSpec::balances(), |_| {});
        wait_for_state(&manager, "balances", ChannelState::Open).await;
        assert_eq!(backend.open_feed_count("balances"), 1);

        manager.unsubscribe(handle);
        for _ in 0..50 {
            if backend.open_feed_count("balances") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.open_feed_count("balances"), 0);
    }

    #[tokio::test]
    async fn double_unsubscribe_is_rejected() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);

        let handle = manager.subscribe(&CollectionSpec::orders(), |_| {});
        let stale = SubscriptionHandle {
            id: handle.id(),
            table: handle.table().to_string(),
        };
        assert!(manager.unsubscribe(handle));
        assert!(!manager.unsubscribe(stale));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_transport_is_reestablished() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let (seen, on_change) = recorder();

        let _handle = manager.subscribe(&CollectionSpec::schedules(), on_change);
        wait_for_state(&manager, "schedules", ChannelState::Open).await;

        backend.disconnect("schedules");
        wait_for_state(&manager, "schedules", ChannelState::Reconnecting { attempt: 1 }).await;
        wait_for_state(&manager, "schedules", ChannelState::Open).await;
        assert_eq!(backend.subscribe_count("schedules"), 2);

        backend.insert("schedules", json!({"id": "s1", "user_id": "u1"}));
        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Resync, ChangeKind::Insert]);
    }

    #[tokio::test]
    async fn lagging_feed_delivers_resync() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let (seen, on_change) = recorder();

        let _handle = manager.subscribe(&CollectionSpec::orders(), on_change);
        wait_for_state(&manager, "orders", ChannelState::Open).await;

        // More than the feed buffers, emitted before the pump runs again.
        for i in 0..100 {
            backend.insert("orders", json!({"id": format!("o{}", i), "buyer_id": "u1"}));
        }

        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 65 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].kind, ChangeKind::Resync);
        assert_eq!(seen[0].table, "orders");
        assert_eq!(seen.iter().filter(|e| e.kind == ChangeKind::Resync).count(), 1);
        assert_eq!(seen.iter().filter(|e| e.kind == ChangeKind::Insert).count(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_mark_channel_failed() {
        let backend = MemoryBackend::new();
        backend.fail_subscribes("users", 10);
        let manager = manager(&backend);

        let _handle = manager.subscribe(&CollectionSpec::profile(), |_| {});
        wait_for_state(&manager, "users", ChannelState::Failed).await;

        // initial attempt + 3 reconnects
        assert_eq!(backend.subscribe_count("users"), 4);
    }
}
