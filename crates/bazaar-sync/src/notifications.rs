//! Notification freshness tracker.
//!
//! A notification is "new" (`Fresh`) for a fixed window after it fires and
//! until the user opens it. Opening it persists an acknowledgement marker so
//! the badge stays off after a reload, even inside the window. Expiry of the
//! window is driven by one timer per notification, all owned by a single
//! registry so teardown is one call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bazaar_types::NotificationRecord;

use crate::error::{Result, SyncError};
use crate::markers::MarkerStore;
use crate::timers::TimerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// State a record starts in when (re)loaded at `now`.
pub fn initial_freshness(
    record: &NotificationRecord,
    acknowledged: bool,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Freshness {
    if acknowledged || record.acknowledged {
        return Freshness::Stale;
    }
    if now - record.triggered_at <= window {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

#[derive(Clone)]
pub struct NotificationTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    markers: Arc<dyn MarkerStore>,
    timers: TimerRegistry,
    window: chrono::Duration,
    states: Mutex<States>,
}

#[derive(Default)]
struct States {
    senders: HashMap<String, watch::Sender<Freshness>>,
    /// Acknowledged in this process, whether or not the marker was persisted.
    acknowledged: HashSet<String>,
}

impl States {
    fn set(&mut self, id: &str, state: Freshness) -> watch::Receiver<Freshness> {
        let tx = self
            .senders
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(state).0);
        tx.send_replace(state);
        tx.subscribe()
    }
}

impl TrackerInner {
    fn states(&self) -> MutexGuard<'_, States> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationTracker {
    pub fn new(markers: Arc<dyn MarkerStore>, window: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                markers,
                timers: TimerRegistry::new(),
                window,
                states: Mutex::new(States::default()),
            }),
        }
    }

    /// Start tracking `record` as loaded at `now`. A fresh record gets a
    /// timer that demotes it when its window closes.
    pub async fn track(&self, record: &NotificationRecord, now: DateTime<Utc>) -> watch::Receiver<Freshness> {
        let marked = self.is_marked(&record.id).await;

        // An acknowledge that ran while the marker was being read wins.
        let mut states = self.inner.states();
        let acknowledged = marked || states.acknowledged.contains(&record.id);
        let state = initial_freshness(record, acknowledged, now, self.inner.window);
        let rx = states.set(&record.id, state);

        match state {
            Freshness::Fresh => {
                let remaining = (record.triggered_at + self.inner.window - now)
                    .to_std()
                    .unwrap_or_default();
                let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
                let id = record.id.clone();
                self.inner.timers.arm(record.id.clone(), Instant::now() + remaining, move || {
                    if let Some(inner) = weak.upgrade() {
                        debug!("Notification {} is no longer new", id);
                        inner.states().set(&id, Freshness::Stale);
                    }
                });
            }
            Freshness::Stale => {
                self.inner.timers.cancel(&record.id);
            }
        }
        rx
    }

    /// Track every record, returning how many start out new.
    pub async fn track_all(&self, records: &[NotificationRecord], now: DateTime<Utc>) -> usize {
        let mut fresh = 0;
        for record in records {
            if *self.track(record, now).await.borrow() == Freshness::Fresh {
                fresh += 1;
            }
        }
        fresh
    }

    /// False for untracked ids.
    pub fn is_new(&self, id: &str) -> bool {
        self.inner
            .states()
            .senders
            .get(id)
            .is_some_and(|tx| *tx.borrow() == Freshness::Fresh)
    }

    pub fn watch(&self, id: &str) -> Option<watch::Receiver<Freshness>> {
        self.inner.states().senders.get(id).map(|tx| tx.subscribe())
    }

    /// The user opened the notification: demote it now and persist the marker.
    ///
    /// The in-memory state is `Stale` even when persisting fails; the only cost
    /// of a failure is the badge reappearing after a restart.
    pub async fn acknowledge(&self, id: &str) -> Result<()> {
        {
            let mut states = self.inner.states();
            states.acknowledged.insert(id.to_string());
            self.inner.timers.cancel(id);
            states.set(id, Freshness::Stale);
        }

        let markers = self.inner.markers.clone();
        let marker_id = id.to_string();
        let persisted = tokio::task::spawn_blocking(move || markers.mark_acknowledged(&marker_id))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match persisted {
            Ok(()) => {
                info!("Notification {} acknowledged", id);
                Ok(())
            }
            Err(reason) => {
                let error = SyncError::PersistMarker {
                    id: id.to_string(),
                    reason,
                };
                warn!("{}", error);
                Err(error)
            }
        }
    }

    /// Cancel every pending timer. States are kept as they are.
    pub fn teardown(&self) -> usize {
        let cancelled = self.inner.timers.cancel_all();
        debug!("Notification tracker torn down ({} timers cancelled)", cancelled);
        cancelled
    }

    pub fn armed_timers(&self) -> usize {
        self.inner.timers.armed()
    }

    async fn is_marked(&self, id: &str) -> bool {
        let markers = self.inner.markers.clone();
        let marker_id = id.to_string();
        match tokio::task::spawn_blocking(move || markers.is_acknowledged(&marker_id)).await {
            Ok(Ok(marked)) => marked,
            Ok(Err(e)) => {
                warn!("Reading acknowledgement for {} failed: {}", id, e);
                false
            }
            Err(e) => {
                warn!("Acknowledgement lookup for {} did not complete: {}", id, e);
                false
            }
        }
    }
}
