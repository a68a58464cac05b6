//! Schedule expiry sweeper.
//!
//! Runs once per load of a schedule view (not on a timer), so an entry may
//! outlive its logical expiry until the calendar is next opened. Deletions
//! are fire-and-forget; a failed deletion leaves the entry in place for the
//! next pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Local, NaiveDateTime};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use bazaar_types::{Record, ScheduleEntry};

use crate::backend::Backend;
use crate::dispatcher::{CachedView, ViewHandle};
use crate::error::SyncError;

/// Whether `entry` should be deleted at `now`.
///
/// - No start time: once the calendar day of `date` is over.
/// - Start time only: once the start has passed *or* is within `lookahead`.
///   This also removes reminders created less than `lookahead` before they
///   occur, which may not be what users expect; kept as the client behaves.
/// - Start and end: once the end has passed, but only after the start is
///   within `lookahead` (or already passed).
pub fn is_expired(entry: &ScheduleEntry, now: NaiveDateTime, lookahead: chrono::Duration) -> bool {
    let Some(starts_at) = entry.starts_at() else {
        return now.date() > entry.date;
    };

    let started = now > starts_at;
    let starting_soon = starts_at - now <= lookahead;
    let gate = started || starting_soon;

    match entry.ends_at() {
        None => gate,
        Some(ends_at) => gate && now > ends_at,
    }
}

/// Ids of the entries to delete at `now`, each at most once, in input order.
pub fn sweep(entries: &[ScheduleEntry], now: NaiveDateTime, lookahead: chrono::Duration) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| is_expired(e, now, lookahead))
        .filter(|e| seen.insert(e.id.clone()))
        .map(|e| e.id.clone())
        .collect()
}

/// Parse backend rows, skipping (and logging) rows that are not schedule entries.
pub fn parse_entries(rows: &[Record]) -> (Vec<ScheduleEntry>, usize) {
    let mut skipped = 0;
    let entries = rows
        .iter()
        .filter_map(|row| match serde_json::from_value::<ScheduleEntry>(row.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unparseable schedule row: {}", e);
                skipped += 1;
                None
            }
        })
        .collect();
    (entries, skipped)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Deletions started by this pass.
    pub issued: Vec<String>,
    /// Expired, but a deletion from an earlier pass is still running.
    pub already_pending: Vec<String>,
    pub unparseable: usize,
}

#[derive(Clone)]
pub struct ScheduleSweeper {
    inner: Arc<SweeperInner>,
}

struct SweeperInner {
    backend: Arc<dyn Backend>,
    table: String,
    lookahead: chrono::Duration,
    pending: Mutex<HashSet<String>>,
    deletions: Mutex<JoinSet<()>>,
}

impl SweeperInner {
    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deletions(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.deletions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScheduleSweeper {
    pub fn new(backend: Arc<dyn Backend>, table: impl Into<String>, lookahead: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(SweeperInner {
                backend,
                table: table.into(),
                lookahead,
                pending: Mutex::new(HashSet::new()),
                deletions: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Evaluate `rows` at `now` and start a deletion for every expired entry
    /// that does not already have one running.
    pub fn run_pass(&self, rows: &[Record], now: NaiveDateTime) -> SweepReport {
        self.reap_finished();

        let (entries, unparseable) = parse_entries(rows);
        let expired = sweep(&entries, now, self.inner.lookahead);

        let mut report = SweepReport {
            unparseable,
            ..Default::default()
        };

        for id in expired {
            if !self.inner.pending().insert(id.clone()) {
                debug!("Deletion of schedule {} already in flight", id);
                report.already_pending.push(id);
                continue;
            }

            let inner = self.inner.clone();
            let task_id = id.clone();
            self.inner.deletions().spawn(async move {
                delete_entry(&inner, &task_id).await;
            });
            report.issued.push(id);
        }

        if !report.issued.is_empty() {
            info!("Sweep issued {} schedule deletions", report.issued.len());
        }
        report
    }

    pub fn sweep_view(&self, view: &CachedView, now: NaiveDateTime) -> SweepReport {
        self.run_pass(&view.data, now)
    }

    /// Sweep after every successful load published on `handle`, using local
    /// wall-clock time.
    pub fn watch(&self, mut handle: ViewHandle) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut last_loaded = None;
            loop {
                let view = handle.current();
                let loaded = !view.is_loading && view.last_error.is_none() && view.fetched_at.is_some();
                if loaded && view.fetched_at != last_loaded {
                    last_loaded = view.fetched_at;
                    sweeper.sweep_view(&view, Local::now().naive_local());
                }
                if handle.changed().await.is_none() {
                    break;
                }
            }
        })
    }

    fn reap_finished(&self) {
        let mut deletions = self.inner.deletions();
        while deletions.try_join_next().is_some() {}
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Wait for every deletion started so far.
    pub async fn drain(&self) {
        let mut deletions = std::mem::take(&mut *self.inner.deletions());
        while deletions.join_next().await.is_some() {}
    }
}

async fn delete_entry(inner: &SweeperInner, id: &str) {
    match inner.backend.delete(&inner.table, id).await {
        Ok(()) => info!("Deleted expired schedule {}", id),
        Err(e) => {
            let error = SyncError::Deletion {
                table: inner.table.clone(),
                id: id.to_string(),
                reason: e.to_string(),
            };
            warn!("{}; will retry on next sweep", error);
        }
    }
    inner.pending().remove(id);
}
