//! In-process backend.
//!
//! Holds tables of JSON records and emits change events on every mutation.
//! Used by the local node and throughout the tests; it also exposes fault
//! injection (dropped transports, failing queries and deletes, latency) and
//! call counters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use bazaar_types::{ChangeEvent, ChangeFilter, ChangeKind, Record};

use crate::backend::{Backend, ChangeFeed, Filter, SortOrder, record_id};
use crate::error::{Result, SyncError};

/// Buffered events per feed before a slow receiver starts lagging.
const FEED_CAPACITY: usize = 64;

struct Feed {
    filter: ChangeFilter,
    tx: broadcast::Sender<ChangeEvent>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Record>>,
    feeds: HashMap<String, Vec<Feed>>,
    latency: Duration,
    query_failures: HashMap<String, u32>,
    subscribe_failures: HashMap<String, u32>,
    delete_failures: HashSet<String>,
    query_counts: HashMap<String, usize>,
    subscribe_counts: HashMap<String, usize>,
    delete_counts: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a document shaped like `{ "<table>": [ {record}, ... ] }`.
    pub fn from_seed(seed: &Value) -> Result<Self> {
        let tables = seed
            .as_object()
            .ok_or_else(|| SyncError::Config("seed must be a JSON object of tables".into()))?;

        let backend = Self::new();
        {
            let mut state = backend.state();
            for (table, rows) in tables {
                let rows = rows.as_array().ok_or_else(|| {
                    SyncError::Config(format!("seed table {} must be an array", table))
                })?;
                state.tables.insert(table.clone(), rows.clone());
            }
        }
        info!("Memory backend seeded with {} tables", tables.len());
        Ok(backend)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row, assigning a UUID when it has no `id`. Returns the id.
    pub fn insert(&self, table: &str, mut record: Record) -> String {
        let id = match record_id(&record) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                if let Some(obj) = record.as_object_mut() {
                    obj.insert("id".into(), Value::String(id.clone()));
                }
                id
            }
        };

        let mut state = self.state();
        state.tables.entry(table.to_string()).or_default().push(record);
        emit(&mut state, ChangeEvent::new(table, ChangeKind::Insert, Some(id.clone())));
        id
    }

    /// Merge `patch`'s fields into the row. Returns false if no such row.
    pub fn update(&self, table: &str, id: &str, patch: Record) -> bool {
        let mut state = self.state();
        let Some(row) = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| record_id(r).as_deref() == Some(id)))
        else {
            return false;
        };

        if let (Some(target), Value::Object(fields)) = (row.as_object_mut(), patch) {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        emit(&mut state, ChangeEvent::new(table, ChangeKind::Update, Some(id.to_string())));
        true
    }

    /// Remove a row. Returns false if no such row.
    pub fn remove(&self, table: &str, id: &str) -> bool {
        let mut state = self.state();
        remove_row(&mut state, table, id)
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Drop the transport of every open feed on `table`.
    pub fn disconnect(&self, table: &str) {
        let dropped = self.state().feeds.remove(table).map_or(0, |feeds| feeds.len());
        info!("Memory backend dropped {} feeds on {}", dropped, table);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// The next `count` queries against `table` fail.
    pub fn fail_queries(&self, table: &str, count: u32) {
        self.state().query_failures.insert(table.to_string(), count);
    }

    /// The next `count` feed subscriptions on `table` fail.
    pub fn fail_subscribes(&self, table: &str, count: u32) {
        self.state().subscribe_failures.insert(table.to_string(), count);
    }

    /// Deletes of `id` fail until `allow_deletes` is called.
    pub fn fail_deletes(&self, id: &str) {
        self.state().delete_failures.insert(id.to_string());
    }

    pub fn allow_deletes(&self, id: &str) {
        self.state().delete_failures.remove(id);
    }

    pub fn query_count(&self, table: &str) -> usize {
        self.state().query_counts.get(table).copied().unwrap_or(0)
    }

    pub fn subscribe_count(&self, table: &str) -> usize {
        self.state().subscribe_counts.get(table).copied().unwrap_or(0)
    }

    pub fn delete_count(&self, id: &str) -> usize {
        self.state().delete_counts.get(id).copied().unwrap_or(0)
    }

    /// Feeds on `table` that still have a live receiver.
    pub fn open_feed_count(&self, table: &str) -> usize {
        self.state().feeds.get(table).map_or(0, |feeds| {
            feeds.iter().filter(|f| f.tx.receiver_count() > 0).count()
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        let latency = {
            let mut state = self.state();
            *state.query_counts.entry(table.to_string()).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.state();
        let state = &mut *guard;
        if take_failure(&mut state.query_failures, table) {
            return Err(SyncError::Backend(format!("injected query failure on {}", table)));
        }

        let mut rows: Vec<Record> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_eq(row, filter.eq.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, order)) = &filter.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(column), b.get(column));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        debug!("Memory backend query {} -> {} rows", table, rows.len());
        Ok(rows)
    }

    async fn subscribe_changes(&self, table: &str, filter: ChangeFilter) -> Result<ChangeFeed> {
        let mut guard = self.state();
        let state = &mut *guard;
        *state.subscribe_counts.entry(table.to_string()).or_default() += 1;
        if take_failure(&mut state.subscribe_failures, table) {
            return Err(SyncError::ChannelDisconnect {
                table: table.to_string(),
                reason: "injected subscribe failure".into(),
            });
        }

        let (tx, rx) = broadcast::channel(FEED_CAPACITY);
        state
            .feeds
            .entry(table.to_string())
            .or_default()
            .push(Feed { filter, tx });
        Ok(rx)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut state = self.state();
        *state.delete_counts.entry(id.to_string()).or_default() += 1;
        if state.delete_failures.contains(id) {
            return Err(SyncError::Backend(format!("injected delete failure on {}/{}", table, id)));
        }
        remove_row(&mut state, table, id);
        Ok(())
    }
}

fn remove_row(state: &mut State, table: &str, id: &str) -> bool {
    let Some(rows) = state.tables.get_mut(table) else {
        return false;
    };
    let before = rows.len();
    rows.retain(|r| record_id(r).as_deref() != Some(id));
    if rows.len() == before {
        return false;
    }
    emit(state, ChangeEvent::new(table, ChangeKind::Delete, Some(id.to_string())));
    true
}

fn emit(state: &mut State, event: ChangeEvent) {
    let Some(feeds) = state.feeds.get_mut(&event.table) else {
        return;
    };
    feeds.retain(|feed| feed.tx.receiver_count() > 0);
    for feed in feeds.iter().filter(|f| f.filter.matches(event.kind)) {
        let _ = feed.tx.send(event.clone());
    }
}

fn take_failure(failures: &mut HashMap<String, u32>, table: &str) -> bool {
    match failures.get_mut(table) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn matches_eq(row: &Record, eq: Option<&(String, String)>) -> bool {
    let Some((column, expected)) = eq else {
        return true;
    };
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == *expected,
        Some(Value::Bool(b)) => b.to_string() == *expected,
        _ => false,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn query_filters_by_owner_and_orders() {
        let backend = MemoryBackend::new();
        backend.insert("orders", json!({"id": "o1", "buyer_id": "u1", "total": 30}));
        backend.insert("orders", json!({"id": "o2", "buyer_id": "u2", "total": 10}));
        backend.insert("orders", json!({"id": "o3", "buyer_id": "u1", "total": 20}));

        let filter = Filter {
            eq: Some(("buyer_id".into(), "u1".into())),
            order_by: None,
        }
        .ordered("total", SortOrder::Ascending);
        let rows = backend.query("orders", &filter).await.unwrap();

        let ids: Vec<_> = rows.iter().filter_map(record_id).collect();
        assert_eq!(ids, vec!["o3", "o1"]);
    }

    #[tokio::test]
    async fn feed_receives_mutations_until_disconnect() {
        let backend = MemoryBackend::new();
        let mut feed = backend
            .subscribe_changes("favorites", ChangeFilter::All)
            .await
            .unwrap();

        let id = backend.insert("favorites", json!({"user_id": "u1"}));
        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record_id.as_deref(), Some(id.as_str()));

        backend.disconnect("favorites");
        assert!(matches!(
            feed.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn filtered_feed_skips_other_kinds() {
        let backend = MemoryBackend::new();
        let mut feed = backend
            .subscribe_changes("balances", ChangeFilter::Only(ChangeKind::Delete))
            .await
            .unwrap();

        backend.insert("balances", json!({"id": "b1"}));
        backend.remove("balances", "b1");

        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn injected_query_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_queries("products", 1);

        assert!(backend.query("products", &Filter::default()).await.is_err());
        assert!(backend.query("products", &Filter::default()).await.is_ok());
        assert_eq!(backend.query_count("products"), 2);
    }

    #[test]
    fn seed_rejects_non_array_tables() {
        assert!(MemoryBackend::from_seed(&json!({"products": {"id": 1}})).is_err());
        let backend = MemoryBackend::from_seed(&json!({"products": [{"id": "p1"}]})).unwrap();
        assert_eq!(backend.rows("products").len(), 1);
    }
}
