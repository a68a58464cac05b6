//! The seam to the backend-as-a-service.
//!
//! The core needs exactly three things from it: a filtered query, a per-table
//! change feed, and row deletion. Everything else about the backend is opaque.

use async_trait::async_trait;
use tokio::sync::broadcast;

use bazaar_types::{ChangeEvent, ChangeFilter, CollectionSpec, Record};

use crate::error::Result;

/// Receiving end of a table's change feed.
///
/// Dropping it unsubscribes. `RecvError::Closed` means the transport dropped;
/// `RecvError::Lagged` means events were missed.
pub type ChangeFeed = broadcast::Receiver<ChangeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Equality predicate plus optional ordering, the only query shape the core uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub eq: Option<(String, String)>,
    pub order_by: Option<(String, SortOrder)>,
}

impl Filter {
    /// Rows of `spec` belonging to `owner`. Specs without an owner column match every row.
    pub fn for_owner(spec: &CollectionSpec, owner: &str) -> Self {
        Self {
            eq: spec
                .owner_column
                .as_ref()
                .map(|column| (column.clone(), owner.to_string())),
            order_by: None,
        }
    }

    pub fn ordered(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((column.into(), order));
        self
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>>;

    async fn subscribe_changes(&self, table: &str, filter: ChangeFilter) -> Result<ChangeFeed>;

    async fn delete(&self, table: &str, id: &str) -> Result<()>;
}

/// Reads the `id` field of a record, accepting string or numeric ids.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
