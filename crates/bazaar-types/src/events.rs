use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of row mutation reported by the backend change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Some events may have been missed (receiver lagged); treat as "anything changed".
    Resync,
}

/// Which change kinds a feed subscription wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind")]
pub enum ChangeFilter {
    /// `*`: every insert, update and delete.
    #[default]
    All,
    Only(ChangeKind),
}

impl ChangeFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            // A resync always passes: it stands for events of unknown kind.
            Self::Only(_) if kind == ChangeKind::Resync => true,
            Self::Only(wanted) => *wanted == kind,
        }
    }
}

/// A coarse "something in this table changed" signal.
///
/// `record_id` is informational only; consumers never patch views with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, record_id: Option<String>) -> Self {
        Self {
            table: table.into(),
            kind,
            record_id,
            at: Utc::now(),
        }
    }

    pub fn resync(table: impl Into<String>) -> Self {
        Self::new(table, ChangeKind::Resync, None)
    }
}
