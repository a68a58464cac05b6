//! Durable acknowledgement markers for notifications.

use chrono::Utc;

use bazaar_db::Database;

const ACK_PREFIX: &str = "notification_ack:";

/// Blocking store of "this notification was viewed" markers. Callers run it
/// off the async runtime.
pub trait MarkerStore: Send + Sync + 'static {
    fn is_acknowledged(&self, id: &str) -> anyhow::Result<bool>;

    fn mark_acknowledged(&self, id: &str) -> anyhow::Result<()>;
}

impl MarkerStore for Database {
    fn is_acknowledged(&self, id: &str) -> anyhow::Result<bool> {
        self.contains(&marker_key(id))
    }

    fn mark_acknowledged(&self, id: &str) -> anyhow::Result<()> {
        self.put(&marker_key(id), &Utc::now().to_rfc3339())
    }
}

fn marker_key(id: &str) -> String {
    format!("{}{}", ACK_PREFIX, id)
}

/// Ids of every acknowledged notification in `db`.
pub fn acknowledged_ids(db: &Database) -> anyhow::Result<Vec<String>> {
    Ok(db
        .keys_with_prefix(ACK_PREFIX)?
        .into_iter()
        .filter_map(|key| key.strip_prefix(ACK_PREFIX).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_acknowledged("n1").unwrap());

        db.mark_acknowledged("n1").unwrap();
        db.mark_acknowledged("n1").unwrap();

        assert!(db.is_acknowledged("n1").unwrap());
        assert_eq!(acknowledged_ids(&db).unwrap(), vec!["n1".to_string()]);
    }
}
