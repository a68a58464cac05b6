use crate::Database;
use crate::models::KvRow;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    /// Insert or overwrite a value.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                (key, value),
            )?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| Ok(query_row(conn, key)?.map(|row| row.value)))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: i64 =
                conn.query_row("SELECT COUNT(*) FROM kv WHERE key = ?1", [key], |row| row.get(0))?;
            Ok(found > 0)
        })
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([prefix], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }
}

fn query_row(conn: &Connection, key: &str) -> Result<Option<KvRow>> {
    let mut stmt = conn.prepare("SELECT key, value, updated_at FROM kv WHERE key = ?1")?;

    let row = stmt
        .query_row([key], |row| {
            Ok(KvRow {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
