/// Database row types — these map directly to SQLite rows.

pub struct KvRow {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}
