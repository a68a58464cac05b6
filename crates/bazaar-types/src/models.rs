use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A backend row as delivered by the query API. The core never looks inside
/// except to read `id` and to parse schedule entries.
pub type Record = serde_json::Value;

/// A calendar entry owned by a user. Times are wall-clock (local) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(deserialize_with = "row_key::deserialize")]
    pub id: String,
    #[serde(rename = "user_id", deserialize_with = "row_key::deserialize")]
    pub owner_id: String,
    pub date: NaiveDate,
    #[serde(default, with = "clock_time")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "clock_time")]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub description: String,
}

impl ScheduleEntry {
    pub fn starts_at(&self) -> Option<NaiveDateTime> {
        self.start_time.map(|t| self.date.and_time(t))
    }

    /// End instant. An end time at or before the start time rolls over to the
    /// following day.
    pub fn ends_at(&self) -> Option<NaiveDateTime> {
        let end = self.end_time?;
        let mut date = self.date;
        if let Some(start) = self.start_time {
            if end <= start {
                date = date.succ_opt()?;
            }
        }
        Some(date.and_time(end))
    }
}

/// A user-facing notification. `acknowledged` mirrors any server-side flag;
/// the local acknowledgement marker is tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

/// Row keys may be text or integer primary keys; both read as strings.
mod row_key {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Text(String),
        Number(serde_json::Number),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Key::deserialize(deserializer)? {
            Key::Text(s) => s,
            Key::Number(n) => n.to_string(),
        })
    }
}

/// `HH:MM` or `HH:MM:SS`; empty strings and nulls read as `None`.
mod clock_time {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.format("%H:%M:%S").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw else { return Ok(None) };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
