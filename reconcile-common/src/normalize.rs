use chrono::{DateTime, Utc};
use serde_json::Map;

use crate::record::{NormalizedRecord, RawRow};

pub trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Lower-case the name and replace every whitespace character with `_`.
pub fn normalize_field_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Canonicalize field names and stamp the ingestion time. Values are left untouched.
/// When two headers collapse onto the same name the one sorting last wins.
pub fn normalize_row(row: RawRow, inserted_at: DateTime<Utc>) -> NormalizedRecord {
    let fields: Map<_, _> = row
        .into_iter()
        .map(|(key, value)| (normalize_field_name(&key), value))
        .collect();

    NormalizedRecord {
        fields,
        inserted_at,
    }
}
