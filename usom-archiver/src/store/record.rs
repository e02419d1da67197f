use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

/// One malicious address entry as published by the USOM address API.
///
/// `id` is the sole deduplication key. Field names on the wire follow the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(rename = "desc", default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub date: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub criticality_level: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connectiontype: String,
}

/// Ordered records fed into the store in one call.
pub type RecordBatch = Vec<Record>;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

impl Record {
    /// Hash fields in storage order.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.to_string()),
            ("url".to_string(), self.url.clone()),
            ("type".to_string(), self.kind.clone()),
            ("desc".to_string(), self.description.clone()),
            ("source".to_string(), self.source.clone()),
            ("date".to_string(), self.date.clone()),
            (
                "criticality_level".to_string(),
                self.criticality_level.to_string(),
            ),
            ("connectiontype".to_string(), self.connectiontype.clone()),
        ]
    }

    /// Rebuild a record from its stored hash.
    ///
    /// An empty hash is an orphan (id present in the membership set, record never written)
    /// and yields `None`. Unparseable numbers fall back to the key's id and level 0.
    pub fn from_fields(id: u64, mut fields: HashMap<String, String>) -> Option<Record> {
        if fields.is_empty() {
            return None;
        }
        let mut take = |name: &str| fields.remove(name).unwrap_or_default();

        let stored_id = take("id").trim().parse::<u64>().unwrap_or(id);
        let criticality_level = take("criticality_level").trim().parse::<i64>().unwrap_or(0);
        Some(Record {
            id: stored_id,
            url: take("url"),
            kind: take("type"),
            description: take("desc"),
            source: take("source"),
            date: take("date"),
            criticality_level,
            connectiontype: take("connectiontype"),
        })
    }

    /// `date` as a timestamp, when it is in one of the formats the API has used.
    pub fn parsed_date(&self) -> Option<NaiveDateTime> {
        let date = self.date.trim();
        if date.is_empty() {
            return None;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(date) {
            return Some(parsed.naive_utc());
        }
        DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(date, format).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .ok()
                    .and_then(|day| day.and_hms_opt(0, 0, 0))
            })
    }

    /// Newest first; undated records last, ties broken by descending id.
    pub fn newest_first(a: &Record, b: &Record) -> Ordering {
        b.parsed_date()
            .cmp(&a.parsed_date())
            .then_with(|| b.id.cmp(&a.id))
    }
}
