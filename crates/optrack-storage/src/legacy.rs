//! The single-document `{site}_grants.json` snapshot older tooling reads and writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use optrack_core::{normalize_details, Details, OpportunityRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::{IoContext, StoreResult};
use crate::fsutil;

#[derive(Debug, Serialize, Deserialize)]
pub struct LegacySnapshot {
    pub site: String,
    #[serde(default)]
    pub grants: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: usize,
}

/// Write the latest records as one JSON document keyed by identifier.
pub fn write_snapshot(
    path: &Path,
    source: &str,
    records: &[OpportunityRecord],
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let grants = records
        .iter()
        .map(|record| Ok((record.identifier.clone(), serde_json::to_value(record)?)))
        .collect::<StoreResult<BTreeMap<_, _>>>()?;
    let snapshot = LegacySnapshot {
        site: source.to_string(),
        count: grants.len(),
        grants,
        last_updated: Some(now),
    };
    fsutil::write_atomic(path, &serde_json::to_vec_pretty(&snapshot)?)
}

/// Read a legacy snapshot into records for `source`. Entries that carry no usable
/// identifier are skipped with a warning.
pub fn read_snapshot(
    path: &Path,
    source: &str,
    now: DateTime<Utc>,
) -> StoreResult<Vec<OpportunityRecord>> {
    let bytes = fs::read(path).io_context(|| format!("reading {}", path.display()))?;
    let snapshot: LegacySnapshot = serde_json::from_slice(&bytes)?;
    let fallback_time = snapshot.last_updated.unwrap_or(now);
    let mut records = Vec::with_capacity(snapshot.grants.len());
    for (key, value) in &snapshot.grants {
        match record_from_legacy(source, key, value, fallback_time) {
            Some(record) => records.push(record),
            None => warn!(source, key = %key, "skipping legacy grant without identifier"),
        }
    }
    Ok(records)
}

/// Accepts both the current record layout and the older scraper layout
/// (`description_full`, `synopsis`, `url`, `first_seen`).
pub(crate) fn record_from_legacy(
    source: &str,
    key: &str,
    value: &JsonValue,
    fallback_time: DateTime<Utc>,
) -> Option<OpportunityRecord> {
    let text = |names: &[&str]| -> String {
        names
            .iter()
            .filter_map(|name| value.get(*name))
            .find_map(|v| match v {
                JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_default()
    };

    let mut identifier = text(&["competition_id", "id"]);
    if identifier.trim().is_empty() {
        identifier = key.to_string();
    }
    let identifier = identifier.trim().to_string();
    if identifier.is_empty() {
        return None;
    }

    let details: Option<Details> = match value.get("details") {
        Some(JsonValue::Object(map)) => {
            Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        _ => None,
    };
    let first_seen = parse_timestamp(&text(&["first_seen_at", "first_seen"])).unwrap_or(fallback_time);
    let last_updated =
        parse_timestamp(&text(&["last_updated_at", "last_updated"])).unwrap_or(first_seen);

    Some(OpportunityRecord {
        identifier,
        source: source.to_string(),
        title: text(&["title"]),
        link: text(&["link", "url"]),
        description: text(&["description", "description_full", "synopsis"]),
        details: normalize_details(details),
        first_seen_at: first_seen,
        last_updated_at: last_updated,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
