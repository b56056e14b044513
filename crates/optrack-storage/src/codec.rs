//! Newline-delimited JSON encoding for a single [`OpportunityRecord`].
//!
//! One record is one line: the canonical `serde_json` rendering followed by `\n`. Struct
//! field order is fixed and `details` keys are sorted, so re-encoding a decoded canonical
//! line reproduces it byte for byte.

use chrono::{DateTime, Utc};
use optrack_core::OpportunityRecord;
use serde_json::Value as JsonValue;

use crate::error::{StoreError, StoreResult};
use crate::legacy;

pub const RECORD_DELIMITER: u8 = b'\n';

pub fn encode(record: &OpportunityRecord) -> StoreResult<Vec<u8>> {
    let mut line = serde_json::to_vec(record)?;
    line.push(RECORD_DELIMITER);
    Ok(line)
}

/// Decode one line. `offset` is only used to label failures.
///
/// The trailing delimiter is optional here; callers that care about torn writes check
/// for it before decoding.
pub fn decode(line: &[u8], offset: u64) -> StoreResult<OpportunityRecord> {
    let body = line.strip_suffix(&[RECORD_DELIMITER]).unwrap_or(line);
    let body = body.strip_suffix(b"\r").unwrap_or(body);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(corrupt(offset, "empty line"));
    }
    let record: OpportunityRecord =
        serde_json::from_slice(body).map_err(|err| corrupt(offset, err.to_string()))?;
    if record.identifier.trim().is_empty() {
        return Err(corrupt(offset, "record has an empty competition_id"));
    }
    if record.source.trim().is_empty() {
        return Err(corrupt(offset, "record has an empty site"));
    }
    Ok(record)
}

/// Lines written by the earlier tracker hold a bare grant object: no `site`, and no
/// timestamps unless the scraper added them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLines {
    pub source: String,
    /// Stamp used for records that carry no timestamps of their own.
    pub recorded_at: DateTime<Utc>,
}

/// Like [`decode`], but falls back to the legacy grant layout when `legacy` is given.
/// The flag is true when the fallback was used.
pub fn decode_with_legacy(
    line: &[u8],
    offset: u64,
    legacy: Option<&LegacyLines>,
) -> StoreResult<(OpportunityRecord, bool)> {
    let err = match decode(line, offset) {
        Ok(record) => return Ok((record, false)),
        Err(err) => err,
    };
    let Some(legacy) = legacy else {
        return Err(err);
    };
    let body = line.strip_suffix(&[RECORD_DELIMITER]).unwrap_or(line);
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value @ JsonValue::Object(_)) => {
            legacy::record_from_legacy(&legacy.source, "", &value, legacy.recorded_at)
                .map(|record| (record, true))
                .ok_or(err)
        }
        _ => Err(err),
    }
}

fn corrupt(offset: u64, reason: impl Into<String>) -> StoreError {
    StoreError::CorruptRecord {
        offset,
        reason: reason.into(),
    }
}
