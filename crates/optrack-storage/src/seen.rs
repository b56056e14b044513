//! Persisted set of every identifier a source has ever produced.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::error::{IoContext, StoreError, StoreResult};
use crate::fsutil;
use crate::store::OpenMode;

/// Key used by the legacy global seen file when it stored a bare list.
pub const LEGACY_DEFAULT_SOURCE: &str = "default";

#[derive(Debug, Serialize)]
struct SeenFile {
    source: String,
    ids: Vec<String>,
    count: usize,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SeenIdSet {
    path: PathBuf,
    source: String,
    ids: BTreeSet<String>,
    dirty: bool,
}

impl SeenIdSet {
    /// Load the set for `source`. A missing file is an empty set.
    ///
    /// Only the `ids` list is trusted; `count` and `last_updated` are rewritten on save,
    /// so a file written by other tooling loads as long as its ids are readable. A file
    /// with no readable id list starts the set empty and the store repairs it from the
    /// index. In read-write mode that file is moved aside first; read-only opens leave
    /// it untouched.
    pub fn open(path: impl Into<PathBuf>, source: &str, mode: OpenMode) -> StoreResult<Self> {
        let path = path.into();
        let ids = match fs::read(&path) {
            Ok(bytes) => match ids_from_file(&bytes) {
                Ok(ids) => ids.into_iter().collect(),
                Err(reason) => {
                    set_aside(&path, source, mode, &reason)?;
                    BTreeSet::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(StoreError::io(format!("reading {}", path.display()), err))
            }
        };
        Ok(Self {
            path,
            source: source.to_string(),
            ids,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.ids.contains(identifier)
    }

    /// Returns `true` when `identifier` was not seen before.
    pub fn add(&mut self, identifier: impl Into<String>) -> bool {
        let inserted = self.ids.insert(identifier.into());
        self.dirty |= inserted;
        inserted
    }

    /// Returns how many identifiers were newly inserted.
    pub fn add_many<I, S>(&mut self, identifiers: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        identifiers
            .into_iter()
            .map(|id| self.add(id))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn all(&self) -> &BTreeSet<String> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist atomically when the set changed. Returns whether a write happened.
    pub fn save(&mut self) -> StoreResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let file = SeenFile {
            source: self.source.clone(),
            ids: self.ids.iter().cloned().collect(),
            count: self.ids.len(),
            last_updated: Utc::now(),
        };
        fsutil::write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)?;
        self.dirty = false;
        Ok(true)
    }

    /// Merge identifiers for this source from the legacy global `seen_competitions.json`.
    ///
    /// That file holds either `{"seen_ids": {source: [ids]}}` or `{"seen_ids": [ids]}`, the
    /// latter belonging to the `default` source.
    pub fn import_legacy(&mut self, path: &Path) -> StoreResult<usize> {
        let bytes = fs::read(path).io_context(|| format!("reading {}", path.display()))?;
        let root: JsonValue = serde_json::from_slice(&bytes)?;
        let ids = match root.get("seen_ids") {
            Some(JsonValue::Object(by_source)) => by_source.get(&self.source),
            Some(list @ JsonValue::Array(_)) if self.source == LEGACY_DEFAULT_SOURCE => Some(list),
            _ => None,
        };
        let ids = ids
            .and_then(JsonValue::as_array)
            .map(|list| collect_ids(list))
            .unwrap_or_default();
        let added = self.add_many(ids);
        info!(source = %self.source, path = %path.display(), added, "imported legacy seen ids");
        Ok(added)
    }
}

/// Accepts `{"ids": [...], ...}` with any extra metadata, or a bare list.
fn ids_from_file(bytes: &[u8]) -> Result<Vec<String>, String> {
    let root: JsonValue = serde_json::from_slice(bytes).map_err(|err| err.to_string())?;
    let list = match &root {
        JsonValue::Array(list) => list,
        JsonValue::Object(map) => match map.get("ids") {
            Some(JsonValue::Array(list)) => list,
            _ => return Err("no ids list".to_string()),
        },
        _ => return Err("not a JSON object".to_string()),
    };
    Ok(collect_ids(list))
}

/// String and numeric identifiers, trimmed; anything else is dropped.
fn collect_ids(list: &[JsonValue]) -> Vec<String> {
    list.iter()
        .filter_map(|id| match id {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

fn set_aside(path: &Path, source: &str, mode: OpenMode, reason: &str) -> StoreResult<()> {
    if mode == OpenMode::ReadOnly {
        warn!(source, path = %path.display(), reason, "seen-id file unreadable, ignoring it");
        return Ok(());
    }
    let aside = path.with_extension(format!(
        "json.corrupt-{}",
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    warn!(
        source,
        path = %path.display(),
        aside = %aside.display(),
        reason,
        "seen-id file unreadable, moving it aside"
    );
    fs::rename(path, &aside)
        .io_context(|| format!("moving {} to {}", path.display(), aside.display()))
}
