//! Identifier -> log position map for the latest version of every record.
//!
//! The index is derived state. Its persisted form carries the log length it was built
//! against plus a checksum over the entries; any mismatch on load means a rebuild from
//! the log, which is always authoritative.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::StoreResult;
use crate::fsutil;
use crate::log::{AppendLog, LogPosition};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    site: String,
    count: usize,
    log_len: u64,
    live_bytes: u64,
    checksum: String,
    last_updated: DateTime<Utc>,
    entries: BTreeMap<String, LogPosition>,
}

/// How the index came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    /// The persisted index matched the log.
    Loaded,
    /// The persisted index was missing or stale and was rebuilt from the log.
    Rebuilt {
        reason: String,
        corrupt_skipped: usize,
        /// Lines still in the earlier tracker's bare grant layout.
        legacy_records: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub records: usize,
    pub corrupt_skipped: usize,
    pub legacy_records: usize,
}

#[derive(Debug)]
pub struct PositionIndex {
    path: PathBuf,
    source: String,
    entries: HashMap<String, LogPosition>,
    dirty: bool,
    saved_log_len: Option<u64>,
}

impl PositionIndex {
    pub fn empty(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            entries: HashMap::new(),
            dirty: false,
            saved_log_len: None,
        }
    }

    /// Load the persisted index for `log`, rebuilding it when it cannot be trusted.
    pub fn open(
        path: impl Into<PathBuf>,
        source: &str,
        log: &AppendLog,
    ) -> StoreResult<(Self, IndexStatus)> {
        let mut index = Self::empty(path, source);
        let reason = match index.load_persisted(log) {
            Ok(()) => return Ok((index, IndexStatus::Loaded)),
            Err(reason) => reason,
        };
        if log.size() > 0 || index.path.exists() {
            warn!(source, path = %index.path.display(), %reason, "rebuilding index from log");
        }
        let stats = index.rebuild_from(log)?;
        if stats.records > 0 {
            info!(source, records = stats.records, corrupt = stats.corrupt_skipped, "index rebuilt");
        }
        Ok((
            index,
            IndexStatus::Rebuilt {
                reason,
                corrupt_skipped: stats.corrupt_skipped,
                legacy_records: stats.legacy_records,
            },
        ))
    }

    fn load_persisted(&mut self, log: &AppendLog) -> Result<(), String> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err("index file missing".to_string())
            }
            Err(err) => return Err(format!("reading index: {err}")),
        };
        let file: IndexFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("parsing index: {err}"))?;
        if file.site != self.source {
            return Err(format!("index belongs to source {:?}", file.site));
        }
        if file.log_len != log.size() {
            return Err(format!(
                "index covers {} log bytes, log has {}",
                file.log_len,
                log.size()
            ));
        }
        if file.count != file.entries.len() {
            return Err(format!(
                "index count {} disagrees with {} entries",
                file.count,
                file.entries.len()
            ));
        }
        if checksum(&file.entries) != file.checksum {
            return Err("index checksum mismatch".to_string());
        }
        if let Some((id, pos)) = file
            .entries
            .iter()
            .find(|(_, pos)| pos.offset + pos.len > file.log_len)
        {
            return Err(format!("entry {id:?} points past the log end ({})", pos.offset));
        }
        self.entries = file.entries.into_iter().collect();
        self.dirty = false;
        self.saved_log_len = Some(file.log_len);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, identifier: &str) -> Option<u64> {
        self.entries.get(identifier).map(|pos| pos.offset)
    }

    pub fn position(&self, identifier: &str) -> Option<LogPosition> {
        self.entries.get(identifier).copied()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Point `identifier` at a newer record version.
    pub fn put(&mut self, identifier: impl Into<String>, position: LogPosition) {
        self.entries.insert(identifier.into(), position);
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of the log still referenced by the index.
    pub fn live_bytes(&self) -> u64 {
        self.entries.values().map(|pos| pos.len).sum()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn sorted_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replay the log from scratch; the last decodable version of each identifier wins.
    pub fn rebuild_from(&mut self, log: &AppendLog) -> StoreResult<RebuildStats> {
        self.entries.clear();
        let mut iter = log.iterate()?;
        let mut records = 0;
        for entry in iter.by_ref() {
            let (position, record) = entry?;
            self.entries.insert(record.identifier, position);
            records += 1;
        }
        self.dirty = true;
        Ok(RebuildStats {
            records,
            corrupt_skipped: iter.corrupt_count(),
            legacy_records: iter.legacy_count(),
        })
    }

    /// Persist atomically if anything changed since the last save. Returns whether a write
    /// happened.
    pub fn save(&mut self, log_len: u64) -> StoreResult<bool> {
        if !self.dirty && self.saved_log_len == Some(log_len) {
            return Ok(false);
        }
        let entries: BTreeMap<String, LogPosition> = self
            .entries
            .iter()
            .map(|(id, pos)| (id.clone(), *pos))
            .collect();
        let file = IndexFile {
            site: self.source.clone(),
            count: entries.len(),
            log_len,
            live_bytes: self.live_bytes(),
            checksum: checksum(&entries),
            last_updated: Utc::now(),
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        fsutil::write_atomic(&self.path, &bytes)?;
        self.dirty = false;
        self.saved_log_len = Some(log_len);
        Ok(true)
    }
}

fn checksum(entries: &BTreeMap<String, LogPosition>) -> String {
    let mut hasher = Sha256::new();
    for (id, pos) in entries {
        hasher.update(id.as_bytes());
        hasher.update(b"\t");
        hasher.update(pos.offset.to_string().as_bytes());
        hasher.update(b"\t");
        hasher.update(pos.len.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use optrack_core::{Candidate, OpportunityRecord};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn record(id: &str, title: &str) -> OpportunityRecord {
        OpportunityRecord::stub(
            &Candidate::new("umich", id).with_title(title),
            Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        )
    }

    fn seeded_log(root: &Path) -> AppendLog {
        let mut log = AppendLog::open(root.join("umich_grants_data.jsonl")).expect("open log");
        log.append(&record("A", "Alpha v1")).expect("a1");
        log.append(&record("B", "Beta")).expect("b");
        log.append(&record("A", "Alpha v2")).expect("a2");
        log
    }

    #[test]
    fn missing_index_is_rebuilt_with_latest_positions() {
        let dir = tempdir().expect("tempdir");
        let log = seeded_log(dir.path());
        let (index, status) =
            PositionIndex::open(dir.path().join("idx.json"), "umich", &log).expect("open");

        assert!(matches!(status, IndexStatus::Rebuilt { corrupt_skipped: 0, .. }));
        assert_eq!(index.len(), 2);
        let a = index.lookup("A").expect("A indexed");
        assert_eq!(log.read_at(a).expect("read").title, "Alpha v2");
        assert!(index.live_bytes() < log.size());
    }

    #[test]
    fn saved_index_loads_when_log_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        let log = seeded_log(dir.path());
        let path = dir.path().join("idx.json");
        let (mut index, _) = PositionIndex::open(&path, "umich", &log).expect("open");
        assert!(index.save(log.size()).expect("save"));
        assert!(!index.save(log.size()).expect("second save is a no-op"));

        let (reloaded, status) = PositionIndex::open(&path, "umich", &log).expect("reopen");
        assert_eq!(status, IndexStatus::Loaded);
        assert_eq!(reloaded.sorted_identifiers(), vec!["A", "B"]);
        assert_eq!(reloaded.position("A"), index.position("A"));
    }

    #[test]
    fn index_is_rebuilt_when_log_grew_behind_its_back() {
        let dir = tempdir().expect("tempdir");
        let mut log = seeded_log(dir.path());
        let path = dir.path().join("idx.json");
        let (mut index, _) = PositionIndex::open(&path, "umich", &log).expect("open");
        index.save(log.size()).expect("save");

        let c = log.append(&record("C", "Gamma")).expect("append unindexed");
        let (index, status) = PositionIndex::open(&path, "umich", &log).expect("reopen");
        assert!(matches!(status, IndexStatus::Rebuilt { .. }));
        assert_eq!(index.lookup("C"), Some(c.offset));
    }

    #[test]
    fn tampered_entries_fail_the_checksum() {
        let dir = tempdir().expect("tempdir");
        let log = seeded_log(dir.path());
        let path = dir.path().join("idx.json");
        let (mut index, _) = PositionIndex::open(&path, "umich", &log).expect("open");
        index.save(log.size()).expect("save");

        let mut file: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        file["entries"]["A"]["offset"] = serde_json::json!(0);
        fs::write(&path, serde_json::to_vec(&file).expect("encode")).expect("write");

        let (index, status) = PositionIndex::open(&path, "umich", &log).expect("reopen");
        match status {
            IndexStatus::Rebuilt { reason, .. } => assert!(reason.contains("checksum")),
            other => panic!("expected rebuild, got {other:?}"),
        }
        assert_eq!(log.read_at(index.lookup("A").unwrap()).unwrap().title, "Alpha v2");
    }

    #[test]
    fn index_for_another_source_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let log = seeded_log(dir.path());
        let path = dir.path().join("idx.json");
        let (mut index, _) = PositionIndex::open(&path, "umich", &log).expect("open");
        index.save(log.size()).expect("save");

        let (_, status) = PositionIndex::open(&path, "msu", &log).expect("reopen");
        assert!(matches!(status, IndexStatus::Rebuilt { .. }));
    }

    proptest! {
        #[test]
        fn rebuilt_index_points_at_last_version(ops in prop::collection::vec((0u8..6, "[a-z]{0,12}"), 1..40)) {
            let dir = tempdir().unwrap();
            let mut log = AppendLog::open(dir.path().join("log.jsonl")).unwrap();
            let mut model: HashMap<String, (u64, String)> = HashMap::new();
            for (id, title) in &ops {
                let id = format!("id-{id}");
                let pos = log.append(&record(&id, title)).unwrap();
                model.insert(id, (pos.offset, title.clone()));
            }

            let mut index = PositionIndex::empty(dir.path().join("idx.json"), "umich");
            index.rebuild_from(&log).unwrap();
            prop_assert_eq!(index.len(), model.len());
            for (id, (offset, title)) in &model {
                prop_assert_eq!(index.lookup(id), Some(*offset));
                prop_assert_eq!(&log.read_at(*offset).unwrap().title, title);
            }
        }
    }
}
