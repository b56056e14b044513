//! Per-source storage: the append-only log, its position index and the seen-id set,
//! kept consistent behind one handle.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use optrack_core::OpportunityRecord;
use tracing::{info, info_span, warn};

use crate::compactor::{self, CompactionReport};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::index::{IndexStatus, PositionIndex, RebuildStats};
use crate::legacy;
use crate::lock::SourceLock;
use crate::log::{AppendLog, LogPosition};
use crate::seen::SeenIdSet;

/// File names for one source under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
    source: String,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>, source: &str) -> StoreResult<Self> {
        validate_source_code(source)?;
        Ok(Self {
            root: root.into(),
            source: source.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> PathBuf {
        self.file("grants_data.jsonl")
    }

    pub fn index(&self) -> PathBuf {
        self.file("grants_index.json")
    }

    pub fn seen(&self) -> PathBuf {
        self.file("seen_competitions.json")
    }

    pub fn legacy_snapshot(&self) -> PathBuf {
        self.file("grants.json")
    }

    pub fn last_run(&self) -> PathBuf {
        self.file("last_run.json")
    }

    pub fn csv_export(&self) -> PathBuf {
        self.file("grants.csv")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(format!("{}.lock", self.source))
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}_{suffix}", self.source))
    }
}

/// Source codes become file-name prefixes, so only a conservative alphabet is accepted.
pub fn validate_source_code(code: &str) -> StoreResult<()> {
    let valid = !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSourceCode(code.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Single writer; takes the source lock and persists repairs.
    ReadWrite,
    /// No lock and no writes; repairs stay in memory.
    ReadOnly,
}

#[derive(Debug)]
pub struct SourceStore {
    paths: StorePaths,
    mode: OpenMode,
    log: AppendLog,
    index: PositionIndex,
    seen: SeenIdSet,
    _lock: Option<SourceLock>,
}

impl SourceStore {
    pub fn open(root: impl AsRef<Path>, source: &str, mode: OpenMode) -> StoreResult<Self> {
        let paths = StorePaths::new(root.as_ref(), source)?;
        let span = info_span!("open_store", source, mode = ?mode);
        let _guard = span.enter();

        let lock = match mode {
            OpenMode::ReadWrite => {
                fs::create_dir_all(paths.root())
                    .io_context(|| format!("creating data root {}", paths.root().display()))?;
                Some(SourceLock::try_acquire(&paths.lock(), source)?)
            }
            OpenMode::ReadOnly => None,
        };

        let log = AppendLog::open(paths.data())?.with_legacy_source(source);
        let (index, status) = PositionIndex::open(paths.index(), source, &log)?;
        let seen = SeenIdSet::open(paths.seen(), source, mode)?;
        let mut store = Self {
            paths,
            mode,
            log,
            index,
            seen,
            _lock: lock,
        };

        let mut legacy_lines = 0;
        if let IndexStatus::Rebuilt {
            reason,
            corrupt_skipped,
            legacy_records,
        } = &status
        {
            legacy_lines = *legacy_records;
            if store.log.size() > 0 {
                info!(
                    %reason,
                    corrupt_skipped,
                    legacy_records,
                    records = store.index.len(),
                    "index rebuilt on open"
                );
            }
        }

        if mode == OpenMode::ReadWrite && legacy_lines > 0 {
            let report = compactor::compact(&mut store.log, &mut store.index)?;
            info!(
                legacy_lines = report.legacy_upgraded,
                records = report.records_after,
                "rewrote legacy log lines in the current layout"
            );
        }

        if mode == OpenMode::ReadWrite
            && store.index.is_empty()
            && store.paths.legacy_snapshot().exists()
        {
            store.import_legacy_snapshot()?;
        }

        let ids: Vec<String> = store.index.identifiers().map(str::to_string).collect();
        let repaired = store.seen.add_many(ids);
        if repaired > 0 {
            warn!(repaired, "seen-id set was missing indexed identifiers");
        }

        if mode == OpenMode::ReadWrite {
            store.flush()?;
        }
        Ok(store)
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn source(&self) -> &str {
        self.paths.source()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn log(&self) -> &AppendLog {
        &self.log
    }

    pub fn index(&self) -> &PositionIndex {
        &self.index
    }

    pub fn seen(&self) -> &SeenIdSet {
        &self.seen
    }

    pub fn is_seen(&self, identifier: &str) -> bool {
        self.seen.contains(identifier)
    }

    /// Record an identifier as observed without writing a record for it.
    pub fn mark_seen(&mut self, identifier: &str) -> StoreResult<bool> {
        self.ensure_writable()?;
        Ok(self.seen.add(identifier))
    }

    /// Latest stored version of `identifier`.
    ///
    /// A pointer that falls outside the log or lands on undecodable bytes means the
    /// index is stale; it is rebuilt from the log and the lookup retried once.
    pub fn get(&mut self, identifier: &str) -> StoreResult<Option<OpportunityRecord>> {
        let Some(offset) = self.index.lookup(identifier) else {
            return Ok(None);
        };
        match self.log.read_at(offset) {
            Ok(record) if record.identifier == identifier => return Ok(Some(record)),
            Ok(record) => warn!(
                identifier,
                offset,
                found = %record.identifier,
                "index entry points at another identifier"
            ),
            Err(err) if err.is_recoverable() => {
                warn!(identifier, offset, %err, "stale index entry")
            }
            Err(err) => return Err(err),
        }

        self.rebuild_index()?;
        match self.index.lookup(identifier) {
            Some(offset) => self.log.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Append a new version of a record and point the index and seen set at it.
    pub fn append(&mut self, record: &OpportunityRecord) -> StoreResult<LogPosition> {
        self.ensure_writable()?;
        let position = self.log.append(record)?;
        self.index.put(record.identifier.clone(), position);
        self.seen.add(record.identifier.clone());
        Ok(position)
    }

    /// Persist the index and the seen set.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.ensure_writable()?;
        self.index.save(self.log.size())?;
        self.seen.save()?;
        Ok(())
    }

    pub fn rebuild_index(&mut self) -> StoreResult<RebuildStats> {
        let stats = self.index.rebuild_from(&self.log)?;
        info!(
            source = self.source(),
            records = stats.records,
            corrupt = stats.corrupt_skipped,
            "rebuilt index"
        );
        if self.mode == OpenMode::ReadWrite {
            self.index.save(self.log.size())?;
        }
        Ok(stats)
    }

    pub fn compact(&mut self) -> StoreResult<CompactionReport> {
        self.ensure_writable()?;
        let span = info_span!("compact", source = self.source());
        let _guard = span.enter();
        compactor::compact(&mut self.log, &mut self.index)
    }

    /// True when the log has grown to at least `ratio` times the bytes the index still
    /// references. A non-positive ratio disables the check.
    pub fn needs_compaction(&self, ratio: f64) -> bool {
        let live = self.index.live_bytes();
        ratio > 0.0 && live > 0 && self.log.size() as f64 >= ratio * live as f64
    }

    /// Latest version of every identifier, ordered by identifier.
    pub fn latest_records(&mut self) -> StoreResult<Vec<OpportunityRecord>> {
        let ids = self.index.sorted_identifiers();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Write `{site}_grants.json` for older readers. Returns the record count.
    pub fn export_legacy_snapshot(&mut self) -> StoreResult<usize> {
        let records = self.latest_records()?;
        legacy::write_snapshot(
            &self.paths.legacy_snapshot(),
            self.source(),
            &records,
            Utc::now(),
        )?;
        Ok(records.len())
    }

    /// Seed an empty log from `{site}_grants.json`. Returns how many records were imported.
    pub fn import_legacy_snapshot(&mut self) -> StoreResult<usize> {
        self.ensure_writable()?;
        let path = self.paths.legacy_snapshot();
        let records = legacy::read_snapshot(&path, self.source(), Utc::now())?;
        for record in &records {
            self.append(record)?;
        }
        self.flush()?;
        info!(
            source = self.source(),
            path = %path.display(),
            imported = records.len(),
            "seeded log from legacy snapshot"
        );
        Ok(records.len())
    }

    /// Merge ids from the legacy global seen file. Returns how many were new.
    pub fn import_legacy_seen(&mut self, path: &Path) -> StoreResult<usize> {
        self.ensure_writable()?;
        let added = self.seen.import_legacy(path)?;
        self.seen.save()?;
        Ok(added)
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(StoreError::ReadOnly(self.source().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use optrack_core::{Candidate, Details};
    use serde_json::json;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn stub(id: &str) -> OpportunityRecord {
        OpportunityRecord::stub(&Candidate::new("umich", id).with_title(format!("Grant {id}")), ts(1))
    }

    #[test]
    fn source_codes_are_restricted() {
        assert!(validate_source_code("umich").is_ok());
        assert!(validate_source_code("msu-2").is_ok());
        for bad in ["", "../etc", "a b", "x/y"] {
            assert!(matches!(
                validate_source_code(bad),
                Err(StoreError::InvalidSourceCode(_))
            ));
        }
    }

    #[test]
    fn paths_follow_the_historical_layout() {
        let paths = StorePaths::new("/data", "umich").expect("paths");
        assert_eq!(paths.data(), PathBuf::from("/data/umich_grants_data.jsonl"));
        assert_eq!(paths.index(), PathBuf::from("/data/umich_grants_index.json"));
        assert_eq!(paths.seen(), PathBuf::from("/data/umich_seen_competitions.json"));
        assert_eq!(paths.legacy_snapshot(), PathBuf::from("/data/umich_grants.json"));
    }

    #[test]
    fn appended_records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
            store.append(&stub("1")).expect("append");
            store.append(&stub("2")).expect("append");
            store.flush().expect("flush");
        }
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadOnly).expect("reopen");
        assert_eq!(store.get("2").expect("get").expect("present").title, "Grant 2");
        assert!(store.get("3").expect("get").is_none());
        assert!(store.is_seen("1"));
    }

    #[test]
    fn second_writer_is_locked_out_but_readers_are_not() {
        let dir = tempdir().expect("tempdir");
        let _writer = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("writer");
        let err = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
        SourceStore::open(dir.path(), "umich", OpenMode::ReadOnly).expect("reader");
    }

    #[test]
    fn read_only_store_refuses_writes() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadOnly).expect("open");
        assert!(matches!(store.append(&stub("1")), Err(StoreError::ReadOnly(_))));
        assert!(!dir.path().join("umich_grants_data.jsonl").exists());
    }

    #[test]
    fn unflushed_appends_are_recovered_from_the_log() {
        let dir = tempdir().expect("tempdir");
        {
            let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
            store.append(&stub("1")).expect("append");
            store.flush().expect("flush");
            // Simulated crash: appended but neither index nor seen set saved.
            store.append(&stub("2")).expect("append");
        }
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("reopen");
        assert!(store.get("2").expect("get").is_some());
        assert!(store.is_seen("2"));
    }

    #[test]
    fn index_pointing_past_the_log_is_repaired_on_read() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        store.append(&stub("1")).expect("append");
        store.index.put("1", LogPosition { offset: 10_000, len: 10 });

        let record = store.get("1").expect("get").expect("present after rebuild");
        assert_eq!(record.identifier, "1");
        assert_eq!(store.index().lookup("1"), Some(0));
    }

    #[test]
    fn torn_tail_does_not_hide_earlier_records() {
        let dir = tempdir().expect("tempdir");
        {
            let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
            store.append(&stub("1")).expect("append");
            store.flush().expect("flush");
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("umich_grants_data.jsonl"))
            .expect("open log");
        file.write_all(b"{\"competition_id\":\"2\",\"si").expect("torn write");
        drop(file);

        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("reopen");
        assert!(store.get("1").expect("get").is_some());
        assert!(store.get("2").expect("get").is_none());
        store.append(&stub("3")).expect("append after torn tail");
        assert!(store.get("3").expect("get").is_some());
    }

    #[test]
    fn compaction_preserves_reads_and_shrinks_the_log() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        store.append(&stub("A")).expect("a1");
        store.append(&stub("B")).expect("b");
        let mut detailed = stub("A");
        let mut details = Details::new();
        details.insert("Deadline".into(), json!("2026-05-01"));
        detailed.details = Some(details);
        store.append(&detailed).expect("a2");
        assert!(store.needs_compaction(1.2));
        assert!(!store.needs_compaction(0.0));

        let before_a = store.get("A").expect("get").expect("A");
        let report = store.compact().expect("compact");
        assert_eq!(report.records_after, 2);
        assert_eq!(store.get("A").expect("get").expect("A"), before_a);
        assert!(store.get("B").expect("get").is_some());
        assert!(!store.needs_compaction(1.2));
    }

    #[test]
    fn legacy_snapshot_seeds_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        {
            let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
            store.append(&stub("1")).expect("append");
            store.append(&stub("2")).expect("append");
            assert_eq!(store.export_legacy_snapshot().expect("export"), 2);
        }
        fs::remove_file(dir.path().join("umich_grants_data.jsonl")).expect("remove log");
        fs::remove_file(dir.path().join("umich_grants_index.json")).expect("remove index");

        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("reopen");
        assert_eq!(store.index().len(), 2);
        assert_eq!(store.get("1").expect("get").expect("1").title, "Grant 1");
    }

    fn write_earlier_tracker_state(root: &Path) {
        fs::write(
            root.join("umich_grants_data.jsonl"),
            concat!(
                r#"{"competition_id": "98123", "title": "Seed", "link": "https://umich.infoready4.com#competitionDetail/98123", "description_full": "Body", "details": {"Deadline": "03/15/2026", "Award": 25000.5}}"#,
                "\n",
                r#"{"competition_id": "98124", "title": "Bridge", "link": "https://umich.infoready4.com#competitionDetail/98124", "description_full": ""}"#,
                "\n",
            ),
        )
        .expect("log");
        fs::write(
            root.join("umich_grants_index.json"),
            br#"{"site": "umich", "count": 2, "last_updated": "2025-05-01T08:30:00.123456", "index": {"98123": 0, "98124": 1}}"#,
        )
        .expect("index");
        fs::write(
            root.join("umich_seen_competitions.json"),
            br#"{"source": "umich", "ids": ["98123", "98124", "98125"], "count": 3, "last_updated": "2025-05-01T08:30:00.123456"}"#,
        )
        .expect("seen");
    }

    #[test]
    fn earlier_tracker_log_is_rewritten_on_first_writable_open() {
        let dir = tempdir().expect("tempdir");
        write_earlier_tracker_state(dir.path());

        {
            let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
            assert_eq!(store.index().len(), 2);
            assert_eq!(store.seen().len(), 3);
            let seed = store.get("98123").expect("get").expect("98123");
            assert_eq!(seed.source, "umich");
            assert_eq!(seed.description, "Body");
            assert_eq!(seed.details.as_ref().expect("details")["Award"], json!(25000.5));
        }

        let log_path = dir.path().join("umich_grants_data.jsonl");
        let text = fs::read_to_string(&log_path).expect("read log");
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            crate::codec::decode(line.as_bytes(), offset).expect("current layout");
            offset += line.len() as u64;
        }
        assert!(!dir.path().join("umich_grants_data.jsonl.compact.tmp").exists());

        let log = AppendLog::open(&log_path).expect("log");
        let (_, status) =
            PositionIndex::open(dir.path().join("umich_grants_index.json"), "umich", &log).expect("index");
        assert_eq!(status, IndexStatus::Loaded);
    }

    #[test]
    fn read_only_open_reads_earlier_tracker_log_without_rewriting() {
        let dir = tempdir().expect("tempdir");
        write_earlier_tracker_state(dir.path());
        let log_before = fs::read(dir.path().join("umich_grants_data.jsonl")).expect("read");

        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadOnly).expect("open");
        let ids: Vec<_> = store
            .latest_records()
            .expect("records")
            .into_iter()
            .map(|r| r.identifier)
            .collect();
        assert_eq!(ids, vec!["98123", "98124"]);
        assert!(store.is_seen("98125"));
        drop(store);

        assert_eq!(fs::read(dir.path().join("umich_grants_data.jsonl")).expect("read"), log_before);
    }
}
