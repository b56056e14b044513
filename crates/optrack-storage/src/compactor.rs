//! Rewrites a log so it holds only the latest version of each identifier.
//!
//! The replacement is written to a sibling temp file, synced, and renamed over the live
//! log. A crash before the rename leaves the old log untouched; a crash after it leaves a
//! stale index that the next open detects and rebuilds.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use optrack_core::OpportunityRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec;
use crate::error::{IoContext, StoreResult};
use crate::fsutil;
use crate::index::PositionIndex;
use crate::log::{AppendLog, LogPosition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub records_before: usize,
    pub records_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub corrupt_skipped: usize,
    /// Lines rewritten from the earlier tracker's layout.
    #[serde(default)]
    pub legacy_upgraded: usize,
}

impl CompactionReport {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

pub fn compact(log: &mut AppendLog, index: &mut PositionIndex) -> StoreResult<CompactionReport> {
    let bytes_before = log.size();
    if !log.exists() {
        return Ok(CompactionReport::default());
    }

    let mut latest: BTreeMap<String, OpportunityRecord> = BTreeMap::new();
    let mut records_before = 0;
    let mut iter = log.iterate()?;
    for entry in iter.by_ref() {
        let (_, record) = entry?;
        records_before += 1;
        latest.insert(record.identifier.clone(), record);
    }
    let corrupt_skipped = iter.corrupt_count();
    let legacy_upgraded = iter.legacy_count();

    let temp_path = compaction_path(log);
    let positions = match write_compacted(&temp_path, &latest) {
        Ok(positions) => positions,
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
    };
    fs::rename(&temp_path, log.path()).io_context(|| {
        format!(
            "replacing {} with {}",
            log.path().display(),
            temp_path.display()
        )
    })?;
    if let Some(parent) = log.path().parent() {
        fsutil::sync_dir(parent)?;
    }
    log.reopen()?;

    index.clear();
    for (identifier, position) in positions {
        index.put(identifier, position);
    }
    index.save(log.size())?;

    let report = CompactionReport {
        records_before,
        records_after: latest.len(),
        bytes_before,
        bytes_after: log.size(),
        corrupt_skipped,
        legacy_upgraded,
    };
    info!(
        path = %log.path().display(),
        records_before = report.records_before,
        records_after = report.records_after,
        bytes_reclaimed = report.bytes_reclaimed(),
        "compacted log"
    );
    Ok(report)
}

fn compaction_path(log: &AppendLog) -> PathBuf {
    let mut name = log
        .path()
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".compact.tmp");
    log.path().with_file_name(name)
}

fn write_compacted(
    temp_path: &Path,
    latest: &BTreeMap<String, OpportunityRecord>,
) -> StoreResult<Vec<(String, LogPosition)>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path)
        .io_context(|| format!("creating {}", temp_path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut positions = Vec::with_capacity(latest.len());
    let mut offset = 0u64;
    for (identifier, record) in latest {
        let line = codec::encode(record)?;
        writer
            .write_all(&line)
            .io_context(|| format!("writing {}", temp_path.display()))?;
        let len = line.len() as u64;
        positions.push((identifier.clone(), LogPosition { offset, len }));
        offset += len;
    }
    let file = writer
        .into_inner()
        .map_err(|err| err.into_error())
        .io_context(|| format!("flushing {}", temp_path.display()))?;
    file.sync_all()
        .io_context(|| format!("syncing {}", temp_path.display()))?;
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use optrack_core::{Candidate, Details};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str, title: &str, hour: u32) -> OpportunityRecord {
        OpportunityRecord::stub(
            &Candidate::new("umich", id).with_title(title),
            Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap(),
        )
    }

    #[test]
    fn compaction_keeps_latest_version_of_each_identifier() {
        let dir = tempdir().expect("tempdir");
        let mut log = AppendLog::open(dir.path().join("umich_grants_data.jsonl")).expect("open");
        log.append(&record("A", "Alpha", 1)).expect("a1");
        log.append(&record("B", "Beta", 1)).expect("b");
        let mut detailed = record("A", "Alpha", 1);
        let mut details = Details::new();
        details.insert("Deadline".into(), json!("2026-05-01"));
        detailed.details = Some(details);
        log.append(&detailed).expect("a2");

        let (mut index, _) =
            PositionIndex::open(dir.path().join("idx.json"), "umich", &log).expect("index");
        let report = compact(&mut log, &mut index).expect("compact");

        assert_eq!(report.records_before, 3);
        assert_eq!(report.records_after, 2);
        assert!(report.bytes_after < report.bytes_before);
        assert_eq!(log.size(), report.bytes_after);
        assert_eq!(index.live_bytes(), log.size());

        let a = log.read_at(index.lookup("A").expect("A")).expect("read A");
        assert!(a.has_details());
        assert_eq!(log.read_at(index.lookup("B").expect("B")).expect("read B").title, "Beta");
        assert!(!dir.path().join("umich_grants_data.jsonl.compact.tmp").exists());

        let (_, status) =
            PositionIndex::open(dir.path().join("idx.json"), "umich", &log).expect("reload");
        assert_eq!(status, crate::index::IndexStatus::Loaded);
    }

    #[test]
    fn compaction_drops_corrupt_lines_and_appends_continue() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let mut log = AppendLog::open(&path).expect("open");
        log.append(&record("A", "Alpha", 1)).expect("a");
        drop(log);
        let mut file = OpenOptions::new().append(true).open(&path).expect("reopen");
        file.write_all(b"garbage\n{\"competition_id\":").expect("corrupt");
        drop(file);

        let mut log = AppendLog::open(&path).expect("open");
        let (mut index, _) =
            PositionIndex::open(dir.path().join("idx.json"), "umich", &log).expect("index");
        let report = compact(&mut log, &mut index).expect("compact");
        assert_eq!(report.records_after, 1);
        assert_eq!(report.corrupt_skipped, 2);

        let c = log.append(&record("C", "Gamma", 2)).expect("append after compaction");
        assert_eq!(log.read_at(c.offset).expect("read").identifier, "C");
    }

    #[test]
    fn compacting_a_missing_log_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let mut log = AppendLog::open(dir.path().join("none.jsonl")).expect("open");
        let mut index = PositionIndex::empty(dir.path().join("idx.json"), "umich");
        assert_eq!(
            compact(&mut log, &mut index).expect("compact"),
            CompactionReport::default()
        );
        assert!(!log.exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn compaction_matches_a_replay_of_the_log(
            lines in prop::collection::vec(
                prop_oneof![
                    3 => ("[A-D]", "[a-z]{0,8}", 0u32..24).prop_map(|(id, title, hour)| Some((id, title, hour))),
                    1 => Just(None),
                ],
                0..24,
            ),
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("umich_grants_data.jsonl");
            let mut bytes = Vec::new();
            for line in &lines {
                match line {
                    Some((id, title, hour)) => {
                        bytes.extend(codec::encode(&record(id, title, *hour)).unwrap())
                    }
                    None => bytes.extend_from_slice(b"{\"competition_id\": \n"),
                }
            }
            fs::write(&path, &bytes).unwrap();

            let mut log = AppendLog::open(&path).unwrap();
            let mut replayed = BTreeMap::new();
            for entry in log.iterate().unwrap() {
                let (_, record) = entry.unwrap();
                replayed.insert(record.identifier.clone(), record);
            }
            let (mut index, _) = PositionIndex::open(dir.path().join("idx.json"), "umich", &log).unwrap();
            let report = compact(&mut log, &mut index).unwrap();

            prop_assert_eq!(report.records_after, replayed.len());
            prop_assert_eq!(report.corrupt_skipped, lines.iter().filter(|l| l.is_none()).count());
            let compacted: Vec<OpportunityRecord> = log
                .iterate()
                .unwrap()
                .map(|entry| entry.map(|(_, record)| record))
                .collect::<StoreResult<_>>()
                .unwrap();
            let expected: Vec<OpportunityRecord> = replayed.values().cloned().collect();
            prop_assert_eq!(&compacted, &expected);
            prop_assert_eq!(index.len(), expected.len());
            for record in &expected {
                let offset = index.lookup(&record.identifier).unwrap();
                prop_assert_eq!(&log.read_at(offset).unwrap(), record);
            }
            prop_assert_eq!(index.live_bytes(), log.size());
        }
    }
}
