//! Folds a scraper candidate batch into a source's store.

use chrono::{DateTime, Utc};
use optrack_core::{Candidate, ChangeSummary, OpportunityRecord, RejectReason, ScanMode};
use optrack_storage::{SourceStore, StoreError, StoreResult};
use thiserror::Error;
use tracing::{info, info_span, warn};

/// A batch stopped on a storage failure. Everything counted in `processed` is durable.
#[derive(Debug, Error)]
#[error("reconciliation aborted after {} candidates: {source}", .processed.processed())]
pub struct ReconcileError {
    pub processed: ChangeSummary,
    #[source]
    pub source: StoreError,
}

pub struct Reconciler<'a> {
    store: &'a mut SourceStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a mut SourceStore) -> Self {
        Self { store }
    }

    pub fn reconcile(
        &mut self,
        candidates: &[Candidate],
        mode: ScanMode,
    ) -> Result<ChangeSummary, ReconcileError> {
        self.reconcile_at(candidates, mode, Utc::now())
    }

    pub fn reconcile_at(
        &mut self,
        candidates: &[Candidate],
        mode: ScanMode,
        now: DateTime<Utc>,
    ) -> Result<ChangeSummary, ReconcileError> {
        let span = info_span!(
            "reconcile",
            source = self.store.source(),
            mode = %mode,
            candidates = candidates.len()
        );
        let _guard = span.enter();

        let mut summary = ChangeSummary::default();
        for (position, candidate) in candidates.iter().enumerate() {
            if let Err(source) = self.apply(position, candidate, mode, now, &mut summary) {
                if let Err(flush_err) = self.store.flush() {
                    warn!(%flush_err, "could not persist index after aborted batch");
                }
                return Err(ReconcileError {
                    processed: summary,
                    source,
                });
            }
        }
        if let Err(source) = self.store.flush() {
            return Err(ReconcileError {
                processed: summary,
                source,
            });
        }
        info!(%summary, "reconciled batch");
        Ok(summary)
    }

    fn apply(
        &mut self,
        position: usize,
        candidate: &Candidate,
        mode: ScanMode,
        now: DateTime<Utc>,
        summary: &mut ChangeSummary,
    ) -> StoreResult<()> {
        let Some(candidate) = self.admit(position, candidate, mode, summary) else {
            return Ok(());
        };
        let identifier = candidate.identifier.clone();

        match mode {
            ScanMode::FastScan => {
                if self.store.is_seen(&identifier) {
                    summary.known += 1;
                } else {
                    self.store.append(&OpportunityRecord::stub(&candidate, now))?;
                    summary.new += 1;
                    summary.new_ids.push(identifier);
                }
            }
            ScanMode::Detail => match self.store.get(&identifier)? {
                None => {
                    self.store
                        .append(&OpportunityRecord::from_candidate(&candidate, now))?;
                    summary.new_with_details += 1;
                    summary.new_ids.push(identifier);
                }
                Some(stored) => {
                    let merged = stored.merged_with(&candidate, now);
                    if merged.same_content(&stored) {
                        summary.unchanged += 1;
                    } else {
                        self.store.append(&merged)?;
                        summary.updated += 1;
                    }
                }
            },
        }
        Ok(())
    }

    /// Validate a candidate and normalise its identifier and source tag.
    fn admit(
        &self,
        position: usize,
        candidate: &Candidate,
        mode: ScanMode,
        summary: &mut ChangeSummary,
    ) -> Option<Candidate> {
        let identifier = candidate.identifier.trim();
        let found = candidate.source.trim();
        let reason = if identifier.is_empty() {
            Some(RejectReason::MissingIdentifier)
        } else if !found.is_empty() && found != self.store.source() {
            Some(RejectReason::SourceMismatch {
                expected: self.store.source().to_string(),
                found: found.to_string(),
            })
        } else if mode == ScanMode::Detail && !candidate.has_details() {
            Some(RejectReason::MissingDetails)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(position, identifier, %reason, "rejected candidate");
            let identifier = (!identifier.is_empty()).then(|| identifier.to_string());
            summary.reject(position, identifier, reason);
            return None;
        }

        Some(Candidate {
            source: self.store.source().to_string(),
            identifier: identifier.to_string(),
            ..candidate.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use optrack_core::Details;
    use optrack_storage::OpenMode;
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn listing(id: &str) -> Candidate {
        Candidate::new("umich", id)
            .with_title(format!("Grant {id}"))
            .with_link(format!("https://umich.infoready4.com#competitionDetail/{id}"))
    }

    fn detailed(id: &str, budget: i64) -> Candidate {
        let mut details = Details::new();
        details.insert("Budget".into(), json!(budget));
        Candidate::new("umich", id).with_details(details)
    }

    #[test]
    fn malformed_candidates_are_rejected_without_stopping_the_batch() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        let batch = vec![
            listing("1"),
            Candidate::new("umich", "   "),
            Candidate::new("msu", "2"),
            listing("3"),
        ];
        let summary = Reconciler::new(&mut store)
            .reconcile_at(&batch, ScanMode::FastScan, ts(1))
            .expect("reconcile");

        assert_eq!(summary.new, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.rejections[0].position, 1);
        assert_eq!(summary.rejections[0].reason, RejectReason::MissingIdentifier);
        assert!(matches!(
            summary.rejections[1].reason,
            RejectReason::SourceMismatch { ref found, .. } if found == "msu"
        ));
        assert!(!store.is_seen("2"));
    }

    #[test]
    fn duplicate_identifiers_within_a_fast_scan_count_once() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        let summary = Reconciler::new(&mut store)
            .reconcile_at(&[listing("A"), listing(" A ")], ScanMode::FastScan, ts(1))
            .expect("reconcile");
        assert_eq!((summary.new, summary.known), (1, 1));
        assert_eq!(summary.new_ids, vec!["A"]);
    }

    #[test]
    fn detail_candidates_without_details_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        let summary = Reconciler::new(&mut store)
            .reconcile_at(&[listing("A")], ScanMode::Detail, ts(1))
            .expect("reconcile");
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.rejections[0].reason, RejectReason::MissingDetails);
        assert_eq!(store.log().size(), 0);
    }

    #[test]
    fn detail_for_unknown_identifier_is_new_with_details() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        let summary = Reconciler::new(&mut store)
            .reconcile_at(&[detailed("Z", 5)], ScanMode::Detail, ts(2))
            .expect("reconcile");
        assert_eq!(summary.new_with_details, 1);
        assert_eq!(summary.new_ids, vec!["Z"]);
        assert!(store.is_seen("Z"));
        let stored = store.get("Z").expect("get").expect("Z");
        assert!(stored.has_details());
        assert_eq!(stored.first_seen_at, ts(2));
    }

    #[test]
    fn changed_details_append_an_update_and_keep_first_seen() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadWrite).expect("open");
        let mut reconciler = Reconciler::new(&mut store);
        reconciler
            .reconcile_at(&[listing("A")], ScanMode::FastScan, ts(1))
            .expect("fast scan");
        reconciler
            .reconcile_at(&[detailed("A", 5)], ScanMode::Detail, ts(2))
            .expect("first detail");
        let summary = reconciler
            .reconcile_at(&[detailed("A", 6)], ScanMode::Detail, ts(3))
            .expect("second detail");
        assert_eq!(summary.updated, 1);

        let stored = store.get("A").expect("get").expect("A");
        assert_eq!(stored.title, "Grant A");
        assert_eq!(stored.first_seen_at, ts(1));
        assert_eq!(stored.last_updated_at, ts(3));
        assert_eq!(stored.details.expect("details")["Budget"], json!(6));
    }

    #[test]
    fn read_only_store_aborts_with_partial_counts() {
        let dir = tempdir().expect("tempdir");
        let mut store = SourceStore::open(dir.path(), "umich", OpenMode::ReadOnly).expect("open");
        let err = Reconciler::new(&mut store)
            .reconcile_at(&[Candidate::new("umich", ""), listing("A")], ScanMode::FastScan, ts(1))
            .unwrap_err();
        assert_eq!(err.processed.rejected, 1);
        assert_eq!(err.processed.new, 0);
        assert!(matches!(err.source, StoreError::ReadOnly(_)));
    }
}
