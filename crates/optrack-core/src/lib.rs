//! Core domain model for OpTrack: opportunity records, scan candidates and change summaries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "optrack-core";

/// Opaque key/value payload produced by the detail-fetch step.
pub type Details = BTreeMap<String, JsonValue>;

/// Collapse an empty payload to `None` so "has details" has a single representation.
pub fn normalize_details(details: Option<Details>) -> Option<Details> {
    details.filter(|d| !d.is_empty())
}

/// One funding opportunity as persisted in a source's log.
///
/// The serialized field names keep the historical JSON layout (`competition_id`, `site`)
/// so exported snapshots stay readable by older tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    #[serde(rename = "competition_id")]
    pub identifier: String,
    #[serde(rename = "site")]
    pub source: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl OpportunityRecord {
    /// A detail-less record written when a fast scan first observes an identifier.
    pub fn stub(candidate: &Candidate, now: DateTime<Utc>) -> Self {
        Self {
            identifier: candidate.identifier.trim().to_string(),
            source: candidate.source.clone(),
            title: candidate.title.clone(),
            link: candidate.link.clone(),
            description: candidate.description.clone(),
            details: None,
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    /// A brand-new record carrying the candidate's full payload.
    pub fn from_candidate(candidate: &Candidate, now: DateTime<Utc>) -> Self {
        Self {
            details: normalize_details(candidate.details.clone()),
            ..Self::stub(candidate, now)
        }
    }

    pub fn has_details(&self) -> bool {
        self.details.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Content equality, ignoring bookkeeping timestamps.
    pub fn same_content(&self, other: &OpportunityRecord) -> bool {
        self.identifier == other.identifier
            && self.source == other.source
            && self.title == other.title
            && self.link == other.link
            && self.description == other.description
            && normalize_details(self.details.clone()) == normalize_details(other.details.clone())
    }

    /// Fold a detail candidate into this stored record.
    ///
    /// Non-empty candidate text fields win, the details payload is replaced wholesale and
    /// `first_seen_at` is preserved.
    pub fn merged_with(&self, candidate: &Candidate, now: DateTime<Utc>) -> Self {
        Self {
            identifier: self.identifier.clone(),
            source: self.source.clone(),
            title: prefer_non_empty(&candidate.title, &self.title),
            link: prefer_non_empty(&candidate.link, &self.link),
            description: prefer_non_empty(&candidate.description, &self.description),
            details: normalize_details(candidate.details.clone()),
            first_seen_at: self.first_seen_at,
            last_updated_at: now,
        }
    }
}

fn prefer_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

/// Partial-or-full record handed over by the scraper collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub source: String,
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Option<Details>,
}

impl Candidate {
    pub fn new(source: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details = Some(details);
        self
    }

    pub fn has_details(&self) -> bool {
        self.details.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// Which upstream scan strategy produced a candidate batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    FastScan,
    Detail,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::FastScan => f.write_str("fast-scan"),
            ScanMode::Detail => f.write_str("detail"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    MissingIdentifier,
    SourceMismatch { expected: String, found: String },
    MissingDetails,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingIdentifier => f.write_str("missing identifier"),
            RejectReason::SourceMismatch { expected, found } => {
                write!(f, "candidate tagged {found:?}, expected {expected:?}")
            }
            RejectReason::MissingDetails => f.write_str("detail candidate without details"),
        }
    }
}

/// A malformed candidate that was skipped during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedCandidate {
    /// Position of the candidate within its batch.
    pub position: usize,
    pub identifier: Option<String>,
    pub reason: RejectReason,
}

/// Per-run outcome of reconciling one candidate batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub new: usize,
    pub known: usize,
    pub new_with_details: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    /// Identifiers first recorded by this run, in batch order.
    #[serde(default)]
    pub new_ids: Vec<String>,
    #[serde(default)]
    pub rejections: Vec<RejectedCandidate>,
}

impl ChangeSummary {
    /// Candidates looked at so far, rejected ones included.
    pub fn processed(&self) -> usize {
        self.new + self.known + self.new_with_details + self.updated + self.unchanged + self.rejected
    }

    /// Number of log appends this summary accounts for.
    pub fn appended(&self) -> usize {
        self.new + self.new_with_details + self.updated
    }

    pub fn reject(&mut self, position: usize, identifier: Option<String>, reason: RejectReason) {
        self.rejected += 1;
        self.rejections.push(RejectedCandidate {
            position,
            identifier,
            reason,
        });
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "new={} known={} new_with_details={} updated={} unchanged={} rejected={}",
            self.new, self.known, self.new_with_details, self.updated, self.unchanged, self.rejected
        )
    }
}
