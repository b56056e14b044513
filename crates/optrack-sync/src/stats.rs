//! Per-source counts and storage footprint, read without taking the writer lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use optrack_adapters::{detail_link, AdapterContext};
use optrack_core::OpportunityRecord;
use optrack_storage::{file_size, validate_source_code, OpenMode, SourceStore, StorePaths};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RunReport;

const STATE_SUFFIXES: [&str; 3] = ["_grants_data.jsonl", "_seen_competitions.json", "_grants.json"];
const PENDING_PREVIEW: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub log_bytes: u64,
    pub index_bytes: u64,
    pub seen_bytes: u64,
    pub legacy_bytes: u64,
    pub csv_bytes: u64,
    pub total_bytes: u64,
}

impl StorageStats {
    fn measure(paths: &StorePaths) -> Self {
        let log_bytes = file_size(&paths.data());
        let index_bytes = file_size(&paths.index());
        let seen_bytes = file_size(&paths.seen());
        let legacy_bytes = file_size(&paths.legacy_snapshot());
        let csv_bytes = file_size(&paths.csv_export());
        Self {
            log_bytes,
            index_bytes,
            seen_bytes,
            legacy_bytes,
            csv_bytes,
            total_bytes: log_bytes + index_bytes + seen_bytes + legacy_bytes + csv_bytes,
        }
    }
}

/// Enough of a grant to follow it up by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRef {
    pub competition_id: String,
    pub title: String,
    pub url: String,
}

impl GrantRef {
    /// Identifiers with no stored record, or a record without a link, point at the
    /// detail route under the source's base URL.
    fn resolve(
        identifier: &str,
        records: &BTreeMap<&str, &OpportunityRecord>,
        ctx: &AdapterContext,
    ) -> Self {
        let record = records.get(identifier);
        let url = record
            .map(|r| r.link.clone())
            .filter(|link| !link.is_empty())
            .unwrap_or_else(|| detail_link(ctx.base_url.as_deref(), identifier));
        Self {
            competition_id: identifier.to_string(),
            title: record.map(|r| r.title.clone()).unwrap_or_default(),
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub site: String,
    pub grant_count: usize,
    pub seen_ids_count: usize,
    pub records_with_details: usize,
    /// Seen identifiers still waiting for a detail fetch.
    pub grants_without_details: usize,
    pub pending_ids: Vec<String>,
    #[serde(default)]
    pub pending_grants: Vec<GrantRef>,
    /// Grants the last run saw for the first time.
    #[serde(default)]
    pub last_run_new_grants: Vec<GrantRef>,
    pub storage: StorageStats,
    pub last_run: Option<RunReport>,
}

/// `ctx` supplies the base URL for links to grants that have no stored record.
pub fn source_stats(root: &Path, ctx: &AdapterContext) -> Result<SourceStats> {
    let source = ctx.source.as_str();
    let mut store = SourceStore::open(root, source, OpenMode::ReadOnly)
        .with_context(|| format!("opening store for {source} in {}", root.display()))?;
    let records = store
        .latest_records()
        .with_context(|| format!("reading records for {source}"))?;

    let by_id: BTreeMap<&str, &OpportunityRecord> =
        records.iter().map(|r| (r.identifier.as_str(), r)).collect();
    let detailed: BTreeSet<&str> = records
        .iter()
        .filter(|r| r.has_details())
        .map(|r| r.identifier.as_str())
        .collect();
    let pending_ids: Vec<String> = store
        .seen()
        .all()
        .iter()
        .filter(|id| !detailed.contains(id.as_str()))
        .cloned()
        .collect();

    let paths = store.paths().clone();
    let last_run_path = paths.last_run();
    let last_run = if last_run_path.exists() {
        match RunReport::read(&last_run_path) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(source, err = %format!("{err:#}"), "ignoring unreadable run report");
                None
            }
        }
    } else {
        None
    };

    let pending_grants = pending_ids
        .iter()
        .map(|id| GrantRef::resolve(id, &by_id, ctx))
        .collect();
    let last_run_new_grants = last_run
        .iter()
        .flat_map(|run| run.summary.new_ids.iter())
        .map(|id| GrantRef::resolve(id, &by_id, ctx))
        .collect();

    let seen_ids_count = store.seen().len();
    Ok(SourceStats {
        site: source.to_string(),
        grant_count: records.len(),
        seen_ids_count,
        records_with_details: detailed.len(),
        grants_without_details: seen_ids_count.saturating_sub(detailed.len()),
        pending_ids,
        pending_grants,
        last_run_new_grants,
        storage: StorageStats::measure(&paths),
        last_run,
    })
}

/// Source codes that have any state file under `root`, sorted.
pub fn discover_sources(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut codes = BTreeSet::new();
    let entries = fs::read_dir(root).with_context(|| format!("listing {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", root.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let code = STATE_SUFFIXES
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix));
        if let Some(code) = code {
            if validate_source_code(code).is_ok() {
                codes.insert(code.to_string());
            }
        }
    }
    Ok(codes.into_iter().collect())
}

pub fn all_stats<F>(root: &Path, context_for: F) -> Result<Vec<SourceStats>>
where
    F: Fn(&str) -> AdapterContext,
{
    discover_sources(root)?
        .iter()
        .map(|code| source_stats(root, &context_for(code)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsFormat {
    Text,
    Json,
    Csv,
}

impl FromStr for StatsFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => bail!("unknown stats format {other:?} (expected text, json or csv)"),
        }
    }
}

pub fn render_stats(stats: &[SourceStats], format: StatsFormat) -> Result<String> {
    match format {
        StatsFormat::Json => serde_json::to_string_pretty(stats).context("serializing stats"),
        StatsFormat::Csv => render_csv(stats),
        StatsFormat::Text => Ok(render_text(stats)),
    }
}

fn render_text(stats: &[SourceStats]) -> String {
    if stats.is_empty() {
        return "no sources with stored state\n".to_string();
    }
    let mut out = String::new();
    for s in stats {
        let _ = writeln!(out, "{}", s.site);
        let _ = writeln!(out, "  grants:            {}", s.grant_count);
        let _ = writeln!(out, "  seen ids:          {}", s.seen_ids_count);
        let _ = writeln!(out, "  with details:      {}", s.records_with_details);
        let _ = writeln!(out, "  awaiting details:  {}", s.grants_without_details);
        if !s.pending_ids.is_empty() {
            let preview: Vec<&str> = s
                .pending_ids
                .iter()
                .take(PENDING_PREVIEW)
                .map(String::as_str)
                .collect();
            let more = s.pending_ids.len().saturating_sub(PENDING_PREVIEW);
            let suffix = if more > 0 { format!(" (+{more} more)") } else { String::new() };
            let _ = writeln!(out, "  pending:           {}{suffix}", preview.join(", "));
        }
        let _ = writeln!(
            out,
            "  storage:           {} bytes (log {}, index {}, seen {})",
            s.storage.total_bytes, s.storage.log_bytes, s.storage.index_bytes, s.storage.seen_bytes
        );
        if let Some(run) = &s.last_run {
            let status = match &run.error {
                Some(err) => format!("failed: {err}"),
                None => run.summary.to_string(),
            };
            let _ = writeln!(
                out,
                "  last run:          {} {} at {}",
                run.mode,
                status,
                run.finished_at.to_rfc3339()
            );
            for grant in s.last_run_new_grants.iter().take(PENDING_PREVIEW) {
                let _ = writeln!(out, "    new {}: {} <{}>", grant.competition_id, grant.title, grant.url);
            }
        }
    }
    out
}

fn render_csv(stats: &[SourceStats]) -> Result<String> {
    let mut csv = csv::Writer::from_writer(Vec::new());
    csv.write_record([
        "site",
        "grant_count",
        "seen_ids_count",
        "records_with_details",
        "grants_without_details",
        "total_bytes",
        "last_run_at",
    ])
    .context("writing stats header")?;
    for s in stats {
        let last_run_at = s
            .last_run
            .as_ref()
            .map(|run| run.finished_at.to_rfc3339())
            .unwrap_or_default();
        csv.write_record([
            s.site.clone(),
            s.grant_count.to_string(),
            s.seen_ids_count.to_string(),
            s.records_with_details.to_string(),
            s.grants_without_details.to_string(),
            s.storage.total_bytes.to_string(),
            last_run_at,
        ])
        .with_context(|| format!("writing stats row for {}", s.site))?;
    }
    let bytes = csv.into_inner().context("flushing stats CSV")?;
    String::from_utf8(bytes).context("stats CSV is not UTF-8")
}
