//! Sync orchestration for OpTrack: configuration, the source registry, reconciliation runs,
//! statistics and exports.

pub mod export;
pub mod reconcile;
pub mod stats;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use optrack_adapters::{load_candidate_batch, AdapterContext, BatchFormat};
use optrack_core::{Candidate, ChangeSummary, OpportunityRecord, ScanMode};
use optrack_storage::{
    validate_source_code, write_atomic, CompactionReport, OpenMode, SourceStore, StorePaths,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub use export::{export_csv, write_csv, write_parquet_snapshot, ParquetManifest, CSV_COLUMNS};
pub use reconcile::{ReconcileError, Reconciler};
pub use stats::{
    all_stats, discover_sources, render_stats, source_stats, GrantRef, SourceStats, StatsFormat,
    StorageStats,
};

pub const CRATE_NAME: &str = "optrack-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub code: String,
    pub display_name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    /// `Ok(None)` when the registry file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let registry: SourceRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for source in &registry.sources {
            validate_source_code(&source.code)
                .with_context(|| format!("source entry in {}", path.display()))?;
        }
        Ok(Some(registry))
    }

    pub fn get(&self, code: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.code == code)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub sources_file: PathBuf,
    /// Regenerate `{site}_grants.json` after detail runs and compactions.
    pub legacy_snapshot: bool,
    /// Compact after a run once `log_bytes >= ratio * live_bytes`; `0` disables.
    pub auto_compact_ratio: f64,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: var("OPTRACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output/db")),
            sources_file: var("OPTRACK_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            legacy_snapshot: var("OPTRACK_LEGACY_SNAPSHOT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            auto_compact_ratio: var("OPTRACK_AUTO_COMPACT_RATIO")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|ratio| ratio.is_finite() && *ratio >= 0.0)
                .unwrap_or(0.0),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_sources_file(mut self, sources_file: impl Into<PathBuf>) -> Self {
        self.sources_file = sources_file.into();
        self
    }
}

/// Outcome of one reconciliation run, persisted as `{site}_last_run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub mode: ScanMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: ChangeSummary,
    #[serde(default)]
    pub compaction: Option<CompactionReport>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing run report")?;
        write_atomic(path, &bytes).with_context(|| format!("writing {}", path.display()))
    }
}

/// Record an aborted run and hand back the error the caller reports. Failing to write
/// the report is logged; it never replaces the reconcile error.
fn abort_run(report: &RunReport, path: &Path, err: ReconcileError) -> anyhow::Error {
    if let Err(write_err) = report.write(path) {
        warn!(
            run_id = %report.run_id,
            err = %format!("{write_err:#}"),
            "could not record the failed run"
        );
    }
    anyhow::Error::new(err).context(format!(
        "{} run {} for {} failed",
        report.mode, report.run_id, report.source
    ))
}

pub struct SyncPipeline {
    config: TrackerConfig,
    registry: Option<SourceRegistry>,
}

impl SyncPipeline {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        if registry.is_none() {
            info!(path = %config.sources_file.display(), "no source registry, accepting any source code");
        }
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn registry(&self) -> Option<&SourceRegistry> {
        self.registry.as_ref()
    }

    /// Reject malformed codes and, when a registry is configured, unknown ones. Writes
    /// additionally require the source to be enabled.
    pub fn check_source(&self, code: &str, for_write: bool) -> Result<()> {
        validate_source_code(code)?;
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        match registry.get(code) {
            None => bail!(
                "unknown source {code:?} (not listed in {})",
                self.config.sources_file.display()
            ),
            Some(source) if for_write && !source.enabled => {
                bail!("source {code:?} is disabled in {}", self.config.sources_file.display())
            }
            Some(_) => Ok(()),
        }
    }

    pub fn adapter_context(&self, code: &str) -> AdapterContext {
        let base_url = self
            .registry
            .as_ref()
            .and_then(|r| r.get(code))
            .and_then(|s| s.base_url.clone());
        match base_url {
            Some(base) => AdapterContext::new(code).with_base_url(base),
            None => AdapterContext::infoready(code),
        }
    }

    pub fn paths(&self, code: &str) -> Result<StorePaths> {
        Ok(StorePaths::new(&self.config.data_dir, code)?)
    }

    pub fn open_store(&self, code: &str, mode: OpenMode) -> Result<SourceStore> {
        self.check_source(code, mode == OpenMode::ReadWrite)?;
        SourceStore::open(&self.config.data_dir, code, mode)
            .with_context(|| format!("opening store for {code} in {}", self.config.data_dir.display()))
    }

    /// Load a scraper output file and reconcile it.
    pub fn run_file(
        &self,
        code: &str,
        input: &Path,
        format: BatchFormat,
        mode: ScanMode,
    ) -> Result<RunReport> {
        self.check_source(code, true)?;
        let candidates = load_candidate_batch(input, format, &self.adapter_context(code))?;
        self.run_batch(code, &candidates, mode)
    }

    /// Reconcile one batch, then apply snapshot and auto-compaction policy and record the
    /// run report. A failed batch still leaves a report with the partial counts.
    pub fn run_batch(&self, code: &str, candidates: &[Candidate], mode: ScanMode) -> Result<RunReport> {
        let span = info_span!("run_batch", source = code, mode = %mode);
        let _guard = span.enter();

        let mut store = self.open_store(code, OpenMode::ReadWrite)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let outcome = Reconciler::new(&mut store).reconcile_at(candidates, mode, started_at);

        let mut report = RunReport {
            run_id,
            source: code.to_string(),
            mode,
            started_at,
            finished_at: started_at,
            summary: ChangeSummary::default(),
            compaction: None,
            error: None,
        };
        match outcome {
            Ok(summary) => report.summary = summary,
            Err(err) => {
                report.summary = err.processed.clone();
                report.error = Some(err.to_string());
                report.finished_at = Utc::now();
                return Err(abort_run(&report, &store.paths().last_run(), err));
            }
        }

        if self.config.auto_compact_ratio > 0.0 && store.needs_compaction(self.config.auto_compact_ratio) {
            report.compaction = Some(store.compact().with_context(|| format!("compacting {code}"))?);
        }
        if self.config.legacy_snapshot && (mode == ScanMode::Detail || report.compaction.is_some()) {
            store
                .export_legacy_snapshot()
                .with_context(|| format!("writing legacy snapshot for {code}"))?;
        }

        report.finished_at = Utc::now();
        report.write(&store.paths().last_run())?;
        info!(%run_id, summary = %report.summary, "run finished");
        Ok(report)
    }

    pub fn compact_source(&self, code: &str) -> Result<CompactionReport> {
        let mut store = self.open_store(code, OpenMode::ReadWrite)?;
        let report = store.compact().with_context(|| format!("compacting {code}"))?;
        if self.config.legacy_snapshot {
            store
                .export_legacy_snapshot()
                .with_context(|| format!("writing legacy snapshot for {code}"))?;
        }
        Ok(report)
    }

    /// Compact every source that has state under the data directory. Disabled or
    /// unregistered sources are skipped with a warning.
    pub fn compact_all(&self) -> Result<Vec<(String, CompactionReport)>> {
        let mut reports = Vec::new();
        for code in discover_sources(&self.config.data_dir)? {
            if let Err(err) = self.check_source(&code, true) {
                warn!(source = %code, %err, "skipping compaction");
                continue;
            }
            let report = self.compact_source(&code)?;
            reports.push((code, report));
        }
        Ok(reports)
    }

    pub fn latest_records(&self, code: &str) -> Result<Vec<OpportunityRecord>> {
        let mut store = self.open_store(code, OpenMode::ReadOnly)?;
        store
            .latest_records()
            .with_context(|| format!("reading records for {code}"))
    }

    /// Write the CSV export; defaults to `{site}_grants.csv` under the data directory.
    pub fn export_csv(&self, code: &str, out: Option<&Path>) -> Result<(PathBuf, usize)> {
        let records = self.latest_records(code)?;
        let path = match out {
            Some(path) => path.to_path_buf(),
            None => self.paths(code)?.csv_export(),
        };
        let rows = export_csv(&records, &path)?;
        Ok((path, rows))
    }

    pub fn export_parquet(&self, code: &str, dir: &Path) -> Result<PathBuf> {
        let records = self.latest_records(code)?;
        write_parquet_snapshot(code, &records, dir)
    }

    pub fn snapshot(&self, code: &str) -> Result<usize> {
        let mut store = self.open_store(code, OpenMode::ReadWrite)?;
        store
            .export_legacy_snapshot()
            .with_context(|| format!("writing legacy snapshot for {code}"))
    }

    pub fn import_seen(&self, code: &str, legacy_file: &Path) -> Result<usize> {
        let mut store = self.open_store(code, OpenMode::ReadWrite)?;
        store
            .import_legacy_seen(legacy_file)
            .with_context(|| format!("importing {} into {code}", legacy_file.display()))
    }

    pub fn stats(&self, code: Option<&str>) -> Result<Vec<SourceStats>> {
        match code {
            Some(code) => {
                self.check_source(code, false)?;
                Ok(vec![source_stats(&self.config.data_dir, &self.adapter_context(code))?])
            }
            None => all_stats(&self.config.data_dir, |code| self.adapter_context(code)),
        }
    }

    /// Every identifier the source has ever produced, sorted.
    pub fn seen_ids(&self, code: &str) -> Result<Vec<String>> {
        let store = self.open_store(code, OpenMode::ReadOnly)?;
        Ok(store.seen().all().iter().cloned().collect())
    }
}
