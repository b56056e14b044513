//! Flat exports of the latest record per identifier: CSV for spreadsheets and a Parquet
//! snapshot with a checksummed manifest for analytics.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use optrack_core::OpportunityRecord;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

pub const CSV_COLUMNS: [&str; 6] = [
    "title",
    "link",
    "competition_id",
    "site",
    "description",
    "details_json",
];

fn details_json(record: &OpportunityRecord) -> Result<String> {
    match &record.details {
        Some(details) => serde_json::to_string(details).context("serializing details"),
        None => Ok("{}".to_string()),
    }
}

/// Write one CSV row per record. Returns the number of data rows.
pub fn write_csv<W: Write>(records: &[OpportunityRecord], writer: W) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_COLUMNS).context("writing CSV header")?;
    for record in records {
        let details = details_json(record)?;
        csv.write_record([
            record.title.as_str(),
            record.link.as_str(),
            record.identifier.as_str(),
            record.source.as_str(),
            record.description.trim(),
            details.as_str(),
        ])
        .with_context(|| format!("writing CSV row for {}", record.identifier))?;
    }
    csv.flush().context("flushing CSV output")?;
    Ok(records.len())
}

pub fn export_csv(records: &[OpportunityRecord], path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let rows = write_csv(records, file)?;
    info!(path = %path.display(), rows, "wrote CSV export");
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub source: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `opportunities.parquet` and `manifest.json` into `dir`; returns the manifest path.
pub fn write_parquet_snapshot(
    source: &str,
    records: &[OpportunityRecord],
    dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let parquet_path = dir.join("opportunities.parquet");
    write_parquet(&parquet_path, opportunities_batch(records)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        source: source.to_string(),
        generated_at: Utc::now(),
        files: vec![manifest_entry("opportunities", dir, &parquet_path, records.len())?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), rows = records.len(), "wrote parquet snapshot");
    Ok(manifest_path)
}

fn opportunities_batch(records: &[OpportunityRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("competition_id", DataType::Utf8, false),
        ArrowField::new("site", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("details_json", DataType::Utf8, true),
        ArrowField::new("has_details", DataType::Boolean, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_updated_at", DataType::Utf8, false),
    ]));

    let text_column = |field: fn(&OpportunityRecord) -> &str| {
        StringArray::from(records.iter().map(|r| Some(field(r))).collect::<Vec<_>>())
    };
    let details = records
        .iter()
        .map(|r| match &r.details {
            Some(details) => serde_json::to_string(details).map(Some),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>, _>>()
        .context("serializing details")?;
    let has_details = BooleanArray::from(records.iter().map(|r| r.has_details()).collect::<Vec<_>>());
    let first_seen = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.first_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let last_updated = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.last_updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(|r| r.identifier.as_str())),
            Arc::new(text_column(|r| r.source.as_str())),
            Arc::new(text_column(|r| r.title.as_str())),
            Arc::new(text_column(|r| r.link.as_str())),
            Arc::new(text_column(|r| r.description.as_str())),
            Arc::new(StringArray::from(details)),
            Arc::new(has_details),
            Arc::new(first_seen),
            Arc::new(last_updated),
        ],
    )
    .context("building opportunities record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use optrack_core::{Candidate, Details};
    use serde_json::json;
    use tempfile::tempdir;

    fn records() -> Vec<OpportunityRecord> {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let mut details = Details::new();
        details.insert("Eligibility".into(), json!("Faculty, \"all ranks\""));
        vec![
            OpportunityRecord::from_candidate(
                &Candidate::new("umich", "1")
                    .with_title("Seed, Pilot")
                    .with_description("  line one\nline two  ")
                    .with_details(details),
                at,
            ),
            OpportunityRecord::stub(&Candidate::new("umich", "2").with_title("Stub"), at),
        ]
    }

    #[test]
    fn csv_quotes_delimiters_and_newlines() {
        let mut out = Vec::new();
        assert_eq!(write_csv(&records(), &mut out).expect("csv"), 2);

        let mut reader = csv::Reader::from_reader(out.as_slice());
        assert_eq!(
            reader.headers().expect("headers").iter().collect::<Vec<_>>(),
            CSV_COLUMNS.to_vec()
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();
        assert_eq!(&rows[0][0], "Seed, Pilot");
        assert_eq!(&rows[0][4], "line one\nline two");
        let details: serde_json::Value = serde_json::from_str(&rows[0][5]).expect("details json");
        assert_eq!(details["Eligibility"], "Faculty, \"all ranks\"");
        assert_eq!(&rows[1][5], "{}");
    }

    #[test]
    fn parquet_snapshot_has_manifest_with_checksum() {
        let dir = tempdir().expect("tempdir");
        let manifest_path =
            write_parquet_snapshot("umich", &records(), dir.path()).expect("parquet");

        let manifest: ParquetManifest =
            serde_json::from_slice(&fs::read(&manifest_path).expect("read")).expect("parse");
        assert_eq!(manifest.source, "umich");
        let entry = &manifest.files[0];
        assert_eq!(entry.path, "opportunities.parquet");
        assert_eq!(entry.rows, 2);

        let bytes = fs::read(dir.path().join("opportunities.parquet")).expect("parquet bytes");
        assert_eq!(entry.bytes, bytes.len() as u64);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(&bytes)));
        assert_eq!(&bytes[..4], b"PAR1");
    }
}
