use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use optrack_adapters::BatchFormat;
use optrack_core::ScanMode;
use optrack_sync::{render_stats, RunReport, StatsFormat, SyncPipeline, TrackerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "optrack")]
#[command(about = "Funding opportunity tracker: reconcile scraper output into per-source stores")]
struct Cli {
    /// Directory holding the per-source state files.
    #[arg(long, global = true, env = "OPTRACK_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Source registry (YAML). Without one any well-formed source code is accepted.
    #[arg(long, global = true, env = "OPTRACK_SOURCES_FILE")]
    sources_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Record newly listed identifiers as detail-less stubs.
    FastScan(BatchArgs),
    /// Fold full detail records into the store.
    DetailFetch(BatchArgs),
    /// Rewrite logs so they hold only the latest version of each record.
    #[command(group(ArgGroup::new("target").required(true).args(["source", "all"])))]
    Compact {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print the latest record for every identifier.
    List {
        #[arg(long)]
        source: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Write a CSV export and, optionally, a Parquet snapshot.
    Export {
        #[arg(long)]
        source: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        parquet: Option<PathBuf>,
    },
    Stats {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value = "text")]
        format: StatsFormat,
    },
    /// Regenerate the `{site}_grants.json` snapshot.
    Snapshot {
        #[arg(long)]
        source: String,
    },
    /// Print every identifier the source has produced, one per line.
    Seen {
        #[arg(long)]
        source: String,
    },
    /// Merge identifiers from a legacy `seen_competitions.json`.
    ImportSeen {
        #[arg(long)]
        source: String,
        #[arg(long, value_name = "FILE")]
        legacy: PathBuf,
    },
    /// List the sources in the registry.
    Sources,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long)]
    source: String,
    /// Scraper output: JSON, JSON lines, or a saved listing page.
    #[arg(long)]
    input: PathBuf,
    /// Defaults to `html` for .html/.htm inputs and `json` otherwise.
    #[arg(long)]
    format: Option<BatchFormat>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = TrackerConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }
    if let Some(sources_file) = cli.sources_file {
        config = config.with_sources_file(sources_file);
    }
    let pipeline = SyncPipeline::new(config)?;

    match cli.command {
        Commands::FastScan(args) => run(&pipeline, args, ScanMode::FastScan)?,
        Commands::DetailFetch(args) => run(&pipeline, args, ScanMode::Detail)?,
        Commands::Compact { source, .. } => {
            let reports = match source {
                Some(code) => {
                    let report = pipeline.compact_source(&code)?;
                    vec![(code, report)]
                }
                None => pipeline.compact_all()?,
            };
            if reports.is_empty() {
                println!("nothing to compact");
            }
            for (code, report) in reports {
                println!(
                    "compacted {code}: records {} -> {}, bytes {} -> {} (corrupt skipped: {}, legacy upgraded: {})",
                    report.records_before,
                    report.records_after,
                    report.bytes_before,
                    report.bytes_after,
                    report.corrupt_skipped,
                    report.legacy_upgraded
                );
            }
        }
        Commands::List { source, limit } => {
            let records = pipeline.latest_records(&source)?;
            let shown = limit.unwrap_or(records.len());
            for record in records.iter().take(shown) {
                let marker = if record.has_details() { "*" } else { " " };
                println!("{marker} {}\t{}\t{}", record.identifier, record.title, record.link);
            }
            let detailed = records.iter().filter(|r| r.has_details()).count();
            println!("{} records ({detailed} with details)", records.len());
        }
        Commands::Export {
            source,
            out,
            parquet,
        } => {
            let (path, rows) = pipeline.export_csv(&source, out.as_deref())?;
            println!("wrote {rows} rows to {}", path.display());
            if let Some(dir) = parquet {
                let manifest = pipeline.export_parquet(&source, &dir)?;
                println!("wrote parquet snapshot, manifest {}", manifest.display());
            }
        }
        Commands::Stats { source, format } => {
            let stats = pipeline.stats(source.as_deref())?;
            print!("{}", render_stats(&stats, format)?);
        }
        Commands::Snapshot { source } => {
            let count = pipeline.snapshot(&source)?;
            let path = pipeline.paths(&source)?.legacy_snapshot();
            println!("wrote {count} records to {}", path.display());
        }
        Commands::Seen { source } => {
            let ids = pipeline.seen_ids(&source)?;
            for id in &ids {
                println!("{id}");
            }
            println!("{} seen identifiers for {source}", ids.len());
        }
        Commands::ImportSeen { source, legacy } => {
            let added = pipeline.import_seen(&source, &legacy)?;
            println!("imported {added} new identifiers into {source}");
        }
        Commands::Sources => match pipeline.registry() {
            Some(registry) => {
                for source in &registry.sources {
                    let state = if source.enabled { "enabled" } else { "disabled" };
                    let base = source.base_url.as_deref().unwrap_or("-");
                    println!("{}\t{}\t{state}\t{base}", source.code, source.display_name);
                }
            }
            None => println!(
                "no registry at {}",
                pipeline.config().sources_file.display()
            ),
        },
    }

    Ok(())
}

fn run(pipeline: &SyncPipeline, args: BatchArgs, mode: ScanMode) -> Result<()> {
    let format = args
        .format
        .unwrap_or_else(|| BatchFormat::from_path(&args.input));
    let report = pipeline.run_file(&args.source, &args.input, format, mode)?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{} run {} for {}: {}",
        report.mode, report.run_id, report.source, report.summary
    );
    for rejection in &report.summary.rejections {
        println!(
            "  rejected #{} ({}): {}",
            rejection.position,
            rejection.identifier.as_deref().unwrap_or("-"),
            rejection.reason
        );
    }
    if !report.summary.new_ids.is_empty() {
        println!("  new: {}", report.summary.new_ids.join(", "));
    }
    if let Some(compaction) = &report.compaction {
        println!(
            "  compacted: {} -> {} records, reclaimed {} bytes",
            compaction.records_before,
            compaction.records_after,
            compaction.bytes_reclaimed()
        );
    }
}
