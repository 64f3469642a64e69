mod accession;
mod config;
mod driver;
mod error;
mod finalize;
mod layout;
mod storage;
#[cfg(test)]
mod testutil;
mod tools;
mod worker;

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::accession::RunFilters;
use crate::config::{load_config, Config, Overrides};
use crate::driver::{write_manifest, Pipeline, RunOptions};

const VERSION: &str = "0.1.0";
const SCRIPT_NAME: &str = "trust4-batch";

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Batch TRUST4 repertoire assembly over SRA archives in object storage", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "trust4-batch.yaml")]
    yaml: PathBuf,

    /// Samples processed concurrently, and the batch size
    #[arg(short, long)]
    parallelism: Option<usize>,

    /// Maximum number of listed archives to consider
    #[arg(short = 'n', long)]
    max_files: Option<usize>,

    /// Local scratch root
    #[arg(short, long)]
    scratch: Option<PathBuf>,

    /// Write per-accession shell scripts instead of running the pipeline
    #[arg(short = 'O', long, default_value = "false")]
    only_scripts: bool,

    #[arg(long = "filter-run")]
    filter_run: Option<String>,

    #[arg(long = "exclude-run")]
    exclude_run: Option<String>,

    /// Write a TSV with the status of every listed object
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    #[arg(long, default_value = "false")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging()?;
    print_banner();

    let filters = RunFilters::new(args.filter_run.as_deref(), args.exclude_run.as_deref())?;
    let file_config = load_config(&args.yaml).context("Failed to load YAML configuration")?;
    let overrides = Overrides {
        parallelism: args.parallelism,
        max_files: args.max_files,
        scratch_root: args.scratch.clone(),
    };
    let config = Config::resolve(file_config, &overrides).context("Invalid configuration")?;

    info!("🪣 Storage: {} ({})", config.storage.location(), config.storage.sra_prefix);
    info!("📁 Scratch root: {}", config.setting.scratch_root.display());
    info!(
        "⚙️  Parallelism = {}, Max files = {}",
        config.setting.parallelism, config.setting.max_files
    );

    let store = storage::connect(&config.storage).await;
    let options = RunOptions {
        only_scripts: args.only_scripts,
        show_progress: !args.no_progress,
    };
    let pipeline = Pipeline::new(&config, store.as_ref(), filters, options);

    if !args.only_scripts {
        info!("🔍 Checking external tools...");
        worker::ensure_tools(pipeline.worker()).context("Tool dependency check failed")?;
    }

    let summary = pipeline
        .run()
        .await
        .map_err(|e| {
            if e.is_fatal() {
                error!("❌ Run aborted: {}", e);
            }
            anyhow::Error::from(e)
        })
        .context("Pipeline aborted")?;

    for batch in &summary.batches {
        let completed = batch.outcomes.iter().filter(|o| o.is_completed()).count();
        info!(
            "  batch {}: {}/{} samples completed, report {}, {} uploads",
            batch.number,
            completed,
            batch.accessions.len(),
            batch.finalize.report_name,
            batch.finalize.uploaded.len()
        );
        for problem in &batch.finalize.problems {
            warn!("    ⚠️ {}", problem);
        }
    }

    if let Some(path) = &args.manifest {
        write_manifest(path, &summary.rows).context("Failed to write manifest")?;
        info!("💾 Manifest saved: {}", path.display());
    }

    info!("🎉 {} finished {} batches", SCRIPT_NAME, summary.batches.len());
    Ok(())
}

fn print_banner() {
    println!("\n{}", "=".repeat(60));
    println!("  🧬 {} - TRUST4 batch runner v{}", SCRIPT_NAME, VERSION);
    println!("{}\n", "=".repeat(60));
}

fn setup_logging() -> Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file = format!("{}_{}.log", SCRIPT_NAME, timestamp);

    let file = File::create(&log_file)?;

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_timer(fmt::time::LocalTime::rfc_3339())
        .compact();

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_timer(fmt::time::LocalTime::rfc_3339())
        .compact();

    use tracing_subscriber::layer::SubscriberExt;
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(stdout_layer);

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    info!("📝 Log file created: {}", log_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let args = Args::try_parse_from([
            "trust4-batch",
            "-y",
            "run.yaml",
            "-p",
            "3",
            "-n",
            "40",
            "--exclude-run",
            "^ERR",
            "-m",
            "manifest.tsv",
        ])
        .unwrap();
        assert_eq!(args.yaml, PathBuf::from("run.yaml"));
        assert_eq!(args.parallelism, Some(3));
        assert_eq!(args.max_files, Some(40));
        assert_eq!(args.exclude_run.as_deref(), Some("^ERR"));
        assert_eq!(args.manifest, Some(PathBuf::from("manifest.tsv")));
        assert!(!args.only_scripts);
    }

    #[test]
    fn cli_defaults() {
        let args = Args::try_parse_from(["trust4-batch"]).unwrap();
        assert_eq!(args.yaml, PathBuf::from("trust4-batch.yaml"));
        assert!(args.parallelism.is_none());
        assert!(!args.no_progress);
    }
}
