//! upl: ETL of UniProtKB releases into PostgreSQL

mod extract;
mod settings;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use upl_core::{Dataset, LoadMode, UniprotPipeline};
use upl_postgres::PostgresAdapter;

use crate::extract::Extractor;
use crate::settings::CliSettings;

#[derive(Parser, Debug)]
#[command(name = "upl")]
#[command(author, version, about = "Load UniProtKB releases into PostgreSQL")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a dataset from the UniProt mirror and verify it
    Download {
        /// Dataset to download ('swissprot', 'trembl' or 'all')
        #[arg(short, long, default_value = "swissprot")]
        dataset: String,
    },
    /// Run the ETL pipeline for a dataset
    Run {
        /// Dataset to load ('swissprot', 'trembl' or 'all')
        #[arg(short, long, default_value = "swissprot")]
        dataset: String,
        /// Load mode ('full' or 'delta')
        #[arg(short, long, default_value = "full")]
        mode: String,
        /// Override the release tag read from the XML root element
        #[arg(long)]
        release: Option<String>,
    },
    /// Show the currently loaded release
    Status,
    /// Create the production schema for first-time setup
    Initialize,
    /// Print the resolved configuration and check database connectivity
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    if let Err(err) = execute(cli).await {
        error!(error = %err, "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let settings = settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Download { dataset } => download(settings, &dataset).await,
        Command::Run {
            dataset,
            mode,
            release,
        } => run(settings, &dataset, &mode, release).await,
        Command::Status => status(settings).await,
        Command::Initialize => initialize(settings).await,
        Command::CheckConfig => check_config(settings).await,
    }
}

async fn download(settings: CliSettings, dataset: &str) -> Result<()> {
    let dataset = Dataset::from_str(dataset)?;
    let mut extractor = Extractor::new(settings.sources, settings.pipeline.data_dir.clone());

    let release = extractor.release_info().await?;
    info!(version = %release.version, date = ?release.date, "mirror release");
    extract::check_release_consistency(
        settings.pipeline.release_tag.as_deref(),
        &release.version,
    )?;

    let mut failed = Vec::new();
    for ds in dataset.expand() {
        let filename = ds.file_name();
        let path = extractor.download_file(filename).await?;
        if !extractor.verify_checksum(&path).await? {
            failed.push(ds.to_string());
        }
    }
    if !failed.is_empty() {
        bail!("checksum verification failed for: {}", failed.join(", "));
    }
    println!("downloaded release {} ({})", release.version, dataset);
    Ok(())
}

async fn run(
    mut settings: CliSettings,
    dataset: &str,
    mode: &str,
    release: Option<String>,
) -> Result<()> {
    let dataset = Dataset::from_str(dataset)?;
    let mode = LoadMode::from_str(mode)?;
    if release.is_some() {
        settings.pipeline.release_tag = release;
    }

    let adapter = PostgresAdapter::connect(&settings.pipeline).await?;
    let pipeline = UniprotPipeline::new(settings.pipeline, adapter)?;
    let summary = pipeline
        .run(mode, dataset)
        .await
        .context("ETL pipeline failed")?;

    if summary.up_to_date {
        println!(
            "database is already on release {}; nothing to do",
            summary.release
        );
    } else {
        println!(
            "loaded release {} ({} entries, {} skipped) in {} mode; run id {}",
            summary.release, summary.entries, summary.skipped_entries, summary.mode, summary.run_id
        );
        for (table, rows) in &summary.tables {
            println!("  {table}: {rows} rows");
        }
    }
    Ok(())
}

async fn status(settings: CliSettings) -> Result<()> {
    let adapter = PostgresAdapter::connect(&settings.pipeline).await?;
    let pipeline = UniprotPipeline::new(settings.pipeline, adapter)?;
    match pipeline.status().await? {
        Some(release) => {
            println!("loaded release: {}", release.version);
            if let Some(date) = release.release_date {
                println!("release date: {date}");
            }
            println!("loaded at: {}", release.load_timestamp);
            println!(
                "entries: swissprot={} trembl={}",
                release.swissprot_entry_count, release.trembl_entry_count
            );
        }
        None => println!("no release is currently loaded"),
    }
    Ok(())
}

async fn initialize(settings: CliSettings) -> Result<()> {
    let schema = settings.pipeline.production_schema.clone();
    let adapter = PostgresAdapter::connect(&settings.pipeline).await?;
    let pipeline = UniprotPipeline::new(settings.pipeline, adapter)?;
    pipeline.initialize().await?;
    println!("production schema '{schema}' is ready");
    Ok(())
}

async fn check_config(settings: CliSettings) -> Result<()> {
    println!("{}", settings::display(&settings));
    let adapter = PostgresAdapter::connect(&settings.pipeline).await?;
    let pipeline = UniprotPipeline::new(settings.pipeline, adapter)?;
    pipeline.status().await?;
    println!("database connection ok");
    Ok(())
}
