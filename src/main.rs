// ABOUTME: CLI entry point for appointment-sync
// ABOUTME: Parses commands, runs them and converts every outcome into a process exit code

use anyhow::Context;
use appointment_sync::backend::BackendClient;
use appointment_sync::config::{SyncConfig, DEFAULT_CONFIG_FILE};
use appointment_sync::error::{exit_code, exit_code_for};
use appointment_sync::lock::RunLock;
use appointment_sync::pipeline::{SinkOutcome, SinkTarget, SyncPipeline};
use appointment_sync::sink::SheetsSink;
use appointment_sync::snapshot::SnapshotStore;
use appointment_sync::source::{RecordSource, Source};
use appointment_sync::utils::sanitize_url;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "appointment-sync")]
#[command(about = "Sync clinic appointments to spreadsheets, a JSON snapshot and an HTTP backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the TOML configuration file
    #[arg(
        long,
        global = true,
        env = "APPOINTMENT_SYNC_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, classify, reconcile every sink, save the snapshot and post to the backend
    Run,
    /// Fetch and classify against the stored snapshot without writing anything
    Diff {
        /// Print the change set as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the stored snapshot's timestamp and record count
    Status,
    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() {
    // We need to parse CLI args early to get the log level
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_code::SUCCESS,
                _ => exit_code::UNCLASSIFIED,
            };
            std::process::exit(code);
        }
    };

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Diff { json } => diff(&config, json).await,
        Commands::Status => status(&config).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn snapshot_store(config: &SyncConfig, source: &str) -> SnapshotStore {
    SnapshotStore::new(&config.snapshot.path, source).keep_backup(config.snapshot.keep_backup)
}

fn pipeline<'a>(
    config: &SyncConfig,
    source: &'a Source,
    store: &'a SnapshotStore,
) -> SyncPipeline<'a, Source> {
    SyncPipeline::new(source, store)
        .with_differ(config.differ.differ())
        .with_columns(config.source.columns.clone())
        .with_max_records(config.source.max_records)
        .with_retry(config.retry.policy())
}

async fn run(config: &SyncConfig) -> anyhow::Result<i32> {
    let _lock = match &config.run.lock_file {
        Some(path) => Some(RunLock::acquire(path)?),
        None => None,
    };

    let retry = config.retry.policy();
    let source =
        Source::from_config(&config.source, retry).context("Failed to configure the source")?;
    let store = snapshot_store(config, &source.describe());

    let mut targets = Vec::new();
    let mut unavailable = Vec::new();
    for sheet in &config.sheets {
        let target = sheet
            .connection()
            .and_then(SheetsSink::new)
            .and_then(|sink| sheet.layout().map(|layout| SinkTarget::new(sink, layout)));
        match target {
            Ok(target) => targets.push(target.prune_on_empty(sheet.prune_on_empty)),
            Err(e) => {
                tracing::error!(
                    "Spreadsheet {} is unavailable: {}",
                    sheet.spreadsheet_id,
                    e
                );
                unavailable.push(SinkOutcome::Failed {
                    sink: format!("sheets:{}/{}", sheet.spreadsheet_id, sheet.worksheet),
                    error: e.to_string(),
                });
            }
        }
    }

    let backend = match &config.backend {
        Some(b) => Some(
            BackendClient::new(
                b.base_url.clone(),
                b.api_key.clone(),
                Duration::from_secs(b.timeout_secs),
            )?
            .with_retry(retry),
        ),
        None => None,
    };

    match pipeline(config, &source, &store)
        .run(&targets, backend.as_ref())
        .await
    {
        Ok(mut summary) => {
            summary.sinks.extend(unavailable);
            summary.log();
            Ok(summary.exit_code())
        }
        Err(e) => {
            if let Some(backend) = &backend {
                if let Err(post_err) = backend.post_error(&e.to_string()).await {
                    tracing::warn!("Failed to report error to backend: {}", post_err);
                }
            }
            Err(e).context("Sync run failed")
        }
    }
}

async fn diff(config: &SyncConfig, json: bool) -> anyhow::Result<i32> {
    let source = Source::from_config(&config.source, config.retry.policy())
        .context("Failed to configure the source")?;
    let store = snapshot_store(config, &source.describe());

    let classification = pipeline(config, &source, &store)
        .classify()
        .await
        .context("Failed to classify appointments")?;
    let changes = &classification.changes;

    if json {
        println!("{}", serde_json::to_string_pretty(changes)?);
    } else {
        println!(
            "{} records: {} new, {} updated, {} unchanged, {} pruned",
            classification.current.len(),
            changes.new.len(),
            changes.updated.len(),
            changes.unchanged.len(),
            changes.pruned.len()
        );
        for entry in &changes.new {
            println!("  + {} ({})", entry.id, entry.label);
        }
        for entry in &changes.updated {
            match &entry.change {
                Some(c) => println!(
                    "  ~ {} ({}): {} '{}' -> '{}'",
                    entry.id, entry.label, c.field, c.old, c.new
                ),
                None => println!("  ~ {} ({})", entry.id, entry.label),
            }
        }
        for id in &changes.pruned {
            println!("  - {}", id);
        }
    }
    Ok(exit_code::SUCCESS)
}

async fn status(config: &SyncConfig) -> anyhow::Result<i32> {
    let store = snapshot_store(config, &config.source.url);
    match store
        .load_document()
        .await
        .context("Failed to read the stored snapshot")?
    {
        Some(doc) => {
            println!("Snapshot: {:?}", store.path());
            println!("Captured: {}", doc.timestamp.to_rfc3339());
            println!("Records:  {}", doc.total_count);
            if !doc.sync_info.source.is_empty() {
                println!("Source:   {}", doc.sync_info.source);
            }
        }
        None => println!("No snapshot at {:?}", store.path()),
    }
    Ok(exit_code::SUCCESS)
}

fn check_config(config: &SyncConfig) -> anyhow::Result<i32> {
    println!("Configuration is valid");
    println!("  source:   {}", sanitize_url(&config.source.url));
    println!("  snapshot: {:?}", config.snapshot.path);
    for sheet in &config.sheets {
        println!(
            "  sheet:    {} / {} ({} columns)",
            sheet.spreadsheet_id,
            sheet.worksheet,
            sheet.layout()?.width()
        );
    }
    match &config.backend {
        Some(b) => println!("  backend:  {}", b.base_url),
        None => println!("  backend:  disabled"),
    }
    Ok(exit_code::SUCCESS)
}
