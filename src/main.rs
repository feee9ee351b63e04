use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use taskmarket::application::engine::MarketplaceEngine;
use taskmarket::application::marketplace::Marketplace;
use taskmarket::config::MarketConfig;
use taskmarket::domain::clock::ManualClock;
use taskmarket::domain::ports::StorageBackendRef;
use taskmarket::infrastructure::in_memory::{InMemoryBackend, StaticVerifier};
use taskmarket::infrastructure::notify::TracingNotifier;
use taskmarket::interfaces::csv::account_writer::AccountWriter;
use taskmarket::interfaces::csv::command_reader::CommandReader;
use taskmarket::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input command script (CSV)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON policy file overriding the default marketplace rules
    #[arg(long)]
    config: Option<PathBuf>,

    /// Background verification workers. With 0, jobs only run between commands.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    #[arg(long, env = "TASKMARKET_LOG", default_value = "warn")]
    log_level: String,
}

fn open_backend(db_path: Option<PathBuf>) -> Result<StorageBackendRef> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = taskmarket::infrastructure::rocksdb::RocksDBBackend::open(path).into_diagnostic()?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Arc::new(InMemoryBackend::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => MarketConfig::load(path).into_diagnostic()?,
        None => MarketConfig::default(),
    };
    if cli.workers > 0 {
        config.verification.worker_count = cli.workers;
    }

    let clock = ManualClock::new(Utc::now());
    let verifier = StaticVerifier::new();
    let market = Marketplace::new(
        open_backend(cli.db_path)?,
        Arc::new(verifier.clone()),
        Arc::new(TracingNotifier),
        Arc::new(clock.clone()),
        config,
    );
    let workers = (cli.workers > 0).then(|| market.spawn_workers());
    let engine = MarketplaceEngine::new(market.clone(), clock, verifier);

    // Process commands
    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for command in reader.commands() {
        match command {
            Ok(command) => {
                if let Err(e) = engine.process_command(command).await {
                    eprintln!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }

    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    market.drain_verifications().await.into_diagnostic()?;

    let accounts = engine.into_results().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = AccountWriter::new(stdout.lock());
    writer.write_accounts(accounts).into_diagnostic()?;

    Ok(())
}
