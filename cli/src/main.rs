use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidemark_kernel::client::{ClientError, WriteClient};
use tidemark_kernel::config::WriteConfig;
use tidemark_kernel::fs::{FileSystem, LocalFileSystem};
use tidemark_kernel::invariants::InvariantEngine;
use tidemark_kernel::record::{Record, RecordKey};
use tidemark_kernel::table::{TableMetaClient, WriteStatus};

/// Tidemark table write client
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(about = "Write, roll back and compact tidemark tables", long_about = None)]
struct Cli {
    /// Path to the write config JSON
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the table described by the config
    Init,
    /// Insert records from a JSON array file
    Insert { records: PathBuf },
    /// Upsert records from a JSON array file
    Upsert { records: PathBuf },
    /// Insert records sorted by key, without index lookups
    BulkInsert { records: PathBuf },
    /// Delete keys from a JSON array of {record_key, partition_path}
    Delete { keys: PathBuf },
    /// Roll back an instant
    Rollback { instant: String },
    /// Execute a compaction; schedules one when no instant is given
    Compact {
        #[arg(long)]
        instant: Option<String>,
        /// Only write the compaction plan
        #[arg(long)]
        schedule_only: bool,
    },
    /// Delete file slices outside the retention window
    Clean,
    /// Print the active timeline
    Timeline,
    /// List the markers of an instant
    Markers { instant: String },
}

/// Summary of one write call.
#[derive(Debug, Serialize)]
struct WriteOutput {
    instant: String,
    files: usize,
    records_written: u64,
    records_deleted: u64,
    failed_records: usize,
    statuses: Vec<WriteStatus>,
}

impl WriteOutput {
    fn new(instant: String, statuses: Vec<WriteStatus>) -> Self {
        Self {
            instant,
            files: statuses.len(),
            records_written: statuses.iter().map(|s| s.stat.num_writes).sum(),
            records_deleted: statuses.iter().map(|s| s.stat.num_deletes).sum(),
            failed_records: statuses.iter().map(|s| s.failed_records.len()).sum(),
            statuses,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = WriteConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let storage: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);

    match cli.command {
        Command::Init => {
            let meta = TableMetaClient::load_or_init(storage, &config)?;
            print_json(meta.properties())
        }
        Command::Insert { records } => {
            let records = read_records(&config, &records)?;
            write(storage, config, |client, ts| client.insert(records, ts))
        }
        Command::Upsert { records } => {
            let records = read_records(&config, &records)?;
            write(storage, config, |client, ts| client.upsert(records, ts))
        }
        Command::BulkInsert { records } => {
            let records = read_records(&config, &records)?;
            write(storage, config, |client, ts| client.bulk_insert(records, ts))
        }
        Command::Delete { keys } => {
            let data = fs::read_to_string(&keys)
                .with_context(|| format!("reading keys {}", keys.display()))?;
            let keys: Vec<RecordKey> = serde_json::from_str(&data)?;
            write(storage, config, |client, ts| client.delete(keys, ts))
        }
        Command::Rollback { instant } => {
            let mut client = WriteClient::new(storage, config)?;
            let stats = client.rollback(&instant)?;
            info!(instant = %instant, partitions = stats.len(), "rolled back");
            print_json(&stats)
        }
        Command::Compact {
            instant,
            schedule_only,
        } => {
            let mut client = WriteClient::new(storage, config)?;
            let instant = match instant {
                Some(instant) => instant,
                None => match client.schedule_compaction()? {
                    Some(instant) => instant,
                    None => return print_json(&Value::Null),
                },
            };
            if schedule_only {
                return print_json(&serde_json::json!({ "scheduled": instant }));
            }
            let statuses = client.compact(&instant, true)?;
            print_json(&WriteOutput::new(instant, statuses))
        }
        Command::Clean => {
            let client = WriteClient::new(storage, config)?;
            print_json(&client.clean()?)
        }
        Command::Timeline => {
            let meta = TableMetaClient::load(storage, &config.base_path)?;
            let timeline =
                meta.reload_active_timeline(Arc::new(InvariantEngine::with_timeline_defaults()))?;
            print_json(&timeline.instants())
        }
        Command::Markers { instant } => {
            let meta = TableMetaClient::load(storage, &config.base_path)?;
            print_json(&meta.marker_store(&instant).list_all()?)
        }
    }
}

fn write<F>(storage: Arc<dyn FileSystem>, config: WriteConfig, op: F) -> Result<()>
where
    F: FnOnce(&mut WriteClient, &str) -> Result<Vec<WriteStatus>, ClientError>,
{
    let mut client = WriteClient::new(storage, config)?;
    let instant = client.begin_instant()?;
    let statuses = op(&mut client, &instant)?;
    info!(instant = %instant, files = statuses.len(), "write finished");
    print_json(&WriteOutput::new(instant, statuses))
}

fn read_records(config: &WriteConfig, path: &Path) -> Result<Vec<Record>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading records {}", path.display()))?;
    let rows: Vec<Map<String, Value>> = serde_json::from_str(&data)?;
    if rows.is_empty() {
        bail!("{} holds no records", path.display());
    }
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            Record::from_data(&config.schema, row).with_context(|| format!("record {i}"))
        })
        .collect()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
