use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser};
use dotenv::dotenv;
use ingest_core::application::IngestionServiceImpl;
use ingest_core::config::PipelineConfig;
use ingest_core::domain::RunSummary;
use ingest_core::ports::BlobStore;
use ingest_core::resolver::{resolve_target_date, RunMode, SystemClock};
use object_store_adapter::{AzureConfiguration, ObjectStoreBlobStore};
use sqlite_adapter::SqliteRecordStore;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Loads one day of retail transaction files from blob storage into SQLite
#[derive(Parser, Debug)]
#[command(name = "retail-ingest")]
#[command(about = "Ingests the CSV blobs of one business date into a SQLite database")]
#[command(group(ArgGroup::new("mode").required(true).args(["auto", "date"])))]
struct Cli {
    /// Process yesterday's files
    #[arg(long)]
    auto: bool,

    /// Process the files of this date
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<String>,

    /// Path to the SQLite database file
    #[arg(long, env = "RETAIL_DB", default_value = "retail_data.db")]
    db: PathBuf,

    /// Blob container holding the files
    #[arg(long, env = "RETAIL_CONTAINER", default_value = "retail")]
    container: String,

    /// Virtual directory inside the container
    #[arg(long, env = "RETAIL_BLOB_DIR")]
    blob_dir: Option<String>,

    /// Read blobs from a local directory instead of Azure
    #[arg(long, env = "RETAIL_LOCAL_ROOT")]
    local_root: Option<PathBuf>,

    /// Azure storage connection string
    #[arg(long, env = "AZURE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    /// Name prefix of the dated files, `{date}` is replaced with the target date
    #[arg(long, default_value = "transactions_{date}_")]
    prefix_template: String,

    /// Stop at the first failing blob
    #[arg(long)]
    fail_fast: bool,

    /// Re-ingest blobs already loaded for the date
    #[arg(long)]
    force_reload: bool,

    /// Also load clients.csv, products.csv and stores.csv
    #[arg(long)]
    with_reference_data: bool,

    /// Extra attempts when listing or fetching fails
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Timeout of each storage request, in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Resolve --auto against the local calendar instead of UTC
    #[arg(long)]
    local_time: bool,

    /// Also append logs to this file
    #[arg(long, env = "RETAIL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn mode(&self) -> RunMode {
        match &self.date {
            Some(date) => RunMode::Manual(date.clone()),
            None => RunMode::Auto,
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            container: self.container.clone(),
            prefix_template: self.prefix_template.clone(),
            fail_fast: self.fail_fast,
            force_reload: self.force_reload,
            include_reference: self.with_reference_data,
            retries: self.retries,
            ..PipelineConfig::default()
        }
    }

    fn blob_store(&self) -> Result<ObjectStoreBlobStore> {
        let directory = self.blob_dir.as_deref();
        if let Some(root) = &self.local_root {
            return ObjectStoreBlobStore::local(root, directory)
                .with_context(|| format!("cannot use {} as blob container", root.display()));
        }

        let connection_string = self.connection_string.as_deref().ok_or_else(|| {
            anyhow!("no blob source configured: set AZURE_CONNECTION_STRING or --local-root")
        })?;
        let mut azure =
            AzureConfiguration::from_connection_string(connection_string, &self.container)?;
        azure.directory = self.blob_dir.clone();
        azure.timeout = Duration::from_secs(self.timeout_secs);
        Ok(ObjectStoreBlobStore::azure(&azure)?)
    }
}

fn run(cli: &Cli) -> Result<RunSummary> {
    let clock = if cli.local_time {
        SystemClock::local()
    } else {
        SystemClock::utc()
    };
    // resolved before touching storage so a bad date never reaches the network
    let date = resolve_target_date(&cli.mode(), &clock)?;

    let record_store = SqliteRecordStore::open(&cli.db)
        .map_err(|e| anyhow!("failed to open database {}: {}", cli.db.display(), e))?;
    let blob_store: Box<dyn BlobStore> = Box::new(cli.blob_store()?);

    let config = cli.pipeline_config();
    info!(container = %config.container, db = %cli.db.display(), "pipeline configured");

    let mut service = IngestionServiceImpl::new(blob_store, Box::new(record_store), config);
    Ok(service.run(date)?)
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

/// Logs go to stderr, and to `log_file` without colors when one is given
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(open_log_file(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("Error during startup: {:#}", e);
        std::process::exit(1);
    }

    match run(&cli) {
        Ok(summary) => {
            println!("{}", summary);
        }
        Err(e) => {
            eprintln!("Error during ingestion: {:#}", e);
            std::process::exit(1);
        }
    }
}
