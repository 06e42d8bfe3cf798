use std::path::PathBuf;
use std::sync::Arc;

use catalog_harvester::fetch::{HttpFetcher, HttpReleaseSource};
use catalog_harvester::harvest::Harvester;
use catalog_harvester::normalize::RecordNormalizer;
use catalog_harvester::sink::{publish, MemoryDatabase};
use catalog_harvester::{ConfigConversions, HarvestConfig};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version, about = "Harvest a package catalog into normalized records")]
struct Args {
    #[clap(long, env = "HARVEST_CONFIG")]
    /// JSON configuration file
    config: Option<PathBuf>,

    #[clap(long)]
    /// Catalog base URI
    repo_uri: Option<String>,

    #[clap(long)]
    /// Number of pool workers
    workers: Option<usize>,

    #[clap(long)]
    /// Bound the job queue to this many pending jobs
    queue_capacity: Option<usize>,

    #[clap(long)]
    /// Only harvest the first N index entries
    max_packages: Option<usize>,

    #[clap(long, default_value = "catalog.json")]
    /// Where to write the resulting database
    output: PathBuf,

    #[clap(long)]
    /// Print debug logs
    debug: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::from_file(path)?,
        None => HarvestConfig::default(),
    };
    if let Some(repo_uri) = args.repo_uri {
        config = config.with_repo_uri(repo_uri);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(capacity) = args.queue_capacity {
        config = config.with_queue_capacity(capacity);
    }
    if let Some(limit) = args.max_packages {
        config = config.with_max_packages(limit);
    }

    let fetcher = Arc::new(HttpFetcher::new()?);
    let releases = Arc::new(HttpReleaseSource::new(&config)?);
    let harvester = Harvester::new(config, fetcher, releases);
    let output = harvester.harvest().await?;
    info!(stats = ?output.stats, "Harvest finished");

    let config = harvester.config();
    let today = chrono::Local::now().date_naive();
    let normalizer = RecordNormalizer::new(config, &ConfigConversions, today);
    let records = normalizer.normalize_all(&output.catalog, &output.store);

    let mut database = MemoryDatabase::new();
    let written = publish(&mut database, config, records)?;
    database.write_json(&args.output)?;
    info!(
        packages = written,
        output = %args.output.display(),
        "Database written"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        error!(error = %e, "Harvest failed");
        std::process::exit(1);
    }
}
