use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use cvmscraper::{
    process::{consolidate_family, latest_family, standardize_family},
    Config, FamilyConfig, LookupQuery, LookupResult, SnapshotCache,
};
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about = "CVM fund data ingestion and snapshot lookups")]
struct Cli {
    /// YAML family/dataset definitions; the built-in CVM set when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data root that source templates, outputs and dataset globs are relative to.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Selection {
    /// Families to run (default: all).
    #[arg(long, value_delimiter = ',')]
    families: Vec<String>,
    #[arg(long, value_delimiter = ',', required = true)]
    years: Vec<i32>,
    #[arg(long, value_delimiter = ',', default_values_t = 1u32..=12)]
    months: Vec<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile each source file and write it under the family's output dir.
    Standardize(Selection),
    /// Merge every period of each family tab into one consolidated file.
    Consolidate(Selection),
    /// Recompute latest-per-entity files from consolidated output.
    Latest {
        #[arg(long, value_delimiter = ',')]
        families: Vec<String>,
    },
    /// Load the configured datasets and print the records for one entity.
    Query {
        dataset: String,
        key: String,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long)]
        latest: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    });
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    // ─── 2) load config ──────────────────────────────────────────────
    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::builtin(),
    };
    info!(
        families = config.families.len(),
        datasets = config.datasets.len(),
        root = %cli.root.display(),
        "startup"
    );

    let start = Instant::now();
    match cli.command {
        Command::Standardize(sel) => {
            for family in select(&config, &sel.families)? {
                let periods = family.periods(&sel.years, &sel.months);
                let reports = standardize_family(family, &cli.root, &periods).await?;
                info!(family = %family.name, files = reports.len(), "standardize done");
            }
        }
        Command::Consolidate(sel) => {
            for family in select(&config, &sel.families)? {
                let periods = family.periods(&sel.years, &sel.months);
                for tab in consolidate_family(family, &cli.root, &periods).await? {
                    info!(
                        family = %family.name,
                        tab = %tab.tab,
                        rows = tab.outcome.rows(),
                        files = tab.written.len(),
                        "consolidate done"
                    );
                }
            }
        }
        Command::Latest { families } => {
            for family in select(&config, &families)? {
                if family.latest.is_none() {
                    info!(family = %family.name, "no latest selection configured, using one row per entity");
                }
                let written = latest_family(family, &cli.root)?;
                info!(family = %family.name, files = written.len(), "latest done");
            }
        }
        Command::Query {
            dataset,
            key,
            year,
            month,
            latest,
        } => query(&config, &cli.root, &dataset, &key, LookupQuery { year, month, latest })?,
    }

    info!(elapsed = ?start.elapsed(), "all done");
    Ok(())
}

fn select<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a FamilyConfig>> {
    if names.is_empty() {
        return Ok(config.families.iter().collect());
    }
    names
        .iter()
        .map(|n| match config.family(n) {
            Some(f) => Ok(f),
            None => bail!("unknown family {n}"),
        })
        .collect()
}

fn query(config: &Config, root: &Path, dataset: &str, key: &str, q: LookupQuery) -> Result<()> {
    let cache = SnapshotCache::new();
    let wanted: Vec<_> = config
        .datasets
        .iter()
        .filter(|d| d.name == dataset)
        .cloned()
        .collect();
    if wanted.is_empty() {
        bail!("unknown dataset {dataset}");
    }
    cache.reload(root, &wanted)?;

    match cache.lookup(dataset, key, &q) {
        LookupResult::NotLoaded => error!("cache not loaded"),
        LookupResult::Records(records) => {
            info!(dataset, key, found = records.len(), "lookup");
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}
