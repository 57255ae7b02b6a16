use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use crate::config::{FamilyConfig, SourceLayout};
use crate::process::{
    export::write_parquet,
    ingest::{FileReport, IngestOutcome, Ingestor, Period},
    latest::select_latest,
    table::CanonicalTable,
};

/// What the consolidation stage produced for one tab of a family.
#[derive(Debug)]
pub struct TabOutcome {
    pub tab: String,
    pub outcome: IngestOutcome,
    pub written: Vec<PathBuf>,
}

/// Existing source files for `tab` across `periods`.
///
/// Template sources that do not exist are skipped. A directory source that
/// cannot be listed is an error.
pub fn resolve_sources(
    family: &FamilyConfig,
    root: &Path,
    tab: &str,
    periods: &[Period],
) -> Result<Vec<PathBuf>> {
    match &family.source {
        SourceLayout::Template { .. } => {
            let mut paths = Vec::new();
            for period in periods {
                let Some(path) = family.source_path(root, tab, period) else {
                    continue;
                };
                if !path.is_file() {
                    debug!(family = %family.name, %period, path = %path.display(), "no source file");
                    continue;
                }
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            Ok(paths)
        }
        SourceLayout::Directory { dir, prefix } => {
            let dir = root.join(dir);
            let mut paths = Vec::new();
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("listing source directory {}", dir.display()))?
            {
                let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
                let path = entry.path();
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix.as_str()));
                if matches && path.is_file() {
                    paths.push(path);
                }
            }
            paths.sort();
            Ok(paths)
        }
    }
}

fn ingestor(family: &FamilyConfig) -> Result<Ingestor> {
    Ok(Ingestor::new(family.loader()?, family.worker_limit()))
}

/// Write every source file of `family` found for `periods`, reconciled, to the
/// family's output directory under its original file name.
#[instrument(level = "info", skip(family, root, periods), fields(family = %family.name))]
pub async fn standardize_family(
    family: &FamilyConfig,
    root: &Path,
    periods: &[Period],
) -> Result<Vec<FileReport>> {
    let ingestor = ingestor(family)?;
    let out = family.output_dir(root);
    let mut reports = Vec::new();
    for tab in &family.tabs {
        let sources = resolve_sources(family, root, tab, periods)?;
        info!(tab = %tab, files = sources.len(), "standardizing");
        reports.extend(ingestor.standardize(sources, &out).await?);
    }
    Ok(reports)
}

/// Merge every period of each tab into `<stem>consolidated.csv`, plus
/// `<stem>latest.csv` when the family selects latest rows and a Parquet copy
/// when enabled. Tabs with no data write nothing.
#[instrument(level = "info", skip(family, root, periods), fields(family = %family.name))]
pub async fn consolidate_family(
    family: &FamilyConfig,
    root: &Path,
    periods: &[Period],
) -> Result<Vec<TabOutcome>> {
    let ingestor = ingestor(family)?;
    let mut outcomes = Vec::with_capacity(family.tabs.len());

    for tab in &family.tabs {
        let sources = resolve_sources(family, root, tab, periods)?;
        let outcome = ingestor.consolidate(sources).await;
        let mut written = Vec::new();

        if let IngestOutcome::Consolidated(c) = &outcome {
            let path = family.consolidated_path(root, tab);
            c.table.write_csv(&path, b',')?;
            info!(tab = %tab, rows = c.table.len(), path = %path.display(), "consolidated file written");
            written.push(path.clone());

            if family.parquet {
                let path = path.with_extension("parquet");
                write_parquet(&c.table, &path)?;
                written.push(path);
            }
            if family.latest.is_some() {
                written.push(write_latest(family, root, tab, &c.table)?);
            }
        } else {
            info!(tab = %tab, "no data, nothing written");
        }

        outcomes.push(TabOutcome {
            tab: tab.clone(),
            outcome,
            written,
        });
    }
    Ok(outcomes)
}

/// Recompute `<stem>latest.csv` from the consolidated files already on disk.
/// Tabs without a consolidated file are skipped.
#[instrument(level = "info", skip(family, root), fields(family = %family.name))]
pub fn latest_family(family: &FamilyConfig, root: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for tab in &family.tabs {
        let src = family.consolidated_path(root, tab);
        if !src.is_file() {
            debug!(path = %src.display(), "no consolidated file");
            continue;
        }
        let table = CanonicalTable::read_csv(&src, b',')?;
        written.push(write_latest(family, root, tab, &table)?);
    }
    Ok(written)
}

fn write_latest(
    family: &FamilyConfig,
    root: &Path,
    tab: &str,
    table: &CanonicalTable,
) -> Result<PathBuf> {
    let scope = family.latest.unwrap_or_default();
    let latest = select_latest(table, &family.key_column, &family.date_column, scope)
        .with_context(|| format!("latest selection for {}{}", family.name, tab))?;
    let path = family.latest_path(root, tab);
    latest.write_csv(&path, b',')?;
    info!(rows = latest.len(), path = %path.display(), "latest file written");
    Ok(path)
}
