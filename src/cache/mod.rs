//! In-memory "latest known record" index over consolidated outputs.
//!
//! The cache holds one immutable [`Snapshot`] behind a `RwLock`. A reload builds
//! a whole new snapshot off to the side and swaps it in under a single write
//! lock, so a reader sees either the previous snapshot or the new one, never a
//! mix. Lookups only ever take the read lock.

pub mod predicate;

use anyhow::{bail, Context, Result};
use glob::glob;
use rayon::prelude::*;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, info, instrument, warn};

use crate::config::DatasetConfig;
use crate::key::EntityKey;
use crate::process::{
    table::CanonicalTable,
    utils::date_year,
};

/// One row of a dataset. Cloning is cheap: header and values are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    headers: Arc<[String]>,
    values: Arc<[String]>,
}

impl Record {
    pub fn new(headers: Arc<[String]>, values: Vec<String>) -> Self {
        Self {
            headers,
            values: values.into(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        self.values.get(idx).map(String::as_str)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Serialises as `{"COLUMN": "value", ...}` in header order.
impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.headers.len()))?;
        for (h, v) in self.headers.iter().zip(self.values.iter()) {
            map.serialize_entry(h, v)?;
        }
        map.end()
    }
}

/// A named table indexed by entity key.
#[derive(Debug)]
pub struct Dataset {
    config: DatasetConfig,
    entries: HashMap<EntityKey, Vec<Record>>,
    rows: usize,
}

impl Dataset {
    /// Index `table` by its key column. Rows with an empty key are not indexed.
    pub fn from_table(config: DatasetConfig, table: CanonicalTable) -> Result<Self> {
        let Some(key_idx) = table.column_index(&config.key_column) else {
            bail!("dataset {}: key column {} missing", config.name, config.key_column);
        };
        if !table.has_column(&config.date_column) {
            bail!("dataset {}: date column {} missing", config.name, config.date_column);
        }

        let headers: Arc<[String]> = table.headers.into();
        let mut entries: HashMap<EntityKey, Vec<Record>> = HashMap::new();
        let mut rows = 0usize;
        for row in table.rows {
            let key = EntityKey::normalize(row.get(key_idx).map(String::as_str).unwrap_or(""));
            if key.is_empty() {
                continue;
            }
            entries
                .entry(key)
                .or_default()
                .push(Record::new(headers.clone(), row));
            rows += 1;
        }
        Ok(Self {
            config,
            entries,
            rows,
        })
    }

    /// Read and merge every file matching the config's globs under `root`.
    #[instrument(level = "info", skip(config, root), fields(dataset = %config.name))]
    pub fn load(config: DatasetConfig, root: &Path) -> Result<Self> {
        let delimiter = config.delimiter_byte()?;
        let mut table = CanonicalTable::default();
        let mut files = 0usize;

        for pattern in &config.sources {
            let full = root.join(pattern);
            let full = full.to_string_lossy();
            for entry in glob(&full).with_context(|| format!("bad glob {full}"))? {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("unreadable glob entry: {e}");
                        continue;
                    }
                };
                table.append(CanonicalTable::read_csv(&path, delimiter)?);
                files += 1;
            }
        }
        if files == 0 {
            warn!(dataset = %config.name, "no source files matched");
        }

        let dataset = Dataset::from_table(config, table);
        if let Ok(d) = &dataset {
            info!(files, rows = d.rows, keys = d.entries.len(), "dataset loaded");
        }
        dataset
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    fn query(&self, key: &EntityKey, query: &LookupQuery) -> Vec<Record> {
        let Some(records) = self.entries.get(key) else {
            return Vec::new();
        };
        let date_col = self.config.date_column.as_str();
        let year = query.year.map(|y| format!("{y:04}"));

        let filtered = records.iter().filter(|r| {
            let date = r.get(date_col).unwrap_or("");
            year.as_deref().map_or(true, |y| date_year(date) == Some(y))
                && query
                    .month
                    .map_or(true, |m| self.config.month_filter.matches(r, date_col, m))
        });

        if !query.latest {
            return filtered.cloned().collect();
        }

        // the newest date wins even when its rows are placeholders; those are
        // then rejected and the lookup comes back empty
        let candidates: Vec<&Record> = filtered.collect();
        let date_of = |r: &Record| r.get(date_col).map(str::trim).unwrap_or("").to_string();
        let Some(max) = candidates.iter().map(|r| date_of(*r)).max() else {
            return Vec::new();
        };
        candidates
            .into_iter()
            .filter(|r| date_of(*r) == max)
            .filter(|r| self.config.validity.iter().all(|v| v.accepts(r)))
            .cloned()
            .collect()
    }
}

/// Filters for [`SnapshotCache::lookup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
    /// Keep only the rows at the latest date, minus those failing the
    /// dataset's validity checks.
    pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The first load has not completed yet.
    NotLoaded,
    Records(Vec<Record>),
}

impl LookupResult {
    pub fn records(&self) -> &[Record] {
        match self {
            LookupResult::NotLoaded => &[],
            LookupResult::Records(r) => r,
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    loaded: bool,
    datasets: HashMap<String, Dataset>,
}

#[derive(Debug, Default)]
pub struct SnapshotCache {
    inner: RwLock<Snapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loaded
    }

    /// Swap in a new set of datasets. Datasets not in `datasets` are gone afterwards.
    pub fn replace(&self, datasets: Vec<Dataset>) {
        let next = Snapshot {
            loaded: true,
            datasets: datasets
                .into_iter()
                .map(|d| (d.config.name.clone(), d))
                .collect(),
        };
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    /// Load every dataset in parallel, then swap them in together. If any
    /// dataset fails to load the current snapshot is kept.
    #[instrument(level = "info", skip(self, root, configs), fields(datasets = configs.len()))]
    pub fn reload(&self, root: &Path, configs: &[DatasetConfig]) -> Result<()> {
        let datasets = configs
            .par_iter()
            .map(|c| Dataset::load(c.clone(), root))
            .collect::<Result<Vec<_>>>()?;
        let rows: usize = datasets.iter().map(Dataset::rows).sum();
        self.replace(datasets);
        info!(rows, "snapshot swapped");
        Ok(())
    }

    /// Records for `key` in `dataset`. Unknown datasets and keys give an empty
    /// result, not an error.
    pub fn lookup(&self, dataset: &str, key: &str, query: &LookupQuery) -> LookupResult {
        let snapshot = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if !snapshot.loaded {
            return LookupResult::NotLoaded;
        }
        let Some(ds) = snapshot.datasets.get(dataset) else {
            debug!(dataset, "unknown dataset");
            return LookupResult::Records(Vec::new());
        };
        LookupResult::Records(ds.query(&EntityKey::normalize(key), query))
    }

    pub fn dataset_names(&self) -> Vec<String> {
        let snapshot = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = snapshot.datasets.keys().cloned().collect();
        names.sort();
        names
    }
}
