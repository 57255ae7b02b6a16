use anyhow::{anyhow, Result};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::process::{
    loader::{LoadStats, LoadedTable, TableLoader},
    table::CanonicalTable,
};

/// A publication period: a month, or a whole year for yearly families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub year: i32,
    pub month: Option<u32>,
}

impl Period {
    pub fn monthly(year: i32, month: u32) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    pub fn yearly(year: i32) -> Self {
        Self { year, month: None }
    }

    /// `"2024"`
    pub fn year_str(&self) -> String {
        format!("{:04}", self.year)
    }

    /// `"03"`, or `""` for a yearly period.
    pub fn month_str(&self) -> String {
        self.month.map(|m| format!("{m:02}")).unwrap_or_default()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(m) => write!(f, "{:04}-{:02}", self.year, m),
            None => write!(f, "{:04}", self.year),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Loaded(LoadStats),
    Failed(String),
}

/// What happened to one source file during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug)]
pub struct Consolidation {
    pub table: CanonicalTable,
    pub files: Vec<FileReport>,
}

/// Result of merging a set of files. `NoData` is a normal terminal state, not a
/// failure: nothing applicable was found, so there is nothing to write.
#[derive(Debug)]
pub enum IngestOutcome {
    Consolidated(Consolidation),
    NoData,
}

impl IngestOutcome {
    pub fn rows(&self) -> usize {
        match self {
            IngestOutcome::Consolidated(c) => c.table.len(),
            IngestOutcome::NoData => 0,
        }
    }
}

/// Runs a [`TableLoader`] over many files with at most `workers` loads in flight.
#[derive(Debug, Clone)]
pub struct Ingestor {
    loader: TableLoader,
    workers: usize,
}

impl Ingestor {
    pub fn new(loader: TableLoader, workers: usize) -> Self {
        Self {
            loader,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawn one task per path, each waiting on the shared semaphore before
    /// running `work` on the blocking pool. Results arrive in completion order.
    ///
    /// The channel closes only once every task has been joined, so draining the
    /// receiver always terminates and sees every result.
    fn dispatch<T, F>(&self, paths: Vec<PathBuf>, work: F) -> mpsc::Receiver<(PathBuf, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&TableLoader, &Path) -> Result<T> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<(PathBuf, Result<T>)>(self.workers * 2);
        let sem = Arc::new(Semaphore::new(self.workers));
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(paths.len());

        for path in paths {
            let tx = tx.clone();
            let sem = sem.clone();
            let work = work.clone();
            let loader = self.loader.clone();

            handles.push(tokio::spawn(async move {
                let result = match sem.acquire_owned().await {
                    Ok(_permit) => {
                        let p = path.clone();
                        match tokio::task::spawn_blocking(move || (*work)(&loader, &p)).await {
                            Ok(r) => r,
                            Err(e) => Err(anyhow!("worker for {} aborted: {e}", path.display())),
                        }
                    }
                    Err(e) => Err(anyhow!("worker pool closed: {e}")),
                };
                let _ = tx.send((path, result)).await;
            }));
        }

        // the original sender lives until every worker has been joined
        tokio::spawn(async move {
            for h in handles {
                if let Err(e) = h.await {
                    error!("worker task failed to join: {e}");
                }
            }
            drop(tx);
        });

        rx
    }

    /// Load every path and concatenate the tables in completion order.
    ///
    /// A file that cannot be opened is reported and skipped; siblings carry on.
    /// Returns [`IngestOutcome::NoData`] when no file contributed a row.
    #[instrument(level = "info", skip(self, paths), fields(files = paths.len(), workers = self.workers))]
    pub async fn consolidate(&self, paths: Vec<PathBuf>) -> IngestOutcome {
        let mut rx = self.dispatch(paths, |loader, path| loader.load(path));

        let mut acc = CanonicalTable::default();
        let mut files = Vec::new();
        while let Some((path, result)) = rx.recv().await {
            match result {
                Ok(LoadedTable { table, stats }) => {
                    debug!(path = %path.display(), rows = table.len(), "merging");
                    acc.append(table);
                    files.push(FileReport {
                        path,
                        outcome: FileOutcome::Loaded(stats),
                    });
                }
                Err(e) => {
                    error!(path = %path.display(), "load failed: {e:#}");
                    files.push(FileReport {
                        path,
                        outcome: FileOutcome::Failed(format!("{e:#}")),
                    });
                }
            }
        }

        if acc.is_empty() {
            info!(files = files.len(), "no rows loaded");
            return IngestOutcome::NoData;
        }
        info!(files = files.len(), rows = acc.len(), "consolidated");
        IngestOutcome::Consolidated(Consolidation { table: acc, files })
    }

    /// Load every path and write each table to `output_dir/<file name>`
    /// (comma-delimited UTF-8). Load failures are reported; a write failure
    /// aborts the stage.
    #[instrument(level = "info", skip(self, paths, output_dir), fields(files = paths.len(), out = %output_dir.display()))]
    pub async fn standardize(&self, paths: Vec<PathBuf>, output_dir: &Path) -> Result<Vec<FileReport>> {
        let mut rx = self.dispatch(paths, |loader, path| loader.load(path));

        let mut files = Vec::new();
        while let Some((path, result)) = rx.recv().await {
            match result {
                Ok(LoadedTable { table, stats }) => {
                    let Some(name) = path.file_name() else {
                        warn!(path = %path.display(), "source has no file name, skipping");
                        continue;
                    };
                    let dest = output_dir.join(name);
                    table.write_csv(&dest, b',')?;
                    debug!(src = %path.display(), dest = %dest.display(), rows = table.len(), "standardized");
                    files.push(FileReport {
                        path,
                        outcome: FileOutcome::Loaded(stats),
                    });
                }
                Err(e) => {
                    error!(path = %path.display(), "load failed: {e:#}");
                    files.push(FileReport {
                        path,
                        outcome: FileOutcome::Failed(format!("{e:#}")),
                    });
                }
            }
        }
        Ok(files)
    }
}
