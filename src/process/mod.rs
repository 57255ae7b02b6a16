// src/process/mod.rs
pub mod export;
pub mod ingest;
pub mod latest;
pub mod loader;
pub mod pipeline;
pub mod reconcile;
pub mod repair;
pub mod table;
pub mod utils;

pub use ingest::{Consolidation, FileOutcome, FileReport, IngestOutcome, Ingestor, Period};
pub use latest::{select_latest, select_latest_by, GroupScope};
pub use loader::{LoadStats, LoadedTable, TableLoader};
pub use pipeline::{consolidate_family, latest_family, resolve_sources, standardize_family, TabOutcome};
pub use reconcile::{reconcile, standardize_headers, DefaultColumn, ReconcileReport, SchemaRules};
pub use repair::{merge_overflow, repair_line, RepairError};
pub use table::CanonicalTable;
