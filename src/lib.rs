pub mod cache;
pub mod config;
pub mod key;
pub mod process;

pub use cache::{LookupQuery, LookupResult, Record, SnapshotCache};
pub use config::{Config, DatasetConfig, FamilyConfig};
pub use key::EntityKey;
pub use process::{CanonicalTable, IngestOutcome, Period};

#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cvmscraper=debug")),
        )
        .with_test_writer()
        .finish();
    // ignore the error if another test already installed it
    let _ = tracing::subscriber::set_global_default(subscriber);
}
