use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringArray},
    datatypes::{DataType, Field, Schema as ArrowSchema},
    record_batch::RecordBatch,
};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    path::Path,
    sync::Arc,
};
use tracing::info;

use crate::process::table::CanonicalTable;

/// Write `table` as a single-row-group Parquet file, every column `Utf8`.
/// Written to `<path>.tmp` first and renamed into place.
pub fn write_parquet<P: AsRef<Path>>(table: &CanonicalTable, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }

    let schema = Arc::new(ArrowSchema::new(
        table
            .headers
            .iter()
            .map(|h| Field::new(h, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let columns: Vec<ArrayRef> = (0..table.headers.len())
        .map(|c| {
            let values = table.rows.iter().map(|r| r.get(c).map(String::as_str).unwrap_or(""));
            Arc::new(StringArray::from_iter_values(values)) as ArrayRef
        })
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), columns).context("building RecordBatch")?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let tmp_path = path.with_extension("parquet.tmp");
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))
            .context("creating ArrowWriter")?;
        writer
            .write(&batch)
            .with_context(|| format!("writing batch to {}", tmp_path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} -> {}", tmp_path.display(), path.display()))?;

    info!(path = %path.display(), rows = table.len(), "parquet written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    #[test]
    fn writes_string_columns() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out/fidc.parquet");
        let table = CanonicalTable {
            headers: vec!["CNPJ_FUNDO_CLASSE".into(), "DT_COMPTC".into()],
            rows: vec![
                vec!["1".into(), "2024-01-31".into()],
                vec!["2".into(), "2024-02-29".into()],
            ],
        };
        write_parquet(&table, &path)?;
        assert!(!path.with_extension("parquet.tmp").exists());

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let dates = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(dates.value(1), "2024-02-29");
        assert_eq!(batches[0].schema().field(0).name(), "CNPJ_FUNDO_CLASSE");
        Ok(())
    }
}
