use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::BufWriter,
    path::Path,
};
use tracing::{debug, warn};

/// An in-memory table of string cells.
///
/// Every row has exactly `headers.len()` fields; the mutating helpers below keep
/// that true so downstream consumers can index rows by column position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalTable {
    /// Column names, in output order.
    pub headers: Vec<String>,
    /// One `Vec<String>` per record, aligned with `headers`.
    pub rows: Vec<Vec<String>>,
}

impl CanonicalTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell at (`row`, `column`), if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx)).map(String::as_str)
    }

    /// Append a column with every existing row set to `default`.
    pub fn add_column(&mut self, name: &str, default: &str) {
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(default.to_string());
        }
    }

    /// Rename `from` to `to` in place. Returns false if `from` is absent.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.headers[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove `name` and its cells. Returns false if it was absent.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        self.headers.remove(idx);
        for row in &mut self.rows {
            if idx < row.len() {
                row.remove(idx);
            }
        }
        true
    }

    /// Concatenate `other`'s rows after ours.
    ///
    /// Columns are aligned by name. A column only `other` has is appended to our
    /// header (existing rows get `""`); a column only we have is filled with `""`
    /// in `other`'s rows. When `other` repeats a column name only the first
    /// occurrence is kept. The row count afterwards is always
    /// `self.len() + other.len()`.
    pub fn append(&mut self, other: CanonicalTable) {
        if self.headers.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }
        if self.headers == other.headers {
            self.rows.extend(other.rows);
            return;
        }

        let mut index: HashMap<String, usize> = HashMap::with_capacity(self.headers.len());
        for (i, h) in self.headers.iter().enumerate() {
            index.entry(h.clone()).or_insert(i);
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(other.headers.len());
        let mut positions: Vec<Option<usize>> = Vec::with_capacity(other.headers.len());
        for h in &other.headers {
            if !seen.insert(h.as_str()) {
                warn!(column = %h, "duplicate column in merged table, keeping the first");
                positions.push(None);
                continue;
            }
            let pos = match index.get(h) {
                Some(&pos) => pos,
                None => {
                    debug!(column = %h, "aligning merge: new column");
                    self.add_column(h, "");
                    let pos = self.headers.len() - 1;
                    index.insert(h.clone(), pos);
                    pos
                }
            };
            positions.push(Some(pos));
        }

        let width = self.headers.len();
        self.rows.reserve(other.rows.len());
        for row in other.rows {
            let mut aligned = vec![String::new(); width];
            for (cell, pos) in row.into_iter().zip(&positions) {
                if let Some(pos) = *pos {
                    aligned[pos] = cell;
                }
            }
            self.rows.push(aligned);
        }
    }

    /// Write a header row plus every record, atomically (tmp file + rename).
    /// Parent directories are created if missing.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P, delimiter: u8) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("csv.tmp");
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            let mut wtr = WriterBuilder::new()
                .delimiter(delimiter)
                .from_writer(BufWriter::new(file));
            wtr.write_record(&self.headers)
                .with_context(|| format!("writing header to {}", tmp_path.display()))?;
            for row in &self.rows {
                wtr.write_record(row)
                    .with_context(|| format!("writing row to {}", tmp_path.display()))?;
            }
            wtr.flush()
                .with_context(|| format!("flushing {}", tmp_path.display()))?;
        }

        fs::rename(&tmp_path, path).with_context(|| {
            format!("renaming {} -> {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }

    /// Read a UTF-8 header-plus-rows file such as one produced by [`write_csv`].
    /// Rows whose width disagrees with the header are skipped with a warning.
    ///
    /// [`write_csv`]: CanonicalTable::write_csv
    pub fn read_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self> {
        let path = path.as_ref();
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut table = CanonicalTable::new(headers);

        for (idx, result) in rdr.records().enumerate() {
            let line = idx + 2;
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), line, error = %e, "unreadable record, skipping");
                    continue;
                }
            };
            if record.len() != table.headers.len() {
                warn!(
                    path = %path.display(),
                    line,
                    fields = record.len(),
                    expected = table.headers.len(),
                    "record width mismatch, skipping"
                );
                continue;
            }
            table.rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(table)
    }
}
