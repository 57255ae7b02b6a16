use anyhow::{Context, Result};
use csv::ReaderBuilder;
use encoding_rs::{Encoding, WINDOWS_1252};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};
use tracing::{debug, error, instrument, warn};

use crate::process::{
    reconcile::{reconcile, SchemaRules},
    repair::{merge_overflow, repair_line},
    table::CanonicalTable,
    utils::strip_quotes,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Counters for one loaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub lines: u64,
    pub rows: u64,
    pub repaired: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct LoadedTable {
    pub table: CanonicalTable,
    pub stats: LoadStats,
}

/// Parses one source file into a reconciled [`CanonicalTable`].
#[derive(Debug, Clone)]
pub struct TableLoader {
    delimiter: u8,
    encoding: &'static Encoding,
    rules: Arc<SchemaRules>,
}

impl TableLoader {
    pub fn new(delimiter: u8, encoding: &'static Encoding, rules: SchemaRules) -> Self {
        Self {
            delimiter,
            encoding,
            rules: Arc::new(rules),
        }
    }

    /// `;`-delimited Latin-1, the shape of the public fund extracts.
    pub fn latin1(rules: SchemaRules) -> Self {
        Self::new(b';', WINDOWS_1252, rules)
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn rules(&self) -> &SchemaRules {
        &self.rules
    }

    /// Read `path` line by line.
    ///
    /// The first non-blank line is the header and fixes the expected width.
    /// Lines that fail to parse or have the wrong width go through repair;
    /// unrecoverable ones are logged and skipped. A read error part way through
    /// keeps the rows read so far. Only failing to open the file is an error.
    #[instrument(level = "info", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<LoadedTable> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut stats = LoadStats::default();
        let mut header: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut line_no: u64 = 0;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(path = %path.display(), line = line_no + 1, error = %e, "read failed, keeping rows parsed so far");
                    break;
                }
            }
            line_no += 1;
            stats.lines += 1;

            let bytes = if line_no == 1 {
                buf.strip_prefix(UTF8_BOM).unwrap_or(&buf)
            } else {
                &buf[..]
            };
            let decoded = self.encoding.decode_without_bom_handling(bytes).0;
            let line = decoded.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }

            let Some(expected) = header.as_ref().map(Vec::len) else {
                match self.parse_line(line) {
                    Some(cols) => header = Some(cols.iter().map(|c| c.trim().to_string()).collect()),
                    None => warn!(path = %path.display(), line = line_no, "unparsable header line, skipping"),
                }
                continue;
            };

            let primary = match self.parse_line(line) {
                Some(row) if row.len() == expected => {
                    rows.push(row);
                    stats.rows += 1;
                    continue;
                }
                other => other,
            };

            match self.repair(line, primary, expected) {
                Some(row) => {
                    debug!(path = %path.display(), line = line_no, "line repaired");
                    rows.push(row);
                    stats.rows += 1;
                    stats.repaired += 1;
                }
                None => {
                    warn!(path = %path.display(), line = line_no, expected, content = %line, "unrecoverable line, skipping");
                    stats.dropped += 1;
                }
            }
        }

        let mut table = CanonicalTable {
            headers: header.unwrap_or_default(),
            rows,
        };
        if !table.headers.is_empty() {
            let report = reconcile(&mut table, &self.rules);
            if !report.is_noop() {
                debug!(path = %path.display(), ?report, "schema reconciled");
            }
        }

        debug!(
            path = %path.display(),
            rows = stats.rows,
            repaired = stats.repaired,
            dropped = stats.dropped,
            "file loaded"
        );
        Ok(LoadedTable { table, stats })
    }

    /// Quote-aware parse of a single line. `None` if the line yields no record.
    fn parse_line(&self, line: &str) -> Option<Vec<String>> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(line.as_bytes());
        match rdr.records().next()? {
            Ok(record) => Some(record.iter().map(str::to_string).collect()),
            Err(e) => {
                debug!(error = %e, "primary parse failed");
                None
            }
        }
    }

    /// Repair the raw line; failing that, merge the overflow of the primary parse.
    fn repair(&self, line: &str, primary: Option<Vec<String>>, expected: usize) -> Option<Vec<String>> {
        match repair_line(line, self.delimiter, expected) {
            Ok(row) => return Some(row),
            Err(e) => debug!(reason = %e, "raw line repair failed"),
        }
        let row = primary.filter(|r| r.len() > expected)?;
        match merge_overflow(row, expected, self.delimiter) {
            Ok(merged) if merged.len() == expected => {
                Some(merged.iter().map(|f| strip_quotes(f)).collect())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    fn write_latin1(path: &Path, text: &str) {
        let (bytes, _, unmappable) = WINDOWS_1252.encode(text);
        assert!(!unmappable);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn quoted_delimiter_stays_in_one_field() -> Result<()> {
        crate::init_test_logging();
        let dir = tempdir()?;
        let path = dir.path().join("t.csv");
        write_latin1(&path, "A;B;C\nx;\"y;z\";1\n");

        let loaded = TableLoader::latin1(SchemaRules::default()).load(&path)?;
        assert_eq!(loaded.table.headers, vec!["A", "B", "C"]);
        assert_eq!(loaded.table.rows, vec![vec!["x", "y;z", "1"]]);
        assert_eq!(loaded.stats.repaired, 0);
        Ok(())
    }

    #[test]
    fn decodes_latin1_and_repairs_oversplit_names() -> Result<()> {
        crate::init_test_logging();
        let dir = tempdir()?;
        let path = dir.path().join("inf_mensal.csv");
        write_latin1(
            &path,
            "VL_PL;DENOM_SOCIAL;TP_FUNDO;CNPJ_FUNDO;DT_COMPTC\r\n\
             100.5;FUNDO AÇÃO;FIDC;11.111.111/0001-11;2024-01-31\r\n\
             7;FUNDO \"ALFA; BETA\";FIDC;22.222.222/0001-22;2024-01-31\r\n\
             1;2;3;4;5;6\r\n\
             \r\n\
             9;GAMA;FIDC;33.333.333/0001-33\r\n",
        );

        let rules = SchemaRules::default()
            .alias("TP_FUNDO", "TP_FUNDO_CLASSE")
            .alias("CNPJ_FUNDO", "CNPJ_FUNDO_CLASSE")
            .default_column("ID_SUBCLASSE", "");
        let loaded = TableLoader::latin1(rules).load(&path)?;
        let t = &loaded.table;

        assert_eq!(
            t.headers,
            vec![
                "VL_PL",
                "DENOM_SOCIAL",
                "TP_FUNDO_CLASSE",
                "CNPJ_FUNDO_CLASSE",
                "DT_COMPTC",
                "ID_SUBCLASSE"
            ]
        );
        assert_eq!(t.len(), 2);
        assert_eq!(t.value(0, "DENOM_SOCIAL"), Some("FUNDO AÇÃO"));
        assert_eq!(t.value(1, "DENOM_SOCIAL"), Some("FUNDO \"ALFA; BETA"));
        assert_eq!(t.value(1, "CNPJ_FUNDO_CLASSE"), Some("22.222.222/0001-22"));
        assert_eq!(t.value(1, "ID_SUBCLASSE"), Some(""));
        assert_eq!(loaded.stats.repaired, 1);
        assert_eq!(loaded.stats.dropped, 2);
        assert!(t.rows.iter().all(|r| r.len() == t.headers.len()));
        Ok(())
    }

    #[test]
    fn unquoted_delimiter_in_name_is_repaired() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.csv");
        write_latin1(&path, "ID;NOME;VALOR\n10;FUNDO A;B;2.5\n11;FUNDO C;3\n");

        let loaded = TableLoader::latin1(SchemaRules::default()).load(&path)?;
        assert_eq!(
            loaded.table.rows,
            vec![vec!["10", "FUNDO A;B", "2.5"], vec!["11", "FUNDO C", "3"]]
        );
        assert_eq!(loaded.stats.repaired, 1);
        Ok(())
    }

    #[test]
    fn quoted_overflow_falls_back_to_the_parsed_row() -> Result<()> {
        // stripping the quotes splits "2;3" apart and leaves the anchor too close
        // to the end, so only the quote-aware fields can be merged
        let dir = tempdir()?;
        let path = dir.path().join("t.csv");
        write_latin1(&path, "N;M;NOME\n1;\"2;3\";A;B\n");

        assert!(repair_line("1;\"2;3\";A;B", b';', 3).is_err());
        let loaded = TableLoader::latin1(SchemaRules::default()).load(&path)?;
        assert_eq!(loaded.table.rows, vec![vec!["1", "2;3", "A;B"]]);
        assert_eq!(loaded.stats.repaired, 1);
        assert_eq!(loaded.stats.dropped, 0);
        Ok(())
    }

    #[test]
    fn header_only_file_is_an_empty_table() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.csv");
        write_latin1(&path, "A;B\n");
        let loaded = TableLoader::latin1(SchemaRules::default()).load(&path)?;
        assert!(loaded.table.is_empty());
        assert_eq!(loaded.table.headers, vec!["A", "B"]);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = TableLoader::latin1(SchemaRules::default())
            .load(dir.path().join("nope.csv"))
            .unwrap_err();
        assert!(err.to_string().contains("opening"));
    }

    #[test]
    fn utf8_bom_is_dropped_from_header() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.csv");
        fs::write(&path, b"\xEF\xBB\xBFA,B\n1,2\n")?;
        let loaded = TableLoader::new(b',', encoding_rs::UTF_8, SchemaRules::default()).load(&path)?;
        assert_eq!(loaded.table.headers, vec!["A", "B"]);
        Ok(())
    }
}
