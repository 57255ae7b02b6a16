//! Recovery of delimited lines that did not parse to the header's width.
//!
//! The usual culprit is a free-text column (a fund name, a description) holding
//! the delimiter, often with unbalanced quotes around it. Repair strips stray
//! quotes next to delimiters, re-splits the line, and folds the overflow back
//! into the first non-numeric field. A field counts as numeric when it starts
//! with a number, so leading identifiers and dates are never merge anchors.
//!
//! The merge anchor is a heuristic: a layout that puts its free-text column
//! after an unrelated non-numeric column will be merged at the wrong place
//! rather than rejected.

use csv::ReaderBuilder;
use thiserror::Error;

use crate::process::utils::{is_numeric_literal, strip_quotes};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("line is empty")]
    Empty,
    #[error("{found} fields, expected {expected}: every field is numeric, no merge anchor")]
    NoAnchor { found: usize, expected: usize },
    #[error("{found} fields, expected {expected}")]
    WidthMismatch { found: usize, expected: usize },
}

/// Coerce `line` into exactly `expected` fields split on `delimiter`.
pub fn repair_line(line: &str, delimiter: u8, expected: usize) -> Result<Vec<String>, RepairError> {
    if line.trim().is_empty() {
        return Err(RepairError::Empty);
    }

    let stripped = strip_stray_quotes(line, delimiter);
    let mut fields = lenient_split(&stripped, delimiter);
    if fields.is_empty() {
        fields = raw_split(&stripped, delimiter);
    }

    let fields = merge_overflow(fields, expected, delimiter)?;
    if fields.len() != expected {
        return Err(RepairError::WidthMismatch {
            found: fields.len(),
            expected,
        });
    }

    Ok(fields.iter().map(|f| strip_quotes(f)).collect())
}

/// Fold surplus fields into the first field that is not a numeric literal.
///
/// With `found - expected = d`, the anchor and the `d` fields after it are
/// joined with the delimiter into one field. Rows that are not wider than
/// `expected` are returned unchanged.
pub fn merge_overflow(
    mut fields: Vec<String>,
    expected: usize,
    delimiter: u8,
) -> Result<Vec<String>, RepairError> {
    let found = fields.len();
    if found <= expected {
        return Ok(fields);
    }
    let surplus = found - expected;

    let anchor = fields
        .iter()
        .position(|f| !is_numeric_literal(f))
        .ok_or(RepairError::NoAnchor { found, expected })?;
    if anchor + surplus >= found {
        return Err(RepairError::WidthMismatch { found, expected });
    }

    let sep = char::from(delimiter).to_string();
    let merged = fields
        .drain(anchor..=anchor + surplus)
        .collect::<Vec<_>>()
        .join(&sep);
    fields.insert(anchor, merged);
    Ok(fields)
}

/// Drop the quote in every `;"` and `";` pair (for a `;` delimiter).
fn strip_stray_quotes(line: &str, delimiter: u8) -> String {
    let d = char::from(delimiter);
    line.replace(&format!("{d}\""), &d.to_string())
        .replace(&format!("\"{d}"), &d.to_string())
}

/// Quote-aware split that tolerates unbalanced quotes. Empty when the reader
/// yields no record, which leaves the caller to split on the raw delimiter.
fn lenient_split(line: &str, delimiter: u8) -> Vec<String> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(line.as_bytes());
    match rdr.records().next() {
        Some(Ok(record)) => record.iter().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn raw_split(line: &str, delimiter: u8) -> Vec<String> {
    line.split(char::from(delimiter)).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merges_name_containing_delimiter() {
        let fixed = repair_line("10;FUNDO A;B;2024-01-31", b';', 3).unwrap();
        assert_eq!(fixed, strings(&["10", "FUNDO A;B", "2024-01-31"]));
    }

    #[test]
    fn strips_stray_quotes_before_merging() {
        let fixed = repair_line("10;\"FUNDO \"X\" A;B\";1.5", b';', 3).unwrap();
        assert_eq!(fixed.len(), 3);
        assert_eq!(fixed[0], "10");
        assert_eq!(fixed[2], "1.5");
        assert!(!fixed[1].starts_with('"') && !fixed[1].ends_with('"'));
    }

    #[test]
    fn merge_overflow_uses_first_non_numeric_field() {
        let merged = merge_overflow(strings(&["1", "2", "a", "b", "c", "3"]), 4, b';').unwrap();
        assert_eq!(merged, strings(&["1", "2", "a;b;c", "3"]));
    }

    #[test]
    fn empty_field_is_a_merge_anchor() {
        let merged = merge_overflow(strings(&["1", "", "x", "3"]), 3, b';').unwrap();
        assert_eq!(merged, strings(&["1", ";x", "3"]));
    }

    #[test]
    fn narrow_rows_pass_through_merge() {
        let row = strings(&["1", "2"]);
        assert_eq!(merge_overflow(row.clone(), 3, b';').unwrap(), row);
    }

    #[test]
    fn all_numeric_overflow_fails() {
        assert_eq!(
            repair_line("1;2;3;4", b';', 3),
            Err(RepairError::NoAnchor {
                found: 4,
                expected: 3
            })
        );
    }

    #[test]
    fn anchor_too_close_to_the_end_fails() {
        assert_eq!(
            repair_line("1;2;3;x;y", b';', 2),
            Err(RepairError::WidthMismatch {
                found: 5,
                expected: 2
            })
        );
    }

    #[test]
    fn short_rows_are_unrecoverable() {
        assert_eq!(
            repair_line("1;x", b';', 3),
            Err(RepairError::WidthMismatch {
                found: 2,
                expected: 3
            })
        );
        assert_eq!(repair_line("   ", b';', 3), Err(RepairError::Empty));
    }

    #[test]
    fn single_overflow_always_recovers_width() {
        // one over-split free-text field, in every position after a numeric prefix
        for prefix in 0..4 {
            let mut parts: Vec<String> = (0..prefix).map(|i| i.to_string()).collect();
            parts.push("NOME".into());
            parts.push("PARTE".into());
            parts.extend((0..3).map(|i| format!("{}.5", i)));
            let line = parts.join(";");
            let expected = parts.len() - 1;
            let fixed = repair_line(&line, b';', expected).unwrap();
            assert_eq!(fixed.len(), expected);
            assert_eq!(fixed[prefix], "NOME;PARTE");
        }
    }

    #[test]
    fn leading_identifier_is_not_an_anchor() {
        let fixed = repair_line("12.345.678/0001-90;FUNDO A;B;100.5", b';', 3).unwrap();
        assert_eq!(fixed, strings(&["12.345.678/0001-90", "FUNDO A;B", "100.5"]));
    }

    #[test]
    fn leading_date_is_not_an_anchor() {
        let fixed = repair_line("2024-01-31;FUNDO A;B;100.5", b';', 3).unwrap();
        assert_eq!(fixed, strings(&["2024-01-31", "FUNDO A;B", "100.5"]));
    }

    #[test]
    fn identifier_and_date_before_the_name() {
        let fixed =
            repair_line("12.345.678/0001-90;2024-01-31;FUNDO;DE;ACOES;7", b';', 4).unwrap();
        assert_eq!(
            fixed,
            strings(&["12.345.678/0001-90", "2024-01-31", "FUNDO;DE;ACOES", "7"])
        );
    }

    #[test]
    fn raw_split_agrees_with_lenient_split_on_plain_lines() {
        let line = "1;FUNDO;2";
        assert_eq!(lenient_split(line, b';'), raw_split(line, b';'));
        assert!(lenient_split("", b';').is_empty());
    }

    #[test]
    fn comma_delimiter() {
        let fixed = repair_line("7,ACME, INC,9", b',', 3).unwrap();
        assert_eq!(fixed, strings(&["7", "ACME, INC", "9"]));
    }
}
