use serde::{Deserialize, Serialize};

use crate::cache::Record;
use crate::process::utils::date_month;

/// A per-dataset check that rejects zero-filled placeholder rows. Only applied
/// when a lookup asks for the latest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// Column parses as an integer greater than zero (shareholder counts).
    PositiveInteger(String),
    /// Column parses as a number greater than zero (quota amounts and values).
    PositiveNumber(String),
    /// Column parses as a number different from zero (monthly returns).
    NonZeroNumber(String),
}

impl Validity {
    pub fn column(&self) -> &str {
        match self {
            Validity::PositiveInteger(c) | Validity::PositiveNumber(c) | Validity::NonZeroNumber(c) => c,
        }
    }

    /// A missing or unparsable cell fails every predicate.
    pub fn accepts(&self, record: &Record) -> bool {
        let Some(raw) = record.get(self.column()).map(str::trim) else {
            return false;
        };
        match self {
            Validity::PositiveInteger(_) => raw.parse::<i64>().map(|n| n > 0).unwrap_or(false),
            Validity::PositiveNumber(_) => parse_number(raw).map(|n| n > 0.0).unwrap_or(false),
            Validity::NonZeroNumber(_) => parse_number(raw).map(|n| n != 0.0).unwrap_or(false),
        }
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// How a lookup's `month` is matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthFilter {
    /// Characters 5..7 of the date column (`2024-03-31` → `03`).
    #[default]
    DateSubstring,
    /// An integer month column, as in the monthly-returns tables.
    Column(String),
}

impl MonthFilter {
    pub fn matches(&self, record: &Record, date_column: &str, month: u32) -> bool {
        let cell = match self {
            MonthFilter::DateSubstring => record.get(date_column).and_then(date_month),
            MonthFilter::Column(c) => record.get(c),
        };
        cell.and_then(|m| m.trim().parse::<u32>().ok()) == Some(month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(pairs: &[(&str, &str)]) -> Record {
        let headers: Arc<[String]> = pairs.iter().map(|(h, _)| h.to_string()).collect();
        Record::new(headers, pairs.iter().map(|(_, v)| v.to_string()).collect())
    }

    #[test]
    fn positive_integer() {
        let p = Validity::PositiveInteger("NR_COTST".into());
        assert!(p.accepts(&record(&[("NR_COTST", "12")])));
        assert!(!p.accepts(&record(&[("NR_COTST", "0")])));
        assert!(!p.accepts(&record(&[("NR_COTST", "1.5")])));
        assert!(!p.accepts(&record(&[("NR_COTST", "")])));
        assert!(!p.accepts(&record(&[("OTHER", "3")])));
    }

    #[test]
    fn numeric_predicates() {
        let pos = Validity::PositiveNumber("VL".into());
        let nz = Validity::NonZeroNumber("VL".into());
        let neg = record(&[("VL", "-0.75")]);
        let zero = record(&[("VL", "0.0")]);
        assert!(!pos.accepts(&neg));
        assert!(nz.accepts(&neg));
        assert!(!pos.accepts(&zero));
        assert!(!nz.accepts(&zero));
        assert!(!nz.accepts(&record(&[("VL", "NaN")])));
    }

    #[test]
    fn month_filters() {
        let r = record(&[("DT_COMPTC", "2024-03-31"), ("MES_RENTAB", "7")]);
        assert!(MonthFilter::DateSubstring.matches(&r, "DT_COMPTC", 3));
        assert!(!MonthFilter::DateSubstring.matches(&r, "DT_COMPTC", 7));
        let col = MonthFilter::Column("MES_RENTAB".into());
        assert!(col.matches(&r, "DT_COMPTC", 7));
        assert!(!col.matches(&r, "DT_COMPTC", 3));
    }
}
