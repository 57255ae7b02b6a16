use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static LEADING_FLOAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").expect("float pattern compiles")
});

/// Strip every leading and trailing `"` left over from broken quoting.
pub fn strip_quotes(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

/// True when the field starts with a floating-point token (`"1"`, `" 2.5"`,
/// `"-3e2"`, and also `"12.345.678/0001-90"` or `"2024-01-31"`).
///
/// Only the prefix has to scan as a number, so identifiers and dates that lead
/// with digits count as numeric. Empty fields, `inf` and `NaN` do not.
pub fn is_numeric_literal(s: &str) -> bool {
    LEADING_FLOAT.is_match(s.trim_start())
}

/// Parse the `YYYY-MM-DD` prefix of a date or timestamp field.
pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let head = s.trim().get(0..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// `"2024-02-28"` → `Some("2024")`
pub fn date_year(s: &str) -> Option<&str> {
    s.trim().get(0..4)
}

/// `"2024-02-28"` → `Some("02")`
pub fn date_month(s: &str) -> Option<&str> {
    s.trim().get(5..7)
}

/// `"2024-02-28"` → `Some("2024-02")`, used to scope groups to a calendar month.
pub fn date_year_month(s: &str) -> Option<&str> {
    s.trim().get(0..7)
}
