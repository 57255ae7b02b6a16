use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::key::EntityKey;
use crate::process::{
    table::CanonicalTable,
    utils::{date_year_month, parse_iso_date},
};

/// What a "latest" row is unique over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupScope {
    /// One row per entity.
    #[default]
    Entity,
    /// One row per entity per calendar month of the date column.
    EntityMonth,
}

/// Keep, for every group produced by `key`, the row with the greatest date.
///
/// Dates compare as `YYYY-MM-DD` strings; rows whose date does not parse are
/// ignored, so a group with no valid date yields nothing. Among rows sharing the
/// maximum date the last one in table order wins. Output rows follow the order in
/// which their group first appeared with a valid date.
pub fn select_latest_by<F>(table: &CanonicalTable, date_column: &str, key: F) -> Result<CanonicalTable>
where
    F: Fn(&[String]) -> Option<String>,
{
    let Some(date_idx) = table.column_index(date_column) else {
        bail!("date column {date_column} not in table");
    };

    let mut slots: HashMap<String, usize> = HashMap::new();
    // (row index, date) per group, in first-seen order
    let mut best: Vec<(usize, &str)> = Vec::new();
    let mut skipped = 0usize;

    for (i, row) in table.rows.iter().enumerate() {
        let Some(date) = row.get(date_idx).map(|d| d.trim()) else {
            skipped += 1;
            continue;
        };
        if parse_iso_date(date).is_none() {
            skipped += 1;
            continue;
        }
        let Some(group) = key(row) else {
            skipped += 1;
            continue;
        };

        match slots.get(&group) {
            Some(&slot) => {
                if date >= best[slot].1 {
                    best[slot] = (i, date);
                }
            }
            None => {
                slots.insert(group, best.len());
                best.push((i, date));
            }
        }
    }

    debug!(
        rows = table.len(),
        groups = best.len(),
        skipped,
        "latest selection"
    );

    Ok(CanonicalTable {
        headers: table.headers.clone(),
        rows: best.into_iter().map(|(i, _)| table.rows[i].clone()).collect(),
    })
}

/// [`select_latest_by`] grouped on the normalized entity key, optionally scoped
/// to the month of `date_column`. Rows with an empty key are not grouped.
pub fn select_latest(
    table: &CanonicalTable,
    key_column: &str,
    date_column: &str,
    scope: GroupScope,
) -> Result<CanonicalTable> {
    let Some(key_idx) = table.column_index(key_column) else {
        bail!("key column {key_column} not in table");
    };
    let Some(date_idx) = table.column_index(date_column) else {
        bail!("date column {date_column} not in table");
    };

    select_latest_by(table, date_column, |row| {
        let key = EntityKey::normalize(row.get(key_idx)?);
        if key.is_empty() {
            return None;
        }
        match scope {
            GroupScope::Entity => Some(key.to_string()),
            GroupScope::EntityMonth => {
                let month = date_year_month(row.get(date_idx)?)?;
                Some(format!("{key}|{month}"))
            }
        }
    })
}
