//! Conventions for run-scoped staging table names that make an
//! abandoned staging table identifiable and drop-safe (spec.md §6, §9).
//!
//! A run id is `"{epoch_seconds}_{random_suffix}"`; `staging_table_name`
//! from `eurostat-core::naming` embeds it into the full table name.
//! `sweep_staging_tables` adapters extract the epoch prefix back out to
//! decide which staging tables are old enough to reap.

use eurostat_core::naming::{safe_ident, staging_table_name};

/// Build a fresh run id for a staging table, embedding the current
/// unix timestamp so an abandoned table's age can be recovered later
/// purely from its name.
pub fn new_run_id(now_epoch_secs: i64, random_suffix: &str) -> String {
    format!("{now_epoch_secs}_{}", safe_ident(random_suffix))
}

/// The full staging table name for `target` at `run_id`.
pub fn staging_name(target: &str, run_id: &str) -> String {
    staging_table_name(target, run_id)
}

/// Recover the embedded epoch timestamp from a staging table's run-id
/// suffix, if the name follows the `new_run_id` convention.
///
/// The run id's leading digit forces `safe_ident` (used by
/// `staging_table_name`) to insert a `t_` prefix, since a SQL
/// identifier can't start with a digit; strip that prefix back off
/// before parsing the epoch.
pub fn extract_epoch(table_name: &str) -> Option<i64> {
    let (_, suffix) = table_name.split_once("__staging_")?;
    let suffix = suffix.strip_prefix("t_").unwrap_or(suffix);
    let (epoch_part, _) = suffix.split_once('_')?;
    epoch_part.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_embedded_epoch() {
        let run_id = new_run_id(1_700_000_000, "ab12cd34");
        let name = staging_name("data_nama_10_gdp", &run_id);
        assert_eq!(extract_epoch(&name), Some(1_700_000_000));
    }

    #[test]
    fn rejects_names_without_the_staging_marker() {
        assert_eq!(extract_epoch("data_nama_10_gdp"), None);
    }
}
