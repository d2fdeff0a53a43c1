//! `InventoryParser`: parses the Table of Contents TSV into
//! `(dataset_id -> last_update)` records (spec.md §4.2).

use std::collections::BTreeMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use eurostat_core::error::PipelineError;
use tracing::warn;

/// Parsed Table of Contents: dataset id -> last update, where a
/// dataset with a missing or malformed timestamp is recorded with
/// `None` rather than dropped, so other records remain usable.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    entries: BTreeMap<String, Option<DateTime<Utc>>>,
}

impl Inventory {
    /// The last known update timestamp for `dataset_id`, or
    /// `InventoryMissing` if the dataset is absent from the TOC or its
    /// `last update of data` cell could not be parsed.
    pub fn last_update(&self, dataset_id: &str) -> Result<DateTime<Utc>, PipelineError> {
        match self.entries.get(dataset_id) {
            Some(Some(ts)) => Ok(*ts),
            _ => Err(PipelineError::InventoryMissing {
                dataset_id: dataset_id.to_string(),
            }),
        }
    }

    pub fn contains(&self, dataset_id: &str) -> bool {
        self.entries.contains_key(dataset_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses a Table of Contents TSV. The header row's column names are
/// matched case-insensitively; `code` and `last update of data` are
/// required columns, `type` is informational only and ignored for the
/// purposes of this mirror.
pub struct InventoryParser;

impl InventoryParser {
    pub fn parse<R: Read>(reader: R) -> Result<Inventory, PipelineError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| PipelineError::TsvMalformed {
                dataset_id: "<inventory>".to_string(),
                reason: format!("could not read header: {e}"),
            })?
            .clone();

        let code_idx = find_column(&headers, "code").ok_or_else(|| PipelineError::TsvMalformed {
            dataset_id: "<inventory>".to_string(),
            reason: "missing 'code' column".to_string(),
        })?;
        let last_update_idx =
            find_column(&headers, "last update of data").ok_or_else(|| PipelineError::TsvMalformed {
                dataset_id: "<inventory>".to_string(),
                reason: "missing 'last update of data' column".to_string(),
            })?;

        let mut entries = BTreeMap::new();
        for record in rdr.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping malformed inventory row");
                    continue;
                }
            };
            let Some(code) = record.get(code_idx) else {
                continue;
            };
            let code = code.trim();
            if code.is_empty() {
                continue;
            }

            let parsed = record
                .get(last_update_idx)
                .and_then(|raw| parse_timestamp(raw.trim()));

            entries.insert(code.to_string(), parsed);
        }

        Ok(Inventory { entries })
    }
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(
                date.and_hms_opt(0, 0, 0).unwrap(),
                Utc,
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rows() {
        let toc = "code\ttype\tlast update of data\nnama_10_gdp\tdataset\t2024-06-01T00:00:00Z\n";
        let inv = InventoryParser::parse(toc.as_bytes()).unwrap();
        assert_eq!(
            inv.last_update("nama_10_gdp").unwrap().to_rfc3339(),
            "2024-06-01T00:00:00+00:00"
        );
    }

    #[test]
    fn missing_timestamp_yields_inventory_missing_on_lookup() {
        let toc = "code\ttype\tlast update of data\nbad_ds\tdataset\t\ngood_ds\tdataset\t2024-06-01T00:00:00Z\n";
        let inv = InventoryParser::parse(toc.as_bytes()).unwrap();
        assert!(matches!(
            inv.last_update("bad_ds"),
            Err(PipelineError::InventoryMissing { .. })
        ));
        assert!(inv.last_update("good_ds").is_ok());
    }

    #[test]
    fn unknown_dataset_yields_inventory_missing() {
        let toc = "code\ttype\tlast update of data\nnama_10_gdp\tdataset\t2024-06-01T00:00:00Z\n";
        let inv = InventoryParser::parse(toc.as_bytes()).unwrap();
        assert!(matches!(
            inv.last_update("does_not_exist"),
            Err(PipelineError::InventoryMissing { .. })
        ));
    }

    #[test]
    fn missing_header_column_is_rejected() {
        let toc = "code\ttype\n nama_10_gdp\tdataset\n";
        let err = InventoryParser::parse(toc.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::TsvMalformed { .. }));
    }
}
