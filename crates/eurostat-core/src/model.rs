//! The SDMX-derived data model: `Dsd`, `Codelist`, `Observation` and
//! `IngestionHistory`, plus the `Representation`/`LoadStrategy` enums
//! threaded through the rest of the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// A single dimension declared by a DSD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: String,
    pub codelist_id: Option<String>,
}

/// A single SDMX attribute declared by a DSD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: String,
    pub codelist_id: Option<String>,
}

/// Data Structure Definition: dimensions, attributes, the primary
/// measure and the distinguished time dimension, in declaration order.
///
/// Immutable after construction; `Dsd::new` is the only way to obtain
/// one and it enforces the invariants from the data model: dimension
/// ids are unique and case-folded, the time dimension is present and
/// not duplicated among the non-time dimensions, and every
/// `codelist_id` resolves in the accompanying code-list map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsd {
    dataset_id: String,
    version: String,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
    primary_measure: String,
    time_dimension: String,
}

impl Dsd {
    /// Build a `Dsd`, validating against `codelists` and rejecting
    /// duplicate or missing time dimensions.
    pub fn new(
        dataset_id: impl Into<String>,
        version: impl Into<String>,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
        primary_measure: Option<String>,
        time_dimension: impl Into<String>,
        codelists: &BTreeMap<String, Codelist>,
    ) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let time_dimension = case_fold(&time_dimension.into());

        let mut dimensions: Vec<Dimension> = dimensions
            .into_iter()
            .map(|d| Dimension {
                id: case_fold(&d.id),
                codelist_id: d.codelist_id,
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for d in &dimensions {
            if !seen.insert(d.id.clone()) {
                return Err(PipelineError::DsdInvalid {
                    dataset_id,
                    reason: format!("duplicate dimension id {}", d.id),
                });
            }
        }

        if time_dimension.is_empty() {
            return Err(PipelineError::DsdInvalid {
                dataset_id,
                reason: "time dimension is absent".to_string(),
            });
        }
        if seen.contains(&time_dimension) {
            return Err(PipelineError::DsdInvalid {
                dataset_id,
                reason: format!(
                    "time dimension {time_dimension} is duplicated in non-time dimensions"
                ),
            });
        }

        for cl in dimensions
            .iter()
            .filter_map(|d| d.codelist_id.as_ref())
            .chain(attributes.iter().filter_map(|a| a.codelist_id.as_ref()))
        {
            if !codelists.contains_key(cl) {
                return Err(PipelineError::DsdInvalid {
                    dataset_id,
                    reason: format!("codelist_id {cl} does not resolve"),
                });
            }
        }

        let primary_measure = primary_measure.unwrap_or_else(|| "OBS_VALUE".to_string());

        Ok(Dsd {
            dataset_id,
            version: version.into(),
            dimensions,
            attributes,
            primary_measure,
            time_dimension,
        })
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }
    pub fn version(&self) -> &str {
        &self.version
    }
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn primary_measure(&self) -> &str {
        &self.primary_measure
    }
    pub fn time_dimension(&self) -> &str {
        &self.time_dimension
    }

    /// The non-time dimension ids, in DSD declaration order.
    pub fn non_time_dimension_ids(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.id.as_str()).collect()
    }
}

fn case_fold(s: &str) -> String {
    s.trim().to_lowercase()
}

/// One code-list entry: label plus optional description and parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntry {
    pub label: String,
    pub description: Option<String>,
    pub parent_code: Option<String>,
}

/// A code-to-label mapping for a dimension's permitted values.
///
/// Codes are case-sensitive, as published. Parent-code cycles are not
/// enforced here; §9 Design Notes treats that as a test-suite
/// responsibility, not a loader responsibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codelist {
    pub id: String,
    codes: BTreeMap<String, CodeEntry>,
}

impl Codelist {
    pub fn new(id: impl Into<String>) -> Self {
        Codelist {
            id: id.into(),
            codes: BTreeMap::new(),
        }
    }

    /// Insert a code, returning an error if it is already present.
    pub fn insert(&mut self, code: impl Into<String>, entry: CodeEntry) -> Result<()> {
        let code = code.into();
        if self.codes.contains_key(&code) {
            return Err(PipelineError::DsdInvalid {
                dataset_id: self.id.clone(),
                reason: format!("duplicate code {code} in codelist {}", self.id),
            });
        }
        self.codes.insert(code, entry);
        Ok(())
    }

    pub fn label_for(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(|e| e.label.as_str())
    }

    pub fn get(&self, code: &str) -> Option<&CodeEntry> {
        self.codes.get(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CodeEntry)> {
        self.codes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// A map from codelist id to its `Codelist`, as produced by `SdmxParser`.
pub type CodelistMap = BTreeMap<String, Codelist>;

/// Whether dimension values in the transformed output are raw codes or
/// substituted code-list labels. Does not affect the target schema:
/// columns are strings either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    Standard,
    Full,
}

impl Default for Representation {
    fn default() -> Self {
        Representation::Standard
    }
}

/// Full load (atomic swap) vs delta load (upsert-merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    Full,
    Delta,
}

/// How `finalize_load` publishes a staging table. `Full` loads always
/// use `Swap`; `Delta` loads always use `Merge` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStrategy {
    Swap,
    Merge,
}

impl From<LoadStrategy> for FinalizeStrategy {
    fn from(strategy: LoadStrategy) -> Self {
        match strategy {
            LoadStrategy::Full => FinalizeStrategy::Swap,
            LoadStrategy::Delta => FinalizeStrategy::Merge,
        }
    }
}

/// A single transformed observation: one row per (non-time dimension
/// combination, time period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Non-time dimension values, in DSD declaration order.
    pub dimensions: Vec<(String, String)>,
    pub time_period: String,
    pub obs_value: Option<f64>,
    pub obs_flags: Option<String>,
}

impl Observation {
    /// Value for a given dimension id, if present.
    pub fn dimension(&self, id: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, v)| v.as_str())
    }
}

/// Load-attempt status, appended to `IngestionHistory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Running,
    Success,
    Failed,
    /// A delta run that was skipped because the source was not newer
    /// than the last successful local run. Not "success": no rows were
    /// loaded, but also not a failure.
    Skipped,
}

/// Append-only record of one load attempt for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionHistory {
    pub ingestion_id: i64,
    pub dataset_id: String,
    pub dsd_version: String,
    pub load_strategy: LoadStrategy,
    pub representation: Representation,
    pub status: IngestionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub rows_loaded: Option<i64>,
    pub source_last_update: Option<DateTime<Utc>>,
    pub error_details: Option<String>,
}

impl IngestionHistory {
    /// Validate the record-level invariants from the data model:
    /// `start_time <= end_time`, and a `success` record carries
    /// `end_time`, `rows_loaded` and `source_last_update`.
    pub fn validate(&self) -> Result<()> {
        if let Some(end) = self.end_time {
            if self.start_time > end {
                return Err(PipelineError::DsdInvalid {
                    dataset_id: self.dataset_id.clone(),
                    reason: "start_time is after end_time".to_string(),
                });
            }
        }
        if self.status == IngestionStatus::Success
            && (self.end_time.is_none() || self.rows_loaded.is_none() || self.source_last_update.is_none())
        {
            return Err(PipelineError::DsdInvalid {
                dataset_id: self.dataset_id.clone(),
                reason: "success record missing end_time, rows_loaded or source_last_update"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codelists() -> CodelistMap {
        let mut map = CodelistMap::new();
        map.insert("geo".to_string(), Codelist::new("geo"));
        map
    }

    #[test]
    fn dsd_rejects_missing_time_dimension() {
        let err = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![Dimension {
                id: "geo".into(),
                codelist_id: Some("geo".into()),
            }],
            vec![],
            None,
            "",
            &codelists(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DsdInvalid { .. }));
    }

    #[test]
    fn dsd_rejects_duplicate_dimension() {
        let err = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![
                Dimension {
                    id: "geo".into(),
                    codelist_id: None,
                },
                Dimension {
                    id: "GEO".into(),
                    codelist_id: None,
                },
            ],
            vec![],
            None,
            "time",
            &codelists(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DsdInvalid { .. }));
    }

    #[test]
    fn dsd_rejects_time_dimension_duplicated_in_non_time() {
        let err = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![Dimension {
                id: "time".into(),
                codelist_id: None,
            }],
            vec![],
            None,
            "time",
            &codelists(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DsdInvalid { .. }));
    }

    #[test]
    fn dsd_rejects_unresolved_codelist() {
        let err = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![Dimension {
                id: "geo".into(),
                codelist_id: Some("missing".into()),
            }],
            vec![],
            None,
            "time",
            &codelists(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DsdInvalid { .. }));
    }

    #[test]
    fn dsd_accepts_valid_definition() {
        let dsd = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![
                Dimension {
                    id: "geo".into(),
                    codelist_id: Some("geo".into()),
                },
                Dimension {
                    id: "freq".into(),
                    codelist_id: None,
                },
            ],
            vec![],
            None,
            "time",
            &codelists(),
        )
        .unwrap();
        assert_eq!(dsd.non_time_dimension_ids(), vec!["geo", "freq"]);
        assert_eq!(dsd.time_dimension(), "time");
    }

    #[test]
    fn ingestion_history_validate() {
        let now = Utc::now();
        let bad = IngestionHistory {
            ingestion_id: 1,
            dataset_id: "x".into(),
            dsd_version: "1".into(),
            load_strategy: LoadStrategy::Full,
            representation: Representation::Standard,
            status: IngestionStatus::Success,
            start_time: now,
            end_time: None,
            rows_loaded: None,
            source_last_update: None,
            error_details: None,
        };
        assert!(bad.validate().is_err());
    }
}
