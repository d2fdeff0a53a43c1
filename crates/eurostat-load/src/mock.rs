//! An in-memory `Loader` used by tests in this crate and in
//! `eurostat-orchestrator`. Exercises the same contract as
//! `PostgresLoader` without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use eurostat_core::error::{PipelineError, Result};
use eurostat_core::model::{CodelistMap, Dsd, FinalizeStrategy, IngestionHistory, Observation};
use futures::StreamExt;

use crate::{Loader, ObservationStream};

type Key = (String, String);

#[derive(Debug, Clone)]
struct TableState {
    dsd_version: String,
    non_time_dimension_ids: Vec<String>,
    rows: Vec<Observation>,
}

/// In-memory stand-in for a PostgreSQL-style target.
#[derive(Debug, Default)]
pub struct MockLoader {
    tables: HashMap<Key, TableState>,
    staging: HashMap<String, Vec<Observation>>,
    codelists: HashMap<String, CodelistMap>,
    history: HashMap<Key, Vec<IngestionHistory>>,
    next_ingestion_id: i64,
    closed: bool,
}

impl MockLoader {
    pub fn new() -> Self {
        MockLoader {
            tables: HashMap::new(),
            staging: HashMap::new(),
            codelists: HashMap::new(),
            history: HashMap::new(),
            next_ingestion_id: 1,
            closed: false,
        }
    }

    /// Test hook: the current row set of `schema.table`, for asserting
    /// against scenario expectations.
    pub fn rows(&self, schema: &str, table: &str) -> Option<&[Observation]> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.rows.as_slice())
    }

    fn observation_key(obs: &Observation) -> (Vec<(String, String)>, String) {
        (obs.dimensions.clone(), obs.time_period.clone())
    }
}

#[async_trait]
impl Loader for MockLoader {
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()> {
        let key = (schema.to_string(), table.to_string());
        if let Some(last) = last_ingestion {
            if last.dsd_version == dsd.version() && self.tables.contains_key(&key) {
                return Ok(());
            }
        }

        let wanted_dims: Vec<String> = dsd.non_time_dimension_ids().iter().map(|s| s.to_string()).collect();
        match self.tables.get(&key) {
            None => {
                self.tables.insert(
                    key,
                    TableState {
                        dsd_version: dsd.version().to_string(),
                        non_time_dimension_ids: wanted_dims,
                        rows: Vec::new(),
                    },
                );
            }
            Some(existing) => {
                for dim in &wanted_dims {
                    if !existing.non_time_dimension_ids.contains(dim) {
                        // Schema evolution: a genuinely new column is nullable-added,
                        // never a conflict.
                        continue;
                    }
                }
                // A dimension present before but no longer present in the DSD
                // would be a type/shape conflict in a real adapter; the mock
                // treats dimension removal the same way since it has no typed
                // columns to compare.
                let removed = existing
                    .non_time_dimension_ids
                    .iter()
                    .any(|d| !wanted_dims.contains(d));
                if removed {
                    return Err(PipelineError::SchemaEvolutionConflict {
                        table: table.to_string(),
                        column: "non_time_dimension_ids".to_string(),
                        existing: existing.non_time_dimension_ids.join(","),
                        wanted: wanted_dims.join(","),
                    });
                }
                let entry = self.tables.get_mut(&(schema.to_string(), table.to_string())).unwrap();
                entry.dsd_version = dsd.version().to_string();
                entry.non_time_dimension_ids = wanted_dims;
            }
        }
        Ok(())
    }

    async fn manage_codelists(&mut self, codelists: &CodelistMap, schema: &str) -> Result<()> {
        let entry = self.codelists.entry(schema.to_string()).or_default();
        for (id, cl) in codelists {
            entry.insert(id.clone(), cl.clone());
        }
        Ok(())
    }

    async fn bulk_load_staging(
        &mut self,
        table: &str,
        _schema: &str,
        mut observations: ObservationStream,
        _use_unlogged: bool,
    ) -> Result<(String, i64)> {
        let staging_name = format!("{table}__staging_mock");
        let mut rows = Vec::new();
        while let Some(obs) = observations.next().await {
            rows.push(obs);
        }
        let count = rows.len() as i64;
        self.staging.insert(staging_name.clone(), rows);
        Ok((staging_name, count))
    }

    async fn finalize_load(
        &mut self,
        staging: &str,
        target: &str,
        schema: &str,
        strategy: FinalizeStrategy,
    ) -> Result<()> {
        let staged_rows = self.staging.remove(staging).ok_or_else(|| PipelineError::FinalizeFailed {
            staging: staging.to_string(),
            target: target.to_string(),
            strategy: format!("{strategy:?}"),
            reason: "staging table not found".to_string(),
        })?;

        let key = (schema.to_string(), target.to_string());
        let table = self.tables.get_mut(&key).ok_or_else(|| PipelineError::FinalizeFailed {
            staging: staging.to_string(),
            target: target.to_string(),
            strategy: format!("{strategy:?}"),
            reason: "target schema not prepared".to_string(),
        })?;

        match strategy {
            FinalizeStrategy::Swap => {
                table.rows = staged_rows;
            }
            FinalizeStrategy::Merge => {
                let mut by_key: BTreeMap<(Vec<(String, String)>, String), Observation> = table
                    .rows
                    .drain(..)
                    .map(|o| (Self::observation_key(&o), o))
                    .collect();
                for obs in staged_rows {
                    by_key.insert(Self::observation_key(&obs), obs);
                }
                table.rows = by_key.into_values().collect();
            }
        }
        Ok(())
    }

    async fn get_ingestion_state(
        &mut self,
        dataset_id: &str,
        schema: &str,
    ) -> Result<Option<IngestionHistory>> {
        Ok(self
            .history
            .get(&(schema.to_string(), dataset_id.to_string()))
            .and_then(|records| {
                records
                    .iter()
                    .rev()
                    .find(|r| r.status == eurostat_core::model::IngestionStatus::Success)
                    .cloned()
            }))
    }

    async fn save_ingestion_state(&mut self, record: &IngestionHistory, schema: &str) -> Result<()> {
        record.validate()?;
        let key = (schema.to_string(), record.dataset_id.clone());
        self.history.entry(key).or_default().push(record.clone());
        Ok(())
    }

    async fn sweep_staging_tables(&mut self, _schema: &str, older_than_seconds: i64) -> Result<Vec<String>> {
        let mut reaped = Vec::new();
        let stale: Vec<String> = self
            .staging
            .keys()
            .filter(|name| {
                crate::naming_sweep::extract_epoch(name)
                    .map(|epoch| epoch < older_than_seconds)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for name in stale {
            self.staging.remove(&name);
            reaped.push(name);
        }
        Ok(reaped)
    }

    async fn close_connection(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Allocate the next ingestion id for tests constructing
/// `IngestionHistory` records against a `MockLoader`.
pub fn next_ingestion_id(loader: &mut MockLoader) -> i64 {
    let id = loader.next_ingestion_id;
    loader.next_ingestion_id += 1;
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eurostat_core::model::{Dimension, IngestionStatus, LoadStrategy, Representation};
    use futures::stream;

    fn dsd() -> Dsd {
        Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![
                Dimension {
                    id: "geo".into(),
                    codelist_id: None,
                },
                Dimension {
                    id: "freq".into(),
                    codelist_id: None,
                },
            ],
            vec![],
            None,
            "time",
            &CodelistMap::new(),
        )
        .unwrap()
    }

    fn obs(geo: &str, freq: &str, time: &str, value: Option<f64>) -> Observation {
        Observation {
            dimensions: vec![("geo".into(), geo.into()), ("freq".into(), freq.into())],
            time_period: time.into(),
            obs_value: value,
            obs_flags: None,
        }
    }

    #[tokio::test]
    async fn swap_replaces_full_row_set() {
        let mut loader = MockLoader::new();
        let dsd = dsd();
        loader.prepare_schema(&dsd, "data_nama_10_gdp", "eurostat_data", None).await.unwrap();

        let rows = vec![obs("DE", "A", "2020", Some(10.5)), obs("FR", "A", "2020", None)];
        let stream: ObservationStream = Box::pin(stream::iter(rows));
        let (staging, count) = loader
            .bulk_load_staging("data_nama_10_gdp", "eurostat_data", stream, false)
            .await
            .unwrap();
        assert_eq!(count, 2);

        loader
            .finalize_load(&staging, "data_nama_10_gdp", "eurostat_data", FinalizeStrategy::Swap)
            .await
            .unwrap();
        assert_eq!(loader.rows("eurostat_data", "data_nama_10_gdp").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn merge_upserts_and_preserves_untouched_rows() {
        let mut loader = MockLoader::new();
        let dsd = dsd();
        loader.prepare_schema(&dsd, "data_nama_10_gdp", "eurostat_data", None).await.unwrap();

        let initial = vec![obs("DE", "A", "2021", Some(11.0))];
        let stream: ObservationStream = Box::pin(stream::iter(initial));
        let (staging, _) = loader
            .bulk_load_staging("data_nama_10_gdp", "eurostat_data", stream, false)
            .await
            .unwrap();
        loader
            .finalize_load(&staging, "data_nama_10_gdp", "eurostat_data", FinalizeStrategy::Swap)
            .await
            .unwrap();

        let delta = vec![obs("DE", "A", "2021", Some(12.0)), obs("DE", "A", "2022", Some(13.0))];
        let stream: ObservationStream = Box::pin(stream::iter(delta));
        let (staging, _) = loader
            .bulk_load_staging("data_nama_10_gdp", "eurostat_data", stream, false)
            .await
            .unwrap();
        loader
            .finalize_load(&staging, "data_nama_10_gdp", "eurostat_data", FinalizeStrategy::Merge)
            .await
            .unwrap();

        let rows = loader.rows("eurostat_data", "data_nama_10_gdp").unwrap();
        assert_eq!(rows.len(), 2);
        let y2021 = rows.iter().find(|r| r.time_period == "2021").unwrap();
        assert_eq!(y2021.obs_value, Some(12.0));
    }

    #[tokio::test]
    async fn ingestion_state_round_trips() {
        let mut loader = MockLoader::new();
        assert!(loader.get_ingestion_state("nama_10_gdp", "eurostat_meta").await.unwrap().is_none());

        let record = IngestionHistory {
            ingestion_id: next_ingestion_id(&mut loader),
            dataset_id: "nama_10_gdp".into(),
            dsd_version: "1.0".into(),
            load_strategy: LoadStrategy::Full,
            representation: Representation::Standard,
            status: IngestionStatus::Success,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            rows_loaded: Some(4),
            source_last_update: Some(Utc::now()),
            error_details: None,
        };
        loader.save_ingestion_state(&record, "eurostat_meta").await.unwrap();

        let state = loader.get_ingestion_state("nama_10_gdp", "eurostat_meta").await.unwrap();
        assert_eq!(state.unwrap().rows_loaded, Some(4));
    }
}
