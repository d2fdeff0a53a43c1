//! # eurostat-orchestrator
//!
//! Wires Fetcher -> Parser -> Transformer -> Loader for one dataset and
//! makes the full/delta decision (spec.md §4.5).

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use chrono::Utc;
use eurostat_core::error::{PipelineError, Result};
use eurostat_core::model::{
    CodelistMap, FinalizeStrategy, IngestionHistory, IngestionStatus, LoadStrategy, Representation,
};
use eurostat_core::naming::data_table_name;
use eurostat_core::PipelineConfig;
use eurostat_fetch::Fetcher;
use eurostat_load::{Loader, ObservationStream};
use eurostat_parse::{InventoryParser, SdmxParser, TsvParser};
use eurostat_transform::Transformer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Outcome of one dataset run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A load completed and published `rows_loaded` observations.
    Loaded { rows_loaded: i64 },
    /// A delta run terminated as a no-op because the source was not
    /// newer than the last successful local run.
    SkippedUpToDate,
}

/// Composes Fetcher, Parsers, Transformer and a `Loader` for a single
/// dataset's run. Not reentrant across datasets; build one per
/// concurrent run if more than one dataset is processed at a time.
pub struct Orchestrator<L: Loader> {
    fetcher: Fetcher,
    loader: L,
    config: PipelineConfig,
}

impl<L: Loader> Orchestrator<L> {
    pub fn new(fetcher: Fetcher, loader: L, config: PipelineConfig) -> Self {
        Orchestrator {
            fetcher,
            loader,
            config,
        }
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    /// Run the full pipeline for one dataset, honoring `cancel` at
    /// network/database suspension points. On any failure after the
    /// run has started, a best-effort `failed` ingestion history row is
    /// written before the error is returned.
    pub async fn run_dataset(
        &mut self,
        dataset_id: &str,
        representation: Representation,
        load_strategy: LoadStrategy,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let start_time = Utc::now();
        let span = info_span!("dataset_run", dataset_id = %dataset_id);
        match self
            .run_dataset_inner(dataset_id, representation, load_strategy, &cancel, start_time)
            .instrument(span)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let record = IngestionHistory {
                    ingestion_id: next_ingestion_id(),
                    dataset_id: dataset_id.to_string(),
                    dsd_version: "unknown".to_string(),
                    load_strategy,
                    representation,
                    status: IngestionStatus::Failed,
                    start_time,
                    end_time: Some(Utc::now()),
                    rows_loaded: None,
                    source_last_update: None,
                    error_details: Some(e.to_string()),
                };
                if let Err(write_err) = self
                    .loader
                    .save_ingestion_state(&record, &self.config.metadata_schema)
                    .await
                {
                    warn!(error = %write_err, dataset_id, "failed to record failed ingestion state");
                }
                Err(e)
            }
        }
    }

    async fn run_dataset_inner(
        &mut self,
        dataset_id: &str,
        representation: Representation,
        load_strategy: LoadStrategy,
        cancel: &CancellationToken,
        start_time: chrono::DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let table = data_table_name(dataset_id);

        let inventory_path = guarded(cancel, self.fetcher.get_inventory()).await?;
        let inventory = parse_blocking(inventory_path, |f| InventoryParser::parse(f)).await?;
        let source_last_update = inventory.last_update(dataset_id).ok();

        if load_strategy == LoadStrategy::Delta {
            let last_success = self
                .loader
                .get_ingestion_state(dataset_id, &self.config.metadata_schema)
                .await?;
            if let (Some(last), Some(remote)) = (&last_success, source_last_update) {
                if let Some(local) = last.source_last_update {
                    if local >= remote {
                        info!(dataset_id, "delta source not newer than last success, skipping");
                        return Ok(RunOutcome::SkippedUpToDate);
                    }
                }
            }
        }

        let dsd_path = guarded(cancel, self.fetcher.get_dsd(dataset_id)).await?;
        let structure = parse_blocking(dsd_path, |f| SdmxParser::parse(BufReader::new(f))).await?;
        let eurostat_parse::ParsedStructure { dsd, mut codelists } = structure;

        let missing: Vec<String> = dsd
            .dimensions()
            .iter()
            .filter_map(|d| d.codelist_id.clone())
            .chain(dsd.attributes().iter().filter_map(|a| a.codelist_id.clone()))
            .filter(|id| !codelists.contains_key(id))
            .collect();
        for codelist_id in missing {
            match self.fetch_and_parse_codelist(cancel, &codelist_id).await {
                Ok(cl) => {
                    codelists.insert(codelist_id, cl);
                }
                Err(e) => {
                    warn!(codelist_id, error = %e, "external codelist could not be resolved, codes will pass through unchanged");
                }
            }
        }

        let last_ingestion = self
            .loader
            .get_ingestion_state(dataset_id, &self.config.metadata_schema)
            .await?;

        self.loader
            .prepare_schema(&dsd, &table, &self.config.data_schema, last_ingestion.as_ref())
            .await?;
        self.loader
            .manage_codelists(&codelists, &self.config.metadata_schema)
            .await?;

        let tsv_path = guarded(cancel, self.fetcher.get_tsv(dataset_id)).await?;
        let (stream, parse_handle) = spawn_transform_pipeline(
            tsv_path,
            dataset_id.to_string(),
            dsd.clone(),
            codelists.clone(),
            representation,
            self.config.channel_capacity,
        );

        let (staging, rows_loaded) = self
            .loader
            .bulk_load_staging(&table, &self.config.data_schema, stream, self.config.use_unlogged_staging)
            .await?;

        parse_handle
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("transform task panicked: {e}")))??;

        let strategy = FinalizeStrategy::from(load_strategy);
        self.loader
            .finalize_load(&staging, &table, &self.config.data_schema, strategy)
            .await?;

        let record = IngestionHistory {
            ingestion_id: next_ingestion_id(),
            dataset_id: dataset_id.to_string(),
            dsd_version: dsd.version().to_string(),
            load_strategy,
            representation,
            status: IngestionStatus::Success,
            start_time,
            end_time: Some(Utc::now()),
            rows_loaded: Some(rows_loaded),
            source_last_update,
            error_details: None,
        };
        if let Err(e) = self
            .loader
            .save_ingestion_state(&record, &self.config.metadata_schema)
            .await
        {
            error!(error = %e, dataset_id, "ingestion succeeded but history write failed");
        }

        Ok(RunOutcome::Loaded { rows_loaded })
    }

    async fn fetch_and_parse_codelist(
        &self,
        cancel: &CancellationToken,
        codelist_id: &str,
    ) -> Result<eurostat_core::model::Codelist> {
        let path = guarded(cancel, self.fetcher.get_codelist(codelist_id)).await?;
        parse_blocking(path, |f| SdmxParser::parse_codelist(BufReader::new(f))).await
    }
}

/// Races `fut` against cancellation, returning a terminal error if
/// `cancel` fires first.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Other(anyhow::anyhow!("cancelled"))),
        res = fut => res,
    }
}

/// Runs a blocking parse step (file I/O plus CPU-bound parsing) on the
/// blocking thread pool so it never stalls the async runtime.
async fn parse_blocking<T, F>(path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(File) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let file = File::open(&path).map_err(|e| PipelineError::CacheIoError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        f(file)
    })
    .await
    .map_err(|e| PipelineError::Other(anyhow::anyhow!("parse task panicked: {e}")))?
}

/// Spawns a blocking producer that streams the TSV matrix through
/// `TsvParser` and `Transformer`, forwarding each `Observation` over a
/// bounded channel, and returns that channel as an `ObservationStream`
/// plus a handle to await the producer's own result.
fn spawn_transform_pipeline(
    tsv_path: PathBuf,
    dataset_id: String,
    dsd: eurostat_core::model::Dsd,
    codelists: CodelistMap,
    representation: Representation,
    channel_capacity: usize,
) -> (ObservationStream, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = tokio::sync::mpsc::channel(channel_capacity);

    let handle = tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&tsv_path).map_err(|e| PipelineError::CacheIoError {
            path: tsv_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut parser = TsvParser::new(BufReader::new(file), dataset_id)?;
        let transformer = Transformer::new(&dsd, &codelists, representation);

        while let Some(chunk) = parser.next_chunk()? {
            for obs in transformer.transform_chunk(&chunk) {
                if tx.blocking_send(obs).is_err() {
                    // Receiver dropped: the loader stopped consuming early
                    // (e.g. it failed). Stop producing.
                    return Ok(());
                }
            }
        }
        Ok(())
    });

    let stream: ObservationStream = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|obs| (obs, rx))
    }));

    (stream, handle)
}

/// A synthetic monotonically-increasing ingestion id sourced from
/// wall-clock nanoseconds. The pipeline is single-writer per dataset
/// (spec.md §5), so collisions within one dataset's own history are not
/// a practical concern.
fn next_ingestion_id() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eurostat_load::mock::MockLoader;

    fn test_config(cache_root: &std::path::Path) -> PipelineConfig {
        PipelineConfig::for_tests(cache_root.display().to_string())
    }

    fn write_gz(path: &std::path::Path, body: &str) {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let file = File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(body.as_bytes()).unwrap();
        enc.finish().unwrap();
    }

    /// S1/S2-shaped smoke test: the orchestrator run produces the
    /// expected row count end to end against a `MockLoader`, without
    /// touching a real network or database.
    #[tokio::test]
    async fn full_run_loads_expected_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path();

        std::fs::write(
            cache_root.join("inventory.tsv"),
            "code\ttype\tlast update of data\nnama_10_gdp\tdataset\t2024-06-01T00:00:00Z\n",
        )
        .unwrap();

        let dsd_xml = r#"<?xml version="1.0"?>
<CompactData>
  <CodeLists>
    <CodeList id="CL_GEO"><Code value="DE"><Description>Germany</Description></Code><Code value="FR"><Description>France</Description></Code></CodeList>
    <CodeList id="CL_FREQ"><Code value="A"><Description>Annual</Description></Code></CodeList>
  </CodeLists>
  <KeyFamily id="nama_10_gdp" version="1.0">
    <Dimension conceptRef="geo" codelist="CL_GEO"/>
    <Dimension conceptRef="freq" codelist="CL_FREQ"/>
    <TimeDimension conceptRef="time"/>
    <PrimaryMeasure conceptRef="obs_value"/>
  </KeyFamily>
</CompactData>"#;
        std::fs::write(cache_root.join("dsd_nama_10_gdp.xml"), dsd_xml).unwrap();

        write_gz(
            &cache_root.join("nama_10_gdp.tsv.gz"),
            "geo,freq\\time\t2020\t2021\nDE,A\t10.5\t11 p\nFR,A\t:\t9\n",
        );

        let fetcher = eurostat_fetch::Fetcher::new("http://127.0.0.1:1", cache_root, true).unwrap();
        let loader = MockLoader::new();
        let config = test_config(cache_root);
        let mut orchestrator = Orchestrator::new(fetcher, loader, config);

        let outcome = orchestrator
            .run_dataset(
                "nama_10_gdp",
                Representation::Standard,
                LoadStrategy::Full,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Loaded { rows_loaded: 4 });

        let rows = orchestrator
            .loader_mut()
            .rows("eurostat_data", "data_nama_10_gdp")
            .unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn delta_skip_when_source_not_newer() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path();

        std::fs::write(
            cache_root.join("inventory.tsv"),
            "code\ttype\tlast update of data\nnama_10_gdp\tdataset\t2024-06-01T00:00:00Z\n",
        )
        .unwrap();

        let fetcher = eurostat_fetch::Fetcher::new("http://127.0.0.1:1", cache_root, true).unwrap();
        let mut loader = MockLoader::new();

        let record = IngestionHistory {
            ingestion_id: 1,
            dataset_id: "nama_10_gdp".to_string(),
            dsd_version: "1.0".to_string(),
            load_strategy: LoadStrategy::Full,
            representation: Representation::Standard,
            status: IngestionStatus::Success,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            rows_loaded: Some(4),
            source_last_update: Some("2024-06-01T00:00:00Z".parse().unwrap()),
            error_details: None,
        };
        loader.save_ingestion_state(&record, "eurostat_meta").await.unwrap();

        let config = test_config(cache_root);
        let mut orchestrator = Orchestrator::new(fetcher, loader, config);

        let outcome = orchestrator
            .run_dataset(
                "nama_10_gdp",
                Representation::Standard,
                LoadStrategy::Delta,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::SkippedUpToDate);
    }
}
