//! # eurostat-load
//!
//! The Loader capability set (spec.md §4.4) and the canonical adapter
//! targeting a PostgreSQL-style engine via its `COPY FROM STDIN`
//! bulk-ingest path.
//!
//! `Loader` is the fixed, explicitly enumerated capability set every
//! adapter must satisfy; there is no open-ended dispatch once an
//! adapter is chosen at composition time.

pub mod naming_sweep;
pub mod postgres;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use eurostat_core::error::Result;
use eurostat_core::model::{CodelistMap, Dsd, FinalizeStrategy, IngestionHistory, Observation};
use futures::Stream;

/// A finite, possibly-chunked sequence of `Observation`s, as produced
/// by the Transformer. Adapters MUST consume this without buffering
/// it in full.
pub type ObservationStream = Pin<Box<dyn Stream<Item = Observation> + Send>>;

/// The capability set every database adapter implements. Semantics are
/// contractual regardless of engine (spec.md §4.4).
#[async_trait]
pub trait Loader: Send + Sync {
    /// Idempotent. Creates `schema`/`table` if absent, with columns
    /// derived from `dsd` per the data model's schema layout. Existing
    /// tables are diffed: missing columns are added (nullable);
    /// incompatible existing columns are reported as
    /// `SchemaEvolutionConflict`, never silently coerced. May
    /// short-circuit when `last_ingestion`'s DSD version already
    /// matches.
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()>;

    /// Idempotent upsert of each code list into a per-list table
    /// `(code PK, label, description, parent_code)`, via a
    /// staging-plus-merge strategy. Row-by-row inserts are prohibited.
    async fn manage_codelists(&mut self, codelists: &CodelistMap, schema: &str) -> Result<()>;

    /// Creates a fresh staging table matching the target's columns
    /// (minus uniqueness constraints) and streams `observations` into
    /// it via the engine's native bulk path. Returns the staging
    /// table's name and the number of rows loaded. Single-row insert
    /// loops are forbidden here.
    async fn bulk_load_staging(
        &mut self,
        table: &str,
        schema: &str,
        observations: ObservationStream,
        use_unlogged: bool,
    ) -> Result<(String, i64)>;

    /// Publishes `staging` into `target` per `strategy`: `Swap` renames
    /// staging over target atomically; `Merge` upserts staging rows
    /// into target on the composite primary key, leaving rows absent
    /// from staging untouched.
    async fn finalize_load(
        &mut self,
        staging: &str,
        target: &str,
        schema: &str,
        strategy: FinalizeStrategy,
    ) -> Result<()>;

    /// The most recent `success` ingestion record for `dataset_id`, or
    /// `None` if the dataset has never loaded successfully.
    async fn get_ingestion_state(
        &mut self,
        dataset_id: &str,
        schema: &str,
    ) -> Result<Option<IngestionHistory>>;

    /// Ensures the ingestion history table exists and appends `record`.
    async fn save_ingestion_state(&mut self, record: &IngestionHistory, schema: &str) -> Result<()>;

    /// Drops staging tables in `schema` whose run-scoped suffix is
    /// older than `older_than_seconds`. Not on the hot load path; a
    /// maintenance operation adapters SHOULD provide (§9).
    async fn sweep_staging_tables(&mut self, schema: &str, older_than_seconds: i64) -> Result<Vec<String>>;

    /// Releases any engine handles held by the adapter.
    async fn close_connection(&mut self) -> Result<()>;
}
