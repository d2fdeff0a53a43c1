//! Error taxonomy for the Eurostat mirror pipeline.
//!
//! `PipelineError` is the single error currency crossing crate
//! boundaries. Variants correspond one-to-one with the error kinds
//! enumerated for the system: input errors, network errors, cache
//! errors, schema errors, load errors and state errors.

use thiserror::Error;

/// Errors produced anywhere along the fetch -> parse -> transform ->
/// load chain.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The SDMX-ML document is structurally invalid for this pipeline's
    /// purposes (e.g. no time dimension, or a duplicate dimension id).
    #[error("invalid DSD for dataset {dataset_id}: {reason}")]
    DsdInvalid { dataset_id: String, reason: String },

    /// The TSV matrix file could not be parsed according to the
    /// expected header/row grammar.
    #[error("malformed TSV for dataset {dataset_id}: {reason}")]
    TsvMalformed { dataset_id: String, reason: String },

    /// The inventory has no usable `last_update` entry for this dataset.
    #[error("inventory missing last_update for dataset {dataset_id}")]
    InventoryMissing { dataset_id: String },

    /// A network request to the dissemination API exhausted its retry
    /// budget.
    #[error("transient fetch failure for {resource} after {attempts} attempts: {reason}")]
    FetchTransient {
        resource: String,
        attempts: u32,
        reason: String,
    },

    /// A network request returned a terminal not-found/auth failure.
    #[error("resource not found upstream: {resource}")]
    FetchNotFound { resource: String },

    /// The local file cache could not be read or written.
    #[error("cache I/O error for {path}: {reason}")]
    CacheIoError { path: String, reason: String },

    /// `prepare_schema` found an existing column whose type is
    /// incompatible with the DSD; the pipeline never silently coerces.
    #[error("schema evolution conflict on {table}.{column}: existing {existing}, wanted {wanted}")]
    SchemaEvolutionConflict {
        table: String,
        column: String,
        existing: String,
        wanted: String,
    },

    /// The bulk load into the staging table failed.
    #[error("bulk load into staging table {staging} failed: {reason}")]
    BulkLoadFailed { staging: String, reason: String },

    /// Swap or merge finalization failed.
    #[error("finalize_load ({strategy}) from {staging} into {target} failed: {reason}")]
    FinalizeFailed {
        staging: String,
        target: String,
        strategy: String,
        reason: String,
    },

    /// The ingestion history row could not be written. The load itself
    /// already completed and is not rolled back.
    #[error("failed to write ingestion history for dataset {dataset_id}: {reason}")]
    IngestionHistoryWriteFailed { dataset_id: String, reason: String },

    /// Malformed or missing pipeline configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for lower-level library errors (HTTP, XML, SQL driver)
    /// that are wrapped at the point they cross into pipeline logic.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// True for errors the Fetcher's retry loop should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::FetchTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
