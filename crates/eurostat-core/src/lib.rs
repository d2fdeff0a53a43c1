//! # eurostat-core
//!
//! Data model, error taxonomy, pipeline configuration and the
//! dataset-table naming policy shared by every other crate in the
//! Eurostat mirror workspace.
//!
//! Downstream crates (`eurostat-fetch`, `eurostat-parse`,
//! `eurostat-transform`, `eurostat-load`, `eurostat-orchestrator`)
//! depend on this crate and nothing here depends on them, so it sits
//! at the bottom of the workspace's dependency order.

pub mod config;
pub mod error;
pub mod model;
pub mod naming;

pub use config::{DbConfig, PipelineConfig};
pub use error::{PipelineError, Result};
pub use model::{
    Attribute, CodeEntry, Codelist, CodelistMap, Dimension, Dsd, FinalizeStrategy,
    IngestionHistory, IngestionStatus, LoadStrategy, Observation, Representation,
};
