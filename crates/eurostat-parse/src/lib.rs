//! # eurostat-parse
//!
//! Parsers that turn the raw artifacts `eurostat-fetch` downloads into
//! structured data: the inventory TSV, SDMX-ML structure documents,
//! and the gzip wide TSV matrix (spec.md §4.2).

pub mod inventory;
pub mod sdmx;
pub mod tsv;

pub use inventory::{Inventory, InventoryParser};
pub use sdmx::{ParsedStructure, SdmxParser};
pub use tsv::{RowChunk, TsvParser, WideRow};
