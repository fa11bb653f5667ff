//! Core library for partitioning building footprints into grid tiles.
//!
//! Reads footprint rows from CSV (WKT geometry) or GeoParquet (WKB geometry),
//! assigns every footprint to a uniform lat/lng grid cell by its anchor vertex,
//! and writes one GeoJSON FeatureCollection per non-empty cell. A separate
//! metadata pass re-reads the tiles and builds `grid_metadata.json`.
//!
//! # Examples
//!
//! ```no_run
//! use footprint_tiles_core::{index_tiles, partition_dataset, MetadataConfig, PartitionConfig};
//! use std::path::Path;
//!
//! let out = Path::new("tiles");
//! partition_dataset(Path::new("buildings.csv"), out, &PartitionConfig::default()).unwrap();
//! index_tiles(out, &MetadataConfig::default()).unwrap();
//! ```

use thiserror::Error;

pub mod accumulate;
pub mod external_sort;
pub mod feature;
pub mod geometry;
pub mod grid;
pub mod manifest;
pub mod memory;
pub mod metadata;
pub mod pipeline;
pub mod reader;
pub mod tile_writer;

pub use accumulate::{accumulate_batch, CellAccumulator, CellMap};
pub use feature::{build_feature, BuildingFeature, DropCounts, DropReason};
pub use grid::{CellBounds, CellId, GridSize, DEFAULT_GRID_SIZE};
pub use manifest::RunManifest;
pub use metadata::{
    build_metadata_index, index_tiles, write_metadata_index, IndexStats, MetadataConfig,
    MetadataIndex,
};
pub use pipeline::{
    partition_batches, partition_dataset, PartitionConfig, PartitionStats, DEFAULT_MEMORY_BUDGET,
};

/// Errors that can occur while partitioning or indexing
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read input: {0}")]
    InputRead(String),

    #[error("Failed to write output: {0}")]
    OutputWrite(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Run manifest error: {0}")]
    Manifest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
