//! Metadata index over a directory of tiles.
//!
//! The index is rebuilt from what is actually on disk: every file whose name
//! matches the tile pattern is opened and its features counted, and bounds are
//! derived from the cell id in the filename. Nothing from the partition run is
//! trusted except the grid parameters in its manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::grid::{CellBounds, CellId, GridSize};
use crate::manifest::{RunManifest, DEFAULT_DATA_SOURCE, FORMAT_VERSION};
use crate::tile_writer::{write_json_atomic, TileNaming, DEFAULT_TILE_PREFIX};
use crate::{Error, Result};

/// Default index filename inside the tile directory.
pub const METADATA_FILENAME: &str = "grid_metadata.json";

/// Options for the metadata pass. Unset fields fall back to the run manifest,
/// then to the crate defaults.
#[derive(Debug, Clone, Default)]
pub struct MetadataConfig {
    /// Grid size; must agree with the manifest when both are present
    pub grid_size: Option<GridSize>,
    /// Tile filename prefix
    pub tile_prefix: Option<String>,
    /// `dataSource` label
    pub data_source: Option<String>,
    /// Index path (default: `<tile_dir>/grid_metadata.json`)
    pub output: Option<PathBuf>,
}

impl MetadataConfig {
    pub fn with_grid_size(mut self, grid_size: GridSize) -> Self {
        self.grid_size = Some(grid_size);
        self
    }

    pub fn with_tile_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tile_prefix = Some(prefix.into());
        self
    }

    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = Some(data_source.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// One tile's entry in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellEntry {
    pub filename: String,
    pub feature_count: u64,
    pub bounds: CellBounds,
}

/// The `grid_metadata.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataIndex {
    pub total_features: u64,
    pub grid_size: GridSize,
    pub version: String,
    pub data_source: String,
    /// Keyed by `"<x>_<y>"`
    pub cells: BTreeMap<String, CellEntry>,
}

/// Why a file in the tile directory was left out of the index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SkipReason {
    #[error("filename does not match the tile pattern")]
    UnrecognizedName,

    #[error("tile could not be read: {0}")]
    Unreadable(String),
}

/// Counters for one metadata pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Regular files found in the directory
    pub files_scanned: usize,
    /// Tiles present in the index
    pub cells_indexed: usize,
    /// Files whose name is not a tile name
    pub skipped_unrecognized: usize,
    /// Tiles that failed to open or parse
    pub skipped_unreadable: usize,
    /// Sum of indexed feature counts
    pub total_features: u64,
}

impl IndexStats {
    fn record_skip(&mut self, reason: &SkipReason) {
        match reason {
            SkipReason::UnrecognizedName => self.skipped_unrecognized += 1,
            SkipReason::Unreadable(_) => self.skipped_unreadable += 1,
        }
    }
}

/// Grid parameters the pass will use, after consulting the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub grid_size: GridSize,
    pub tile_prefix: String,
    pub data_source: String,
}

/// Merge explicit options with the run manifest found in `dir`.
pub fn resolve_params(dir: &Path, config: &MetadataConfig) -> Result<ResolvedParams> {
    let manifest = RunManifest::read_from_dir(dir)?;

    let grid_size = match (config.grid_size, &manifest) {
        (Some(explicit), Some(m)) if explicit != m.grid_size => {
            return Err(Error::InvalidConfig(format!(
                "grid size {} does not match the {} recorded in {}",
                explicit,
                m.grid_size,
                RunManifest::path_in(dir).display()
            )))
        }
        (Some(explicit), _) => explicit,
        (None, Some(m)) => m.grid_size,
        (None, None) => {
            return Err(Error::InvalidConfig(format!(
                "no run manifest in {}; a grid size must be given",
                dir.display()
            )))
        }
    };

    let tile_prefix = config
        .tile_prefix
        .clone()
        .or_else(|| manifest.as_ref().map(|m| m.tile_prefix.clone()))
        .unwrap_or_else(|| DEFAULT_TILE_PREFIX.to_string());

    let data_source = config
        .data_source
        .clone()
        .or_else(|| manifest.as_ref().map(|m| m.data_source.clone()))
        .unwrap_or_else(|| DEFAULT_DATA_SOURCE.to_string());

    Ok(ResolvedParams {
        grid_size,
        tile_prefix,
        data_source,
    })
}

/// Only the length of `features` is needed; the elements are skipped unparsed.
#[derive(Deserialize)]
struct TileFeatures {
    #[serde(default)]
    features: Vec<IgnoredAny>,
}

/// Count the features of one tile file.
pub fn count_tile_features(path: &Path) -> std::result::Result<u64, SkipReason> {
    let file = File::open(path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    let tile: TileFeatures = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    Ok(tile.features.len() as u64)
}

/// Build the index for every tile in `dir` without writing it.
pub fn build_metadata_index(
    dir: &Path,
    config: &MetadataConfig,
) -> Result<(MetadataIndex, IndexStats)> {
    if !dir.is_dir() {
        return Err(Error::InputRead(format!(
            "Tile directory not found: {}",
            dir.display()
        )));
    }

    let params = resolve_params(dir, config)?;
    let naming = TileNaming::new(&params.tile_prefix)?;
    let mut stats = IndexStats::default();

    let mut tiles: Vec<(CellId, String, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::InputRead(format!("Failed to list {}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        stats.files_scanned += 1;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        match name.as_deref().and_then(|n| naming.parse(n)) {
            Some(cell) => tiles.push((cell, name.unwrap_or_default(), path)),
            None => {
                log::debug!("Skipping {}: {}", path.display(), SkipReason::UnrecognizedName);
                stats.record_skip(&SkipReason::UnrecognizedName);
            }
        }
    }
    tiles.sort();

    let counted: Vec<_> = tiles
        .into_par_iter()
        .map(|(cell, filename, path)| {
            let count = count_tile_features(&path);
            (cell, filename, path, count)
        })
        .collect();

    let mut index = MetadataIndex {
        total_features: 0,
        grid_size: params.grid_size,
        version: FORMAT_VERSION.to_string(),
        data_source: params.data_source,
        cells: BTreeMap::new(),
    };

    for (cell, filename, path, count) in counted {
        match count {
            Ok(feature_count) => {
                index.total_features += feature_count;
                index.cells.insert(
                    cell.to_string(),
                    CellEntry {
                        filename,
                        feature_count,
                        bounds: cell.bounds(params.grid_size),
                    },
                );
            }
            Err(reason) => {
                log::warn!("Skipping {}: {}", path.display(), reason);
                stats.record_skip(&reason);
            }
        }
    }

    stats.cells_indexed = index.cells.len();
    stats.total_features = index.total_features;
    Ok((index, stats))
}

/// Atomically write an index document.
pub fn write_metadata_index(index: &MetadataIndex, path: &Path) -> Result<()> {
    write_json_atomic(path, index)
}

/// Build the index for `dir` and write it. Returns the path written.
pub fn index_tiles(dir: &Path, config: &MetadataConfig) -> Result<(PathBuf, MetadataIndex, IndexStats)> {
    let (index, stats) = build_metadata_index(dir, config)?;
    let output = config
        .output
        .clone()
        .unwrap_or_else(|| dir.join(METADATA_FILENAME));

    write_metadata_index(&index, &output)?;

    log::info!(
        "Indexed {} tiles ({} features) into {}",
        stats.cells_indexed,
        stats.total_features,
        output.display()
    );
    if stats.skipped_unreadable > 0 {
        log::warn!("{} tiles could not be read", stats.skipped_unreadable);
    }

    Ok((output, index, stats))
}
