//! Run manifest: the grid parameters a partition run used.
//!
//! Written next to the tiles once every tile has been written, and read back by
//! the metadata pass so tile bounds are computed with the same grid size the
//! tiles were cut with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::grid::GridSize;
use crate::tile_writer::write_json_atomic;
use crate::{Error, Result};

/// Manifest filename inside the tile directory.
pub const MANIFEST_FILENAME: &str = "run_manifest.json";

/// Format version shared by the manifest and the metadata index.
pub const FORMAT_VERSION: &str = "1.0";

/// Default `dataSource` label.
pub const DEFAULT_DATA_SOURCE: &str = "Google Open Buildings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub version: String,
    pub grid_size: GridSize,
    pub tile_prefix: String,
    pub data_source: String,
    pub total_features: u64,
    pub tile_count: u64,
}

impl RunManifest {
    /// Manifest path inside a tile directory.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILENAME)
    }

    /// Atomically write the manifest into `dir`, replacing any previous one.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Read the manifest from `dir`. Returns `Ok(None)` if there is none.
    pub fn read_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Manifest(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::Manifest(format!("Invalid {}: {}", path.display(), e)))
    }
}
