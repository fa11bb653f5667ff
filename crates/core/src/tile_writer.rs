//! GeoJSON tile output.
//!
//! Every tile is streamed into a temporary file in the output directory and
//! then renamed over its final name, so a reader either sees the previous
//! tile or the complete new one, never a partial write.

use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::feature::BuildingFeature;
use crate::grid::CellId;
use crate::{Error, Result};

/// Default tile filename prefix.
pub const DEFAULT_TILE_PREFIX: &str = "buildings";

/// Tile file extension.
pub const TILE_EXTENSION: &str = "geojson";

/// Maps cells to tile filenames and back: `<prefix>_<x>_<y>.geojson`.
#[derive(Debug, Clone)]
pub struct TileNaming {
    prefix: String,
    pattern: Regex,
}

impl TileNaming {
    pub fn new(prefix: &str) -> Result<Self> {
        if prefix.is_empty() {
            return Err(Error::InvalidConfig("tile prefix must not be empty".to_string()));
        }
        if prefix.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!(
                "tile prefix must not contain path separators: {:?}",
                prefix
            )));
        }

        let pattern = Regex::new(&format!(
            r"^{}_(-?\d+)_(-?\d+)\.{}$",
            regex::escape(prefix),
            TILE_EXTENSION
        ))
        .map_err(|e| Error::InvalidConfig(format!("bad tile prefix {:?}: {}", prefix, e)))?;

        Ok(Self {
            prefix: prefix.to_string(),
            pattern,
        })
    }

    /// Filename of a cell's tile.
    pub fn filename(&self, cell: CellId) -> String {
        format!("{}_{}.{}", self.prefix, cell, TILE_EXTENSION)
    }

    /// Recover the cell from a tile filename. Returns `None` for anything else.
    pub fn parse(&self, filename: &str) -> Option<CellId> {
        let caps = self.pattern.captures(filename)?;
        let x = caps.get(1)?.as_str().parse().ok()?;
        let y = caps.get(2)?.as_str().parse().ok()?;
        Some(CellId::new(x, y))
    }
}

/// Counters for tiles written, plus the cells they cover in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub tiles_written: usize,
    pub features_written: usize,
    pub cells: Vec<CellId>,
}

impl WriteStats {
    pub fn record_tile(&mut self, cell: CellId, features: usize) {
        self.tiles_written += 1;
        self.features_written += features;
        self.cells.push(cell);
    }
}

/// Writes one GeoJSON FeatureCollection per cell into an output directory.
#[derive(Debug, Clone)]
pub struct TileWriter {
    dir: PathBuf,
    naming: TileNaming,
}

impl TileWriter {
    pub fn new(dir: &Path, naming: TileNaming) -> Self {
        Self {
            dir: dir.to_path_buf(),
            naming,
        }
    }

    /// Final path of a cell's tile.
    pub fn tile_path(&self, cell: CellId) -> PathBuf {
        self.dir.join(self.naming.filename(cell))
    }

    /// Write a cell's tile: `spilled` features (already serialized GeoJSON)
    /// first, then `features`. Replaces any existing tile. Returns the feature
    /// count.
    pub fn write_tile<I>(
        &self,
        cell: CellId,
        spilled: I,
        features: &[BuildingFeature],
    ) -> Result<usize>
    where
        I: IntoIterator<Item = Result<String>>,
    {
        let path = self.tile_path(cell);
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| {
            Error::OutputWrite(format!(
                "Failed to create temp file in {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let count = {
            let mut out = BufWriter::new(tmp.as_file_mut());
            let count = write_collection(&mut out, spilled, features)?;
            out.flush()?;
            count
        };

        tmp.persist(&path).map_err(|e| {
            Error::OutputWrite(format!("Failed to write {}: {}", path.display(), e.error))
        })?;

        log::debug!("Wrote {} features to {}", count, path.display());
        Ok(count)
    }

    /// Delete tiles of this naming whose cell is not in `written`.
    ///
    /// Run after a partition so the directory holds exactly that run's tiles.
    /// Files that do not parse as tile names are left alone. Returns the number
    /// of tiles removed.
    pub fn remove_stale(&self, written: &[CellId]) -> Result<usize> {
        let keep: HashSet<CellId> = written.iter().copied().collect();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::OutputWrite(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let stale = entry
                .file_name()
                .to_str()
                .and_then(|name| self.naming.parse(name))
                .is_some_and(|cell| !keep.contains(&cell));
            if stale {
                let path = entry.path();
                std::fs::remove_file(&path).map_err(|e| {
                    Error::OutputWrite(format!("Failed to remove {}: {}", path.display(), e))
                })?;
                log::debug!("Removed stale tile {}", path.display());
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Removed {} stale tiles from {}", removed, self.dir.display());
        }
        Ok(removed)
    }
}

fn write_collection<W, I>(out: &mut W, spilled: I, features: &[BuildingFeature]) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<String>>,
{
    let mut count = 0;
    out.write_all(br#"{"type":"FeatureCollection","features":["#)?;

    for feature in spilled {
        let feature = feature?;
        if count > 0 {
            out.write_all(b",")?;
        }
        out.write_all(feature.as_bytes())?;
        count += 1;
    }

    for feature in features {
        if count > 0 {
            out.write_all(b",")?;
        }
        serde_json::to_writer(&mut *out, &feature.to_geojson())?;
        count += 1;
    }

    out.write_all(b"]}")?;
    Ok(count)
}

/// Serialize `value` as pretty JSON and atomically place it at `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| {
        Error::OutputWrite(format!("Failed to create temp file in {}: {}", dir.display(), e))
    })?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut out, value)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }

    tmp.persist(path).map_err(|e| {
        Error::OutputWrite(format!("Failed to write {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
