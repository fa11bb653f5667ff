//! Disk-backed grouping of spilled features by grid cell.
//!
//! Features evicted from the in-memory cell map become [`TileRecord`]s and are
//! fed to an `extsort::ExternalSorter`, which keeps at most one segment of
//! records in memory and writes sorted segments to a hidden directory inside
//! the output directory. Reading the result back performs a k-way merge of the
//! segments, so records come out ordered by `(cell, row)`: every cell's
//! records are consecutive and in input order.
//!
//! ```ignore
//! let sorter = TileSorter::create_in(output_dir, DEFAULT_SEGMENT_SIZE)?;
//! let mut sorted = sorter.sort(records)?;
//! while let Some(cell) = sorted.peek_cell()? {
//!     for feature in sorted.cell_run(cell) {
//!         let geojson = feature?;
//!     }
//! }
//! ```

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::iter::Peekable;
use std::path::Path;

use extsort::{ExternalSorter, Sortable};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::feature::BuildingFeature;
use crate::grid::CellId;
use crate::{Error, Result};

/// Records buffered in memory before a sorted segment is written to disk.
pub const DEFAULT_SEGMENT_SIZE: usize = 100_000;

const SORT_DIR_PREFIX: &str = ".spill-";

/// One spilled feature, keyed by its cell and input row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileRecord {
    /// Grid cell the feature belongs to - primary sort key
    pub cell: CellId,
    /// Input row index - secondary sort key
    pub row: u64,
    /// The GeoJSON feature, already serialized as it will appear in the tile
    pub feature: String,
}

impl TileRecord {
    /// Serialize a feature for spilling.
    pub fn from_feature(cell: CellId, feature: &BuildingFeature) -> Result<Self> {
        Ok(Self {
            cell,
            row: feature.index as u64,
            feature: serde_json::to_string(&feature.to_geojson())?,
        })
    }
}

impl Eq for TileRecord {}

impl PartialOrd for TileRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TileRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cell
            .cmp(&other.cell)
            .then_with(|| self.row.cmp(&other.row))
    }
}

impl Sortable for TileRecord {
    fn encode<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let bytes = rmp_serde::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // u32 length prefix frames each record
        let len = u32::try_from(bytes.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn decode<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;

        rmp_serde::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// External sorter for spilled records, backed by a temporary directory.
pub struct TileSorter {
    dir: TempDir,
    segment_size: usize,
}

impl TileSorter {
    /// Create the sort directory under `parent`.
    ///
    /// `segment_size` is the number of records held in memory before a sorted
    /// segment goes to disk.
    pub fn create_in(parent: &Path, segment_size: usize) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SORT_DIR_PREFIX)
            .tempdir_in(parent)
            .map_err(|e| {
                Error::OutputWrite(format!(
                    "Failed to create sort directory in {}: {}",
                    parent.display(),
                    e
                ))
            })?;

        Ok(Self {
            dir,
            segment_size: segment_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Consume `records` and return them ordered by cell, then row.
    pub fn sort<I>(self, records: I) -> Result<SortedTiles>
    where
        I: Iterator<Item = TileRecord>,
    {
        let sorted = ExternalSorter::new()
            .with_segment_size(self.segment_size)
            .with_sort_dir(self.dir.path().to_path_buf())
            .sort_by(records, TileRecord::cmp)?;

        let records: Box<dyn Iterator<Item = std::io::Result<TileRecord>>> = Box::new(sorted);
        Ok(SortedTiles {
            records: records.peekable(),
            _dir: self.dir,
        })
    }
}

/// Sorted spilled records, consumed one cell at a time.
///
/// The sort directory is removed when this is dropped.
pub struct SortedTiles {
    records: Peekable<Box<dyn Iterator<Item = std::io::Result<TileRecord>>>>,
    _dir: TempDir,
}

impl SortedTiles {
    /// Cell of the next record, or `None` once every record has been taken.
    pub fn peek_cell(&mut self) -> Result<Option<CellId>> {
        if let Some(Err(_)) = self.records.peek() {
            if let Some(Err(e)) = self.records.next() {
                return Err(Error::Io(e));
            }
        }
        Ok(self
            .records
            .peek()
            .and_then(|record| record.as_ref().ok())
            .map(|record| record.cell))
    }

    /// The consecutive run of serialized features for `cell`.
    ///
    /// Yields nothing if the next record belongs to another cell.
    pub fn cell_run(&mut self, cell: CellId) -> impl Iterator<Item = Result<String>> + '_ {
        std::iter::from_fn(move || {
            let in_run = match self.records.peek() {
                Some(Ok(record)) => record.cell == cell,
                Some(Err(_)) => true,
                None => false,
            };
            if !in_run {
                return None;
            }
            self.records
                .next()
                .map(|record| record.map(|r| r.feature).map_err(Error::Io))
        })
    }
}
