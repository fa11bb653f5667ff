//! Partition pipeline - wires together reading, feature building, grid
//! accumulation and tile writing.
//!
//! A run:
//! 1. Reads the dataset in batches of rows
//! 2. Builds features and groups them by grid cell, in parallel within a batch
//! 3. Merges each batch into the global cell map; past the memory budget the
//!    held features go to an external sort on disk
//! 4. Writes one GeoJSON tile per non-empty cell
//! 5. Removes tiles of the same prefix left by earlier runs
//! 6. Records the grid parameters in `run_manifest.json`
//!
//! Batch size and thread count only affect memory and speed: the tiles produced
//! for a dataset are the same for any setting.

use std::path::{Path, PathBuf};

use rayon::ThreadPool;

use crate::accumulate::{accumulate_batch, BatchStats, CellAccumulator};
use crate::external_sort::{TileRecord, TileSorter, DEFAULT_SEGMENT_SIZE};
use crate::feature::DropCounts;
use crate::grid::GridSize;
use crate::manifest::{RunManifest, DEFAULT_DATA_SOURCE, FORMAT_VERSION};
use crate::memory::format_bytes;
use crate::reader::{open_row_batches, Row, DEFAULT_BATCH_SIZE};
use crate::tile_writer::{TileNaming, TileWriter, DEFAULT_TILE_PREFIX};
use crate::{Error, Result};

/// Default memory budget: 256 MiB of held features.
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// Configuration for a partition run.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Cell edge length in degrees (default: 0.05)
    pub grid_size: GridSize,
    /// Rows per batch (default: 100 000)
    pub batch_size: usize,
    /// Worker threads; `None` uses rayon's global pool
    pub threads: Option<usize>,
    /// Estimated bytes of features held in memory before they are spilled (default: 256 MiB)
    pub memory_budget: usize,
    /// Tile filename prefix (default: `buildings`)
    pub tile_prefix: String,
    /// `dataSource` label recorded in the manifest
    pub data_source: String,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            grid_size: GridSize::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            threads: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            tile_prefix: DEFAULT_TILE_PREFIX.to_string(),
            data_source: DEFAULT_DATA_SOURCE.to_string(),
        }
    }
}

impl PartitionConfig {
    /// Set the grid size.
    pub fn with_grid_size(mut self, grid_size: GridSize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Set the number of rows per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run batch work on a dedicated pool of `threads` workers.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Spill cells to disk once held features exceed `bytes`.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Set the tile filename prefix.
    pub fn with_tile_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tile_prefix = prefix.into();
        self
    }

    /// Set the data source label.
    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(Error::InvalidConfig(
                "thread count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a completed partition run.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStats {
    /// Rows consumed from the input
    pub rows_read: usize,
    /// Features written across all tiles
    pub features_written: usize,
    /// Rows dropped, by reason
    pub dropped: DropCounts,
    /// Batches processed
    pub batches: usize,
    /// Tiles written
    pub tiles_written: usize,
    /// Peak estimated bytes of features held in memory
    pub peak_memory_bytes: usize,
    /// Times in-memory cells were spilled to disk
    pub spills: usize,
    /// Tiles from earlier runs deleted because this run wrote no such cell
    pub stale_tiles_removed: usize,
    /// Path of the run manifest
    pub manifest_path: PathBuf,
}

/// Partition a CSV or (Geo)Parquet file into grid tiles under `output_dir`.
///
/// # Example
///
/// ```no_run
/// use footprint_tiles_core::pipeline::{partition_dataset, PartitionConfig};
/// use footprint_tiles_core::grid::GridSize;
/// use std::path::Path;
///
/// let config = PartitionConfig::default().with_grid_size(GridSize::new(0.1).unwrap());
/// let stats = partition_dataset(Path::new("buildings.csv"), Path::new("tiles"), &config).unwrap();
/// println!("{} tiles, {} features", stats.tiles_written, stats.features_written);
/// ```
pub fn partition_dataset(
    input: &Path,
    output_dir: &Path,
    config: &PartitionConfig,
) -> Result<PartitionStats> {
    config.validate()?;

    log::info!(
        "Partitioning {} into {} (grid {}, batches of {})",
        input.display(),
        output_dir.display(),
        config.grid_size,
        config.batch_size
    );

    let batches = open_row_batches(input, config.batch_size)?;
    partition_batches(batches, output_dir, config)
}

/// Feeds spilled records to the external sorter while pulling batches.
///
/// The sorter consumes this iterator to completion. A batch or spill error
/// ends the stream early and is parked in `failure` for the caller.
struct SpillFeed<'a, I> {
    batches: I,
    accumulator: &'a mut CellAccumulator,
    pool: Option<&'a ThreadPool>,
    grid_size: GridSize,
    totals: &'a mut BatchStats,
    failure: &'a mut Option<Error>,
    batch_idx: usize,
    pending: std::vec::IntoIter<TileRecord>,
}

impl<I> SpillFeed<'_, I>
where
    I: Iterator<Item = Result<Vec<Row>>>,
{
    /// Accumulate the next batch. Returns `false` when the stream is over.
    fn pull_batch(&mut self) -> bool {
        let rows = match self.batches.next() {
            Some(Ok(rows)) => rows,
            Some(Err(e)) => {
                *self.failure = Some(e);
                return false;
            }
            None => return false,
        };
        self.batch_idx += 1;

        let grid_size = self.grid_size;
        let outcome = match self.pool {
            Some(pool) => pool.install(|| accumulate_batch(&rows, grid_size)),
            None => accumulate_batch(&rows, grid_size),
        };
        drop(rows);

        log::info!(
            "Batch {}: {} rows, {} features into {} cells, {} dropped",
            self.batch_idx,
            outcome.stats.rows,
            outcome.stats.features,
            outcome.cells.len(),
            outcome.stats.dropped.total()
        );

        self.totals.add(&outcome.stats);
        match self.accumulator.absorb(outcome.cells) {
            Ok(records) => {
                self.pending = records.into_iter();
                true
            }
            Err(e) => {
                *self.failure = Some(e);
                false
            }
        }
    }
}

impl<I> Iterator for SpillFeed<'_, I>
where
    I: Iterator<Item = Result<Vec<Row>>>,
{
    type Item = TileRecord;

    fn next(&mut self) -> Option<TileRecord> {
        loop {
            if let Some(record) = self.pending.next() {
                return Some(record);
            }
            if !self.pull_batch() {
                return None;
            }
        }
    }
}

/// Partition rows from any batch source.
///
/// The first batch error aborts the run. Tiles are only written after every
/// batch has been accumulated, and the manifest only after every tile.
pub fn partition_batches<I>(
    batches: I,
    output_dir: &Path,
    config: &PartitionConfig,
) -> Result<PartitionStats>
where
    I: IntoIterator<Item = Result<Vec<Row>>>,
{
    config.validate()?;
    let naming = TileNaming::new(&config.tile_prefix)?;

    std::fs::create_dir_all(output_dir).map_err(|e| {
        Error::OutputWrite(format!(
            "Failed to create output directory {}: {}",
            output_dir.display(),
            e
        ))
    })?;

    let pool = match config.threads {
        Some(threads) => Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| Error::InvalidConfig(format!("Failed to build thread pool: {}", e)))?,
        ),
        None => None,
    };

    let grid_size = config.grid_size;
    let mut accumulator = CellAccumulator::new(config.memory_budget);
    let mut totals = BatchStats::default();
    let mut failure = None;

    let sorter = TileSorter::create_in(output_dir, DEFAULT_SEGMENT_SIZE)?;
    log::debug!("Spill sort directory: {}", sorter.path().display());

    let feed = SpillFeed {
        batches: batches.into_iter(),
        accumulator: &mut accumulator,
        pool: pool.as_ref(),
        grid_size,
        totals: &mut totals,
        failure: &mut failure,
        batch_idx: 0,
        pending: Vec::new().into_iter(),
    };
    let spilled = sorter.sort(feed)?;
    if let Some(e) = failure {
        return Err(e);
    }

    let writer = TileWriter::new(output_dir, naming);
    let (written, memory) = accumulator.finish(spilled, &writer)?;
    let stale_tiles_removed = writer.remove_stale(&written.cells)?;

    let manifest = RunManifest {
        version: FORMAT_VERSION.to_string(),
        grid_size,
        tile_prefix: config.tile_prefix.clone(),
        data_source: config.data_source.clone(),
        total_features: written.features_written as u64,
        tile_count: written.tiles_written as u64,
    };
    let manifest_path = manifest.write_to_dir(output_dir)?;

    log::info!(
        "Wrote {} features to {} tiles in {} ({} rows read, {} dropped)",
        written.features_written,
        written.tiles_written,
        output_dir.display(),
        totals.rows,
        totals.dropped.total()
    );
    if memory.spills > 0 {
        log::info!(
            "Spilled {} times ({} features); peak held {}",
            memory.spills,
            memory.spilled_features,
            format_bytes(memory.peak_memory_bytes)
        );
    }

    Ok(PartitionStats {
        rows_read: totals.rows,
        features_written: written.features_written,
        dropped: totals.dropped,
        batches: memory.batches,
        tiles_written: written.tiles_written,
        peak_memory_bytes: memory.peak_memory_bytes,
        spills: memory.spills,
        stale_tiles_removed,
        manifest_path,
    })
}
