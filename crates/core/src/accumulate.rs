//! Grouping features by grid cell, within a batch and across batches.
//!
//! Within a batch, rows are split into contiguous chunks, one per rayon worker.
//! Each worker builds its own [`CellMap`]; the partial maps are then folded on a
//! single thread in chunk order. No map is ever shared between threads, so the
//! merge needs no locking and feature order inside a cell follows input order.
//!
//! Across batches, [`CellAccumulator`] absorbs each batch's map as it
//! completes. Once the held features exceed the memory budget every cell is
//! turned into [`TileRecord`]s for the external sorter and memory is released.
//! At the end each tile is assembled from its sorted spilled records followed
//! by the features still held.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::external_sort::{SortedTiles, TileRecord};
use crate::feature::{build_feature, BuildingFeature, DropCounts};
use crate::grid::{CellId, GridSize};
use crate::memory::{estimate_feature_size, format_bytes, MemoryTracker};
use crate::reader::Row;
use crate::tile_writer::{TileWriter, WriteStats};
use crate::Result;

/// Smallest chunk handed to a worker; tiny chunks cost more to merge than to build.
pub const MIN_ROWS_PER_WORKER: usize = 1024;

/// Features grouped by grid cell, insertion order preserved within each cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMap {
    cells: HashMap<CellId, Vec<BuildingFeature>>,
}

impl CellMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a feature to a cell.
    pub fn push(&mut self, cell: CellId, feature: BuildingFeature) {
        self.cells.entry(cell).or_default().push(feature);
    }

    /// Move every feature of `other` into this map, after the features already here.
    pub fn absorb(&mut self, other: CellMap) {
        if self.cells.is_empty() {
            self.cells = other.cells;
            return;
        }
        for (cell, features) in other.cells {
            self.cells.entry(cell).or_default().extend(features);
        }
    }

    /// Union of two maps; shared cells list `self`'s features first.
    pub fn merge(mut self, other: CellMap) -> CellMap {
        self.absorb(other);
        self
    }

    /// Number of non-empty cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Total features across all cells.
    pub fn feature_count(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    /// Features assigned to one cell.
    pub fn get(&self, cell: &CellId) -> Option<&[BuildingFeature]> {
        self.cells.get(cell).map(Vec::as_slice)
    }

    /// Iterate over all features in arbitrary cell order.
    pub fn features(&self) -> impl Iterator<Item = &BuildingFeature> {
        self.cells.values().flatten()
    }

    /// Cell ids in sorted order.
    pub fn cell_ids(&self) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self.cells.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Consume the map, yielding cells in sorted order.
    pub fn into_sorted(self) -> Vec<(CellId, Vec<BuildingFeature>)> {
        let mut cells: Vec<_> = self.cells.into_iter().collect();
        cells.sort_by_key(|(cell, _)| *cell);
        cells
    }
}

/// Row accounting for one batch (or a whole run once merged).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Rows consumed
    pub rows: usize,
    /// Rows that became features
    pub features: usize,
    /// Rows dropped, by reason
    pub dropped: DropCounts,
}

impl BatchStats {
    pub fn add(&mut self, other: &BatchStats) {
        self.rows += other.rows;
        self.features += other.features;
        self.dropped.add(&other.dropped);
    }
}

/// Result of accumulating one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub cells: CellMap,
    pub stats: BatchStats,
}

impl BatchOutcome {
    /// Fold another partial result after this one.
    pub fn merge(mut self, other: BatchOutcome) -> BatchOutcome {
        self.cells.absorb(other.cells);
        self.stats.add(&other.stats);
        self
    }
}

/// Build, assign and group a slice of rows on the current thread.
pub fn accumulate_rows(rows: &[Row], grid_size: GridSize) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    outcome.stats.rows = rows.len();

    for row in rows {
        match build_feature(row) {
            Ok((feature, anchor)) => {
                let cell = CellId::containing(anchor.x, anchor.y, grid_size);
                outcome.cells.push(cell, feature);
                outcome.stats.features += 1;
            }
            Err(reason) => {
                log::debug!("Dropping row {}: {}", row.index, reason);
                outcome.stats.dropped.record(&reason);
            }
        }
    }

    outcome
}

/// Accumulate one batch using every worker of the current rayon pool.
///
/// Each worker folds a contiguous chunk into a local map; the partial maps are
/// reduced sequentially in chunk order.
pub fn accumulate_batch(rows: &[Row], grid_size: GridSize) -> BatchOutcome {
    let workers = rayon::current_num_threads().max(1);
    let chunk_len = rows.len().div_ceil(workers).max(MIN_ROWS_PER_WORKER);

    let partials: Vec<BatchOutcome> = rows
        .par_chunks(chunk_len)
        .map(|chunk| accumulate_rows(chunk, grid_size))
        .collect();

    partials
        .into_iter()
        .fold(BatchOutcome::default(), BatchOutcome::merge)
}

/// Spill and memory statistics of a [`CellAccumulator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    /// Batches absorbed
    pub batches: usize,
    /// Peak estimated bytes held in memory
    pub peak_memory_bytes: usize,
    /// Number of times in-memory cells were spilled
    pub spills: usize,
    /// Features handed to the external sorter
    pub spilled_features: usize,
}

/// Global cell map across all batches of a run, bounded by a memory budget.
pub struct CellAccumulator {
    cells: CellMap,
    tracker: MemoryTracker,
    stats: AccumulatorStats,
}

impl CellAccumulator {
    /// Spill whenever held features are estimated above `budget_bytes`.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            cells: CellMap::new(),
            tracker: MemoryTracker::with_budget(budget_bytes),
            stats: AccumulatorStats::default(),
        }
    }

    /// Merge one completed batch into the global map.
    ///
    /// Returns the records to spill: empty while within budget, otherwise every
    /// held feature.
    pub fn absorb(&mut self, batch: CellMap) -> Result<Vec<TileRecord>> {
        let bytes: usize = batch.features().map(estimate_feature_size).sum();
        self.cells.absorb(batch);
        self.tracker.add(bytes);
        self.stats.batches += 1;

        if self.tracker.over_budget() {
            self.spill()
        } else {
            Ok(Vec::new())
        }
    }

    fn spill(&mut self) -> Result<Vec<TileRecord>> {
        let held = self.tracker.held();
        let cells = std::mem::take(&mut self.cells);

        let mut records = Vec::with_capacity(cells.feature_count());
        for (cell, features) in cells.into_sorted() {
            for feature in &features {
                records.push(TileRecord::from_feature(cell, feature)?);
            }
        }

        self.stats.spills += 1;
        self.stats.spilled_features += records.len();
        self.tracker.release_all();
        log::info!(
            "Spilling {} features ({} held) to the external sorter",
            records.len(),
            format_bytes(held)
        );
        Ok(records)
    }

    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            peak_memory_bytes: self.tracker.peak(),
            ..self.stats
        }
    }

    /// Write one tile per non-empty cell, in sorted cell order.
    ///
    /// `spilled` holds every record returned by [`absorb`](Self::absorb), sorted.
    /// A cell's spilled features come from earlier batches than its held ones,
    /// so they are written first.
    pub fn finish(
        self,
        mut spilled: SortedTiles,
        writer: &TileWriter,
    ) -> Result<(WriteStats, AccumulatorStats)> {
        let stats = self.stats();
        let mut held = self.cells.into_sorted().into_iter().peekable();

        let mut write_stats = WriteStats::default();
        loop {
            let next_held = held.peek().map(|(cell, _)| *cell);
            let Some(cell) = spilled.peek_cell()?.into_iter().chain(next_held).min() else {
                break;
            };

            let features = held
                .next_if(|(c, _)| *c == cell)
                .map(|(_, features)| features)
                .unwrap_or_default();
            let written = writer.write_tile(cell, spilled.cell_run(cell), &features)?;
            write_stats.record_tile(cell, written);
        }

        Ok((write_stats, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_sort::{TileSorter, DEFAULT_SEGMENT_SIZE};
    use crate::feature::BuildingProperties;
    use crate::geometry::Footprint;
    use crate::pipeline::PartitionConfig;
    use crate::tile_writer::TileNaming;
    use geo::polygon;
    use std::path::Path;

    fn grid() -> GridSize {
        GridSize::new(0.05).unwrap()
    }

    fn square_wkt(lng: f64, lat: f64) -> String {
        let d = 0.001;
        format!(
            "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
            x0 = lng,
            y0 = lat,
            x1 = lng + d,
            y1 = lat + d
        )
    }

    fn row(index: usize, lng: f64, lat: f64) -> Row {
        Row::from_wkt(
            index,
            &square_wkt(lng, lat),
            index as f64,
            0.9,
            format!("CODE{}+", index).as_str(),
        )
    }

    fn feature(code: &str) -> BuildingFeature {
        indexed_feature(0, code)
    }

    fn indexed_feature(index: usize, code: &str) -> BuildingFeature {
        BuildingFeature {
            index,
            geometry: Footprint::Polygon(polygon![
                (x: 0.0, y: 0.0),
                (x: 0.001, y: 0.0),
                (x: 0.001, y: 0.001),
                (x: 0.0, y: 0.0),
            ]),
            properties: BuildingProperties {
                area_in_meters: 1.0,
                confidence: 1.0,
                full_plus_code: code.to_string(),
            },
        }
    }

    fn codes(features: &[BuildingFeature]) -> Vec<&str> {
        features
            .iter()
            .map(|f| f.properties.full_plus_code.as_str())
            .collect()
    }

    /// Rows scattered over a few cells, including negative ones, plus bad rows.
    fn sample_rows() -> Vec<Row> {
        let mut rows = Vec::new();
        for i in 0..5000 {
            let lng = -0.1 + (i % 7) as f64 * 0.03;
            let lat = -0.05 + (i % 5) as f64 * 0.025;
            rows.push(row(i, lng, lat));
        }
        rows.push(Row::from_wkt(5000, "INVALID", 1.0, 1.0, "BAD1+"));
        rows.push(Row::from_wkt(5001, "POINT(0.01 0.01)", 1.0, 1.0, "BAD2+"));
        rows
    }

    // ========== CellMap ==========

    #[test]
    fn test_cell_map_push_keeps_order() {
        let mut map = CellMap::new();
        let cell = CellId::new(0, 0);
        map.push(cell, feature("A"));
        map.push(cell, feature("B"));
        map.push(CellId::new(-1, 0), feature("C"));

        assert_eq!(map.len(), 2);
        assert_eq!(map.feature_count(), 3);
        assert_eq!(codes(map.get(&cell).unwrap()), vec!["A", "B"]);
        assert_eq!(map.cell_ids(), vec![CellId::new(-1, 0), CellId::new(0, 0)]);
    }

    #[test]
    fn test_merge_concatenates_shared_cells() {
        let cell = CellId::new(3, 4);
        let mut a = CellMap::new();
        a.push(cell, feature("A"));
        let mut b = CellMap::new();
        b.push(cell, feature("B"));
        b.push(CellId::new(9, 9), feature("C"));

        let merged = a.merge(b);
        assert_eq!(merged.len(), 2);
        assert_eq!(codes(merged.get(&cell).unwrap()), vec!["A", "B"]);
    }

    #[test]
    fn test_merge_is_associative() {
        let rows = sample_rows();
        let (a, rest) = rows.split_at(1500);
        let (b, c) = rest.split_at(2000);

        let map = |rows: &[Row]| accumulate_rows(rows, grid()).cells;

        let left = map(a).merge(map(b)).merge(map(c));
        let right = map(a).merge(map(b).merge(map(c)));
        let whole = map(&rows);

        assert_eq!(left, right);
        assert_eq!(left, whole);
    }

    #[test]
    fn test_merge_is_commutative_up_to_order() {
        let rows = sample_rows();
        let (a, b) = rows.split_at(2500);

        let ab = accumulate_rows(a, grid()).cells.merge(accumulate_rows(b, grid()).cells);
        let ba = accumulate_rows(b, grid()).cells.merge(accumulate_rows(a, grid()).cells);

        assert_eq!(ab.cell_ids(), ba.cell_ids());
        for cell in ab.cell_ids() {
            let mut x = codes(ab.get(&cell).unwrap());
            let mut y = codes(ba.get(&cell).unwrap());
            x.sort();
            y.sort();
            assert_eq!(x, y, "cell {} differs", cell);
        }
    }

    // ========== Batch accumulation ==========

    #[test]
    fn test_accumulate_rows_counts_drops() {
        let outcome = accumulate_rows(&sample_rows(), grid());

        assert_eq!(outcome.stats.rows, 5002);
        assert_eq!(outcome.stats.features, 5000);
        assert_eq!(outcome.stats.dropped.geometry_decode, 1);
        assert_eq!(outcome.stats.dropped.unsupported_geometry, 1);
        assert_eq!(outcome.cells.feature_count(), 5000);
        assert!(outcome.cells.cell_ids().contains(&CellId::new(-2, -1)));
    }

    #[test]
    fn test_accumulate_rows_assigns_by_anchor() {
        let rows = vec![row(0, -0.01, -0.01), row(1, 0.0, 0.0), row(2, 0.049, 0.0), row(3, 0.05, 0.0)];
        let cells = accumulate_rows(&rows, grid()).cells;

        assert_eq!(codes(cells.get(&CellId::new(-1, -1)).unwrap()), vec!["CODE0+"]);
        assert_eq!(codes(cells.get(&CellId::new(0, 0)).unwrap()), vec!["CODE1+", "CODE2+"]);
        assert_eq!(codes(cells.get(&CellId::new(1, 0)).unwrap()), vec!["CODE3+"]);
    }

    #[test]
    fn test_parallel_batch_matches_sequential() {
        let rows = sample_rows();
        let sequential = accumulate_rows(&rows, grid());
        let parallel = accumulate_batch(&rows, grid());

        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_batch_size_invariance() {
        let rows = sample_rows();
        let reference = accumulate_rows(&rows, grid());

        for batch_size in [1, 7, 333, 1024, 5002, 10_000] {
            let merged = rows
                .chunks(batch_size)
                .map(|chunk| accumulate_batch(chunk, grid()))
                .fold(BatchOutcome::default(), BatchOutcome::merge);

            assert_eq!(merged.stats, reference.stats, "batch size {}", batch_size);
            assert_eq!(merged.cells, reference.cells, "batch size {}", batch_size);
        }
    }

    #[test]
    fn test_empty_batch() {
        let outcome = accumulate_batch(&[], grid());
        assert!(outcome.cells.is_empty());
        assert_eq!(outcome.stats, BatchStats::default());
    }

    // ========== Cross-batch accumulator ==========

    fn read_tile(dir: &Path, cell: CellId) -> Vec<String> {
        let naming = TileNaming::new("t").unwrap();
        let path = dir.join(naming.filename(cell));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        json["features"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["properties"]["full_plus_code"].as_str().unwrap().to_string())
            .collect()
    }

    /// Absorb `batches` under `budget` and write the tiles into `dir`.
    fn run(dir: &Path, budget: usize, batches: Vec<CellMap>) -> (WriteStats, AccumulatorStats) {
        let mut acc = CellAccumulator::new(budget);
        let mut records = Vec::new();
        for batch in batches {
            records.extend(acc.absorb(batch).unwrap());
        }

        let sorter = TileSorter::create_in(dir, DEFAULT_SEGMENT_SIZE).unwrap();
        let spilled = sorter.sort(records.into_iter()).unwrap();
        let writer = TileWriter::new(dir, TileNaming::new("t").unwrap());
        acc.finish(spilled, &writer).unwrap()
    }

    #[test]
    fn test_absorb_within_budget_holds_features() {
        let mut acc = CellAccumulator::new(usize::MAX);
        let mut batch = CellMap::new();
        batch.push(CellId::new(0, 0), feature("A"));

        assert!(acc.absorb(batch).unwrap().is_empty());
        let stats = acc.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.spills, 0);
        assert_eq!(stats.peak_memory_bytes, estimate_feature_size(&feature("A")));
    }

    #[test]
    fn test_absorb_over_budget_returns_every_held_feature() {
        let mut acc = CellAccumulator::new(1);
        let mut batch = CellMap::new();
        batch.push(CellId::new(1, 0), indexed_feature(0, "A"));
        batch.push(CellId::new(0, 0), indexed_feature(1, "B"));
        batch.push(CellId::new(1, 0), indexed_feature(2, "C"));

        let records = acc.absorb(batch).unwrap();
        let keys: Vec<(CellId, u64)> = records.iter().map(|r| (r.cell, r.row)).collect();
        assert_eq!(
            keys,
            vec![(CellId::new(0, 0), 1), (CellId::new(1, 0), 0), (CellId::new(1, 0), 2)]
        );
        assert_eq!(acc.stats().spills, 1);
        assert_eq!(acc.stats().spilled_features, 3);

        // Memory was released, so a small batch under the budget stays held
        let mut acc = CellAccumulator::new(estimate_feature_size(&feature("X")) * 2);
        let mut big = CellMap::new();
        for i in 0..3 {
            big.push(CellId::new(0, 0), indexed_feature(i, "X"));
        }
        assert_eq!(acc.absorb(big).unwrap().len(), 3);
        let mut small = CellMap::new();
        small.push(CellId::new(0, 0), indexed_feature(3, "X"));
        assert!(acc.absorb(small).unwrap().is_empty());
    }

    #[test]
    fn test_spilling_preserves_tiles() {
        let rows = sample_rows();
        let batches = || {
            rows.chunks(700)
                .map(|chunk| accumulate_batch(chunk, grid()).cells)
                .collect::<Vec<_>>()
        };
        let cells = accumulate_rows(&rows, grid()).cells.cell_ids();

        let memory_dir = tempfile::tempdir().unwrap();
        let spill_dir = tempfile::tempdir().unwrap();

        let (a, held_stats) = run(memory_dir.path(), usize::MAX, batches());
        let (b, spill_stats) = run(spill_dir.path(), 1, batches());

        assert_eq!(held_stats.spills, 0);
        assert_eq!(spill_stats.batches, 8);
        assert_eq!(spill_stats.spills, 8);
        assert_eq!(spill_stats.spilled_features, 5000);

        assert_eq!(a, b);
        assert_eq!(a.features_written, 5000);
        assert_eq!(a.tiles_written, cells.len());
        assert_eq!(a.cells, cells);

        for cell in cells {
            assert_eq!(
                read_tile(memory_dir.path(), cell),
                read_tile(spill_dir.path(), cell),
                "cell {}",
                cell
            );
        }

        // The sort directory is gone once the tiles are written
        let leftovers: Vec<_> = std::fs::read_dir(spill_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_partial_spill_orders_spilled_features_first() {
        let dir = tempfile::tempdir().unwrap();
        // Budget fits a couple of features, not a whole batch of three
        let one = estimate_feature_size(&feature("X"));
        let cell = CellId::new(0, 0);

        let mut first = CellMap::new();
        first.push(cell, indexed_feature(0, "A"));
        first.push(cell, indexed_feature(1, "B"));
        first.push(CellId::new(-1, 0), indexed_feature(2, "E"));
        let mut second = CellMap::new();
        second.push(cell, indexed_feature(3, "C"));
        second.push(CellId::new(2, 0), indexed_feature(4, "F"));

        let (stats, acc_stats) = run(dir.path(), one * 2 + one / 2, vec![first, second]);
        assert_eq!(acc_stats.spills, 1);
        assert_eq!(acc_stats.spilled_features, 3);
        assert_eq!(stats.tiles_written, 3);
        assert_eq!(
            stats.cells,
            vec![CellId::new(-1, 0), CellId::new(0, 0), CellId::new(2, 0)]
        );
        assert_eq!(read_tile(dir.path(), cell), vec!["A", "B", "C"]);
        assert_eq!(read_tile(dir.path(), CellId::new(-1, 0)), vec!["E"]);
        assert_eq!(read_tile(dir.path(), CellId::new(2, 0)), vec!["F"]);
    }

    #[test]
    fn test_default_budget_spills_oversized_input() {
        let budget = PartitionConfig::default().memory_budget;
        let mut acc = CellAccumulator::new(budget);

        let mut small = CellMap::new();
        small.push(CellId::new(0, 0), indexed_feature(0, "A"));
        assert!(acc.absorb(small).unwrap().is_empty());

        // The plus-code allocation alone is larger than the default budget
        let mut oversized = indexed_feature(1, "");
        oversized.properties.full_plus_code = String::with_capacity(budget + 1);
        let mut big = CellMap::new();
        big.push(CellId::new(0, 0), oversized);

        let records = acc.absorb(big).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(acc.stats().spills, 1);
        assert!(acc.stats().peak_memory_bytes > budget);
    }

    #[test]
    fn test_finish_without_features_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (stats, acc_stats) = run(dir.path(), 1, vec![CellMap::new()]);
        assert_eq!(stats, WriteStats::default());
        assert_eq!(acc_stats.batches, 1);
        assert_eq!(acc_stats.spills, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
