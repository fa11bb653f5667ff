//! CLI for footprint-tiles - Partition building footprints into grid tiles
//!
//! This is a thin wrapper around the footprint-tiles-core library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use footprint_tiles_core::{
    index_tiles, partition_dataset, GridSize, MetadataConfig, PartitionConfig, PartitionStats,
    DEFAULT_GRID_SIZE,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "footprint-tiles",
    about = "Partition building footprints into lat/lng grid GeoJSON tiles",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a CSV or GeoParquet dataset into one GeoJSON tile per grid cell
    Partition {
        /// Input dataset (.csv, .parquet or .geoparquet)
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Directory for tiles and the run manifest
        #[arg(value_name = "OUTPUT_DIR")]
        output_dir: PathBuf,

        /// Grid cell size in degrees
        #[arg(long, default_value_t = DEFAULT_GRID_SIZE)]
        grid_size: f64,

        /// Rows read per batch
        #[arg(long, default_value = "100000")]
        batch_size: usize,

        /// Worker threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Spill held features to disk once they exceed this many MiB
        #[arg(long, value_name = "MB", default_value = "256")]
        memory_budget_mb: usize,

        /// Tile filename prefix
        #[arg(long, default_value = "buildings")]
        prefix: String,

        /// Data source label recorded in the manifest and index
        #[arg(long)]
        data_source: Option<String>,

        /// Build grid_metadata.json after partitioning
        #[arg(long)]
        index: bool,
    },

    /// Build grid_metadata.json from the tiles in a directory
    Index {
        /// Directory containing the tiles
        #[arg(value_name = "TILE_DIR")]
        tile_dir: PathBuf,

        /// Grid cell size in degrees (default: read from run_manifest.json)
        #[arg(long)]
        grid_size: Option<f64>,

        /// Index file path (default: TILE_DIR/grid_metadata.json)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Tile filename prefix (default: from the manifest, else "buildings")
        #[arg(long)]
        prefix: Option<String>,

        /// Data source label (default: from the manifest)
        #[arg(long)]
        data_source: Option<String>,
    },
}

fn parse_grid_size(degrees: f64) -> Result<GridSize> {
    GridSize::new(degrees).context("Invalid --grid-size")
}

fn report_partition(stats: &PartitionStats, output_dir: &Path) {
    println!(
        "✓ Wrote {} features to {} tiles in {}",
        stats.features_written,
        stats.tiles_written,
        output_dir.display()
    );
    println!(
        "  {} rows read in {} batches, {} dropped",
        stats.rows_read,
        stats.batches,
        stats.dropped.total()
    );

    let dropped = &stats.dropped;
    for (reason, count) in [
        ("malformed record", dropped.malformed_record),
        ("missing geometry", dropped.missing_geometry),
        ("undecodable geometry", dropped.geometry_decode),
        ("unsupported geometry", dropped.unsupported_geometry),
        ("invalid attribute", dropped.invalid_attribute),
        ("degenerate geometry", dropped.degenerate_geometry),
    ] {
        if count > 0 {
            println!("    {}: {}", reason, count);
        }
    }

    if stats.spills > 0 {
        println!("  spilled to disk {} times", stats.spills);
    }
    if stats.stale_tiles_removed > 0 {
        println!("  {} stale tiles removed", stats.stale_tiles_removed);
    }
}

fn run_index(tile_dir: &Path, config: &MetadataConfig) -> Result<()> {
    let (path, _, stats) = index_tiles(tile_dir, config)
        .with_context(|| format!("Failed to index tiles in {}", tile_dir.display()))?;

    println!(
        "✓ Indexed {} tiles ({} features) into {}",
        stats.cells_indexed,
        stats.total_features,
        path.display()
    );
    if stats.skipped_unreadable > 0 {
        println!("  {} unreadable tiles skipped", stats.skipped_unreadable);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    match args.command {
        Command::Partition {
            input,
            output_dir,
            grid_size,
            batch_size,
            threads,
            memory_budget_mb,
            prefix,
            data_source,
            index,
        } => {
            let mut config = PartitionConfig::default()
                .with_grid_size(parse_grid_size(grid_size)?)
                .with_batch_size(batch_size)
                .with_memory_budget(memory_budget_mb.saturating_mul(1024 * 1024))
                .with_tile_prefix(prefix);
            if let Some(threads) = threads {
                config = config.with_threads(threads);
            }
            if let Some(data_source) = data_source {
                config = config.with_data_source(data_source);
            }

            let stats = partition_dataset(&input, &output_dir, &config).with_context(|| {
                format!(
                    "Failed to partition {} into {}",
                    input.display(),
                    output_dir.display()
                )
            })?;
            report_partition(&stats, &output_dir);

            if index {
                run_index(&output_dir, &MetadataConfig::default())?;
            }
        }

        Command::Index {
            tile_dir,
            grid_size,
            output,
            prefix,
            data_source,
        } => {
            let mut config = MetadataConfig::default();
            if let Some(degrees) = grid_size {
                config = config.with_grid_size(parse_grid_size(degrees)?);
            }
            if let Some(output) = output {
                config = config.with_output(output);
            }
            if let Some(prefix) = prefix {
                config = config.with_tile_prefix(prefix);
            }
            if let Some(data_source) = data_source {
                config = config.with_data_source(data_source);
            }

            run_index(&tile_dir, &config)?;
        }
    }

    Ok(())
}
