//! Uniform lat/lng grid math.
//!
//! Cells are `grid_size × grid_size` degree squares indexed by floor division of
//! longitude and latitude, so negative coordinates land in negative cells
//! (`-0.01 / 0.05` floors to `-1`, not `0`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default cell edge length in degrees, shared by tiling and indexing.
pub const DEFAULT_GRID_SIZE: f64 = 0.05;

/// Cell edge length in degrees. Always positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct GridSize(f64);

impl GridSize {
    /// Validate and wrap a grid size in degrees.
    pub fn new(degrees: f64) -> Result<Self> {
        if degrees.is_finite() && degrees > 0.0 {
            Ok(Self(degrees))
        } else {
            Err(Error::InvalidConfig(format!(
                "grid size must be a positive number of degrees, got {}",
                degrees
            )))
        }
    }

    /// The edge length in degrees.
    pub fn degrees(self) -> f64 {
        self.0
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self(DEFAULT_GRID_SIZE)
    }
}

impl TryFrom<f64> for GridSize {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<GridSize> for f64 {
    fn from(value: GridSize) -> Self {
        value.0
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.0)
    }
}

/// Integer grid cell coordinates. Ordered by `x`, then `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub x: i64,
    pub y: i64,
}

impl CellId {
    /// Create a cell id from its indices
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Find the cell containing a longitude/latitude pair.
    ///
    /// Uses mathematical floor on both axes. Points exactly on a cell's west or
    /// south edge belong to that cell; points on its east or north edge belong
    /// to the neighbour.
    pub fn containing(lng: f64, lat: f64, grid_size: GridSize) -> Self {
        let size = grid_size.degrees();
        Self {
            x: (lng / size).floor() as i64,
            y: (lat / size).floor() as i64,
        }
    }

    /// Geographic bounds of this cell.
    pub fn bounds(&self, grid_size: GridSize) -> CellBounds {
        let size = grid_size.degrees();
        CellBounds {
            north: (self.y + 1) as f64 * size,
            south: self.y as f64 * size,
            east: (self.x + 1) as f64 * size,
            west: self.x as f64 * size,
        }
    }
}

/// Formats as `<x>_<y>`, the key used in filenames and the metadata index.
impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}

/// Geographic bounding box of a grid cell, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl CellBounds {
    /// Check whether a point lies inside the half-open cell `[west, east) × [south, north)`.
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        lng >= self.west && lng < self.east && lat >= self.south && lat < self.north
    }

    /// Width in degrees
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Height in degrees
    pub fn height(&self) -> f64 {
        self.north - self.south
    }
}
