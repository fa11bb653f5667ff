//! Byte accounting for the features held between batches.
//!
//! Estimates are structural: vector headers plus coordinate payloads plus the
//! plus-code allocation. Allocator slack is not modelled, so the budget bounds
//! the estimate rather than the process RSS.

use std::mem::size_of;

use geo::{Coord, LineString, Polygon};

use crate::feature::BuildingFeature;
use crate::geometry::Footprint;

/// Bytes owned by a footprint's rings and coordinates.
pub fn estimate_footprint_size(footprint: &Footprint) -> usize {
    let rings = footprint.ring_count() * size_of::<LineString<f64>>();
    let coords = footprint.coord_count() * size_of::<Coord<f64>>();
    let parts = match footprint {
        Footprint::Polygon(_) => size_of::<Polygon<f64>>(),
        Footprint::MultiPolygon(mp) => (mp.0.len() + 1) * size_of::<Polygon<f64>>(),
    };
    parts + rings + coords
}

/// Bytes held by one feature: the struct itself, its footprint and its plus code.
pub fn estimate_feature_size(feature: &BuildingFeature) -> usize {
    size_of::<BuildingFeature>()
        + estimate_footprint_size(&feature.geometry)
        + feature.properties.full_plus_code.capacity()
}

/// Running total of held bytes against a fixed budget.
#[derive(Debug)]
pub struct MemoryTracker {
    held: usize,
    peak: usize,
    budget: usize,
}

impl MemoryTracker {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            held: 0,
            peak: 0,
            budget,
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.held = self.held.saturating_add(bytes);
        self.peak = self.peak.max(self.held);
    }

    /// Everything held so far has left memory.
    pub fn release_all(&mut self) {
        self.held = 0;
    }

    pub fn over_budget(&self) -> bool {
        self.held > self.budget
    }

    pub fn held(&self) -> usize {
        self.held
    }

    /// Highest `held` value since creation.
    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// Render a byte count with a binary unit, e.g. `1.50 KB`.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
