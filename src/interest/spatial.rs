//! Spatial hash grid broad phase for proximity matching
//!
//! Divides space into uniform cubic cells and stores attribute indices in
//! every cell their bounds overlap. A rule query only visits the cells its
//! own bounds overlap, then the caller runs the exact test on candidates.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::util::vec3::{Aabb, Vec3};

/// Default cell size (world units)
pub const DEFAULT_CELL_SIZE: f32 = 64.0;

/// Initial capacity for grid cells (number of expected non-empty cells)
const GRID_INITIAL_CAPACITY: usize = 256;

/// Grid cell key - (x, y, z) cell coordinates
pub type CellKey = (i32, i32, i32);

/// Inclusive cell range covered by a box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellRange {
    min: CellKey,
    max: CellKey,
}

impl CellRange {
    fn cell_count(&self) -> u64 {
        let dx = (self.max.0 as i64 - self.min.0 as i64 + 1) as u64;
        let dy = (self.max.1 as i64 - self.min.1 as i64 + 1) as u64;
        let dz = (self.max.2 as i64 - self.min.2 as i64 + 1) as u64;
        dx.saturating_mul(dy).saturating_mul(dz)
    }
}

/// Spatial hash grid over entry indices
pub struct SpatialGrid {
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f32,
    /// Map from cell key to entries in that cell
    cells: FxHashMap<CellKey, SmallVec<[usize; 8]>>,
    /// Entries too large to bucket, tested against every query
    oversized: Vec<usize>,
    /// Entries spanning more cells than this go to `oversized`
    max_cells_per_entry: u64,
    /// Queries spanning more cells than this scan every entry instead
    max_query_cells: u64,
    entry_count: usize,
}

impl SpatialGrid {
    /// Create a new grid with the given cell size
    pub fn new(cell_size: f32, max_cells_per_entry: u64, max_query_cells: u64) -> Self {
        Self {
            inv_cell_size: 1.0 / cell_size,
            cells: FxHashMap::with_capacity_and_hasher(GRID_INITIAL_CAPACITY, Default::default()),
            oversized: Vec::new(),
            max_cells_per_entry: max_cells_per_entry.max(1),
            max_query_cells: max_query_cells.max(1),
            entry_count: 0,
        }
    }

    /// Convert world position to cell key
    #[inline]
    fn position_to_cell(&self, position: Vec3) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
            (position.z * self.inv_cell_size).floor() as i32,
        )
    }

    #[inline]
    fn cell_range(&self, bounds: &Aabb) -> CellRange {
        CellRange {
            min: self.position_to_cell(bounds.min),
            max: self.position_to_cell(bounds.max),
        }
    }

    /// Insert an entry. `index` is the caller's handle (its position in
    /// whatever list it is matching against).
    pub fn insert(&mut self, index: usize, bounds: &Aabb) {
        self.entry_count = self.entry_count.max(index + 1);
        let range = self.cell_range(bounds);
        if range.cell_count() > self.max_cells_per_entry {
            self.oversized.push(index);
            return;
        }
        for x in range.min.0..=range.max.0 {
            for y in range.min.1..=range.max.1 {
                for z in range.min.2..=range.max.2 {
                    self.cells.entry((x, y, z)).or_default().push(index);
                }
            }
        }
    }

    /// Candidate entries whose cells overlap `bounds`, sorted and unique.
    ///
    /// Candidates still need an exact test.
    pub fn query(&self, bounds: &Aabb, out: &mut Vec<usize>) {
        out.clear();
        let range = self.cell_range(bounds);

        if range.cell_count() > self.max_query_cells {
            // Cheaper to test everything than to walk that many empty cells
            out.extend(0..self.entry_count);
            return;
        }

        for x in range.min.0..=range.max.0 {
            for y in range.min.1..=range.max.1 {
                for z in range.min.2..=range.max.2 {
                    if let Some(cell) = self.cells.get(&(x, y, z)) {
                        out.extend_from_slice(cell);
                    }
                }
            }
        }
        out.extend_from_slice(&self.oversized);
        out.sort_unstable();
        out.dedup();
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn oversized_count(&self) -> usize {
        self.oversized.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32, y: f32, z: f32) -> Aabb {
        Aabb::from_point(Vec3::new(x, y, z))
    }

    #[test]
    fn test_query_finds_nearby_only() {
        let mut grid = SpatialGrid::new(10.0, 64, 4096);
        grid.insert(0, &point(5.0, 0.0, 0.0));
        grid.insert(1, &point(50.0, 0.0, 0.0));
        grid.insert(2, &point(-5.0, -5.0, 0.0));

        let mut out = Vec::new();
        grid.query(&Aabb::from_sphere(Vec3::ZERO, 10.0), &mut out);
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn test_negative_coordinates_bucket_correctly() {
        let grid_cell = SpatialGrid::new(10.0, 64, 4096).position_to_cell(Vec3::new(-0.5, 0.5, -10.0));
        assert_eq!(grid_cell, (-1, 0, -1));
    }

    #[test]
    fn test_multi_cell_entry_is_deduplicated() {
        let mut grid = SpatialGrid::new(10.0, 64, 4096);
        grid.insert(0, &Aabb::new(Vec3::ZERO, Vec3::new(25.0, 25.0, 0.0)));

        let mut out = Vec::new();
        grid.query(&Aabb::new(Vec3::ZERO, Vec3::new(30.0, 30.0, 0.0)), &mut out);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_oversized_entry_always_candidate() {
        let mut grid = SpatialGrid::new(1.0, 8, 4096);
        grid.insert(0, &Aabb::new(Vec3::splat(-100.0), Vec3::splat(100.0)));
        grid.insert(1, &point(500.0, 500.0, 500.0));
        assert_eq!(grid.oversized_count(), 1);

        let mut out = Vec::new();
        grid.query(&point(-1000.0, 0.0, 0.0), &mut out);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_huge_query_falls_back_to_full_scan() {
        let mut grid = SpatialGrid::new(1.0, 64, 100);
        grid.insert(0, &point(0.0, 0.0, 0.0));
        grid.insert(1, &point(9999.0, 0.0, 0.0));

        let mut out = Vec::new();
        grid.query(&Aabb::from_sphere(Vec3::ZERO, 1000.0), &mut out);
        assert_eq!(out, vec![0, 1]);
    }
}
