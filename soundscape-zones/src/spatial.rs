//! Spatial hash grid over zone bounding boxes.
//!
//! Divides the lng/lat plane into uniform cells (degrees).  Each zone
//! occupies the cells its bounding box covers; proximity queries only visit
//! the cells around the query box, so the exact geometry test runs on a
//! handful of candidates regardless of how many zones the session holds.
//!
//! Zones whose box would span more than [`MAX_CELLS_PER_ENTRY`] cells (a
//! polygon around a whole district) are kept in a separate oversized list
//! that every query scans.

use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;

/// Entries covering more cells than this are not gridded.
pub const MAX_CELLS_PER_ENTRY: i64 = 4_096;

// ───────────────────────────────────────────────────────────────────
// Aabb
// ───────────────────────────────────────────────────────────────────

/// Axis-aligned box in degrees: x is longitude, y is latitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Aabb {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: max_x.max(min_x),
            max_y: max_y.max(min_y),
        }
    }

    /// Box of half-extents `dx`/`dy` around a point.
    pub fn around(x: f64, y: f64, dx: f64, dy: f64) -> Self {
        Self::new(x - dx, y - dy, x + dx, y + dy)
    }

    #[inline(always)]
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.min_x && px <= self.max_x && py >= self.min_y && py <= self.max_y
    }

    #[inline(always)]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    fn is_finite(&self) -> bool {
        self.min_x.is_finite() && self.min_y.is_finite() && self.max_x.is_finite() && self.max_y.is_finite()
    }
}

// ───────────────────────────────────────────────────────────────────
// Cell key
// ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CellKey(i64, i64);

// ───────────────────────────────────────────────────────────────────
// SpatialHash
// ───────────────────────────────────────────────────────────────────

/// Grid-based candidate index keyed by `K`.
#[derive(Clone)]
pub struct SpatialHash<K> {
    inv_cell_size: f64,
    grid: FxHashMap<CellKey, Vec<K>>,
    bounds: FxHashMap<K, Aabb>,
    oversized: Vec<K>,
}

impl<K: Clone + Eq + Hash> SpatialHash<K> {
    /// `cell_size` in degrees; non-positive or non-finite values fall back
    /// to 0.001° (about 111 m of latitude).
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 { cell_size } else { 0.001 };
        Self {
            inv_cell_size: 1.0 / cell_size,
            grid: FxHashMap::default(),
            bounds: FxHashMap::default(),
            oversized: Vec::new(),
        }
    }

    // ───────────────────── helpers ─────────────────────

    #[inline(always)]
    fn to_cell(&self, x: f64, y: f64) -> CellKey {
        CellKey(
            (x * self.inv_cell_size).floor() as i64,
            (y * self.inv_cell_size).floor() as i64,
        )
    }

    #[inline]
    fn cell_range(&self, aabb: &Aabb) -> (CellKey, CellKey) {
        (self.to_cell(aabb.min_x, aabb.min_y), self.to_cell(aabb.max_x, aabb.max_y))
    }

    fn cell_span(min: CellKey, max: CellKey) -> i64 {
        (max.0 - min.0 + 1).saturating_mul(max.1 - min.1 + 1)
    }

    // ───────────────────── mutation ─────────────────────

    /// Insert or move an entry.
    pub fn insert(&mut self, key: K, aabb: Aabb) {
        if self.bounds.contains_key(&key) {
            self.remove(&key);
        }
        if !aabb.is_finite() {
            return;
        }

        let (min, max) = self.cell_range(&aabb);
        self.bounds.insert(key.clone(), aabb);
        if Self::cell_span(min, max) > MAX_CELLS_PER_ENTRY {
            self.oversized.push(key);
            return;
        }
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                self.grid.entry(CellKey(cx, cy)).or_default().push(key.clone());
            }
        }
    }

    /// Remove an entry.  No-op if unknown.
    pub fn remove(&mut self, key: &K) {
        let Some(aabb) = self.bounds.remove(key) else {
            return;
        };
        if let Some(pos) = self.oversized.iter().position(|k| k == key) {
            self.oversized.swap_remove(pos);
            return;
        }
        let (min, max) = self.cell_range(&aabb);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let cell = CellKey(cx, cy);
                if let Some(keys) = self.grid.get_mut(&cell) {
                    if let Some(pos) = keys.iter().position(|k| k == key) {
                        keys.swap_remove(pos);
                    }
                    if keys.is_empty() {
                        self.grid.remove(&cell);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.grid.clear();
        self.bounds.clear();
        self.oversized.clear();
    }

    // ───────────────────── queries ─────────────────────

    /// All entries whose box contains the point.
    pub fn hit_test_all(&self, px: f64, py: f64) -> Vec<K> {
        self.query_region(&Aabb::new(px, py, px, py))
            .into_iter()
            .filter(|key| self.bounds.get(key).is_some_and(|b| b.contains(px, py)))
            .collect()
    }

    /// All entries whose box intersects `region`.
    pub fn query_region(&self, region: &Aabb) -> Vec<K> {
        let mut result = Vec::new();
        let mut seen = FxHashSet::default();

        let (min, max) = self.cell_range(region);
        if Self::cell_span(min, max) > MAX_CELLS_PER_ENTRY {
            // Query box larger than the grid is useful for; test every box.
            return self
                .bounds
                .iter()
                .filter(|(_, b)| b.intersects(region))
                .map(|(k, _)| k.clone())
                .collect();
        }

        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let Some(keys) = self.grid.get(&CellKey(cx, cy)) else {
                    continue;
                };
                for key in keys {
                    if seen.insert(key) && self.bounds.get(key).is_some_and(|b| b.intersects(region)) {
                        result.push(key.clone());
                    }
                }
            }
        }
        for key in &self.oversized {
            if self.bounds.get(key).is_some_and(|b| b.intersects(region)) {
                result.push(key.clone());
            }
        }
        result
    }

    pub fn bounds_of(&self, key: &K) -> Option<Aabb> {
        self.bounds.get(key).copied()
    }

    // ───────────────────── stats ─────────────────────

    #[inline]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Number of occupied grid cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.grid.len()
    }

    /// Entries kept outside the grid.
    pub fn oversized_count(&self) -> usize {
        self.oversized.len()
    }
}

// ===================================================================
// Tests
// ===================================================================
