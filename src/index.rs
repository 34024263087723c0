//! Spatial index over active entity positions.
//!
//! This module maintains a geohash-bucketed grid used to answer viewport
//! and radius lookups against the tracked fleet. A reverse id-to-bucket
//! map makes upserts amortized O(1): a moved entity is relocated between
//! buckets inside a single call, so callers holding the store lock never
//! observe it absent from all buckets.

use crate::error::{Result, TrackError};
use crate::types::{EntityId, Viewport};
use geo::{Distance, Haversine, Point};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;

/// Radius above which the neighbor-bucket walk degrades to a full scan.
const LARGE_RADIUS_THRESHOLD: f64 = 100_000.0;

/// Below this population a full scan beats bucket bookkeeping.
const SMALL_DATASET_THRESHOLD: usize = 1000;

/// Most cells a viewport cover may visit before degrading to a full
/// scan.
const MAX_COVER_CELLS: usize = 1024;

struct IndexedEntity {
    point: Point,
}

/// Geohash-bucketed index of entity positions.
///
/// Invariant: every indexed entity appears in exactly one bucket, and the
/// reverse map agrees with that bucket. A detected mismatch is repaired by
/// forced relocation and logged, never surfaced as an error.
pub struct SpatialIndex {
    precision: usize,
    buckets: FxHashMap<String, FxHashMap<EntityId, IndexedEntity>>,
    /// Reverse map: entity id to the geohash of its current bucket.
    locations: FxHashMap<EntityId, String>,
}

impl SpatialIndex {
    pub fn new(precision: usize) -> Self {
        Self {
            precision: precision.clamp(1, 12),
            buckets: FxHashMap::default(),
            locations: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.locations.contains_key(entity_id)
    }

    /// Current indexed position of an entity.
    pub fn position(&self, entity_id: &str) -> Option<Point> {
        let cell = self.locations.get(entity_id)?;
        self.buckets
            .get(cell)
            .and_then(|bucket| bucket.get(entity_id))
            .map(|entry| entry.point)
    }

    /// Insert or move an entity.
    ///
    /// If the entity already lives in a different bucket it is relocated
    /// within this call. Returns an error only for positions that cannot
    /// be geohashed (outside WGS84 bounds); the write paths validate
    /// coordinates before reaching the index.
    pub fn upsert(&mut self, entity_id: &str, point: Point) -> Result<()> {
        let cell = self.encode(&point)?;

        if let Some(previous) = self.locations.get(entity_id) {
            if *previous == cell {
                match self.buckets.get_mut(&cell).and_then(|b| b.get_mut(entity_id)) {
                    Some(entry) => {
                        entry.point = point;
                        return Ok(());
                    }
                    None => {
                        // Reverse map points at a bucket that lost the
                        // entry: repair by reinserting below.
                        log::warn!(
                            "index inconsistency for entity {entity_id}: bucket {cell} missing entry, relocating"
                        );
                        self.purge_strays(entity_id);
                    }
                }
            } else {
                let previous = previous.clone();
                if !self.remove_from_bucket(&previous, entity_id) {
                    log::warn!(
                        "index inconsistency for entity {entity_id}: expected in bucket {previous}, relocating"
                    );
                    self.purge_strays(entity_id);
                }
            }
        }

        self.buckets
            .entry(cell.clone())
            .or_default()
            .insert(entity_id.to_string(), IndexedEntity { point });
        self.locations.insert(entity_id.to_string(), cell);
        Ok(())
    }

    /// Remove an entity from the index. Returns whether it was present.
    pub fn remove(&mut self, entity_id: &str) -> bool {
        match self.locations.remove(entity_id) {
            Some(cell) => {
                if !self.remove_from_bucket(&cell, entity_id) {
                    log::warn!(
                        "index inconsistency for entity {entity_id}: expected in bucket {cell} on remove"
                    );
                    self.purge_strays(entity_id);
                }
                true
            }
            None => false,
        }
    }

    /// Entity ids whose position intersects the viewport, sorted by id.
    ///
    /// Boundary ties are inclusive.
    pub fn query_bounds(&self, viewport: &Viewport) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entries_in_bounds(viewport)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Entities inside the viewport with their positions, unsorted.
    ///
    /// Visits only the buckets whose geohash cells intersect the
    /// viewport; small populations and oversized covers fall back to a
    /// full scan.
    pub fn entries_in_bounds(&self, viewport: &Viewport) -> Vec<(EntityId, Point)> {
        if self.locations.len() < SMALL_DATASET_THRESHOLD {
            return self.scan_bounds(viewport);
        }
        match self.cover_cells(viewport) {
            Some(cells) => {
                let mut results = Vec::new();
                for cell in &cells {
                    if let Some(bucket) = self.buckets.get(cell) {
                        for (id, entry) in bucket {
                            if viewport.contains(&entry.point) {
                                results.push((id.clone(), entry.point));
                            }
                        }
                    }
                }
                results
            }
            None => self.scan_bounds(viewport),
        }
    }

    fn scan_bounds(&self, viewport: &Viewport) -> Vec<(EntityId, Point)> {
        let mut results = Vec::new();
        for bucket in self.buckets.values() {
            for (id, entry) in bucket {
                if viewport.contains(&entry.point) {
                    results.push((id.clone(), entry.point));
                }
            }
        }
        results
    }

    /// Geohash cells covering the viewport, walked row by row from the
    /// south-west corner. Cells at one precision form a regular lat/lon
    /// grid, so a west-to-east, south-to-north neighbor walk visits every
    /// intersecting cell exactly once. `None` when the cover exceeds the
    /// cell budget or a corner cannot be geohashed.
    fn cover_cells(&self, viewport: &Viewport) -> Option<Vec<String>> {
        let corner = geo::Coord {
            x: viewport.min_lon,
            y: viewport.min_lat,
        };
        let mut row = geohash::encode(corner, self.precision).ok()?;
        let mut cells = Vec::new();

        loop {
            let row_bbox = geohash::decode_bbox(&row).ok()?;
            let mut cell = row.clone();
            loop {
                if cells.len() >= MAX_COVER_CELLS {
                    return None;
                }
                let bbox = geohash::decode_bbox(&cell).ok()?;
                cells.push(cell);
                if bbox.max().x >= viewport.max_lon {
                    break;
                }
                cell = geohash::neighbor(cells.last()?, geohash::Direction::E).ok()?;
            }
            if row_bbox.max().y >= viewport.max_lat {
                break;
            }
            row = geohash::neighbor(&row, geohash::Direction::N).ok()?;
        }
        Some(cells)
    }

    /// Entities within `radius_m` meters of `center`, nearest first,
    /// truncated to `limit`. The boundary is inclusive.
    pub fn query_within_radius(
        &self,
        center: &Point,
        radius_m: f64,
        limit: usize,
    ) -> Vec<(EntityId, f64)> {
        if limit == 0 || !radius_m.is_finite() || radius_m < 0.0 {
            return Vec::new();
        }

        let mut matches = if self.should_use_full_scan(radius_m) {
            self.collect_full_scan(center, radius_m)
        } else {
            let candidates = self.candidate_cells(center);
            let nearby = self.collect_candidates(&candidates, center, radius_m);
            if nearby.is_empty() {
                // Neighbor cover can miss when the radius spans more than
                // one ring of buckets; fall back to the exact path.
                self.collect_full_scan(center, radius_m)
            } else {
                nearby
            }
        };

        matches.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        matches.truncate(limit);
        matches
    }

    fn encode(&self, point: &Point) -> Result<String> {
        geohash::encode((*point).into(), self.precision)
            .map_err(|e| TrackError::InvalidPosition(e.to_string()))
    }

    fn remove_from_bucket(&mut self, cell: &str, entity_id: &str) -> bool {
        let mut removed = false;
        if let Some(bucket) = self.buckets.get_mut(cell) {
            removed = bucket.remove(entity_id).is_some();
            if bucket.is_empty() {
                self.buckets.remove(cell);
            }
        }
        removed
    }

    /// Remove every occurrence of an id, whatever bucket it landed in.
    fn purge_strays(&mut self, entity_id: &str) {
        self.buckets.retain(|_, bucket| {
            bucket.remove(entity_id);
            !bucket.is_empty()
        });
    }

    fn should_use_full_scan(&self, radius_m: f64) -> bool {
        radius_m > LARGE_RADIUS_THRESHOLD || self.locations.len() < SMALL_DATASET_THRESHOLD
    }

    fn collect_full_scan(&self, center: &Point, radius_m: f64) -> Vec<(EntityId, f64)> {
        let mut matches = Vec::new();
        for bucket in self.buckets.values() {
            for (id, entry) in bucket {
                let distance = Haversine.distance(*center, entry.point);
                if distance <= radius_m {
                    matches.push((id.clone(), distance));
                }
            }
        }
        matches
    }

    fn candidate_cells(&self, center: &Point) -> FxHashSet<String> {
        let mut candidates = FxHashSet::default();
        if let Ok(center_cell) = geohash::encode((*center).into(), self.precision) {
            for direction in &[
                geohash::Direction::N,
                geohash::Direction::S,
                geohash::Direction::E,
                geohash::Direction::W,
                geohash::Direction::NE,
                geohash::Direction::NW,
                geohash::Direction::SE,
                geohash::Direction::SW,
            ] {
                if let Ok(neighbor) = geohash::neighbor(&center_cell, *direction) {
                    candidates.insert(neighbor);
                }
            }
            candidates.insert(center_cell);
        }
        candidates
    }

    fn collect_candidates(
        &self,
        candidates: &FxHashSet<String>,
        center: &Point,
        radius_m: f64,
    ) -> Vec<(EntityId, f64)> {
        let mut matches = Vec::new();
        for cell in candidates {
            if let Some(bucket) = self.buckets.get(cell) {
                for (id, entry) in bucket {
                    let distance = Haversine.distance(*center, entry.point);
                    if distance <= radius_m {
                        matches.push((id.clone(), distance));
                    }
                }
            }
        }
        matches
    }

    #[cfg(test)]
    fn corrupt_for_test(&mut self, entity_id: &str) {
        // Drop the bucket entry while keeping the reverse map, simulating
        // a torn relocation.
        if let Some(cell) = self.locations.get(entity_id).cloned() {
            self.remove_from_bucket(&cell, entity_id);
        }
    }
}
