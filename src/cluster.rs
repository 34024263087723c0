//! Zoom-dependent grid clustering for map rendering.
//!
//! Entities are bucketed on a web-mercator pixel grid whose cell size
//! halves per zoom-in step (the standard 256px-per-tile convention).
//! Clusters are recomputed from scratch on every call against the
//! snapshot handed in by the caller, so an abandoned render request is
//! simply a dropped result; no partial state survives.
//!
//! Determinism: members are ordered by entity id before accumulation and
//! buckets are emitted in key order, so identical input yields
//! byte-identical output.

use crate::types::{Cluster, Config, EntityId, Viewport};
use geo::{Distance, Haversine, Point};
use std::collections::BTreeMap;

/// Pixel size of one map tile in the slippy-map scheme.
const TILE_PX: f64 = 256.0;

/// Latitude bound of the web-mercator projection.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Zoom levels beyond this do not change bucketing meaningfully and
/// would overflow the world-pixel scale.
const MAX_ZOOM: u8 = 30;

/// Stateless grid-bucket clusterer.
pub struct ClusterEngine {
    cell_px: f64,
    cell_px_by_zoom: Vec<f64>,
}

impl ClusterEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            cell_px: config.cluster_cell_px,
            cell_px_by_zoom: config.cluster_cell_px_by_zoom.clone(),
        }
    }

    /// Cluster the given entities for one render pass.
    ///
    /// Entities outside the viewport are dropped; the remainder is
    /// partitioned exactly: every entity appears in exactly one returned
    /// cluster. A cluster with a single member degenerates to a marker.
    pub fn cluster(
        &self,
        entities: &[(EntityId, Point)],
        zoom: u8,
        viewport: &Viewport,
    ) -> Vec<Cluster> {
        let zoom = zoom.min(MAX_ZOOM);
        let cell_px = self.cell_px_for_zoom(zoom);

        let mut visible: Vec<&(EntityId, Point)> = entities
            .iter()
            .filter(|(_, point)| {
                point.x().is_finite() && point.y().is_finite() && viewport.contains(point)
            })
            .collect();
        // Id order first, so bucket ties and centroid accumulation are
        // reproducible across calls.
        visible.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut buckets: BTreeMap<(i64, i64), Vec<(&EntityId, Point)>> = BTreeMap::new();
        for (id, point) in visible {
            let (px, py) = world_px(point, zoom);
            let key = ((px / cell_px).floor() as i64, (py / cell_px).floor() as i64);
            buckets.entry(key).or_default().push((id, *point));
        }

        buckets
            .into_iter()
            .map(|((cx, cy), members)| {
                let centroid = centroid(&members);
                let radius_m = members
                    .iter()
                    .map(|(_, point)| Haversine.distance(centroid, *point))
                    .fold(0.0_f64, f64::max);

                Cluster {
                    id: format!("z{zoom}:{cx}:{cy}"),
                    centroid,
                    members: members.iter().map(|(id, _)| (*id).clone()).collect(),
                    radius_m,
                }
            })
            .collect()
    }

    fn cell_px_for_zoom(&self, zoom: u8) -> f64 {
        match self.cell_px_by_zoom.get(zoom as usize) {
            Some(&px) if px > 0.0 => px,
            _ => self.cell_px,
        }
    }
}

fn centroid(members: &[(&EntityId, Point)]) -> Point {
    let n = members.len() as f64;
    let (sum_x, sum_y) = members.iter().fold((0.0, 0.0), |(sx, sy), (_, p)| {
        (sx + p.x(), sy + p.y())
    });
    Point::new(sum_x / n, sum_y / n)
}

/// Project a WGS84 point to world pixels at a zoom level.
fn world_px(point: &Point, zoom: u8) -> (f64, f64) {
    let scale = TILE_PX * (1u64 << zoom) as f64;
    let x = (point.x() + 180.0) / 360.0 * scale;

    let lat = point
        .y()
        .clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT)
        .to_radians();
    let y = (1.0 - ((lat.tan() + 1.0 / lat.cos()).ln()) / std::f64::consts::PI) / 2.0 * scale;
    (x, y)
}
