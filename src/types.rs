//! Core types and configuration for the tracking engine.
//!
//! This module provides the data model shared by the ingestion, indexing,
//! clustering, and sync paths, plus a serializable `Config` with minimal
//! complexity.

use geo::Point;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Identifier of a tracked entity (device, vehicle, person).
pub type EntityId = String;

/// Where a position sample originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    /// Emitted by the local location provider.
    Local,
    /// Applied from a backend pull.
    Remote,
}

/// A raw position reading for one entity.
///
/// Samples are transient: they are consumed by the position buffer and
/// discarded after being merged into the entity state.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub entity_id: EntityId,
    /// WGS84 position, x = longitude, y = latitude.
    pub point: Point,
    /// Reported accuracy radius in meters.
    pub accuracy_m: f64,
    pub timestamp: SystemTime,
    pub source: SampleSource,
}

impl PositionSample {
    pub fn new(
        entity_id: impl Into<EntityId>,
        point: Point,
        accuracy_m: f64,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            point,
            accuracy_m,
            timestamp,
            source: SampleSource::Local,
        }
    }

    pub fn with_source(mut self, source: SampleSource) -> Self {
        self.source = source;
        self
    }
}

/// A tracked movable point with identity.
///
/// Entities are mutated only through the position buffer (local samples)
/// and the sync coordinator (remote pulls), and removed when the stale
/// timeout elapses or the backend reports a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    /// WGS84 position, x = longitude, y = latitude.
    pub position: Point,
    /// Heading in degrees, 0 = north, clockwise.
    pub heading_deg: f64,
    /// Ground speed in meters per second.
    pub speed_mps: f64,
    pub last_update: SystemTime,
    /// Set when no sample has arrived within the stale timeout; stale
    /// entities are excluded from cluster queries until refreshed.
    pub stale: bool,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, position: Point, timestamp: SystemTime) -> Self {
        Self {
            id: id.into(),
            position,
            heading_deg: 0.0,
            speed_mps: 0.0,
            last_update: timestamp,
            stale: false,
        }
    }
}

/// A geographic bounding region used for render queries.
///
/// Boundary ties are inclusive: entities exactly on an edge are part of
/// the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Viewport {
    /// Create a viewport from two corners, normalizing coordinate order.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon: min_lon.min(max_lon),
            min_lat: min_lat.min(max_lat),
            max_lon: min_lon.max(max_lon),
            max_lat: min_lat.max(max_lat),
        }
    }

    /// Inclusive containment check.
    pub fn contains(&self, point: &Point) -> bool {
        point.x() >= self.min_lon
            && point.x() <= self.max_lon
            && point.y() >= self.min_lat
            && point.y() <= self.max_lat
    }
}

/// A visual aggregation of nearby entities at a given zoom level.
///
/// Clusters partition the queried entity set: no entity belongs to two
/// clusters produced by the same render pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Deterministic id derived from the zoom grid bucket.
    pub id: String,
    /// Arithmetic mean of member coordinates.
    pub centroid: Point,
    /// Member entity ids, sorted. Never empty.
    pub members: Vec<EntityId>,
    /// Distance in meters from the centroid to the farthest member.
    pub radius_m: f64,
}

impl Cluster {
    /// A cluster with a single member degenerates to a plain marker.
    pub fn is_marker(&self) -> bool {
        self.members.len() == 1
    }
}

/// Tracking engine configuration.
///
/// Designed to be easily loadable from JSON or similar formats while
/// keeping complexity minimal.
///
/// # Example
///
/// ```rust
/// use geotrack::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_stale_timeout(Duration::from_secs(120))
///     .with_max_accuracy(75.0);
/// assert!(config.validate().is_ok());
///
/// let json = r#"{ "max_accuracy_m": 30.0, "geohash_precision": 6 }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.geohash_precision, 6);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Samples with a larger accuracy radius (meters) are rejected as
    /// low-confidence readings.
    #[serde(default = "Config::default_max_accuracy_m")]
    pub max_accuracy_m: f64,

    /// Implied speeds (m/s) above this threshold trigger jump
    /// suppression instead of applying the sample verbatim.
    #[serde(default = "Config::default_max_speed_mps")]
    pub max_speed_mps: f64,

    /// Weight of the incoming sample when a jump is smoothed (0..1).
    #[serde(default = "Config::default_smoothing_factor")]
    pub smoothing_factor: f64,

    /// Seconds without an accepted sample before an entity is marked
    /// stale.
    #[serde(default = "Config::default_stale_timeout_seconds")]
    pub stale_timeout_seconds: f64,

    /// Seconds without an accepted sample before a clean entity is
    /// evicted entirely.
    #[serde(default = "Config::default_evict_timeout_seconds")]
    pub evict_timeout_seconds: f64,

    /// Number of recent accepted samples retained per entity.
    #[serde(default = "Config::default_history_capacity")]
    pub history_capacity: usize,

    /// Geohash precision for the spatial index buckets (1-12).
    #[serde(default = "Config::default_geohash_precision")]
    pub geohash_precision: usize,

    /// Cluster grid cell edge in screen pixels on a 256px-per-tile
    /// web-mercator world. The world doubles per zoom-in step, so the
    /// geographic cell size halves accordingly.
    #[serde(default = "Config::default_cluster_cell_px")]
    pub cluster_cell_px: f64,

    /// Optional per-zoom overrides of `cluster_cell_px`, indexed by zoom
    /// level. Missing or non-positive entries fall back to the default.
    #[serde(default)]
    pub cluster_cell_px_by_zoom: Vec<f64>,

    /// Interval between periodic sync cycles, seconds.
    #[serde(default = "Config::default_sync_interval_seconds")]
    pub sync_interval_seconds: f64,

    /// Timeout applied to each individual backend request, seconds.
    #[serde(default = "Config::default_sync_timeout_seconds")]
    pub sync_timeout_seconds: f64,

    /// Maximum push attempts per entity per sync cycle.
    #[serde(default = "Config::default_max_push_attempts")]
    pub max_push_attempts: u32,

    /// Base delay of the exponential push backoff, milliseconds.
    #[serde(default = "Config::default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the push backoff, milliseconds.
    #[serde(default = "Config::default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Config {
    const fn default_max_accuracy_m() -> f64 {
        50.0
    }

    const fn default_max_speed_mps() -> f64 {
        70.0
    }

    const fn default_smoothing_factor() -> f64 {
        0.25
    }

    const fn default_stale_timeout_seconds() -> f64 {
        60.0
    }

    const fn default_evict_timeout_seconds() -> f64 {
        240.0
    }

    const fn default_history_capacity() -> usize {
        32
    }

    const fn default_geohash_precision() -> usize {
        7
    }

    const fn default_cluster_cell_px() -> f64 {
        64.0
    }

    const fn default_sync_interval_seconds() -> f64 {
        15.0
    }

    const fn default_sync_timeout_seconds() -> f64 {
        10.0
    }

    const fn default_max_push_attempts() -> u32 {
        5
    }

    const fn default_backoff_base_ms() -> u64 {
        500
    }

    const fn default_backoff_cap_ms() -> u64 {
        30_000
    }

    pub fn with_max_accuracy(mut self, meters: f64) -> Self {
        self.max_accuracy_m = meters;
        self
    }

    pub fn with_max_speed(mut self, mps: f64) -> Self {
        self.max_speed_mps = mps;
        self
    }

    pub fn with_smoothing_factor(mut self, factor: f64) -> Self {
        self.smoothing_factor = factor;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn with_evict_timeout(mut self, timeout: Duration) -> Self {
        self.evict_timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_geohash_precision(mut self, precision: usize) -> Self {
        self.geohash_precision = precision;
        self
    }

    pub fn with_cluster_cell_px(mut self, px: f64) -> Self {
        self.cluster_cell_px = px;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_seconds = interval.as_secs_f64();
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn with_max_push_attempts(mut self, attempts: u32) -> Self {
        self.max_push_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_cap_ms = cap.as_millis() as u64;
        self
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_timeout_seconds)
    }

    pub fn evict_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.evict_timeout_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sync_interval_seconds)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sync_timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Effective cluster cell edge in pixels for a zoom level.
    pub fn cluster_cell_px_for_zoom(&self, zoom: u8) -> f64 {
        match self.cluster_cell_px_by_zoom.get(zoom as usize) {
            Some(&px) if px > 0.0 => px,
            _ => self.cluster_cell_px,
        }
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::TrackError::InvalidConfig;

        if !(self.max_accuracy_m.is_finite() && self.max_accuracy_m > 0.0) {
            return Err(InvalidConfig("max_accuracy_m must be positive".into()));
        }
        if !(self.max_speed_mps.is_finite() && self.max_speed_mps > 0.0) {
            return Err(InvalidConfig("max_speed_mps must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.smoothing_factor) {
            return Err(InvalidConfig("smoothing_factor must be within 0..=1".into()));
        }
        if self.stale_timeout_seconds <= 0.0 {
            return Err(InvalidConfig("stale_timeout_seconds must be positive".into()));
        }
        if self.evict_timeout_seconds < self.stale_timeout_seconds {
            return Err(InvalidConfig(
                "evict_timeout_seconds must not be below stale_timeout_seconds".into(),
            ));
        }
        if !(1..=12).contains(&self.geohash_precision) {
            return Err(InvalidConfig(
                "geohash_precision must be between 1 and 12".into(),
            ));
        }
        if !(self.cluster_cell_px.is_finite() && self.cluster_cell_px > 0.0) {
            return Err(InvalidConfig("cluster_cell_px must be positive".into()));
        }
        if self.sync_interval_seconds <= 0.0 {
            return Err(InvalidConfig("sync_interval_seconds must be positive".into()));
        }
        if self.sync_timeout_seconds <= 0.0 {
            return Err(InvalidConfig("sync_timeout_seconds must be positive".into()));
        }
        if self.max_push_attempts == 0 {
            return Err(InvalidConfig("max_push_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_accuracy_m: Self::default_max_accuracy_m(),
            max_speed_mps: Self::default_max_speed_mps(),
            smoothing_factor: Self::default_smoothing_factor(),
            stale_timeout_seconds: Self::default_stale_timeout_seconds(),
            evict_timeout_seconds: Self::default_evict_timeout_seconds(),
            history_capacity: Self::default_history_capacity(),
            geohash_precision: Self::default_geohash_precision(),
            cluster_cell_px: Self::default_cluster_cell_px(),
            cluster_cell_px_by_zoom: Vec::new(),
            sync_interval_seconds: Self::default_sync_interval_seconds(),
            sync_timeout_seconds: Self::default_sync_timeout_seconds(),
            max_push_attempts: Self::default_max_push_attempts(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_cap_ms: Self::default_backoff_cap_ms(),
        }
    }
}

/// Counters describing engine activity.
#[derive(Debug, Clone, Default)]
pub struct TrackStats {
    /// Samples accepted and merged into entity state.
    pub ingested: u64,
    /// Samples rejected by the position buffer.
    pub rejected: u64,
    /// Successful pushes acknowledged by the backend.
    pub pushes: u64,
    /// Remote updates applied from pulls.
    pub pulls: u64,
    /// Version conflicts resolved during sync.
    pub conflicts: u64,
    /// Entities marked stale by the periodic sweep.
    pub stale_marked: u64,
    /// Entities evicted after the eviction timeout.
    pub evicted: u64,
    /// Backend payloads rejected as malformed.
    pub malformed_payloads: u64,
}

impl TrackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingested(&mut self) {
        self.ingested += 1;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_pushes(&mut self, count: u64) {
        self.pushes += count;
    }

    pub fn record_pulls(&mut self, count: u64) {
        self.pulls += count;
    }

    pub fn record_conflicts(&mut self, count: u64) {
        self.conflicts += count;
    }

    pub fn record_stale(&mut self, count: u64) {
        self.stale_marked += count;
    }

    pub fn record_evicted(&mut self, count: u64) {
        self.evicted += count;
    }

    pub fn record_malformed(&mut self, count: u64) {
        self.malformed_payloads += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.geohash_precision, 7);
        assert_eq!(config.max_push_attempts, 5);
    }

    #[test]
    fn test_config_builders() {
        let config = Config::default()
            .with_stale_timeout(Duration::from_secs(30))
            .with_backoff(Duration::from_millis(100), Duration::from_secs(5))
            .with_max_push_attempts(3);

        assert_eq!(config.stale_timeout(), Duration::from_secs(30));
        assert_eq!(config.backoff_base(), Duration::from_millis(100));
        assert_eq!(config.backoff_cap(), Duration::from_secs(5));
        assert_eq!(config.max_push_attempts, 3);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(Config::default().with_max_accuracy(0.0).validate().is_err());
        assert!(Config::default().with_smoothing_factor(1.5).validate().is_err());
        assert!(Config::default().with_geohash_precision(13).validate().is_err());
        assert!(Config::default().with_max_push_attempts(0).validate().is_err());

        let shrunk = Config::default()
            .with_stale_timeout(Duration::from_secs(300))
            .with_evict_timeout(Duration::from_secs(60));
        assert!(shrunk.validate().is_err());
    }

    #[test]
    fn test_config_from_json_with_partial_fields() {
        let json = r#"{ "max_speed_mps": 120.0, "cluster_cell_px": 80.0 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_speed_mps, 120.0);
        assert_eq!(config.cluster_cell_px, 80.0);
        // Unspecified fields take defaults
        assert_eq!(config.max_accuracy_m, 50.0);
    }

    #[test]
    fn test_cluster_cell_table_override() {
        let mut config = Config::default();
        config.cluster_cell_px_by_zoom = vec![0.0, 128.0];
        assert_eq!(config.cluster_cell_px_for_zoom(0), 64.0); // non-positive falls back
        assert_eq!(config.cluster_cell_px_for_zoom(1), 128.0);
        assert_eq!(config.cluster_cell_px_for_zoom(9), 64.0); // out of table
    }

    #[test]
    fn test_viewport_normalizes_and_is_inclusive() {
        let viewport = Viewport::new(10.0, 20.0, -10.0, -20.0);
        assert_eq!(viewport.min_lon, -10.0);
        assert_eq!(viewport.max_lat, 20.0);

        assert!(viewport.contains(&Point::new(-10.0, 20.0))); // corner is inside
        assert!(viewport.contains(&Point::new(0.0, 0.0)));
        assert!(!viewport.contains(&Point::new(10.1, 0.0)));
    }

    #[test]
    fn test_singleton_cluster_is_marker() {
        let cluster = Cluster {
            id: "z10:1:2".into(),
            centroid: Point::new(0.0, 0.0),
            members: vec!["a".into()],
            radius_m: 0.0,
        };
        assert!(cluster.is_marker());
    }
}
