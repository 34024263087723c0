//! Position ingestion buffer.
//!
//! Filters noisy GPS input before it reaches the spatial index: rejects
//! out-of-order and low-confidence samples, suppresses physically
//! implausible jumps via exponential smoothing, and retains a bounded ring
//! of recent accepted samples per entity.

use crate::types::{Config, Entity, EntityId, PositionSample};
use geo::{Bearing, Distance, Haversine, Point};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::SystemTime;

/// Minimum elapsed time assumed between samples when computing implied
/// speed, to avoid dividing by a zero or sub-millisecond interval.
const MIN_SAMPLE_INTERVAL_SECS: f64 = 0.001;

/// Why a sample was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Timestamp not newer than the last accepted sample for the entity.
    OutOfOrder,
    /// Accuracy radius above the configured maximum.
    LowConfidence,
    /// Coordinates or accuracy are NaN or infinite.
    NonFinite,
    /// Coordinates outside WGS84 bounds.
    OutOfRange,
}

/// Outcome of ingesting one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    Accepted(EntityUpdate),
    Rejected(RejectReason),
}

impl Ingest {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Ingest::Accepted(_))
    }
}

/// The merged result of an accepted sample, ready to apply to entity
/// state and the spatial index.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity_id: EntityId,
    /// Position to apply; differs from the raw sample when a jump was
    /// smoothed.
    pub point: Point,
    pub heading_deg: f64,
    pub speed_mps: f64,
    pub timestamp: SystemTime,
    /// True when jump suppression replaced the raw position.
    pub smoothed: bool,
}

/// Per-entity sample filter and history ring.
pub struct PositionBuffer {
    max_accuracy_m: f64,
    max_speed_mps: f64,
    smoothing_factor: f64,
    history_capacity: usize,
    /// Recent accepted samples per entity, newest at the back.
    history: FxHashMap<EntityId, VecDeque<PositionSample>>,
}

impl PositionBuffer {
    pub fn new(config: &Config) -> Self {
        Self {
            max_accuracy_m: config.max_accuracy_m,
            max_speed_mps: config.max_speed_mps,
            smoothing_factor: config.smoothing_factor,
            history_capacity: config.history_capacity.max(1),
            history: FxHashMap::default(),
        }
    }

    /// Filter one sample against the entity's current state.
    ///
    /// `current` is the entity as known to the caller, `None` for a
    /// first-seen id. Accepted samples are recorded in the history ring;
    /// rejected samples leave no trace beyond a log line.
    pub fn ingest(&mut self, current: Option<&Entity>, sample: PositionSample) -> Ingest {
        if !sample.point.x().is_finite()
            || !sample.point.y().is_finite()
            || !sample.accuracy_m.is_finite()
        {
            log::warn!(
                "rejecting non-finite sample for entity {}",
                sample.entity_id
            );
            return Ingest::Rejected(RejectReason::NonFinite);
        }

        if sample.point.x().abs() > 180.0 || sample.point.y().abs() > 90.0 {
            log::warn!(
                "rejecting out-of-range sample for entity {}",
                sample.entity_id
            );
            return Ingest::Rejected(RejectReason::OutOfRange);
        }

        if sample.accuracy_m > self.max_accuracy_m {
            log::debug!(
                "rejecting low-confidence sample for entity {} (accuracy {:.1}m > {:.1}m)",
                sample.entity_id,
                sample.accuracy_m,
                self.max_accuracy_m
            );
            return Ingest::Rejected(RejectReason::LowConfidence);
        }

        if sample.timestamp <= self.last_accepted_at(current, &sample.entity_id) {
            log::debug!("rejecting out-of-order sample for entity {}", sample.entity_id);
            return Ingest::Rejected(RejectReason::OutOfOrder);
        }

        let update = match current {
            Some(entity) => self.merge(entity, &sample),
            None => EntityUpdate {
                entity_id: sample.entity_id.clone(),
                point: sample.point,
                heading_deg: 0.0,
                speed_mps: 0.0,
                timestamp: sample.timestamp,
                smoothed: false,
            },
        };

        self.push_history(sample);
        Ingest::Accepted(update)
    }

    /// Recent accepted samples for an entity, oldest first.
    pub fn history(&self, entity_id: &str) -> impl Iterator<Item = &PositionSample> + '_ {
        self.history.get(entity_id).into_iter().flatten()
    }

    /// Drop all buffered samples for an entity. Called on eviction and
    /// remote deletion.
    pub fn forget(&mut self, entity_id: &str) {
        self.history.remove(entity_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.history.len()
    }

    fn last_accepted_at(&self, current: Option<&Entity>, entity_id: &str) -> SystemTime {
        let buffered = self
            .history
            .get(entity_id)
            .and_then(|ring| ring.back())
            .map(|sample| sample.timestamp);

        match (buffered, current.map(|e| e.last_update)) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => SystemTime::UNIX_EPOCH,
        }
    }

    fn merge(&self, entity: &Entity, sample: &PositionSample) -> EntityUpdate {
        let elapsed = sample
            .timestamp
            .duration_since(entity.last_update)
            .map(|d| d.as_secs_f64())
            .unwrap_or(MIN_SAMPLE_INTERVAL_SECS)
            .max(MIN_SAMPLE_INTERVAL_SECS);

        let distance = Haversine.distance(entity.position, sample.point);
        let implied_speed = distance / elapsed;

        let (point, smoothed) = if implied_speed > self.max_speed_mps {
            log::debug!(
                "smoothing jump for entity {} (implied speed {:.1} m/s)",
                sample.entity_id,
                implied_speed
            );
            (
                lerp(entity.position, sample.point, self.smoothing_factor),
                true,
            )
        } else {
            (sample.point, false)
        };

        let applied_distance = Haversine.distance(entity.position, point);
        let speed_mps = applied_distance / elapsed;
        let heading_deg = if applied_distance > 0.0 {
            normalize_bearing(Haversine.bearing(entity.position, point))
        } else {
            entity.heading_deg
        };

        EntityUpdate {
            entity_id: sample.entity_id.clone(),
            point,
            heading_deg,
            speed_mps,
            timestamp: sample.timestamp,
            smoothed,
        }
    }

    fn push_history(&mut self, sample: PositionSample) {
        let ring = self.history.entry(sample.entity_id.clone()).or_default();
        if ring.len() == self.history_capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }
}

fn lerp(from: Point, to: Point, factor: f64) -> Point {
    Point::new(
        from.x() + (to.x() - from.x()) * factor,
        from.y() + (to.y() - from.y()) * factor,
    )
}

fn normalize_bearing(degrees: f64) -> f64 {
    degrees.rem_euclid(360.0)
}
