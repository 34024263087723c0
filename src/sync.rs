//! Remote synchronization coordinator.
//!
//! Reconciles local entity state with a backend over an unreliable
//! network. Each entity carries a small state machine
//! (`Clean -> Dirty -> Pushing -> Clean | Conflict`); pushes retry with
//! exponential backoff and jitter, pulls arriving for an entity with an
//! in-flight local edit are deferred until it returns to `Clean`, and
//! conflicts resolve last-writer-wins by timestamp with remote deletions
//! always winning.
//!
//! Dynamic backend payloads are parsed into the fixed [`RemoteEntity`]
//! shape at this boundary; anything that does not parse is logged and
//! dropped without touching entity state.

use crate::error::{Result, TrackError};
use crate::service::TrackStore;
use crate::types::{Entity, EntityId};
use async_trait::async_trait;
use geo::Point;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sync lifecycle phase of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// Local and remote state agree as far as we know.
    #[default]
    Clean,
    /// A local change awaits the next push cycle.
    Dirty,
    /// A push is in flight.
    Pushing,
    /// Push attempts were exhausted; retried on the next cycle.
    Conflict,
}

/// Per-entity sync bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Last version acknowledged by the backend.
    pub version: u64,
    pub phase: SyncPhase,
    /// Push attempts consumed in the current cycle.
    pub attempts: u32,
    pub last_sync: Option<SystemTime>,
    /// Remote update received while a local edit was in flight, applied
    /// once the entity returns to Clean.
    pub deferred: Option<RemoteEntity>,
}

/// The fixed entity-update shape every pull payload must parse into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: EntityId,
    pub lat: f64,
    pub lon: f64,
    pub version: u64,
    /// Unix timestamp, seconds.
    pub timestamp: f64,
    #[serde(default)]
    pub deleted: bool,
}

/// Largest accepted remote timestamp (year 10000). Values above this are
/// not representable as a `Duration` offset and never legitimate.
const MAX_UNIX_TIMESTAMP: f64 = 253_402_300_800.0;

impl RemoteEntity {
    pub fn point(&self) -> Point {
        Point::new(self.lon, self.lat)
    }

    pub fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs_f64(self.timestamp.clamp(0.0, MAX_UNIX_TIMESTAMP))
    }

    /// Reject payloads the engine cannot apply safely.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TrackError::MalformedPayload("empty entity id".into()));
        }
        if !self.lat.is_finite() || !self.lon.is_finite() || !self.timestamp.is_finite() {
            return Err(TrackError::MalformedPayload(format!(
                "non-finite fields for entity {}",
                self.id
            )));
        }
        if self.lon.abs() > 180.0 || self.lat.abs() > 90.0 {
            return Err(TrackError::MalformedPayload(format!(
                "coordinates out of range for entity {}",
                self.id
            )));
        }
        if !(0.0..=MAX_UNIX_TIMESTAMP).contains(&self.timestamp) {
            return Err(TrackError::MalformedPayload(format!(
                "timestamp out of range for entity {}",
                self.id
            )));
        }
        Ok(())
    }
}

/// The shape pushed to the backend for one locally-changed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub lat: f64,
    pub lon: f64,
    pub version: u64,
    /// Unix timestamp of the local change, seconds.
    pub timestamp: f64,
}

impl EntityRecord {
    pub fn from_entity(entity: &Entity, version: u64) -> Self {
        Self {
            id: entity.id.clone(),
            lat: entity.position.y(),
            lon: entity.position.x(),
            version,
            timestamp: entity
                .last_update
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64(),
        }
    }
}

/// Backend response to a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The write was accepted; the entity now has this version.
    Accepted { version: u64 },
    /// The submitted version was stale; `current` is the backend's copy.
    VersionConflict { current: RemoteEntity },
}

/// Failures a backend implementation can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Connectivity-level failure; retried with backoff.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Credentials rejected; terminal for the sync path.
    #[error("unauthorized")]
    Unauthorized,
    /// The backend answered with something unusable.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The narrow seam to the remote backend. The wire schema is owned
/// externally; implementations live outside this crate.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Fetch raw entity payloads updated since the given instant
    /// (`None` = everything). Payloads are parsed and validated by the
    /// coordinator, not trusted as-is.
    async fn pull_since(
        &self,
        since: Option<SystemTime>,
    ) -> std::result::Result<Vec<serde_json::Value>, RemoteError>;

    /// Write one entity. Returns the new version or a conflict carrying
    /// the backend's current copy.
    async fn push(&self, record: &EntityRecord)
    -> std::result::Result<PushOutcome, RemoteError>;
}

/// How the store handled one remote update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PullApply {
    /// Entity state was created or updated.
    Applied,
    /// Entity removed following a remote deletion.
    Deleted,
    /// Entity had a local edit in flight; update queued.
    Deferred,
    /// Update was older than local knowledge; dropped.
    Ignored,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Entities successfully pushed.
    pub pushed: usize,
    /// Entities whose push attempts were exhausted this cycle.
    pub failed: usize,
    /// Version conflicts resolved (either direction).
    pub conflicts: usize,
    /// Remote updates applied from the pull.
    pub pulled: usize,
    /// Remote updates deferred behind in-flight local edits.
    pub deferred: usize,
    /// Payloads dropped as malformed.
    pub malformed: usize,
    /// Entities removed because the backend reported deletion.
    pub deleted_ids: Vec<EntityId>,
}

enum PushResolution {
    Pushed,
    RemoteAdopted { deleted: Option<EntityId> },
    Exhausted,
    Malformed,
}

/// Drives push/pull cycles against a [`RemoteBackend`].
pub struct SyncCoordinator {
    backend: Arc<dyn RemoteBackend>,
    request_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    last_pull: Option<SystemTime>,
}

impl SyncCoordinator {
    pub(crate) fn new(backend: Arc<dyn RemoteBackend>, config: &crate::types::Config) -> Self {
        Self {
            backend,
            request_timeout: config.sync_timeout(),
            max_attempts: config.max_push_attempts,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            last_pull: None,
        }
    }

    /// Run one push-then-pull cycle.
    ///
    /// Pushes run concurrently, each with its own timeout and backoff, so
    /// one slow entity never delays another. Only an authentication
    /// failure escalates to an error; everything else lands in the
    /// report.
    pub(crate) async fn run_cycle(&mut self, store: &TrackStore) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let dirty = store.collect_dirty();
        if !dirty.is_empty() {
            log::debug!("sync cycle pushing {} dirty entities", dirty.len());
        }

        let results = futures::future::join_all(
            dirty
                .into_iter()
                .map(|record| self.push_entity(store, record)),
        )
        .await;

        let mut auth_failed = false;
        for result in results {
            match result {
                Ok(PushResolution::Pushed) => report.pushed += 1,
                Ok(PushResolution::RemoteAdopted { deleted }) => {
                    report.conflicts += 1;
                    if let Some(id) = deleted {
                        report.deleted_ids.push(id);
                    }
                }
                Ok(PushResolution::Exhausted) => report.failed += 1,
                Ok(PushResolution::Malformed) => report.malformed += 1,
                Err(TrackError::AuthFailure) => auth_failed = true,
                Err(e) => {
                    log::warn!("push failed: {e}");
                    report.failed += 1;
                }
            }
        }
        if auth_failed {
            return Err(TrackError::AuthFailure);
        }

        self.pull(store, &mut report).await?;
        Ok(report)
    }

    async fn push_entity(
        &self,
        store: &TrackStore,
        mut record: EntityRecord,
    ) -> Result<PushResolution> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome =
                tokio::time::timeout(self.request_timeout, self.backend.push(&record)).await;

            match outcome {
                Err(_) => {
                    log::warn!(
                        "push timed out for entity {} (attempt {attempt})",
                        record.id
                    );
                }
                Ok(Err(RemoteError::Unauthorized)) => {
                    store.fail_push(&record.id);
                    return Err(TrackError::AuthFailure);
                }
                Ok(Err(RemoteError::Transport(reason))) => {
                    log::warn!(
                        "push transport failure for entity {} (attempt {attempt}): {reason}",
                        record.id
                    );
                }
                Ok(Err(RemoteError::Malformed(reason))) => {
                    // The entity keeps its prior state; no partial apply.
                    log::warn!(
                        "malformed push response for entity {}: {reason}",
                        record.id
                    );
                    if let Some(deferred) = store.restore_clean(&record.id) {
                        store.apply_remote(&deferred, false);
                    }
                    return Ok(PushResolution::Malformed);
                }
                Ok(Ok(PushOutcome::Accepted { version })) => {
                    if let Some(deferred) = store.complete_push(&record.id, version) {
                        // The queued pull applies now that we are Clean.
                        store.apply_remote(&deferred, false);
                    }
                    return Ok(PushResolution::Pushed);
                }
                Ok(Ok(PushOutcome::VersionConflict { current })) => {
                    if let Err(e) = current.validate() {
                        log::warn!("conflict response rejected: {e}");
                        if let Some(deferred) = store.restore_clean(&record.id) {
                            store.apply_remote(&deferred, false);
                        }
                        return Ok(PushResolution::Malformed);
                    }

                    let remote_wins = current.deleted
                        || !store.local_newer_than(&record.id, current.system_time());
                    if remote_wins {
                        let deleted = current.deleted.then(|| current.id.clone());
                        store.apply_remote(&current, true);
                        return Ok(PushResolution::RemoteAdopted { deleted });
                    }

                    // Local edit is newer: retry against the version the
                    // backend actually holds.
                    log::debug!(
                        "version conflict for entity {}, retrying with version {}",
                        record.id,
                        current.version
                    );
                    record.version = current.version;
                }
            }

            if attempt >= self.max_attempts {
                log::warn!(
                    "push attempts exhausted for entity {} after {attempt} tries",
                    record.id
                );
                store.fail_push(&record.id);
                return Ok(PushResolution::Exhausted);
            }

            let delay = jitter(backoff_delay(self.backoff_base, self.backoff_cap, attempt));
            tokio::time::sleep(delay).await;
        }
    }

    async fn pull(&mut self, store: &TrackStore, report: &mut CycleReport) -> Result<()> {
        let cycle_start = SystemTime::now();

        let payloads = match tokio::time::timeout(
            self.request_timeout,
            self.backend.pull_since(self.last_pull),
        )
        .await
        {
            Err(_) => {
                log::warn!("pull timed out; retrying next cycle");
                return Ok(());
            }
            Ok(Err(RemoteError::Unauthorized)) => return Err(TrackError::AuthFailure),
            Ok(Err(e)) => {
                log::warn!("pull failed: {e}; retrying next cycle");
                return Ok(());
            }
            Ok(Ok(payloads)) => payloads,
        };

        for payload in payloads {
            let remote: RemoteEntity = match serde_json::from_value(payload) {
                Ok(remote) => remote,
                Err(e) => {
                    log::warn!("dropping malformed pull payload: {e}");
                    report.malformed += 1;
                    continue;
                }
            };
            if let Err(e) = remote.validate() {
                log::warn!("dropping invalid pull payload: {e}");
                report.malformed += 1;
                continue;
            }

            match store.apply_remote(&remote, false) {
                PullApply::Applied => report.pulled += 1,
                PullApply::Deleted => report.deleted_ids.push(remote.id),
                PullApply::Deferred => report.deferred += 1,
                PullApply::Ignored => {}
            }
        }

        self.last_pull = Some(cycle_start);
        Ok(())
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}

fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);

        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 7), Duration::from_secs(30)); // 32s capped
        assert_eq!(backoff_delay(base, cap, 20), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_zero_attempt_treated_as_first() {
        let base = Duration::from_millis(100);
        assert_eq!(
            backoff_delay(base, Duration::from_secs(10), 0),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_remote_entity_parses_from_dynamic_payload() {
        let payload = serde_json::json!({
            "id": "veh-1",
            "lat": 40.7128,
            "lon": -74.0060,
            "version": 3,
            "timestamp": 1_700_000_000.0
        });
        let remote: RemoteEntity = serde_json::from_value(payload).unwrap();
        assert_eq!(remote.id, "veh-1");
        assert!(!remote.deleted); // missing flag defaults to false
        assert!(remote.validate().is_ok());
        assert_eq!(remote.point(), Point::new(-74.0060, 40.7128));
    }

    #[test]
    fn test_remote_entity_rejects_bad_payloads() {
        let missing: std::result::Result<RemoteEntity, _> =
            serde_json::from_value(serde_json::json!({ "id": "x" }));
        assert!(missing.is_err());

        let out_of_range = RemoteEntity {
            id: "x".into(),
            lat: 91.0,
            lon: 0.0,
            version: 1,
            timestamp: 0.0,
            deleted: false,
        };
        assert!(matches!(
            out_of_range.validate(),
            Err(TrackError::MalformedPayload(_))
        ));

        let empty_id = RemoteEntity {
            id: "".into(),
            lat: 0.0,
            lon: 0.0,
            version: 1,
            timestamp: 0.0,
            deleted: false,
        };
        assert!(empty_id.validate().is_err());
    }

    #[test]
    fn test_remote_entity_rejects_unrepresentable_timestamps() {
        let mut remote = RemoteEntity {
            id: "x".into(),
            lat: 0.0,
            lon: 0.0,
            version: 1,
            timestamp: 1e30,
            deleted: false,
        };
        assert!(matches!(
            remote.validate(),
            Err(TrackError::MalformedPayload(_))
        ));
        // The conversion stays total even for values validate refuses.
        assert!(remote.system_time() > UNIX_EPOCH);

        remote.timestamp = -5.0;
        assert!(remote.validate().is_err());
        assert_eq!(remote.system_time(), UNIX_EPOCH);
    }

    #[test]
    fn test_entity_record_round_trips_entity_fields() {
        let when = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entity = Entity::new("veh-1", Point::new(-74.0, 40.7), when);
        let record = EntityRecord::from_entity(&entity, 7);

        assert_eq!(record.id, "veh-1");
        assert_eq!(record.lon, -74.0);
        assert_eq!(record.lat, 40.7);
        assert_eq!(record.version, 7);
        assert_eq!(record.timestamp, 1_700_000_000.0);
    }
}
