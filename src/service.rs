//! Tracking service: the owner of fleet state.
//!
//! Wires the position buffer, spatial index, and cluster engine together,
//! and runs the periodic stale sweep and sync cycles on background tasks.
//! State lives behind a single `Arc<RwLock<...>>` with short critical
//! sections: ingestion and sync are the only writers, and render queries
//! snapshot the viewport's entities under the read lock and cluster
//! outside it.

use crate::buffer::{Ingest, PositionBuffer};
use crate::cluster::ClusterEngine;
use crate::error::{Result, TrackError};
use crate::index::SpatialIndex;
use crate::sync::{
    CycleReport, EntityRecord, PullApply, RemoteBackend, RemoteEntity, SyncCoordinator, SyncPhase,
    SyncState,
};
use crate::types::{
    Cluster, Config, Entity, EntityId, PositionSample, SampleSource, TrackStats, Viewport,
};
use geo::Point;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared fleet state: entities, their sync bookkeeping, and the spatial
/// index, guarded by one lock.
#[derive(Clone)]
pub(crate) struct TrackStore {
    inner: Arc<RwLock<StoreInner>>,
}

struct StoreInner {
    entities: FxHashMap<EntityId, Entity>,
    sync: FxHashMap<EntityId, SyncState>,
    index: SpatialIndex,
    stats: TrackStats,
    closed: bool,
}

impl TrackStore {
    fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                entities: FxHashMap::default(),
                sync: FxHashMap::default(),
                index: SpatialIndex::new(config.geohash_precision),
                stats: TrackStats::new(),
                closed: false,
            })),
        }
    }

    /// Entities with a pending local change, moved to `Pushing` and
    /// returned as push records, sorted by id.
    pub(crate) fn collect_dirty(&self) -> Vec<EntityRecord> {
        let mut inner = self.inner.write();
        let StoreInner { entities, sync, .. } = &mut *inner;

        let mut records = Vec::new();
        for (id, state) in sync.iter_mut() {
            if matches!(state.phase, SyncPhase::Dirty | SyncPhase::Conflict) {
                if let Some(entity) = entities.get(id) {
                    state.phase = SyncPhase::Pushing;
                    records.push(EntityRecord::from_entity(entity, state.version));
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Record a backend-acknowledged push. Returns a deferred remote
    /// update if one was queued behind the in-flight edit.
    pub(crate) fn complete_push(&self, entity_id: &str, version: u64) -> Option<RemoteEntity> {
        let mut inner = self.inner.write();
        inner.stats.record_pushes(1);
        let state = inner.sync.get_mut(entity_id)?;

        state.version = version;
        state.last_sync = Some(SystemTime::now());
        if state.phase == SyncPhase::Pushing {
            state.phase = SyncPhase::Clean;
            state.attempts = 0;
            return state.deferred.take();
        }
        // A new local edit arrived mid-flight; it stays Dirty and the
        // deferred pull keeps waiting for Clean.
        None
    }

    /// Push attempts exhausted: park the entity in `Conflict` so the next
    /// cycle retries it.
    pub(crate) fn fail_push(&self, entity_id: &str) {
        let mut inner = self.inner.write();
        if let Some(state) = inner.sync.get_mut(entity_id) {
            if state.phase == SyncPhase::Pushing {
                state.phase = SyncPhase::Conflict;
            }
        }
    }

    /// A malformed backend response leaves the entity Clean at its prior
    /// state. Returns a deferred remote update if one was queued behind
    /// the failed push; the queue is incremental, so it would otherwise
    /// never be resent.
    pub(crate) fn restore_clean(&self, entity_id: &str) -> Option<RemoteEntity> {
        let mut inner = self.inner.write();
        let state = inner.sync.get_mut(entity_id)?;
        if state.phase == SyncPhase::Pushing {
            state.phase = SyncPhase::Clean;
            state.attempts = 0;
            return state.deferred.take();
        }
        None
    }

    /// Whether the local copy of an entity is newer than a remote
    /// timestamp (last-writer-wins tiebreak).
    pub(crate) fn local_newer_than(&self, entity_id: &str, remote: SystemTime) -> bool {
        let inner = self.inner.read();
        inner
            .entities
            .get(entity_id)
            .map(|entity| entity.last_update > remote)
            .unwrap_or(false)
    }

    /// Apply one validated remote update.
    ///
    /// With `supersede` false (pull path), an entity with an unpushed
    /// local change (Dirty, Pushing, or retry-pending) defers the update
    /// and stale versions are ignored. With `supersede` true (conflict
    /// adoption), the remote copy wins outright.
    pub(crate) fn apply_remote(&self, remote: &RemoteEntity, supersede: bool) -> PullApply {
        let mut inner = self.inner.write();
        let StoreInner {
            entities,
            sync,
            index,
            stats,
            ..
        } = &mut *inner;

        let state = sync.entry(remote.id.clone()).or_default();

        if !supersede
            && matches!(
                state.phase,
                SyncPhase::Dirty | SyncPhase::Pushing | SyncPhase::Conflict
            )
        {
            let newer = state
                .deferred
                .as_ref()
                .map(|queued| remote.version > queued.version)
                .unwrap_or(true);
            if newer {
                state.deferred = Some(remote.clone());
            }
            return PullApply::Deferred;
        }

        if remote.deleted {
            sync.remove(&remote.id);
            entities.remove(&remote.id);
            index.remove(&remote.id);
            return PullApply::Deleted;
        }

        if !supersede && entities.contains_key(&remote.id) && remote.version <= state.version {
            return PullApply::Ignored;
        }

        if let Err(e) = index.upsert(&remote.id, remote.point()) {
            log::warn!("could not index remote update for {}: {e}", remote.id);
            return PullApply::Ignored;
        }

        let entity = entities
            .entry(remote.id.clone())
            .or_insert_with(|| Entity::new(remote.id.clone(), remote.point(), remote.system_time()));
        entity.position = remote.point();
        entity.last_update = remote.system_time();
        entity.stale = false;

        state.version = remote.version;
        state.phase = SyncPhase::Clean;
        state.attempts = 0;
        state.last_sync = Some(SystemTime::now());
        if let Some(queued) = &state.deferred {
            if queued.version <= remote.version {
                state.deferred = None;
            }
        }

        stats.record_pulls(1);
        PullApply::Applied
    }
}

/// Handle to the background loops started by [`TrackingService::spawn`].
pub struct ServiceHandle {
    task: JoinHandle<()>,
}

/// Orchestrates ingestion, clustering, staleness sweeps, and sync for one
/// tracking session. Created on start, torn down with [`shutdown`]
/// (which flushes pending pushes).
///
/// [`shutdown`]: TrackingService::shutdown
///
/// # Example
///
/// ```ignore
/// let service = Arc::new(TrackingService::new(Config::default(), backend)?);
/// let handle = service.spawn();
///
/// service.ingest(sample)?;
/// let clusters = service.render(12, &viewport)?;
///
/// service.shutdown(handle).await?;
/// ```
pub struct TrackingService {
    store: TrackStore,
    buffer: Mutex<PositionBuffer>,
    engine: ClusterEngine,
    coordinator: tokio::sync::Mutex<SyncCoordinator>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    sync_halted: AtomicBool,
}

impl TrackingService {
    pub fn new(config: Config, backend: Arc<dyn RemoteBackend>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            store: TrackStore::new(&config),
            buffer: Mutex::new(PositionBuffer::new(&config)),
            engine: ClusterEngine::new(&config),
            coordinator: tokio::sync::Mutex::new(SyncCoordinator::new(backend, &config)),
            config,
            shutdown_tx,
            sync_halted: AtomicBool::new(false),
        })
    }

    /// Feed one raw position sample through the ingestion path.
    ///
    /// Accepted local samples mark the entity Dirty for the next sync
    /// cycle; rejected samples change nothing beyond a counter.
    pub fn ingest(&self, sample: PositionSample) -> Result<Ingest> {
        // Lock order is buffer then store, everywhere.
        let mut buffer = self.buffer.lock();
        let mut inner = self.store.inner.write();
        if inner.closed {
            return Err(TrackError::Closed);
        }

        let source = sample.source;
        let current = inner.entities.get(&sample.entity_id).cloned();
        let outcome = buffer.ingest(current.as_ref(), sample);

        match &outcome {
            Ingest::Accepted(update) => {
                inner.index.upsert(&update.entity_id, update.point)?;

                let entity = inner
                    .entities
                    .entry(update.entity_id.clone())
                    .or_insert_with(|| {
                        Entity::new(update.entity_id.clone(), update.point, update.timestamp)
                    });
                entity.position = update.point;
                entity.heading_deg = update.heading_deg;
                entity.speed_mps = update.speed_mps;
                entity.last_update = update.timestamp;
                entity.stale = false;

                inner.stats.record_ingested();

                if source == SampleSource::Local {
                    // Re-dirty even mid-push, so an in-flight push does
                    // not swallow this newer change.
                    let state = inner.sync.entry(update.entity_id.clone()).or_default();
                    state.phase = SyncPhase::Dirty;
                }
            }
            Ingest::Rejected(_) => inner.stats.record_rejected(),
        }

        Ok(outcome)
    }

    /// Produce the cluster set for one render pass.
    ///
    /// The store is only read long enough to snapshot the non-stale
    /// entities inside the viewport; clustering happens outside the lock,
    /// so a caller abandoning the request simply drops the result.
    pub fn render(&self, zoom: u8, viewport: &Viewport) -> Result<Vec<Cluster>> {
        let snapshot = {
            let inner = self.store.inner.read();
            if inner.closed {
                return Err(TrackError::Closed);
            }
            let mut visible = inner.index.entries_in_bounds(viewport);
            visible.retain(|(id, _)| {
                inner
                    .entities
                    .get(id)
                    .map(|entity| !entity.stale)
                    .unwrap_or(false)
            });
            visible
        };

        Ok(self.engine.cluster(&snapshot, zoom, viewport))
    }

    /// Entities within a radius of a point, nearest first. Includes stale
    /// entities; their last known position is still valid.
    pub fn nearby(
        &self,
        center: &Point,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(EntityId, f64)>> {
        let inner = self.store.inner.read();
        if inner.closed {
            return Err(TrackError::Closed);
        }
        Ok(inner.index.query_within_radius(center, radius_m, limit))
    }

    /// Flag a local (non-positional) mutation so the entity is pushed on
    /// the next cycle.
    pub fn mark_dirty(&self, entity_id: &str) -> Result<()> {
        let mut inner = self.store.inner.write();
        if inner.closed {
            return Err(TrackError::Closed);
        }
        if !inner.entities.contains_key(entity_id) {
            return Err(TrackError::EntityNotFound(entity_id.to_string()));
        }
        let state = inner.sync.entry(entity_id.to_string()).or_default();
        state.phase = SyncPhase::Dirty;
        Ok(())
    }

    /// Run one sync cycle immediately.
    ///
    /// Returns `AuthFailure` (and halts further cycles) when the backend
    /// rejects our credentials; transport-level trouble stays in the
    /// report.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        if self.is_sync_halted() {
            return Err(TrackError::AuthFailure);
        }

        let mut coordinator = self.coordinator.lock().await;
        match coordinator.run_cycle(&self.store).await {
            Ok(report) => {
                let mut buffer = self.buffer.lock();
                for id in &report.deleted_ids {
                    buffer.forget(id);
                }
                drop(buffer);

                let mut inner = self.store.inner.write();
                inner.stats.record_conflicts(report.conflicts as u64);
                inner.stats.record_malformed(report.malformed as u64);
                Ok(report)
            }
            Err(TrackError::AuthFailure) => {
                self.sync_halted.store(true, Ordering::SeqCst);
                log::error!("backend authentication failed; sync path halted");
                Err(TrackError::AuthFailure)
            }
            Err(e) => Err(e),
        }
    }

    /// Mark entities stale past the stale timeout and evict clean
    /// entities past the eviction timeout. Returns (marked, evicted).
    pub fn sweep(&self) -> (u64, u64) {
        let now = SystemTime::now();
        let stale_after = self.config.stale_timeout();
        let evict_after = self.config.evict_timeout();

        let mut buffer = self.buffer.lock();
        let mut inner = self.store.inner.write();
        let StoreInner {
            entities,
            sync,
            index,
            stats,
            ..
        } = &mut *inner;

        let mut marked = 0u64;
        let mut evicted: Vec<EntityId> = Vec::new();

        for (id, entity) in entities.iter_mut() {
            let idle = now
                .duration_since(entity.last_update)
                .unwrap_or_default();

            if idle >= evict_after {
                let clean = sync
                    .get(id)
                    .map(|state| state.phase == SyncPhase::Clean)
                    .unwrap_or(true);
                if clean {
                    evicted.push(id.clone());
                    continue;
                }
            }

            if idle >= stale_after && !entity.stale {
                entity.stale = true;
                marked += 1;
            }
        }

        for id in &evicted {
            entities.remove(id);
            sync.remove(id);
            index.remove(id);
            buffer.forget(id);
            log::debug!("evicted idle entity {id}");
        }

        stats.record_stale(marked);
        stats.record_evicted(evicted.len() as u64);
        (marked, evicted.len() as u64)
    }

    /// Start the periodic sweep + sync loop. The loop runs until
    /// [`shutdown`](Self::shutdown) is called.
    pub fn spawn(self: &Arc<Self>) -> ServiceHandle {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sync_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; consume it so the loop
            // waits a full interval before its first cycle.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.sweep();
                        if !service.is_sync_halted() {
                            if let Err(e) = service.sync_now().await {
                                log::error!("sync cycle failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        // Final flush of pending pushes before exit.
                        if !service.is_sync_halted() {
                            if let Err(e) = service.sync_now().await {
                                log::warn!("final sync flush failed: {e}");
                            }
                        }
                        break;
                    }
                }
            }
        });

        ServiceHandle { task }
    }

    /// Stop the background loop, flush pending syncs, and close the
    /// service. Further ingest/render calls return `Closed`.
    pub async fn shutdown(&self, handle: ServiceHandle) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if handle.task.await.is_err() {
            log::warn!("tracking loop ended abnormally during shutdown");
        }
        self.store.inner.write().closed = true;
        Ok(())
    }

    /// True once the sync path hit a terminal authentication failure.
    pub fn is_sync_halted(&self) -> bool {
        self.sync_halted.load(Ordering::SeqCst)
    }

    /// Snapshot of one entity.
    pub fn entity(&self, entity_id: &str) -> Option<Entity> {
        self.store.inner.read().entities.get(entity_id).cloned()
    }

    /// Current sync phase of one entity.
    pub fn sync_phase(&self, entity_id: &str) -> Option<SyncPhase> {
        self.store
            .inner
            .read()
            .sync
            .get(entity_id)
            .map(|state| state.phase)
    }

    /// Number of tracked entities.
    pub fn entity_count(&self) -> usize {
        self.store.inner.read().entities.len()
    }

    /// Snapshot of engine counters.
    pub fn stats(&self) -> TrackStats {
        self.store.inner.read().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{PushOutcome, RemoteError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend that accepts every push and returns no pulls.
    struct NullBackend;

    #[async_trait]
    impl RemoteBackend for NullBackend {
        async fn pull_since(
            &self,
            _since: Option<SystemTime>,
        ) -> std::result::Result<Vec<serde_json::Value>, RemoteError> {
            Ok(Vec::new())
        }

        async fn push(
            &self,
            record: &EntityRecord,
        ) -> std::result::Result<PushOutcome, RemoteError> {
            Ok(PushOutcome::Accepted {
                version: record.version + 1,
            })
        }
    }

    fn service() -> TrackingService {
        TrackingService::new(Config::default(), Arc::new(NullBackend)).unwrap()
    }

    fn sample(id: &str, lon: f64, lat: f64, secs: u64) -> PositionSample {
        PositionSample::new(
            id,
            Point::new(lon, lat),
            5.0,
            SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        )
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn test_ingest_creates_entity_and_marks_dirty() {
        let svc = service();
        let outcome = svc.ingest(sample("veh-1", -74.0, 40.7, now_secs())).unwrap();
        assert!(outcome.is_accepted());

        let entity = svc.entity("veh-1").unwrap();
        assert_eq!(entity.position, Point::new(-74.0, 40.7));
        assert!(!entity.stale);
        assert_eq!(svc.sync_phase("veh-1"), Some(SyncPhase::Dirty));
        assert_eq!(svc.stats().ingested, 1);
    }

    #[test]
    fn test_remote_sourced_sample_stays_clean() {
        let svc = service();
        let remote_sample = sample("veh-1", -74.0, 40.7, now_secs())
            .with_source(SampleSource::Remote);
        svc.ingest(remote_sample).unwrap();
        assert_eq!(svc.sync_phase("veh-1"), None);
    }

    #[test]
    fn test_render_excludes_stale_entities() {
        let config = Config::default().with_stale_timeout(Duration::from_secs(1));
        let svc = TrackingService::new(config, Arc::new(NullBackend)).unwrap();
        let viewport = Viewport::new(-75.0, 40.0, -73.0, 41.0);

        // One entity far in the past, one fresh
        svc.ingest(sample("old", -74.0, 40.7, now_secs() - 3600)).unwrap();
        svc.ingest(sample("fresh", -74.1, 40.6, now_secs())).unwrap();

        let (marked, _) = svc.sweep();
        assert_eq!(marked, 1);

        let clusters = svc.render(10, &viewport).unwrap();
        let members: Vec<_> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        assert!(members.contains(&"fresh".to_string()));
        assert!(!members.contains(&"old".to_string()));

        // A fresh sample revives the stale entity
        svc.ingest(sample("old", -74.0, 40.7, now_secs() + 1)).unwrap();
        let clusters = svc.render(10, &viewport).unwrap();
        let members: Vec<_> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        assert!(members.contains(&"old".to_string()));
    }

    #[test]
    fn test_sweep_evicts_clean_idle_entities_only() {
        let config = Config::default()
            .with_stale_timeout(Duration::from_secs(1))
            .with_evict_timeout(Duration::from_secs(2));
        let svc = TrackingService::new(config, Arc::new(NullBackend)).unwrap();

        // Dirty entity idles past the eviction timeout but must survive
        svc.ingest(sample("unpushed", -74.0, 40.7, now_secs() - 3600)).unwrap();
        let (_, evicted) = svc.sweep();
        assert_eq!(evicted, 0);
        assert_eq!(svc.entity_count(), 1);
        assert_eq!(svc.sync_phase("unpushed"), Some(SyncPhase::Dirty));
    }

    #[tokio::test]
    async fn test_sync_cycle_returns_entity_to_clean() {
        let svc = service();
        svc.ingest(sample("veh-1", -74.0, 40.7, now_secs())).unwrap();

        let report = svc.sync_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(svc.sync_phase("veh-1"), Some(SyncPhase::Clean));
        assert_eq!(svc.stats().pushes, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_ingestion() {
        let svc = Arc::new(service());
        let handle = svc.spawn();
        svc.shutdown(handle).await.unwrap();

        assert!(matches!(
            svc.ingest(sample("veh-1", 0.0, 0.0, now_secs())),
            Err(TrackError::Closed)
        ));
        let viewport = Viewport::new(-1.0, -1.0, 1.0, 1.0);
        assert!(matches!(svc.render(10, &viewport), Err(TrackError::Closed)));
    }

    #[test]
    fn test_reingest_during_push_keeps_entity_dirty() {
        let svc = service();
        svc.ingest(sample("veh-1", -74.0, 40.7, now_secs())).unwrap();

        // Start a push cycle without completing it
        let records = svc.store.collect_dirty();
        assert_eq!(records.len(), 1);
        assert_eq!(svc.sync_phase("veh-1"), Some(SyncPhase::Pushing));

        svc.ingest(sample("veh-1", -74.0005, 40.7005, now_secs() + 1))
            .unwrap();
        assert_eq!(svc.sync_phase("veh-1"), Some(SyncPhase::Dirty));
    }

    #[test]
    fn test_mark_dirty_requires_known_entity() {
        let svc = service();
        assert!(matches!(
            svc.mark_dirty("ghost"),
            Err(TrackError::EntityNotFound(_))
        ));
    }
}
