use async_trait::async_trait;
use geotrack::{
    Config, EntityRecord, Point, PositionSample, PushOutcome, RemoteBackend, RemoteError,
    TrackingService, Viewport,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Backend that accepts every push and has nothing to pull.
struct NullBackend;

#[async_trait]
impl RemoteBackend for NullBackend {
    async fn pull_since(
        &self,
        _since: Option<SystemTime>,
    ) -> Result<Vec<serde_json::Value>, RemoteError> {
        Ok(Vec::new())
    }

    async fn push(&self, record: &EntityRecord) -> Result<PushOutcome, RemoteError> {
        Ok(PushOutcome::Accepted {
            version: record.version + 1,
        })
    }
}

fn service(config: Config) -> TrackingService {
    TrackingService::new(config, Arc::new(NullBackend)).unwrap()
}

fn sample(id: &str, lon: f64, lat: f64, offset_secs: i64) -> PositionSample {
    let now = SystemTime::now();
    let timestamp = if offset_secs >= 0 {
        now + Duration::from_secs(offset_secs as u64)
    } else {
        now - Duration::from_secs((-offset_secs) as u64)
    };
    PositionSample::new(id, Point::new(lon, lat), 5.0, timestamp)
}

fn nyc_viewport() -> Viewport {
    Viewport::new(-75.0, 40.0, -73.0, 41.5)
}

#[test]
fn test_pipeline_ingest_to_render() {
    let svc = service(Config::default());

    // Two vehicles on the same block, one across the river, one in Paris
    svc.ingest(sample("veh-1", -74.0060, 40.7128, 0)).unwrap();
    svc.ingest(sample("veh-2", -74.0058, 40.7129, 0)).unwrap();
    svc.ingest(sample("veh-3", -73.9442, 40.6782, 0)).unwrap();
    svc.ingest(sample("paris", 2.3522, 48.8566, 0)).unwrap();

    let clusters = svc.render(12, &nyc_viewport()).unwrap();

    // Paris is outside the viewport
    let members: Vec<_> = clusters
        .iter()
        .flat_map(|c| c.members.iter().cloned())
        .collect();
    assert_eq!(members.len(), 3);
    assert!(!members.contains(&"paris".to_string()));

    // The same-block pair collapses into one cluster at zoom 12
    let pair = clusters
        .iter()
        .find(|c| c.members.contains(&"veh-1".to_string()))
        .unwrap();
    assert!(pair.members.contains(&"veh-2".to_string()));
    assert!(!pair.is_marker());

    // Partition: no entity appears twice
    let mut deduped = members.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), members.len());
}

#[test]
fn test_render_is_deterministic() {
    let svc = service(Config::default());
    for i in 0..20 {
        let lon = -74.0 + (i as f64) * 0.003;
        let lat = 40.7 + (i as f64 % 5.0) * 0.002;
        svc.ingest(sample(&format!("veh-{i:02}"), lon, lat, 0)).unwrap();
    }

    let first = svc.render(11, &nyc_viewport()).unwrap();
    let second = svc.render(11, &nyc_viewport()).unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_gps_spike_does_not_teleport_cluster() {
    let svc = service(Config::default());
    let start = Point::new(-74.0060, 40.7128);

    svc.ingest(sample("veh-1", start.x(), start.y(), 0)).unwrap();

    // ~10km jump one second later: implausible at the 70 m/s default
    let outcome = svc
        .ingest(sample("veh-1", start.x(), start.y() + 0.09, 1))
        .unwrap();
    assert!(outcome.is_accepted());

    let entity = svc.entity("veh-1").unwrap();
    let moved = geotrack::Viewport::new(
        start.x() - 0.01,
        start.y() - 0.01,
        start.x() + 0.01,
        start.y() + 0.04,
    );
    // The applied position stayed within a fraction of the spike
    assert!(moved.contains(&entity.position));

    let clusters = svc.render(12, &nyc_viewport()).unwrap();
    assert_eq!(clusters.len(), 1);
    let centroid = clusters[0].centroid;
    assert!((centroid.y() - start.y()).abs() < 0.09 * 0.5);
}

#[test]
fn test_rejected_samples_leave_no_trace() {
    let svc = service(Config::default());
    svc.ingest(sample("veh-1", -74.0, 40.7, 0)).unwrap();

    // Out of order
    let outcome = svc.ingest(sample("veh-1", -74.1, 40.8, -60)).unwrap();
    assert!(!outcome.is_accepted());
    // Low confidence
    let mut bad = sample("veh-1", -74.1, 40.8, 10);
    bad.accuracy_m = 10_000.0;
    assert!(!svc.ingest(bad).unwrap().is_accepted());

    let entity = svc.entity("veh-1").unwrap();
    assert_eq!(entity.position, Point::new(-74.0, 40.7));

    let stats = svc.stats();
    assert_eq!(stats.ingested, 1);
    assert_eq!(stats.rejected, 2);
}

#[test]
fn test_nearby_query_orders_by_distance() {
    let svc = service(Config::default());
    svc.ingest(sample("close", -74.0000, 40.7128, 0)).unwrap();
    svc.ingest(sample("closer", -74.0050, 40.7128, 0)).unwrap();
    svc.ingest(sample("far", -73.9000, 40.7128, 0)).unwrap();

    let center = Point::new(-74.0060, 40.7128);
    let hits = svc.nearby(&center, 5_000.0, 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, "closer");
    assert_eq!(hits[1].0, "close");
}

#[test]
fn test_stale_entity_excluded_until_refreshed() {
    let config = Config::default().with_stale_timeout(Duration::from_secs(30));
    let svc = service(config);

    svc.ingest(sample("idle", -74.0, 40.7, -120)).unwrap();
    svc.ingest(sample("live", -74.1, 40.6, 0)).unwrap();

    let (marked, evicted) = svc.sweep();
    assert_eq!(marked, 1);
    assert_eq!(evicted, 0);

    let members: Vec<_> = svc
        .render(10, &nyc_viewport())
        .unwrap()
        .iter()
        .flat_map(|c| c.members.clone())
        .collect();
    assert_eq!(members, vec!["live".to_string()]);

    // But the stale entity still answers radius queries
    let hits = svc
        .nearby(&Point::new(-74.0, 40.7), 1_000.0, 10)
        .unwrap();
    assert!(hits.iter().any(|(id, _)| id == "idle"));

    // A fresh sample brings it back into render output
    svc.ingest(sample("idle", -74.0, 40.7, 1)).unwrap();
    let members: Vec<_> = svc
        .render(10, &nyc_viewport())
        .unwrap()
        .iter()
        .flat_map(|c| c.members.clone())
        .collect();
    assert!(members.contains(&"idle".to_string()));
}

#[test]
fn test_markers_and_clusters_by_zoom() {
    let svc = service(Config::default());
    svc.ingest(sample("a", -74.0060, 40.7128, 0)).unwrap();
    svc.ingest(sample("b", -73.9442, 40.6782, 0)).unwrap();

    let coarse = svc.render(5, &nyc_viewport()).unwrap();
    assert_eq!(coarse.len(), 1);
    assert_eq!(coarse[0].members.len(), 2);

    let fine = svc.render(16, &nyc_viewport()).unwrap();
    assert_eq!(fine.len(), 2);
    assert!(fine.iter().all(|c| c.is_marker()));
}
