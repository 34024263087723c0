//! Live location tracking engine with spatial indexing, zoom-dependent
//! map clustering, and remote synchronization.
//!
//! ```rust
//! use geotrack::{Config, Point, PositionBuffer, PositionSample};
//! use std::time::SystemTime;
//!
//! let config = Config::default();
//! let mut buffer = PositionBuffer::new(&config);
//!
//! let sample = PositionSample::new(
//!     "veh-1",
//!     Point::new(-74.0060, 40.7128),
//!     5.0,
//!     SystemTime::now(),
//! );
//! assert!(buffer.ingest(None, sample).is_accepted());
//! ```
//!
//! The full pipeline is owned by [`TrackingService`]: raw samples flow
//! through the [`PositionBuffer`] (filter/smooth), into the
//! [`SpatialIndex`] (upsert), and out through the [`ClusterEngine`] on
//! render requests, while a [`sync::SyncCoordinator`]-driven loop
//! reconciles state with a [`RemoteBackend`] on a schedule.

pub mod buffer;
pub mod cluster;
pub mod error;
pub mod index;
pub mod service;
pub mod sync;
pub mod types;

pub use error::{Result, TrackError};

pub use buffer::{EntityUpdate, Ingest, PositionBuffer, RejectReason};
pub use cluster::ClusterEngine;
pub use index::SpatialIndex;
pub use service::{ServiceHandle, TrackingService};
pub use sync::{
    CycleReport, EntityRecord, PushOutcome, RemoteBackend, RemoteEntity, RemoteError, SyncPhase,
    SyncState,
};
pub use types::{
    Cluster, Config, Entity, EntityId, PositionSample, SampleSource, TrackStats, Viewport,
};

pub use geo::Point;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Result, TrackError, TrackingService};

    pub use crate::{Cluster, Config, Entity, PositionSample, Viewport};

    pub use crate::{Ingest, PositionBuffer, RejectReason};

    pub use crate::{PushOutcome, RemoteBackend, RemoteEntity, RemoteError, SyncPhase};

    pub use geo::Point;

    pub use std::time::Duration;
}
