//! Error types for the tracking engine.
//!
//! Only failures that a caller can meaningfully react to surface as
//! `TrackError`. Rejected position samples are ordinary return values
//! (`Ingest::Rejected`), and index inconsistencies self-heal in place.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackError>;

/// Errors produced by the tracking engine.
#[derive(Error, Debug)]
pub enum TrackError {
    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation referenced an entity that is not tracked.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// A position could not be indexed (outside WGS84 bounds).
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// The backend returned a payload that does not parse into the
    /// expected entity-update shape. The affected entity keeps its prior
    /// state.
    #[error("Malformed backend payload: {0}")]
    MalformedPayload(String),

    /// The backend rejected our credentials. Terminal for the sync path;
    /// ingestion and rendering continue unaffected.
    #[error("Backend authentication failure")]
    AuthFailure,

    /// The tracking service has been shut down.
    #[error("Tracking service is closed")]
    Closed,
}
