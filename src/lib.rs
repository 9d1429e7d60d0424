//! # Railguard
//!
//! Offline-first GPS tracking and safety alerting core for rail workers.
//!
//! This library provides:
//! - GPS sample smoothing over a sliding window with glitch rejection
//! - Milepost resolution against cached track reference geometry
//! - Boundary and proximity alerting with cooldown-based deduplication
//! - SQLite persistence with a durable offline sync queue
//! - HTTP client and realtime event types for the remote tracking service
//!
//! The host application owns the platform pieces (location provider,
//! reachability, socket transport) and drives [`TrackingPipeline`] with raw
//! fixes; everything derived flows through the local store before it ever
//! reaches the network.
//!
//! ## Quick Start
//!
//! ```rust
//! use railguard::{RawFix, SampleSmoother, SmootherConfig};
//! use chrono::Utc;
//!
//! let mut smoother = SampleSmoother::new(SmootherConfig::default());
//! let fix = RawFix {
//!     latitude: 40.0,
//!     longitude: -100.0,
//!     altitude: None,
//!     accuracy_meters: 5.0,
//!     speed_mps: 1.2,
//!     heading_degrees: 270.0,
//!     timestamp: Utc::now(),
//! };
//!
//! let position = smoother.smooth(fix).expect("first valid fix yields a position");
//! assert_eq!(position.latitude, 40.0);
//! ```

pub mod error;
pub use error::{RailguardError, Result};

// Core data model shared by every stage
pub mod types;
pub use types::{
    AlertEvent, AlertLevel, AlertType, Authority, AuthorityStatus, DroppedPin, EntityKind,
    PeerPosition, RawFix, ResolvedTrackPosition, SmoothedPosition, SyncOperation, SyncQueueItem,
    SyncStatus, TrackReferencePoint, TrackType, WorkerProfile,
};

// Geodesy helpers
pub mod geo_utils;
pub use geo_utils::{haversine_distance, meters_to_miles, METERS_PER_MILE};

// GPS sample smoothing
pub mod smoother;
pub use smoother::{SampleSmoother, SmootherConfig};

// Milepost resolution against cached reference geometry
pub mod resolver;
pub use resolver::{resolve, ResolverConfig};

// Boundary and proximity alert evaluation
pub mod alerts;
pub use alerts::{AlertConfig, AlertEngine, AlertThreshold};

// SQLite persistence and sync queue storage
pub mod persistence;
pub use persistence::{LocalStore, SyncCounts};

// HTTP client for the remote tracking service
pub mod http;
pub use http::{
    AlertSubmission, PinSubmission, PositionSubmission, RemoteClient, SyncBatchEntry,
};

// Realtime channel types and peer cache
pub mod realtime;
pub use realtime::{InboundRealtime, OutboundRealtime, PeerCache};

// Offline sync queue drain
pub mod sync;
pub use sync::{DrainReport, SyncConfig, SyncTransport, SyncWorker};

// Tracking orchestration
pub mod tracker;
pub use tracker::{
    run_uplink, ConnectivityState, FixOutcome, OutboundUpdate, PermissionStatus, PipelineConfig,
    SamplingMode, TrackingPipeline,
};
