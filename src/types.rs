//! Core data model for the tracking and alerting pipeline.
//!
//! These types are the contract between the pipeline stages, the persistence
//! layer, and the remote service payloads. Enums that round-trip through
//! SQLite carry `as_str`/`parse` helpers so an unknown string surfaces as a
//! `Parse` error instead of a panic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RailguardError, Result};

// ============================================================================
// Position Types
// ============================================================================

/// A raw GPS fix as delivered by the device location provider.
///
/// Accuracy may be zero/negative (invalid) or very large (unreliable); the
/// smoother is responsible for rejecting garbage, not the producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_meters: f64,
    /// Instantaneous speed in m/s.
    pub speed_mps: f64,
    /// Heading in degrees clockwise from true north.
    pub heading_degrees: f64,
    pub timestamp: DateTime<Utc>,
}

impl RawFix {
    /// Check whether latitude/longitude are finite and in range.
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Output of the sample smoother. Immutable once produced; superseded by the
/// next sample, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmoothedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_meters: f64,
    /// Taken from the latest sample, not averaged.
    pub speed_mps: f64,
    /// Taken from the latest sample, not averaged.
    pub heading_degrees: f64,
    pub timestamp: DateTime<Utc>,
    /// True when more than one sample contributed to the average.
    pub smoothed: bool,
    /// Number of window samples that contributed; confidence signal for
    /// downstream consumers.
    pub sample_count: u32,
}

// ============================================================================
// Track Geometry Types
// ============================================================================

/// Track classification for a reference point or authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackType {
    Main,
    Siding,
    Yard,
    Industrial,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Main => "main",
            TrackType::Siding => "siding",
            TrackType::Yard => "yard",
            TrackType::Industrial => "industrial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(TrackType::Main),
            "siding" => Ok(TrackType::Siding),
            "yard" => Ok(TrackType::Yard),
            "industrial" => Ok(TrackType::Industrial),
            other => Err(RailguardError::Parse(format!(
                "unknown track type '{other}'"
            ))),
        }
    }
}

/// A known (milepost, lat, lon, track) tuple along a subdivision, used to
/// interpolate a worker's milepost from GPS. Loaded read-only from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackReferencePoint {
    pub subdivision_id: String,
    pub milepost: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub track_type: TrackType,
    pub track_number: u32,
}

/// A position expressed in linear track coordinates. `None` from the resolver
/// means "not currently on any known track".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTrackPosition {
    pub milepost: f64,
    pub track_type: TrackType,
    pub track_number: u32,
    pub distance_from_track_meters: f64,
}

// ============================================================================
// Authority Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorityStatus {
    Active,
    Ended,
}

impl AuthorityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityStatus::Active => "active",
            AuthorityStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AuthorityStatus::Active),
            "ended" => Ok(AuthorityStatus::Ended),
            other => Err(RailguardError::Parse(format!(
                "unknown authority status '{other}'"
            ))),
        }
    }
}

/// A time-bounded permission granting a worker occupancy of a track segment
/// between two mileposts. Exactly one Active authority owns the current
/// tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authority {
    pub id: String,
    pub subdivision_id: String,
    pub track_type: TrackType,
    pub track_number: u32,
    pub begin_milepost: f64,
    pub end_milepost: f64,
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub status: AuthorityStatus,
}

impl Authority {
    pub fn is_active(&self) -> bool {
        self.status == AuthorityStatus::Active
    }

    /// Lower/upper milepost limits regardless of the order they were entered.
    pub fn limits(&self) -> (f64, f64) {
        if self.begin_milepost <= self.end_milepost {
            (self.begin_milepost, self.end_milepost)
        } else {
            (self.end_milepost, self.begin_milepost)
        }
    }
}

// ============================================================================
// Alert Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertType {
    Boundary,
    Proximity,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Boundary => "boundary",
            AlertType::Proximity => "proximity",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "boundary" => Ok(AlertType::Boundary),
            "proximity" => Ok(AlertType::Proximity),
            other => Err(RailguardError::Parse(format!(
                "unknown alert type '{other}'"
            ))),
        }
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertLevel {
    Informational,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Informational => "informational",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "informational" => Ok(AlertLevel::Informational),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            "emergency" => Ok(AlertLevel::Emergency),
            other => Err(RailguardError::Parse(format!(
                "unknown alert level '{other}'"
            ))),
        }
    }
}

/// An alert decided by the alert engine. A given `key` fires at most once per
/// cooldown window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Deduplication identity: boundary side + threshold, or peer authority
    /// + threshold.
    pub key: String,
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub milepost: f64,
    /// Distance to the boundary or peer, in miles.
    pub distance_miles: f64,
    pub related_worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Sync Queue Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Position,
    Alert,
    Pin,
    Authority,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Position => "position",
            EntityKind::Alert => "alert",
            EntityKind::Pin => "pin",
            EntityKind::Authority => "authority",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "position" => Ok(EntityKind::Position),
            "alert" => Ok(EntityKind::Alert),
            "pin" => Ok(EntityKind::Pin),
            "authority" => Ok(EntityKind::Authority),
            other => Err(RailguardError::Parse(format!(
                "unknown entity kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOperation {
    Insert,
    Update,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Insert => "insert",
            SyncOperation::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(SyncOperation::Insert),
            "update" => Ok(SyncOperation::Update),
            other => Err(RailguardError::Parse(format!(
                "unknown sync operation '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(RailguardError::Parse(format!(
                "unknown sync status '{other}'"
            ))),
        }
    }
}

/// A durable record of locally generated data awaiting remote submission.
/// Never deleted before reaching Synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub status: SyncStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Pins and Peers
// ============================================================================

/// The locally cached signed-in worker. Single-row record; the
/// authentication layer owns how it gets here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub worker_id: String,
    pub display_name: String,
}

/// A user-dropped map pin; generated locally, reaches the server through the
/// sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedPin {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Last-known position of another worker, cached from realtime peer updates
/// and used for offline proximity evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPosition {
    pub worker_id: String,
    pub authority_id: String,
    pub subdivision_id: String,
    pub track_type: TrackType,
    pub track_number: u32,
    pub milepost: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}
