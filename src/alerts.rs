//! Boundary and proximity alert evaluation.
//!
//! Every sampling cycle the engine compares the resolved milepost against the
//! active authority's limits and against cached peer positions on the same
//! track. Per boundary side and per peer, only the single tightest satisfied
//! threshold fires; looser thresholds are suppressed once a tighter one is
//! already satisfied, so one approach never produces a storm of escalating
//! severities. Each fired key enters a cooldown map and cannot fire again
//! until the cooldown elapses, even though evaluation runs every cycle.
//!
//! When authority, threshold or position data is missing, evaluation is
//! skipped for the cycle: "cannot assess" is never reported as "safe".

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::types::{
    AlertEvent, AlertLevel, AlertType, Authority, PeerPosition, ResolvedTrackPosition,
};

/// One severity step in the threshold ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThreshold {
    pub level: AlertLevel,
    pub distance_miles: f64,
}

/// Configuration for the alert engine.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Boundary thresholds, ascending by distance. The tightest satisfied
    /// entry is the one that fires.
    pub boundary_thresholds: Vec<AlertThreshold>,

    /// Proximity thresholds, ascending by distance.
    pub proximity_thresholds: Vec<AlertThreshold>,

    /// Minimum interval before the same alert key may fire again.
    /// Default: 300 seconds
    pub cooldown_seconds: i64,

    /// Peer positions older than this are ignored for proximity evaluation.
    /// Default: 600 seconds
    pub peer_stale_seconds: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        let ladder = vec![
            AlertThreshold {
                level: AlertLevel::Emergency,
                distance_miles: 0.1,
            },
            AlertThreshold {
                level: AlertLevel::Critical,
                distance_miles: 0.25,
            },
            AlertThreshold {
                level: AlertLevel::Warning,
                distance_miles: 0.5,
            },
            AlertThreshold {
                level: AlertLevel::Informational,
                distance_miles: 1.0,
            },
        ];
        Self {
            boundary_thresholds: ladder.clone(),
            proximity_thresholds: ladder,
            cooldown_seconds: 300,
            peer_stale_seconds: 600,
        }
    }
}

/// Which limit of the authority a boundary alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundarySide {
    Begin,
    End,
}

impl BoundarySide {
    fn as_str(self) -> &'static str {
        match self {
            BoundarySide::Begin => "begin",
            BoundarySide::End => "end",
        }
    }
}

/// Stateful alert engine for one tracking session.
#[derive(Debug)]
pub struct AlertEngine {
    config: AlertConfig,
    /// Emitted alert key -> time it fired. Cleared on session start.
    cooldowns: HashMap<String, DateTime<Utc>>,
}

impl AlertEngine {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            cooldowns: HashMap::new(),
        }
    }

    /// Clear the cooldown map. Called when a new session starts.
    pub fn reset(&mut self) {
        self.cooldowns.clear();
    }

    /// Staleness horizon for cached peer positions, shared with the peer
    /// cache's pruning.
    pub fn peer_stale_seconds(&self) -> i64 {
        self.config.peer_stale_seconds
    }

    /// Evaluate one cycle. `peers` holds the most recent cached position per
    /// other worker; when online the server performs this computation and the
    /// caller passes only server-pushed results through, so the local list is
    /// the offline fallback.
    pub fn evaluate(
        &mut self,
        resolved: &ResolvedTrackPosition,
        authority: &Authority,
        peers: &[PeerPosition],
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        if !authority.is_active() {
            debug!("[AlertEngine] Authority {} not active, skipping cycle", authority.id);
            return Vec::new();
        }

        let mut events = Vec::new();
        events.extend(self.evaluate_boundaries(resolved, authority, now));
        events.extend(self.evaluate_proximity(resolved, authority, peers, now));
        events
    }

    fn evaluate_boundaries(
        &mut self,
        resolved: &ResolvedTrackPosition,
        authority: &Authority,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        if self.config.boundary_thresholds.is_empty() {
            debug!("[AlertEngine] No boundary thresholds configured, skipping");
            return Vec::new();
        }

        let (low, high) = authority.limits();
        let mut events = Vec::new();

        for (side, limit) in [(BoundarySide::Begin, low), (BoundarySide::End, high)] {
            let distance = (resolved.milepost - limit).abs();
            let Some(threshold) = tightest_satisfied(&self.config.boundary_thresholds, distance)
            else {
                continue;
            };

            let key = format!("boundary:{}:{}", side.as_str(), threshold.distance_miles);
            if !self.claim_key(&key, now) {
                continue;
            }

            debug!(
                "[AlertEngine] Boundary {} at {:.2}mi fired {:?} (mp {:.2})",
                side.as_str(),
                distance,
                threshold.level,
                resolved.milepost
            );
            events.push(AlertEvent {
                key,
                alert_type: AlertType::Boundary,
                level: threshold.level,
                milepost: resolved.milepost,
                distance_miles: distance,
                related_worker_id: None,
                created_at: now,
            });
        }

        events
    }

    fn evaluate_proximity(
        &mut self,
        resolved: &ResolvedTrackPosition,
        authority: &Authority,
        peers: &[PeerPosition],
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        if self.config.proximity_thresholds.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();

        for peer in peers {
            // Own authority echoes back through the realtime channel.
            if peer.authority_id == authority.id {
                continue;
            }
            if peer.subdivision_id != authority.subdivision_id
                || peer.track_type != authority.track_type
                || peer.track_number != authority.track_number
            {
                continue;
            }
            if now - peer.updated_at > Duration::seconds(self.config.peer_stale_seconds) {
                debug!(
                    "[AlertEngine] Peer {} position stale, skipping",
                    peer.worker_id
                );
                continue;
            }

            // Flat milepost difference; richer track-walked distance is a
            // server-side concern.
            let distance = (resolved.milepost - peer.milepost).abs();
            let Some(threshold) = tightest_satisfied(&self.config.proximity_thresholds, distance)
            else {
                continue;
            };

            // Keyed per peer authority so a third worker neither suppresses
            // nor duplicates alerts for a second.
            let key = format!(
                "proximity:{}:{}",
                peer.authority_id, threshold.distance_miles
            );
            if !self.claim_key(&key, now) {
                continue;
            }

            debug!(
                "[AlertEngine] Proximity to {} at {:.2}mi fired {:?}",
                peer.worker_id, distance, threshold.level
            );
            events.push(AlertEvent {
                key,
                alert_type: AlertType::Proximity,
                level: threshold.level,
                milepost: resolved.milepost,
                distance_miles: distance,
                related_worker_id: Some(peer.worker_id.clone()),
                created_at: now,
            });
        }

        events
    }

    /// Record `key` as fired unless it is still cooling down.
    fn claim_key(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        if let Some(fired_at) = self.cooldowns.get(key) {
            if now - *fired_at < Duration::seconds(self.config.cooldown_seconds) {
                return false;
            }
        }
        self.cooldowns.insert(key.to_string(), now);
        true
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

/// The tightest (smallest-distance) threshold whose distance is still
/// satisfied. Thresholds are ascending, so the first match wins.
fn tightest_satisfied(thresholds: &[AlertThreshold], distance: f64) -> Option<AlertThreshold> {
    thresholds
        .iter()
        .find(|t| distance <= t.distance_miles)
        .copied()
}
