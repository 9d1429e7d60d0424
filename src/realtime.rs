//! Typed boundary for the bidirectional realtime channel.
//!
//! The socket transport itself lives outside this crate; the host feeds
//! decoded inbound events in and ships outbound events out. Inbound peer
//! locations are consumed purely as a cache update for the local proximity
//! fallback; server-pushed alerts pass through untouched for the alert
//! surface.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{AlertEvent, PeerPosition};

/// Events the pipeline emits over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundRealtime {
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        authority_id: String,
        latitude: f64,
        longitude: f64,
        milepost: Option<f64>,
        speed_mps: f64,
        heading_degrees: f64,
        recorded_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ProximityCheckRequest { authority_id: String },
}

/// Events the server pushes to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundRealtime {
    /// Server-side alert decision (e.g. server-computed proximity while
    /// online). Passed through to the alert surface and log.
    Alert(AlertEvent),
    /// Another worker's authority overlaps ours.
    #[serde(rename_all = "camelCase")]
    AuthorityOverlap {
        authority_id: String,
        other_authority_id: String,
        overlap_begin_milepost: f64,
        overlap_end_milepost: f64,
    },
    /// Another worker's position changed; cache it for offline proximity.
    PeerLocationUpdate(PeerPosition),
}

/// Last-known peer positions keyed by authority id. Read-only data for the
/// alert engine; only inbound realtime events mutate it.
#[derive(Debug, Default)]
pub struct PeerCache {
    peers: HashMap<String, PeerPosition>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one peer update, keeping only the newest per authority.
    pub fn update(&mut self, peer: PeerPosition) {
        match self.peers.get(&peer.authority_id) {
            Some(existing) if existing.updated_at > peer.updated_at => {
                debug!(
                    "[PeerCache] Dropped out-of-order update for {}",
                    peer.authority_id
                );
            }
            _ => {
                self.peers.insert(peer.authority_id.clone(), peer);
            }
        }
    }

    /// Remove a peer whose authority ended.
    pub fn remove(&mut self, authority_id: &str) {
        self.peers.remove(authority_id);
    }

    /// Drop entries older than `max_age`.
    pub fn prune(&mut self, now: DateTime<Utc>, max_age: Duration) {
        self.peers.retain(|_, p| now - p.updated_at <= max_age);
    }

    /// Current peer list for proximity evaluation.
    pub fn snapshot(&self) -> Vec<PeerPosition> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackType;
    use chrono::TimeZone;

    fn peer(authority_id: &str, milepost: f64, updated_at: DateTime<Utc>) -> PeerPosition {
        PeerPosition {
            worker_id: "worker-2".to_string(),
            authority_id: authority_id.to_string(),
            subdivision_id: "sub-1".to_string(),
            track_type: TrackType::Main,
            track_number: 1,
            milepost,
            latitude: 40.0,
            longitude: -100.0,
            updated_at,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_update_keeps_newest_per_authority() {
        let mut cache = PeerCache::new();
        cache.update(peer("auth-2", 4.0, now()));
        cache.update(peer("auth-2", 4.5, now() + Duration::seconds(10)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot()[0].milepost, 4.5);

        // Out-of-order update is dropped.
        cache.update(peer("auth-2", 3.0, now() - Duration::seconds(60)));
        assert_eq!(cache.snapshot()[0].milepost, 4.5);
    }

    #[test]
    fn test_prune_drops_stale_entries() {
        let mut cache = PeerCache::new();
        cache.update(peer("auth-2", 4.0, now() - Duration::seconds(700)));
        cache.update(peer("auth-3", 5.0, now() - Duration::seconds(10)));
        cache.prune(now(), Duration::seconds(600));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot()[0].authority_id, "auth-3");
    }

    #[test]
    fn test_remove_on_authority_end() {
        let mut cache = PeerCache::new();
        cache.update(peer("auth-2", 4.0, now()));
        cache.remove("auth-2");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_inbound_event_round_trip() {
        let event = InboundRealtime::PeerLocationUpdate(peer("auth-2", 4.0, now()));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"peerLocationUpdate\""));
        let parsed: InboundRealtime = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_outbound_location_update_serializes_camel_case() {
        let event = OutboundRealtime::LocationUpdate {
            authority_id: "auth-1".to_string(),
            latitude: 40.0,
            longitude: -100.0,
            milepost: Some(10.4),
            speed_mps: 1.2,
            heading_degrees: 90.0,
            recorded_at: now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"authorityId\":\"auth-1\""));
        assert!(json.contains("\"type\":\"locationUpdate\""));
    }
}
