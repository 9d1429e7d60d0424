//! Tracking orchestrator: owns the per-fix pipeline and session lifecycle.
//!
//! Each raw fix runs Smoother -> Resolver -> Alert Engine synchronously and
//! in order; no two fixes are ever processed concurrently because all mutable
//! pipeline state lives behind `&mut self`. Network work is handed to an
//! uplink worker over a channel and never blocks the sampling path: a slow or
//! hung remote call degrades to "keep queuing locally", never to "stop
//! processing GPS".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::alerts::{AlertConfig, AlertEngine};
use crate::error::{RailguardError, Result};
use crate::http::{AlertSubmission, PinSubmission, PositionSubmission, RemoteClient};
use crate::persistence::LocalStore;
use crate::realtime::{InboundRealtime, OutboundRealtime, PeerCache};
use crate::resolver::{resolve, ResolverConfig};
use crate::smoother::{SampleSmoother, SmootherConfig};
use crate::types::{
    AlertEvent, Authority, AuthorityStatus, DroppedPin, EntityKind, RawFix,
    ResolvedTrackPosition, SmoothedPosition, SyncOperation, TrackReferencePoint,
};

static PIN_SEQ: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

/// Shared online/offline flag, flipped by the host's reachability monitor
/// and read by the pipeline and sync worker.
#[derive(Debug, Default)]
pub struct ConnectivityState {
    online: AtomicBool,
}

impl ConnectivityState {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

/// Platform location permission as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Foreground vs. reduced-rate background sampling. The two never run
/// concurrently for one session; starting foreground replaces background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Foreground,
    Background,
}

/// Work handed to the uplink worker. Produced by the pipeline, consumed off
/// the sampling path.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundUpdate {
    Position { log_id: i64, submission: PositionSubmission },
    Alert(AlertSubmission),
    Pin(PinSubmission),
    Realtime(OutboundRealtime),
}

/// Result of processing one raw fix.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// The fix was rejected before any valid position existed.
    NoPosition,
    /// Position known but not on any known track; boundary and proximity
    /// evaluation suppressed for this cycle.
    OffTrack(SmoothedPosition),
    /// Full cycle: resolved milepost plus any alerts that fired.
    Resolved {
        position: SmoothedPosition,
        track: ResolvedTrackPosition,
        alerts: Vec<AlertEvent>,
    },
    /// Cycle skipped: no session, or an internal failure that was logged.
    Skipped,
}

/// Pipeline tuning knobs, one sub-config per stage.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub smoother: SmootherConfig,
    pub resolver: ResolverConfig,
    pub alerts: AlertConfig,
}

/// The per-session tracking pipeline.
///
/// Constructed by the application context at session start and torn down at
/// session end; nothing here is a global.
pub struct TrackingPipeline {
    store: Arc<Mutex<LocalStore>>,
    connectivity: Arc<ConnectivityState>,
    uplink: Option<UnboundedSender<OutboundUpdate>>,

    smoother: SampleSmoother,
    alert_engine: AlertEngine,
    resolver_config: ResolverConfig,

    reference_points: Vec<TrackReferencePoint>,
    authority: Option<Authority>,
    peers: PeerCache,
    sampling_mode: Option<SamplingMode>,
    realtime_connected: bool,
}

impl TrackingPipeline {
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        connectivity: Arc<ConnectivityState>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            connectivity,
            uplink: None,
            smoother: SampleSmoother::new(config.smoother),
            alert_engine: AlertEngine::new(config.alerts),
            resolver_config: config.resolver,
            reference_points: Vec::new(),
            authority: None,
            peers: PeerCache::new(),
            sampling_mode: None,
            realtime_connected: false,
        }
    }

    /// Attach the channel to the uplink worker (see [`run_uplink`]).
    pub fn set_uplink(&mut self, sender: UnboundedSender<OutboundUpdate>) {
        self.uplink = Some(sender);
    }

    /// Host callback for realtime channel connect/disconnect. On connect,
    /// asks the server to re-run proximity evaluation so anything missed
    /// while offline is surfaced immediately.
    pub fn set_realtime_connected(&mut self, connected: bool) {
        let was_connected = self.realtime_connected;
        self.realtime_connected = connected;
        if connected && !was_connected {
            if let Some(authority) = self.authority.clone() {
                self.try_uplink(OutboundUpdate::Realtime(
                    OutboundRealtime::ProximityCheckRequest {
                        authority_id: authority.id,
                    },
                ));
            }
        }
    }

    pub fn current_authority(&self) -> Option<&Authority> {
        self.authority.as_ref()
    }

    pub fn sampling_mode(&self) -> Option<SamplingMode> {
        self.sampling_mode
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Start tracking under an Active authority.
    ///
    /// Denied location permission is fatal here so the caller can prompt;
    /// tracking never silently starts degraded. Starting foreground while a
    /// background subscription exists replaces it.
    pub fn start(
        &mut self,
        authority: Authority,
        mode: SamplingMode,
        permission: PermissionStatus,
    ) -> Result<()> {
        if permission == PermissionStatus::Denied {
            return Err(RailguardError::PermissionDenied(
                "location access is required to start tracking".to_string(),
            ));
        }
        if !authority.is_active() {
            return Err(RailguardError::NoActiveAuthority(format!(
                "authority {} is not active",
                authority.id
            )));
        }

        if let Some(previous) = self.sampling_mode {
            info!(
                "[TrackingPipeline] Replacing {previous:?} sampling with {mode:?} for authority {}",
                authority.id
            );
        }

        // Fresh session: never blend positions or cooldowns across sessions.
        self.smoother.reset();
        self.alert_engine.reset();

        {
            let store = self.store.lock().unwrap();
            store.save_current_authority(&authority)?;
        }
        self.reference_points = {
            let store = self.store.lock().unwrap();
            store.load_reference_points(&authority.subdivision_id)?
        };
        if self.reference_points.is_empty() {
            warn!(
                "[TrackingPipeline] No cached reference points for subdivision {}, positions will stay unresolved",
                authority.subdivision_id
            );
        }

        info!(
            "[TrackingPipeline] Started {mode:?} tracking for authority {} (mp {:.2}-{:.2})",
            authority.id, authority.begin_milepost, authority.end_milepost
        );
        self.authority = Some(authority);
        self.sampling_mode = Some(mode);
        Ok(())
    }

    /// Stop tracking: clears all in-memory session state, cancels nothing
    /// that is already durably queued, and leaves persisted history intact.
    pub fn stop(&mut self) {
        if let Some(authority) = &self.authority {
            info!("[TrackingPipeline] Stopped tracking for authority {}", authority.id);
        }
        self.smoother.reset();
        self.alert_engine.reset();
        self.reference_points.clear();
        self.peers.clear();
        self.authority = None;
        self.sampling_mode = None;
    }

    /// End the current authority: persist the Ended status, queue the status
    /// change for the server, and stop the session.
    pub fn end_authority(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(authority) = self.authority.take() else {
            return Err(RailguardError::NoActiveAuthority(
                "no tracking session to end".to_string(),
            ));
        };

        let ended = Authority {
            status: AuthorityStatus::Ended,
            ..authority
        };
        {
            let store = self.store.lock().unwrap();
            store.save_current_authority(&ended)?;
            store.enqueue_sync(
                EntityKind::Authority,
                SyncOperation::Update,
                &serde_json::to_value(&ended)?,
                now,
            )?;
        }
        info!("[TrackingPipeline] Ended authority {}", ended.id);
        self.stop();
        Ok(())
    }

    // ========================================================================
    // Per-fix pipeline
    // ========================================================================

    /// Process one raw fix through the full pipeline.
    ///
    /// Internal failures never propagate to the host's location callback:
    /// they are logged and the cycle is skipped.
    pub fn process_fix(&mut self, raw: RawFix) -> FixOutcome {
        match self.process_fix_inner(raw) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[TrackingPipeline] Cycle skipped: {e}");
                FixOutcome::Skipped
            }
        }
    }

    fn process_fix_inner(&mut self, raw: RawFix) -> Result<FixOutcome> {
        let Some(authority) = self.authority.clone() else {
            debug!("[TrackingPipeline] Fix received with no session, skipping");
            return Ok(FixOutcome::Skipped);
        };

        let Some(position) = self.smoother.smooth(raw) else {
            return Ok(FixOutcome::NoPosition);
        };

        let resolved = resolve(&position, &self.reference_points, &self.resolver_config);

        // The engine skips evaluation off-track; "cannot assess" is not
        // "safe".
        let alerts = match &resolved {
            Some(track) => {
                self.peers.prune(
                    position.timestamp,
                    chrono::Duration::seconds(self.alert_engine.peer_stale_seconds()),
                );
                let peers = self.peers.snapshot();
                self.alert_engine
                    .evaluate(track, &authority, &peers, position.timestamp)
            }
            None => Vec::new(),
        };

        let log_id = {
            let store = self.store.lock().unwrap();
            let log_id = store.append_gps_log(&authority.id, &position, resolved.as_ref())?;
            for alert in &alerts {
                store.append_alert_log(alert)?;
            }
            log_id
        };

        self.dispatch_position(&authority, &position, resolved.as_ref(), log_id)?;
        for alert in &alerts {
            self.dispatch_alert(alert)?;
        }

        Ok(match resolved {
            Some(track) => FixOutcome::Resolved {
                position,
                track,
                alerts,
            },
            None => FixOutcome::OffTrack(position),
        })
    }

    fn dispatch_position(
        &mut self,
        authority: &Authority,
        position: &SmoothedPosition,
        resolved: Option<&ResolvedTrackPosition>,
        log_id: i64,
    ) -> Result<()> {
        let submission = PositionSubmission {
            authority_id: authority.id.clone(),
            latitude: position.latitude,
            longitude: position.longitude,
            speed_mps: position.speed_mps,
            heading_degrees: position.heading_degrees,
            accuracy_meters: position.accuracy_meters,
            milepost: resolved.map(|r| r.milepost),
            recorded_at: position.timestamp.timestamp(),
        };

        if self.try_uplink(OutboundUpdate::Position {
            log_id,
            submission: submission.clone(),
        }) {
            if self.realtime_connected {
                self.try_uplink(OutboundUpdate::Realtime(OutboundRealtime::LocationUpdate {
                    authority_id: authority.id.clone(),
                    latitude: position.latitude,
                    longitude: position.longitude,
                    milepost: resolved.map(|r| r.milepost),
                    speed_mps: position.speed_mps,
                    heading_degrees: position.heading_degrees,
                    recorded_at: position.timestamp,
                }));
            }
            return Ok(());
        }

        let store = self.store.lock().unwrap();
        store.enqueue_sync(
            EntityKind::Position,
            SyncOperation::Insert,
            &serde_json::to_value(&submission)?,
            position.timestamp,
        )?;
        Ok(())
    }

    fn dispatch_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        let submission = AlertSubmission {
            alert_key: alert.key.clone(),
            alert_type: alert.alert_type.as_str().to_string(),
            level: alert.level.as_str().to_string(),
            milepost: alert.milepost,
            distance_miles: alert.distance_miles,
            related_worker_id: alert.related_worker_id.clone(),
            created_at: alert.created_at.timestamp(),
        };

        if self.try_uplink(OutboundUpdate::Alert(submission.clone())) {
            return Ok(());
        }

        let store = self.store.lock().unwrap();
        store.enqueue_sync(
            EntityKind::Alert,
            SyncOperation::Insert,
            &serde_json::to_value(&submission)?,
            alert.created_at,
        )?;
        Ok(())
    }

    /// Attempt to hand an update to the uplink worker. False when offline or
    /// the worker is gone; the caller falls back to the sync queue.
    fn try_uplink(&mut self, update: OutboundUpdate) -> bool {
        if !self.connectivity.is_online() {
            return false;
        }
        match &self.uplink {
            Some(sender) => {
                if sender.send(update).is_ok() {
                    true
                } else {
                    debug!("[TrackingPipeline] Uplink worker gone, queuing locally");
                    self.uplink = None;
                    false
                }
            }
            None => false,
        }
    }

    // ========================================================================
    // Realtime inbound
    // ========================================================================

    /// Apply one inbound realtime event. Returns a server-pushed alert for
    /// the host's alert surface when one arrived.
    pub fn handle_inbound(&mut self, event: InboundRealtime) -> Result<Option<AlertEvent>> {
        match event {
            InboundRealtime::PeerLocationUpdate(peer) => {
                debug!(
                    "[TrackingPipeline] Peer {} now at mp {:.2}",
                    peer.worker_id, peer.milepost
                );
                self.peers.update(peer);
                Ok(None)
            }
            InboundRealtime::Alert(alert) => {
                let store = self.store.lock().unwrap();
                store.append_alert_log(&alert)?;
                Ok(Some(alert))
            }
            InboundRealtime::AuthorityOverlap {
                authority_id,
                other_authority_id,
                overlap_begin_milepost,
                overlap_end_milepost,
            } => {
                warn!(
                    "[TrackingPipeline] Authority {authority_id} overlaps {other_authority_id} (mp {overlap_begin_milepost:.2}-{overlap_end_milepost:.2})"
                );
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Pins
    // ========================================================================

    /// Drop a pin at the given location. Persisted locally first; reaches
    /// the server via uplink or queue.
    pub fn drop_pin(
        &mut self,
        latitude: f64,
        longitude: f64,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<DroppedPin> {
        let seq = PIN_SEQ.fetch_add(1, Ordering::Relaxed);
        let pin = DroppedPin {
            id: format!("pin_{}_{}", now.timestamp_millis(), seq),
            latitude,
            longitude,
            label: label.to_string(),
            created_at: now,
        };

        {
            let store = self.store.lock().unwrap();
            store.insert_pin(&pin)?;
        }

        let submission = PinSubmission {
            id: pin.id.clone(),
            latitude,
            longitude,
            label: pin.label.clone(),
            created_at: now.timestamp(),
        };
        if !self.try_uplink(OutboundUpdate::Pin(submission.clone())) {
            let store = self.store.lock().unwrap();
            store.enqueue_sync(
                EntityKind::Pin,
                SyncOperation::Insert,
                &serde_json::to_value(&submission)?,
                now,
            )?;
        }

        Ok(pin)
    }
}

// ============================================================================
// Uplink worker
// ============================================================================

/// Consume outbound updates and push them to the remote service. Any failed
/// push is converted to a sync-queue item, so the worst case degrades to the
/// offline path rather than losing the record. Runs until the pipeline drops
/// its sender.
pub async fn run_uplink(
    mut rx: UnboundedReceiver<OutboundUpdate>,
    client: RemoteClient,
    store: Arc<Mutex<LocalStore>>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            OutboundUpdate::Position { log_id, submission } => {
                match client.submit_position(&submission).await {
                    Ok(()) => {
                        let store = store.lock().unwrap();
                        if let Err(e) = store.mark_gps_log_synced(log_id) {
                            warn!("[Uplink] Failed to mark gps log {log_id} synced: {e}");
                        }
                    }
                    Err(e) => {
                        debug!("[Uplink] Position push failed ({e}), queuing");
                        enqueue_fallback(
                            &store,
                            EntityKind::Position,
                            &serde_json::to_value(&submission).unwrap_or_default(),
                        );
                    }
                }
            }
            OutboundUpdate::Alert(submission) => {
                if let Err(e) = client.submit_alert_log(&submission).await {
                    debug!("[Uplink] Alert push failed ({e}), queuing");
                    enqueue_fallback(
                        &store,
                        EntityKind::Alert,
                        &serde_json::to_value(&submission).unwrap_or_default(),
                    );
                }
            }
            OutboundUpdate::Pin(submission) => {
                if let Err(e) = client.submit_pin(&submission).await {
                    debug!("[Uplink] Pin push failed ({e}), queuing");
                    enqueue_fallback(
                        &store,
                        EntityKind::Pin,
                        &serde_json::to_value(&submission).unwrap_or_default(),
                    );
                }
            }
            OutboundUpdate::Realtime(event) => {
                // Realtime transport lives in the host; a disconnected
                // channel already stops these at the pipeline.
                debug!("[Uplink] Realtime event ready for broadcast: {event:?}");
            }
        }
    }
    info!("[Uplink] Channel closed, worker exiting");
}

fn enqueue_fallback(
    store: &Arc<Mutex<LocalStore>>,
    kind: EntityKind,
    payload: &serde_json::Value,
) {
    let store = store.lock().unwrap();
    if let Err(e) = store.enqueue_sync(kind, SyncOperation::Insert, payload, Utc::now()) {
        warn!("[Uplink] Failed to queue {kind:?} after push failure: {e}");
    }
}
