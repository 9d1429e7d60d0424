//! End-to-end pipeline scenarios.
//!
//! Drives the full chain with synthetic fixes: smoothing -> milepost
//! resolution -> alert evaluation -> persistence, against a file-backed
//! store so restart recovery is covered too.
//!
//! Run with: `cargo test --test pipeline_scenarios`

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use railguard::{
    Authority, AuthorityStatus, AlertLevel, ConnectivityState, FixOutcome, LocalStore,
    PermissionStatus, PipelineConfig, RawFix, SamplingMode, TrackReferencePoint, TrackType,
    TrackingPipeline, WorkerProfile,
};

// Straight north-south track: milepost i sits at latitude 40.0 + i * 0.01.
fn reference_points() -> Vec<TrackReferencePoint> {
    (0..=20)
        .map(|i| TrackReferencePoint {
            subdivision_id: "sub-1".to_string(),
            milepost: i as f64,
            latitude: 40.0 + i as f64 * 0.01,
            longitude: -100.0,
            track_type: TrackType::Main,
            track_number: 1,
        })
        .collect()
}

fn authority() -> Authority {
    Authority {
        id: "auth-1".to_string(),
        subdivision_id: "sub-1".to_string(),
        track_type: TrackType::Main,
        track_number: 1,
        begin_milepost: 1.0,
        end_milepost: 7.0,
        owner_id: "worker-1".to_string(),
        started_at: start_time(),
        status: AuthorityStatus::Active,
    }
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn fix(milepost: f64, at: DateTime<Utc>) -> RawFix {
    RawFix {
        latitude: 40.0 + milepost * 0.01,
        longitude: -100.0,
        altitude: None,
        accuracy_meters: 5.0,
        speed_mps: 1.4,
        heading_degrees: 180.0,
        timestamp: at,
    }
}

/// Helper: file-backed store with cached geometry and a signed-in worker.
fn setup_store(dir: &TempDir) -> Arc<Mutex<LocalStore>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db_path = dir.path().join("railguard.db");
    let mut store = LocalStore::new(db_path.to_str().unwrap()).expect("failed to open store");
    store
        .save_current_user(&WorkerProfile {
            worker_id: "worker-1".to_string(),
            display_name: "J. Doe".to_string(),
        })
        .unwrap();
    store
        .cache_reference_points("sub-1", &reference_points())
        .unwrap();
    Arc::new(Mutex::new(store))
}

fn setup_pipeline(store: &Arc<Mutex<LocalStore>>, online: bool) -> TrackingPipeline {
    let connectivity = Arc::new(ConnectivityState::new(online));
    let mut pipeline =
        TrackingPipeline::new(Arc::clone(store), connectivity, PipelineConfig::default());
    pipeline
        .start(authority(), SamplingMode::Foreground, PermissionStatus::Granted)
        .unwrap();
    pipeline
}

// ============================================================================
// Scenario: walking toward the authority begin limit
// ============================================================================

#[test]
fn test_walk_toward_boundary_escalates_each_level_once() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let mut pipeline = setup_pipeline(&store, false);

    // Dwell five fixes per waypoint so the smoothing window converges on
    // each spot before moving on. 40s spacing keeps the implied transit
    // speed plausible while the time spent inside any one severity band
    // stays below the alert cooldown, so no key expires mid-walk.
    let waypoints = [4.0, 3.0, 2.0, 1.5, 1.25, 1.05];
    let mut fired = Vec::new();
    let mut cycle = 0i64;
    for &wp in &waypoints {
        for _ in 0..5 {
            let at = start_time() + Duration::seconds(cycle * 40);
            cycle += 1;
            match pipeline.process_fix(fix(wp, at)) {
                FixOutcome::Resolved { alerts, .. } => fired.extend(alerts),
                other => panic!("expected resolved outcome at mp {wp}, got {other:?}"),
            }
        }
    }

    // One alert per severity band, in escalating order, despite thirty
    // evaluation cycles.
    let levels: Vec<AlertLevel> = fired.iter().map(|a| a.level).collect();
    assert_eq!(
        levels,
        vec![
            AlertLevel::Informational,
            AlertLevel::Warning,
            AlertLevel::Critical,
            AlertLevel::Emergency,
        ]
    );
    for alert in &fired {
        assert!(alert.key.starts_with("boundary:begin:"));
        assert!(alert.related_worker_id.is_none());
    }

    // Every cycle persisted a position; every alert persisted too.
    let guard = store.lock().unwrap();
    assert_eq!(guard.gps_log_count().unwrap(), 30);
    assert_eq!(guard.load_alert_log().unwrap().len(), 4);
    // Offline: 30 positions + 4 alerts durably queued.
    assert_eq!(guard.sync_counts().unwrap().pending, 34);
}

// ============================================================================
// Scenario: off-track excursion and return
// ============================================================================

#[test]
fn test_off_track_excursion_suppresses_then_recovers() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let mut pipeline = setup_pipeline(&store, false);

    let on_track = pipeline.process_fix(fix(4.0, start_time()));
    assert!(matches!(on_track, FixOutcome::Resolved { .. }));

    // Wander ~400m east of the centerline: resolvable position, no track.
    let off = RawFix {
        longitude: -99.9953,
        ..fix(4.0, start_time() + Duration::seconds(60))
    };
    let outcome = pipeline.process_fix(off);
    let FixOutcome::OffTrack(position) = outcome else {
        panic!("expected off-track outcome, got {outcome:?}");
    };
    assert!(position.longitude > -100.0);

    // Back on the centerline the resolver picks the milepost up again.
    // (The smoothing window still carries the excursion, so allow a few
    // cycles to converge.)
    let mut last = None;
    for i in 0..5 {
        let at = start_time() + Duration::seconds(120 + i * 60);
        last = Some(pipeline.process_fix(fix(4.0, at)));
    }
    let FixOutcome::Resolved { track, .. } = last.unwrap() else {
        panic!("expected recovery to a resolved outcome");
    };
    assert!((track.milepost - 4.0).abs() < 0.05);

    // Off-track cycles are still persisted, with no milepost.
    assert_eq!(store.lock().unwrap().gps_log_count().unwrap(), 7);
}

// ============================================================================
// Scenario: glitchy fixes never reach the log as teleports
// ============================================================================

#[test]
fn test_teleport_glitch_is_absorbed() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let mut pipeline = setup_pipeline(&store, false);

    pipeline.process_fix(fix(4.0, start_time()));

    // Multipath glitch: 5km jump two seconds later.
    let glitch = RawFix {
        latitude: 40.085,
        ..fix(4.0, start_time() + Duration::seconds(2))
    };
    let outcome = pipeline.process_fix(glitch);
    let FixOutcome::Resolved { track, .. } = outcome else {
        panic!("expected the prior position to be returned, got {outcome:?}");
    };
    assert!((track.milepost - 4.0).abs() < 0.01);
}

// ============================================================================
// Scenario: restart recovery
// ============================================================================

#[test]
fn test_restart_recovers_authority_and_backlog() {
    let dir = TempDir::new().unwrap();
    {
        let store = setup_store(&dir);
        let mut pipeline = setup_pipeline(&store, false);
        pipeline.process_fix(fix(1.2, start_time()));
        // Pipeline dropped without stop(): simulated process death.
    }

    // Fresh open of the same file sees everything that was durably written.
    let db_path = dir.path().join("railguard.db");
    let store = LocalStore::new(db_path.to_str().unwrap()).unwrap();

    let recovered = store.load_current_authority().unwrap().unwrap();
    assert_eq!(recovered.id, "auth-1");
    assert_eq!(recovered.status, AuthorityStatus::Active);

    assert_eq!(store.gps_log_count().unwrap(), 1);
    assert_eq!(store.load_alert_log().unwrap().len(), 1);
    // Position + alert both survived in the sync queue.
    assert_eq!(store.sync_counts().unwrap().pending, 2);
    assert_eq!(store.load_reference_points("sub-1").unwrap().len(), 21);
}

// ============================================================================
// Scenario: ending the authority closes the session
// ============================================================================

#[test]
fn test_end_authority_persists_ended_status() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let mut pipeline = setup_pipeline(&store, false);

    pipeline.process_fix(fix(4.0, start_time()));
    pipeline
        .end_authority(start_time() + Duration::seconds(60))
        .unwrap();

    assert!(pipeline.current_authority().is_none());
    let guard = store.lock().unwrap();
    assert_eq!(
        guard.load_current_authority().unwrap().unwrap().status,
        AuthorityStatus::Ended
    );

    // Fixes after the end are ignored, not logged.
    drop(guard);
    let outcome = pipeline.process_fix(fix(4.0, start_time() + Duration::seconds(120)));
    assert_eq!(outcome, FixOutcome::Skipped);
    assert_eq!(store.lock().unwrap().gps_log_count().unwrap(), 1);
}
