//! Offline sync queue drain.
//!
//! Enqueuing is a durable local write that never blocks on network state;
//! the drain side replays Pending items oldest-first in bounded batches
//! whenever connectivity allows, with exponential backoff between failed
//! cycles. Items transition Pending -> Synced on confirmed acceptance and
//! Pending -> Failed after exhausting retries; neither state deletes the row.
//!
//! The server upserts idempotently, so at-least-once replay is safe.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::error::Result;
use crate::http::{RemoteClient, SyncBatchEntry};
use crate::persistence::LocalStore;
use crate::tracker::ConnectivityState;
use crate::types::SyncQueueItem;

/// Configuration for the sync drain cycle.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum items pulled per drain cycle.
    /// Default: 25
    pub batch_size: u32,

    /// Attempts before an item is marked Failed.
    /// Default: 5
    pub max_attempts: u32,

    /// Fixed drain interval when connectivity is stable.
    /// Default: 60 seconds
    pub drain_interval_secs: u64,

    /// Base of the exponential backoff applied after a failed cycle.
    /// Default: 5 seconds
    pub backoff_base_secs: i64,

    /// Backoff ceiling.
    /// Default: 300 seconds
    pub backoff_cap_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 5,
            drain_interval_secs: 60,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
        }
    }
}

/// Remote submission seam for the drain cycle. `RemoteClient` is the
/// production implementation; tests substitute a scripted one.
pub trait SyncTransport {
    fn submit_batch(
        &self,
        entries: &[SyncBatchEntry],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl SyncTransport for RemoteClient {
    async fn submit_batch(&self, entries: &[SyncBatchEntry]) -> Result<()> {
        self.submit_sync_batch(entries).await
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Items pulled from the queue this cycle.
    pub attempted: u32,
    /// Items confirmed Synced this cycle.
    pub synced: u32,
    /// True when the cycle did not run (drain already in progress, or
    /// backing off after failures).
    pub skipped: bool,
}

/// Drains the sync queue toward the remote service.
pub struct SyncWorker {
    store: Arc<Mutex<LocalStore>>,
    config: SyncConfig,
    /// A drain in progress is exclusive; a second request is a no-op.
    drain_in_progress: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Earliest time the next drain may run, set after failed cycles.
    next_drain_after: Mutex<Option<DateTime<Utc>>>,
}

impl SyncWorker {
    pub fn new(store: Arc<Mutex<LocalStore>>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            drain_in_progress: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            next_drain_after: Mutex::new(None),
        }
    }

    /// Attempt one drain cycle at time `now`.
    pub async fn drain<T: SyncTransport>(&self, transport: &T, now: DateTime<Utc>) -> Result<DrainReport> {
        if let Some(after) = *self.next_drain_after.lock().unwrap() {
            if now < after {
                debug!("[SyncWorker] Backing off until {after}, drain skipped");
                return Ok(DrainReport {
                    skipped: true,
                    ..DrainReport::default()
                });
            }
        }

        if self
            .drain_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[SyncWorker] Drain already in progress, request ignored");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }

        let result = self.drain_locked(transport, now).await;
        self.drain_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_locked<T: SyncTransport>(
        &self,
        transport: &T,
        now: DateTime<Utc>,
    ) -> Result<DrainReport> {
        let batch = {
            let store = self.store.lock().unwrap();
            store.pending_sync_batch(self.config.batch_size)?
        };

        if batch.is_empty() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            *self.next_drain_after.lock().unwrap() = None;
            return Ok(DrainReport::default());
        }

        let entries: Vec<SyncBatchEntry> = batch.iter().map(to_entry).collect();
        let attempted = batch.len() as u32;
        debug!("[SyncWorker] Draining {attempted} pending items");

        match transport.submit_batch(&entries).await {
            Ok(()) => {
                let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
                let store = self.store.lock().unwrap();
                store.mark_sync_items_synced(&ids, now)?;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.next_drain_after.lock().unwrap() = None;
                info!("[SyncWorker] Synced {attempted} items");
                Ok(DrainReport {
                    attempted,
                    synced: attempted,
                    skipped: false,
                })
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let store = self.store.lock().unwrap();
                    for item in &batch {
                        store.record_sync_failure(
                            item.id,
                            &message,
                            self.config.max_attempts,
                            now,
                        )?;
                    }
                }

                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let backoff_secs = (self.config.backoff_base_secs
                    << (failures - 1).min(16))
                .min(self.config.backoff_cap_secs);
                *self.next_drain_after.lock().unwrap() =
                    Some(now + Duration::seconds(backoff_secs));
                warn!(
                    "[SyncWorker] Batch of {attempted} failed ({message}), backing off {backoff_secs}s"
                );
                Ok(DrainReport {
                    attempted,
                    synced: 0,
                    skipped: false,
                })
            }
        }
    }

    /// Periodic drain loop: fixed interval, plus an opportunistic drain
    /// whenever connectivity transitions from absent to present. Runs until
    /// the task is aborted; independent of the tracking session lifecycle.
    pub async fn run<T: SyncTransport>(
        &self,
        transport: &T,
        connectivity: Arc<ConnectivityState>,
    ) {
        let mut was_online = connectivity.is_online();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.drain_interval_secs));
        // Connectivity transitions are polled at a finer grain than the
        // drain interval.
        let mut poll = tokio::time::interval(std::time::Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if connectivity.is_online() {
                        if let Err(e) = self.drain(transport, Utc::now()).await {
                            warn!("[SyncWorker] Periodic drain error: {e}");
                        }
                    }
                }
                _ = poll.tick() => {
                    let online = connectivity.is_online();
                    if online && !was_online {
                        info!("[SyncWorker] Connectivity restored, draining opportunistically");
                        if let Err(e) = self.drain(transport, Utc::now()).await {
                            warn!("[SyncWorker] Opportunistic drain error: {e}");
                        }
                    }
                    was_online = online;
                }
            }
        }
    }
}

fn to_entry(item: &SyncQueueItem) -> SyncBatchEntry {
    SyncBatchEntry {
        entity_kind: item.entity_kind,
        operation: item.operation,
        payload: item.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RailguardError;
    use crate::types::{EntityKind, SyncOperation};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    /// Scripted transport: fails the first `fail_first` calls, records
    /// every batch it accepts.
    struct ScriptedTransport {
        fail_first: u32,
        calls: AtomicU32,
        accepted: Mutex<Vec<Vec<SyncBatchEntry>>>,
    }

    impl ScriptedTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                accepted: Mutex::new(Vec::new()),
            }
        }

        fn accepted_items(&self) -> usize {
            self.accepted.lock().unwrap().iter().map(|b| b.len()).sum()
        }
    }

    impl SyncTransport for ScriptedTransport {
        async fn submit_batch(&self, entries: &[SyncBatchEntry]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(RailguardError::Http {
                    message: "service unavailable".to_string(),
                    status: Some(503),
                });
            }
            self.accepted.lock().unwrap().push(entries.to_vec());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn worker_with_items(count: u32) -> (SyncWorker, Arc<Mutex<LocalStore>>) {
        let store = Arc::new(Mutex::new(LocalStore::in_memory().unwrap()));
        {
            let guard = store.lock().unwrap();
            for i in 0..count {
                let payload = serde_json::json!({ "seq": i });
                guard
                    .enqueue_sync(EntityKind::Position, SyncOperation::Insert, &payload, now())
                    .unwrap();
            }
        }
        (
            SyncWorker::new(Arc::clone(&store), SyncConfig::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_drain_syncs_all_pending_once() {
        let (worker, store) = worker_with_items(10);
        let transport = ScriptedTransport::new(0);

        let report = worker.drain(&transport, now()).await.unwrap();
        assert_eq!(report.synced, 10);
        assert_eq!(transport.accepted_items(), 10);

        // Second drain finds nothing: no duplicate submission.
        let report = worker.drain(&transport, now()).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.accepted_items(), 10);

        let counts = store.lock().unwrap().sync_counts().unwrap();
        assert_eq!(counts.synced, 10);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_failed_cycle_backs_off_then_recovers() {
        let (worker, store) = worker_with_items(3);
        let transport = ScriptedTransport::new(1);

        let t0 = now();
        let report = worker.drain(&transport, t0).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.attempted, 3);

        // Within the backoff window the drain is skipped.
        let report = worker
            .drain(&transport, t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert!(report.skipped);

        // After the backoff the retry succeeds.
        let report = worker
            .drain(&transport, t0 + Duration::seconds(6))
            .await
            .unwrap();
        assert_eq!(report.synced, 3);
        let counts = store.lock().unwrap().sync_counts().unwrap();
        assert_eq!(counts.synced, 3);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        // A high attempt ceiling keeps the items Pending across every
        // failing cycle, so the backoff sequence itself is what ends the
        // loop, not batch exhaustion.
        let store = Arc::new(Mutex::new(LocalStore::in_memory().unwrap()));
        {
            let guard = store.lock().unwrap();
            for i in 0..10 {
                let payload = serde_json::json!({ "seq": i });
                guard
                    .enqueue_sync(EntityKind::Position, SyncOperation::Insert, &payload, now())
                    .unwrap();
            }
        }
        let worker = SyncWorker::new(
            Arc::clone(&store),
            SyncConfig {
                max_attempts: 100,
                ..SyncConfig::default()
            },
        );
        let transport = ScriptedTransport::new(u32::MAX);

        let mut t = now();
        let mut gaps = Vec::new();
        for _ in 0..8 {
            let report = worker.drain(&transport, t).await.unwrap();
            assert!(!report.skipped);
            assert_eq!(report.attempted, 10);
            let after = worker.next_drain_after.lock().unwrap().unwrap();
            gaps.push((after - t).num_seconds());
            t = after;
        }
        // Doubling from the 5s base until pinned at the 300s cap.
        assert_eq!(gaps, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[tokio::test]
    async fn test_items_fail_permanently_after_max_attempts() {
        let (worker, store) = worker_with_items(2);
        let transport = ScriptedTransport::new(u32::MAX);

        let mut t = now();
        for _ in 0..5 {
            let report = worker.drain(&transport, t).await.unwrap();
            assert!(!report.skipped);
            t = t + Duration::seconds(600);
        }

        let guard = store.lock().unwrap();
        let counts = guard.sync_counts().unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.pending, 0);
        // The backlog remains retrievable.
        assert_eq!(guard.failed_sync_items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_is_bounded() {
        let store = Arc::new(Mutex::new(LocalStore::in_memory().unwrap()));
        {
            let guard = store.lock().unwrap();
            for i in 0..30 {
                let payload = serde_json::json!({ "seq": i });
                guard
                    .enqueue_sync(EntityKind::Position, SyncOperation::Insert, &payload, now())
                    .unwrap();
            }
        }
        let worker = SyncWorker::new(
            Arc::clone(&store),
            SyncConfig {
                batch_size: 25,
                ..SyncConfig::default()
            },
        );
        let transport = ScriptedTransport::new(0);

        let report = worker.drain(&transport, now()).await.unwrap();
        assert_eq!(report.synced, 25);
        let report = worker.drain(&transport, now()).await.unwrap();
        assert_eq!(report.synced, 5);
    }

    #[tokio::test]
    async fn test_empty_queue_drain_is_noop() {
        let (worker, _store) = worker_with_items(0);
        let transport = ScriptedTransport::new(0);
        let report = worker.drain(&transport, now()).await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(transport.accepted_items(), 0);
    }
}
