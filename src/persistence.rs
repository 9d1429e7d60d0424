//! Local durable store backed by SQLite.
//!
//! Everything the pipeline derives is written here first; the remote service
//! only ever sees data that already survived locally. Layout:
//!
//! - `current_user` / `current_authority` — single-row caches
//! - `gps_log` — append-only derived positions with a `sync_status` column
//! - `alert_log` — fired alerts with the same sync pattern
//! - `sync_queue` — durable backlog of records pending remote submission
//! - `reference_points` — cached track geometry keyed by subdivision
//! - `pins` — user-dropped map pins

use chrono::{DateTime, TimeZone, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{RailguardError, Result};
use crate::types::{
    AlertEvent, AlertLevel, AlertType, Authority, AuthorityStatus, DroppedPin, EntityKind,
    ResolvedTrackPosition, SmoothedPosition, SyncOperation, SyncQueueItem, SyncStatus, TrackType,
    TrackReferencePoint, WorkerProfile,
};

/// Counts per sync status, for the operator-visible backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCounts {
    pub pending: u32,
    pub synced: u32,
    pub failed: u32,
}

/// SQLite-backed local store. One connection, owned by the caller; the
/// pipeline wraps it in a mutex when network workers need access too.
pub struct LocalStore {
    db: Connection,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Self::migrate_schema(&db)?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Single-row cache of the signed-in worker
            CREATE TABLE IF NOT EXISTS current_user (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                worker_id TEXT NOT NULL,
                display_name TEXT NOT NULL
            );

            -- Single-row cache of the Active authority
            CREATE TABLE IF NOT EXISTS current_authority (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                authority_id TEXT NOT NULL,
                subdivision_id TEXT NOT NULL,
                track_type TEXT NOT NULL,
                track_number INTEGER NOT NULL,
                begin_milepost REAL NOT NULL,
                end_milepost REAL NOT NULL,
                owner_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                status TEXT NOT NULL
            );

            -- Append-only derived positions
            CREATE TABLE IF NOT EXISTS gps_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                authority_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy_meters REAL NOT NULL,
                speed_mps REAL NOT NULL,
                heading_degrees REAL NOT NULL,
                milepost REAL,
                track_type TEXT,
                track_number INTEGER,
                sample_count INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'pending'
            );

            -- Fired alerts
            CREATE TABLE IF NOT EXISTS alert_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_key TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                level TEXT NOT NULL,
                milepost REAL NOT NULL,
                distance_miles REAL NOT NULL,
                related_worker_id TEXT,
                created_at INTEGER NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'pending'
            );

            -- Durable backlog of records pending remote submission
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );

            -- Cached track geometry per subdivision
            CREATE TABLE IF NOT EXISTS reference_points (
                subdivision_id TEXT NOT NULL,
                milepost REAL NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                track_type TEXT NOT NULL,
                track_number INTEGER NOT NULL
            );

            -- User-dropped pins
            CREATE TABLE IF NOT EXISTS pins (
                id TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                label TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_gps_log_sync ON gps_log(sync_status);
            CREATE INDEX IF NOT EXISTS idx_alert_log_sync ON alert_log(sync_status);
            CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, id);
            CREATE INDEX IF NOT EXISTS idx_reference_points_sub ON reference_points(subdivision_id);
        "#,
        )?;
        Ok(())
    }

    /// Additive migrations for stores created by earlier builds.
    fn migrate_schema(conn: &Connection) -> Result<()> {
        // gps_log and alert_log predate per-row sync tracking.
        let has_gps_sync = conn
            .prepare("SELECT sync_status FROM gps_log LIMIT 0")
            .is_ok();
        if !has_gps_sync {
            conn.execute_batch(
                "ALTER TABLE gps_log ADD COLUMN sync_status TEXT NOT NULL DEFAULT 'pending';",
            )?;
            info!("[LocalStore] Migrated gps_log: added sync_status column");
        }

        let has_alert_sync = conn
            .prepare("SELECT sync_status FROM alert_log LIMIT 0")
            .is_ok();
        if !has_alert_sync {
            conn.execute_batch(
                "ALTER TABLE alert_log ADD COLUMN sync_status TEXT NOT NULL DEFAULT 'pending';",
            )?;
            info!("[LocalStore] Migrated alert_log: added sync_status column");
        }

        Ok(())
    }

    // ========================================================================
    // Current user / authority
    // ========================================================================

    pub fn save_current_user(&self, user: &WorkerProfile) -> Result<()> {
        self.db.execute(
            "INSERT INTO current_user (id, worker_id, display_name) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET worker_id = ?1, display_name = ?2",
            params![user.worker_id, user.display_name],
        )?;
        Ok(())
    }

    pub fn load_current_user(&self) -> Result<Option<WorkerProfile>> {
        let user = self
            .db
            .query_row(
                "SELECT worker_id, display_name FROM current_user WHERE id = 1",
                [],
                |row| {
                    Ok(WorkerProfile {
                        worker_id: row.get(0)?,
                        display_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn save_current_authority(&self, authority: &Authority) -> Result<()> {
        self.db.execute(
            "INSERT INTO current_authority
                 (id, authority_id, subdivision_id, track_type, track_number,
                  begin_milepost, end_milepost, owner_id, started_at, status)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 authority_id = ?1, subdivision_id = ?2, track_type = ?3,
                 track_number = ?4, begin_milepost = ?5, end_milepost = ?6,
                 owner_id = ?7, started_at = ?8, status = ?9",
            params![
                authority.id,
                authority.subdivision_id,
                authority.track_type.as_str(),
                authority.track_number,
                authority.begin_milepost,
                authority.end_milepost,
                authority.owner_id,
                authority.started_at.timestamp(),
                authority.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn load_current_authority(&self) -> Result<Option<Authority>> {
        let row = self
            .db
            .query_row(
                "SELECT authority_id, subdivision_id, track_type, track_number,
                        begin_milepost, end_milepost, owner_id, started_at, status
                 FROM current_authority WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, sub, track_type, track_number, begin, end, owner, started, status)) = row
        else {
            return Ok(None);
        };

        Ok(Some(Authority {
            id,
            subdivision_id: sub,
            track_type: TrackType::parse(&track_type)?,
            track_number,
            begin_milepost: begin,
            end_milepost: end,
            owner_id: owner,
            started_at: timestamp_to_datetime(started)?,
            status: AuthorityStatus::parse(&status)?,
        }))
    }

    pub fn clear_current_authority(&self) -> Result<()> {
        self.db.execute("DELETE FROM current_authority WHERE id = 1", [])?;
        Ok(())
    }

    // ========================================================================
    // GPS and alert logs
    // ========================================================================

    pub fn append_gps_log(
        &self,
        authority_id: &str,
        position: &SmoothedPosition,
        resolved: Option<&ResolvedTrackPosition>,
    ) -> Result<i64> {
        self.db.execute(
            "INSERT INTO gps_log
                 (authority_id, latitude, longitude, accuracy_meters, speed_mps,
                  heading_degrees, milepost, track_type, track_number, sample_count,
                  recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                authority_id,
                position.latitude,
                position.longitude,
                position.accuracy_meters,
                position.speed_mps,
                position.heading_degrees,
                resolved.map(|r| r.milepost),
                resolved.map(|r| r.track_type.as_str()),
                resolved.map(|r| r.track_number),
                position.sample_count,
                position.timestamp.timestamp(),
            ],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn mark_gps_log_synced(&self, id: i64) -> Result<()> {
        self.db.execute(
            "UPDATE gps_log SET sync_status = 'synced' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn gps_log_count(&self) -> Result<u32> {
        let count: u32 = self
            .db
            .query_row("SELECT COUNT(*) FROM gps_log", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn append_alert_log(&self, event: &AlertEvent) -> Result<i64> {
        self.db.execute(
            "INSERT INTO alert_log
                 (alert_key, alert_type, level, milepost, distance_miles,
                  related_worker_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.key,
                event.alert_type.as_str(),
                event.level.as_str(),
                event.milepost,
                event.distance_miles,
                event.related_worker_id,
                event.created_at.timestamp(),
            ],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn load_alert_log(&self) -> Result<Vec<AlertEvent>> {
        let mut stmt = self.db.prepare(
            "SELECT alert_key, alert_type, level, milepost, distance_miles,
                    related_worker_id, created_at
             FROM alert_log ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (key, alert_type, level, milepost, distance, related, created) = row?;
            events.push(AlertEvent {
                key,
                alert_type: AlertType::parse(&alert_type)?,
                level: AlertLevel::parse(&level)?,
                milepost,
                distance_miles: distance,
                related_worker_id: related,
                created_at: timestamp_to_datetime(created)?,
            });
        }
        Ok(events)
    }

    // ========================================================================
    // Reference point cache
    // ========================================================================

    /// Replace the cached reference set for one subdivision.
    pub fn cache_reference_points(
        &mut self,
        subdivision_id: &str,
        points: &[TrackReferencePoint],
    ) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM reference_points WHERE subdivision_id = ?1",
            params![subdivision_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reference_points
                     (subdivision_id, milepost, latitude, longitude, track_type, track_number)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for p in points {
                stmt.execute(params![
                    subdivision_id,
                    p.milepost,
                    p.latitude,
                    p.longitude,
                    p.track_type.as_str(),
                    p.track_number,
                ])?;
            }
        }
        tx.commit()?;
        info!(
            "[LocalStore] Cached {} reference points for subdivision {}",
            points.len(),
            subdivision_id
        );
        Ok(())
    }

    pub fn load_reference_points(&self, subdivision_id: &str) -> Result<Vec<TrackReferencePoint>> {
        let mut stmt = self.db.prepare(
            "SELECT milepost, latitude, longitude, track_type, track_number
             FROM reference_points WHERE subdivision_id = ?1 ORDER BY milepost",
        )?;
        let rows = stmt.query_map(params![subdivision_id], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;

        let mut points = Vec::new();
        for row in rows {
            let (milepost, lat, lon, track_type, track_number) = row?;
            points.push(TrackReferencePoint {
                subdivision_id: subdivision_id.to_string(),
                milepost,
                latitude: lat,
                longitude: lon,
                track_type: TrackType::parse(&track_type)?,
                track_number,
            });
        }
        Ok(points)
    }

    // ========================================================================
    // Pins
    // ========================================================================

    pub fn insert_pin(&self, pin: &DroppedPin) -> Result<()> {
        self.db.execute(
            "INSERT OR REPLACE INTO pins (id, latitude, longitude, label, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pin.id,
                pin.latitude,
                pin.longitude,
                pin.label,
                pin.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn pin_count(&self) -> Result<u32> {
        let count: u32 = self
            .db
            .query_row("SELECT COUNT(*) FROM pins", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // Sync queue
    // ========================================================================

    /// Durable enqueue. Never touches the network; always succeeds or
    /// surfaces a storage error.
    pub fn enqueue_sync(
        &self,
        kind: EntityKind,
        operation: SyncOperation,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.db.execute(
            "INSERT INTO sync_queue (entity_kind, operation, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                kind.as_str(),
                operation.as_str(),
                payload.to_string(),
                now.timestamp(),
            ],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    /// Oldest-first batch of Pending items below the attempt ceiling.
    pub fn pending_sync_batch(&self, limit: u32) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = self.db.prepare(
            "SELECT id, entity_kind, operation, payload, status, attempts,
                    last_attempt_at, last_error
             FROM sync_queue WHERE status = 'pending' ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, kind, op, payload, status, attempts, last_attempt, last_error) = row?;
            items.push(SyncQueueItem {
                id,
                entity_kind: EntityKind::parse(&kind)?,
                operation: SyncOperation::parse(&op)?,
                payload: serde_json::from_str(&payload)?,
                status: SyncStatus::parse(&status)?,
                attempts,
                last_attempt_at: last_attempt.map(timestamp_to_datetime).transpose()?,
                last_error,
            });
        }
        Ok(items)
    }

    /// Transition items to Synced. Rows are retained as an audit record and
    /// excluded from future batches, never deleted.
    pub fn mark_sync_items_synced(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        for id in ids {
            self.db.execute(
                "UPDATE sync_queue SET status = 'synced', last_attempt_at = ?2, last_error = NULL
                 WHERE id = ?1",
                params![id, now.timestamp()],
            )?;
        }
        Ok(())
    }

    /// Record a failed attempt. After `max_attempts` the item is marked
    /// Failed: out of the automatic drain, still retrievable.
    pub fn record_sync_failure(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.execute(
            "UPDATE sync_queue
             SET attempts = attempts + 1,
                 last_attempt_at = ?2,
                 last_error = ?3,
                 status = CASE WHEN attempts + 1 >= ?4 THEN 'failed' ELSE 'pending' END
             WHERE id = ?1",
            params![id, now.timestamp(), error, max_attempts],
        )?;
        Ok(())
    }

    pub fn sync_counts(&self) -> Result<SyncCounts> {
        let mut stmt = self
            .db
            .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut counts = SyncCounts::default();
        for row in rows {
            let (status, count) = row?;
            match SyncStatus::parse(&status)? {
                SyncStatus::Pending => counts.pending = count,
                SyncStatus::Synced => counts.synced = count,
                SyncStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Failed items for the operator-visible backlog.
    pub fn failed_sync_items(&self) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = self.db.prepare(
            "SELECT id, entity_kind, operation, payload, status, attempts,
                    last_attempt_at, last_error
             FROM sync_queue WHERE status = 'failed' ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, kind, op, payload, status, attempts, last_attempt, last_error) = row?;
            items.push(SyncQueueItem {
                id,
                entity_kind: EntityKind::parse(&kind)?,
                operation: SyncOperation::parse(&op)?,
                payload: serde_json::from_str(&payload)?,
                status: SyncStatus::parse(&status)?,
                attempts,
                last_attempt_at: last_attempt.map(timestamp_to_datetime).transpose()?,
                last_error,
            });
        }
        Ok(items)
    }
}

fn timestamp_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| RailguardError::Parse(format!("invalid timestamp {secs}")))
}
