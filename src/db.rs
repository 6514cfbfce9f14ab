use crate::core::transfer::{ProgressInfo, SessionStatus};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

pub const DB_FILE_NAME: &str = "courier.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSession {
    pub id: i64,
    pub uuid: String,
    pub queued: bool,
    pub study_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub study_date: String,
    pub modalities_in_study: String,
    pub destination_id: i64,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub files_sent: i64,
    pub files_total: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub destination_host: String,
    pub destination_port: u16,
    pub destination_ae: String,
    pub source_ae: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientStudy {
    pub id: i64,
    pub study_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub study_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub id: i64,
    pub series_instance_uid: String,
    pub modality: String,
    pub patient_study_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: i64,
    pub sop_instance_uid: String,
    pub instance_number: i64,
    pub series_id: i64,
}

/// Fields the ingest side supplies when it queues a study for sending.
#[derive(Debug, Clone, Default)]
pub struct NewSession<'a> {
    pub study_instance_uid: &'a str,
    pub patient_name: &'a str,
    pub patient_id: &'a str,
    pub study_date: &'a str,
    pub modalities_in_study: &'a str,
    pub destination_id: i64,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub session_id: i64,
    pub event_type: String,
    pub message: String,
    pub created_at: String,
}

const SESSION_COLUMNS: &str = "id, uuid, queued, study_instance_uid, patient_name, patient_id, study_date, \
     modalities_in_study, destination_id, status, error, files_sent, files_total, created_at, updated_at";

pub fn init_db(state_dir: &str) -> Result<Connection> {
    debug!("Initializing database in: {}", state_dir);
    if !Path::new(state_dir).exists() {
        info!("Creating state directory: {}", state_dir);
        fs::create_dir_all(state_dir).context("create state dir")?;
    }
    let db_path = Path::new(state_dir).join(DB_FILE_NAME);
    let conn = open_db(&db_path)?;
    info!("Database initialized successfully at {:?}", db_path);
    Ok(conn)
}

/// Opens (or creates) a database file with the pragmas shared-queue access needs.
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("open sqlite db")?;
    conn.busy_timeout(BUSY_TIMEOUT).context("set busy timeout")?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .context("enable WAL journal")?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> Result<()> {
    if let Err(e) = conn.execute_batch(
        "
        PRAGMA foreign_keys = OFF;
        CREATE TABLE IF NOT EXISTS outgoing_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            queued INTEGER NOT NULL DEFAULT 1,
            study_instance_uid TEXT NOT NULL,
            patient_name TEXT NOT NULL DEFAULT '',
            patient_id TEXT NOT NULL DEFAULT '',
            study_date TEXT NOT NULL DEFAULT '',
            modalities_in_study TEXT NOT NULL DEFAULT '',
            destination_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            files_sent INTEGER NOT NULL DEFAULT 0,
            files_total INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outgoing_sessions_queued ON outgoing_sessions(queued);
        CREATE TABLE IF NOT EXISTS destinations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            destination_host TEXT NOT NULL,
            destination_port INTEGER NOT NULL,
            destination_ae TEXT NOT NULL,
            source_ae TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS patient_studies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            study_instance_uid TEXT NOT NULL,
            patient_name TEXT NOT NULL DEFAULT '',
            patient_id TEXT NOT NULL DEFAULT '',
            study_date TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS series (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_instance_uid TEXT NOT NULL,
            modality TEXT NOT NULL DEFAULT '',
            patient_study_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(patient_study_id) REFERENCES patient_studies(id)
        );
        CREATE TABLE IF NOT EXISTS instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sop_instance_uid TEXT NOT NULL,
            instance_number INTEGER NOT NULL DEFAULT 0,
            series_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(series_id) REFERENCES series(id)
        );
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES outgoing_sessions(id)
        );
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    ) {
        error!("Failed to initialize database schema: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<OutgoingSession> {
    let status: String = row.get(9)?;
    Ok(OutgoingSession {
        id: row.get(0)?,
        uuid: row.get(1)?,
        queued: row.get::<_, i64>(2)? != 0,
        study_instance_uid: row.get(3)?,
        patient_name: row.get(4)?,
        patient_id: row.get(5)?,
        study_date: row.get(6)?,
        modalities_in_study: row.get(7)?,
        destination_id: row.get(8)?,
        status: SessionStatus::parse(&status),
        error: row.get(10)?,
        files_sent: row.get(11)?,
        files_total: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// --- Queue ---

/// Reads one session still waiting to be claimed. No ordering is promised.
pub fn select_one_ready_session(conn: &Connection) -> Result<Option<OutgoingSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM outgoing_sessions WHERE queued = 1 LIMIT 1");
    let session = conn
        .query_row(&sql, [], session_from_row)
        .optional()
        .context("select ready session")?;
    Ok(session)
}

/// Conditionally clears the `queued` flag. Returns the number of rows changed,
/// which is 1 only for the caller that won the claim.
pub fn claim_session(conn: &Connection, session_id: i64) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE outgoing_sessions SET queued = 0, status = ?, updated_at = ? WHERE id = ? AND queued = 1",
            params![SessionStatus::Claimed.as_str(), now, session_id],
        )
        .context("claim session")?;
    Ok(changed)
}

pub fn enqueue_session(conn: &Connection, new: &NewSession<'_>) -> Result<OutgoingSession> {
    let now = Utc::now().to_rfc3339();
    let uuid = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO outgoing_sessions (uuid, queued, study_instance_uid, patient_name, patient_id, study_date, \
         modalities_in_study, destination_id, status, created_at, updated_at) \
         VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            uuid,
            new.study_instance_uid,
            new.patient_name,
            new.patient_id,
            new.study_date,
            new.modalities_in_study,
            new.destination_id,
            SessionStatus::Queued.as_str(),
            now,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!("Queued session {} ({}) for study {}", id, uuid, new.study_instance_uid);
    get_session(conn, id)?.context("queued session vanished")
}

pub fn get_session(conn: &Connection, session_id: i64) -> Result<Option<OutgoingSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM outgoing_sessions WHERE id = ?");
    Ok(conn
        .query_row(&sql, params![session_id], session_from_row)
        .optional()?)
}

pub fn get_session_by_uuid(conn: &Connection, uuid: &str) -> Result<Option<OutgoingSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM outgoing_sessions WHERE uuid = ?");
    Ok(conn
        .query_row(&sql, params![uuid], session_from_row)
        .optional()?)
}

pub fn list_sessions(conn: &Connection, limit: i64) -> Result<Vec<OutgoingSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM outgoing_sessions ORDER BY id DESC LIMIT ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit], session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_queued_sessions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outgoing_sessions WHERE queued = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn update_session_status(
    conn: &Connection,
    uuid: &str,
    status: SessionStatus,
    error: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE outgoing_sessions SET status = ?, error = ?, updated_at = ? WHERE uuid = ?",
        params![status.as_str(), error, now, uuid],
    )?;
    Ok(())
}

pub fn update_session_progress(conn: &Connection, uuid: &str, progress: &ProgressInfo) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE outgoing_sessions SET files_sent = ?, files_total = ?, updated_at = ? WHERE uuid = ?",
        params![progress.files_sent as i64, progress.files_total as i64, now, uuid],
    )?;
    Ok(())
}

/// Marks a claimed session that could not be dispatched. `queued` stays cleared.
pub fn dead_letter_session(conn: &Connection, session_id: i64, reason: &str) -> Result<()> {
    info!("Dead-lettering session ID {}: {}", session_id, reason);
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE outgoing_sessions SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        params![SessionStatus::Failed.as_str(), reason, now, session_id],
    )?;
    insert_event(conn, session_id, "dead_letter", reason)?;
    Ok(())
}

/// Puts a finished session (completed, cancelled or failed) back on the queue.
/// Returns false when no session has that uuid; a session that is still
/// queued or in flight is refused with an error.
pub fn requeue_session(conn: &Connection, uuid: &str) -> Result<bool> {
    let Some(session) = get_session_by_uuid(conn, uuid)? else {
        return Ok(false);
    };
    if session.queued || !session.status.is_terminal() {
        bail!(
            "session {} is {} and cannot be requeued until it finishes",
            uuid,
            session.status
        );
    }
    info!("Requeueing session ID {} ({})", session.id, uuid);
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE outgoing_sessions SET queued = 1, status = ?, error = NULL, files_sent = 0, files_total = 0, \
         updated_at = ? WHERE id = ? AND queued = 0 AND status IN (?, ?, ?)",
        params![
            SessionStatus::Queued.as_str(),
            now,
            session.id,
            SessionStatus::Completed.as_str(),
            SessionStatus::Cancelled.as_str(),
            SessionStatus::Failed.as_str()
        ],
    )?;
    if changed == 0 {
        bail!("session {} changed state while being requeued", uuid);
    }
    insert_event(conn, session.id, "requeue", "session requeued manually")?;
    Ok(true)
}

// --- Events ---

pub fn insert_event(conn: &Connection, session_id: i64, event_type: &str, message: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO events (session_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
        params![session_id, event_type, message, now],
    )?;
    Ok(())
}

pub fn insert_event_by_uuid(conn: &Connection, uuid: &str, event_type: &str, message: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO events (session_id, event_type, message, created_at) \
         SELECT id, ?, ?, ? FROM outgoing_sessions WHERE uuid = ?",
        params![event_type, message, now, uuid],
    )?;
    Ok(())
}

pub fn list_events(conn: &Connection, session_id: i64) -> Result<Vec<EventRow>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, event_type, message, created_at FROM events WHERE session_id = ? ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(EventRow {
                session_id: row.get(0)?,
                event_type: row.get(1)?,
                message: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- Destinations ---

pub fn find_destination(conn: &Connection, destination_id: i64) -> Result<Option<Destination>> {
    let destination = conn
        .query_row(
            "SELECT id, name, destination_host, destination_port, destination_ae, source_ae \
             FROM destinations WHERE id = ? LIMIT 1",
            params![destination_id],
            |row| {
                Ok(Destination {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    destination_host: row.get(2)?,
                    destination_port: row.get(3)?,
                    destination_ae: row.get(4)?,
                    source_ae: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(destination)
}

pub fn create_destination(
    conn: &Connection,
    name: &str,
    host: &str,
    port: u16,
    destination_ae: &str,
    source_ae: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO destinations (name, destination_host, destination_port, destination_ae, source_ae, \
         created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![name, host, port, destination_ae, source_ae, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

// --- Study records ---

/// All studies carrying the uid; the enumerator insists on at least one.
pub fn find_studies(conn: &Connection, study_instance_uid: &str) -> Result<Vec<PatientStudy>> {
    let mut stmt = conn.prepare(
        "SELECT id, study_instance_uid, patient_name, patient_id, study_date \
         FROM patient_studies WHERE study_instance_uid = ? ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![study_instance_uid], |row| {
            Ok(PatientStudy {
                id: row.get(0)?,
                study_instance_uid: row.get(1)?,
                patient_name: row.get(2)?,
                patient_id: row.get(3)?,
                study_date: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_series(conn: &Connection, patient_study_id: i64) -> Result<Vec<Series>> {
    let mut stmt = conn.prepare(
        "SELECT id, series_instance_uid, modality, patient_study_id \
         FROM series WHERE patient_study_id = ? ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![patient_study_id], |row| {
            Ok(Series {
                id: row.get(0)?,
                series_instance_uid: row.get(1)?,
                modality: row.get(2)?,
                patient_study_id: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_instances(conn: &Connection, series_id: i64) -> Result<Vec<Instance>> {
    let mut stmt = conn.prepare(
        "SELECT id, sop_instance_uid, instance_number, series_id \
         FROM instances WHERE series_id = ? ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![series_id], |row| {
            Ok(Instance {
                id: row.get(0)?,
                sop_instance_uid: row.get(1)?,
                instance_number: row.get(2)?,
                series_id: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_study(
    conn: &Connection,
    study_instance_uid: &str,
    patient_name: &str,
    patient_id: &str,
    study_date: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO patient_studies (study_instance_uid, patient_name, patient_id, study_date, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![study_instance_uid, patient_name, patient_id, study_date, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn create_series(
    conn: &Connection,
    patient_study_id: i64,
    series_instance_uid: &str,
    modality: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO series (series_instance_uid, modality, patient_study_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
        params![series_instance_uid, modality, patient_study_id, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn create_instance(
    conn: &Connection,
    series_id: i64,
    sop_instance_uid: &str,
    instance_number: i64,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO instances (sop_instance_uid, instance_number, series_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
        params![sop_instance_uid, instance_number, series_id, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

// --- Settings ---

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

pub fn load_all_settings(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        map.insert(k, v);
    }
    Ok(map)
}

pub fn has_settings(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))?;
    Ok(count > 0)
}
