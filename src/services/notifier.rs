use crate::core::transfer::{ProgressInfo, SessionStatus};
use crate::db::{self, OutgoingSession};
use crate::utils::lock_mutex;
use anyhow::Result;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Receives session state as the dispatcher and its send tasks make progress.
///
/// Every call is best-effort. Implementations log their own failures; nothing
/// is reported back to the caller.
pub trait SessionNotifier: Send + Sync {
    /// Sent once per dispatched session, before its transfer task starts.
    fn destination_assigned(&self, session: &OutgoingSession, destination_name: &str);

    fn status_changed(&self, session_uuid: &str, status: SessionStatus, detail: &str);

    fn progress(&self, session_uuid: &str, progress: &ProgressInfo);
}

/// Records notifications in the `outgoing_sessions` and `events` tables.
#[derive(Clone)]
pub struct DbNotifier {
    conn: Arc<Mutex<Connection>>,
}

impl DbNotifier {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn record_status(&self, session_uuid: &str, status: SessionStatus, detail: &str) -> Result<()> {
        let conn = lock_mutex(&self.conn)?;
        let error = (status == SessionStatus::Failed).then_some(detail);
        db::update_session_status(&conn, session_uuid, status, error)?;
        db::insert_event_by_uuid(&conn, session_uuid, status.as_str(), detail)?;
        Ok(())
    }
}

impl SessionNotifier for DbNotifier {
    fn destination_assigned(&self, session: &OutgoingSession, destination_name: &str) {
        let res = lock_mutex(&self.conn).and_then(|conn| {
            db::insert_event(
                &conn,
                session.id,
                "destination",
                &format!("sending to {}", destination_name),
            )
        });
        if let Err(e) = res {
            warn!(
                "Failed to record destination for session {}: {:#}",
                session.uuid, e
            );
        }
    }

    fn status_changed(&self, session_uuid: &str, status: SessionStatus, detail: &str) {
        debug!("Session {} is now {}: {}", session_uuid, status, detail);
        if let Err(e) = self.record_status(session_uuid, status, detail) {
            warn!(
                "Failed to record status {} for session {}: {:#}",
                status, session_uuid, e
            );
        }
    }

    fn progress(&self, session_uuid: &str, progress: &ProgressInfo) {
        let res = lock_mutex(&self.conn)
            .and_then(|conn| db::update_session_progress(&conn, session_uuid, progress));
        if let Err(e) = res {
            warn!("Failed to record progress for session {}: {:#}", session_uuid, e);
        }
    }
}
