use crate::db::{self, Destination};
use rusqlite::Connection;
use tracing::{debug, warn};

/// Looks up the connection profile for a destination id.
///
/// A missing row and a failing query both come back as `None`: the caller
/// cannot dispatch to this destination right now either way.
pub fn resolve(conn: &Connection, destination_id: i64) -> Option<Destination> {
    match db::find_destination(conn, destination_id) {
        Ok(Some(destination)) => {
            debug!(
                "Resolved destination {} to {}:{} (called AE {}, calling AE {})",
                destination_id,
                destination.destination_host,
                destination.destination_port,
                destination.destination_ae,
                destination.source_ae
            );
            Some(destination)
        }
        Ok(None) => {
            warn!("Destination {} not found", destination_id);
            None
        }
        Err(e) => {
            warn!("Failed to look up destination {}: {:#}", destination_id, e);
            None
        }
    }
}
