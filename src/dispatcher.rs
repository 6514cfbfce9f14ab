use crate::core::config::Config;
use crate::db::{self, OutgoingSession};
use crate::registry::TaskRegistry;
use crate::services::enumerator;
use crate::services::notifier::{DbNotifier, SessionNotifier};
use crate::services::resolver;
use crate::services::sender::{SendOptions, SenderFactory, TaskFactory};
use crate::utils::{lock_mutex, lock_or_recover};
use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Claims one ready session: select a candidate, then clear its `queued` flag
/// only if it is still set. A lost race returns `None` without retrying.
pub fn claim_next_session(conn: &Connection) -> Result<Option<OutgoingSession>> {
    let Some(mut candidate) = db::select_one_ready_session(conn)? else {
        return Ok(None);
    };
    if db::claim_session(conn, candidate.id)? == 0 {
        debug!("Session {} was claimed by another dispatcher", candidate.id);
        return Ok(None);
    }
    candidate.queued = false;
    candidate.status = crate::core::transfer::SessionStatus::Claimed;
    Ok(Some(candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Draining,
    Stopped,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DispatcherState::Running,
            1 => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A transfer task was started and registered for the session uuid.
    Started(String),
    /// The session was claimed but could not be sent; it is now marked failed.
    DeadLettered(String),
}

/// Control surface shared with the host process.
#[derive(Clone)]
pub struct DispatcherHandle {
    registry: Arc<Mutex<TaskRegistry>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl DispatcherHandle {
    /// Requests a graceful drain. Calling it again has no further effect.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("Dispatcher stop requested");
        }
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Cancels the in-flight transfer for `uuid`. Returns false when no
    /// registered task matches.
    pub fn cancel_by_uuid(&self, uuid: &str) -> bool {
        let found = lock_or_recover(&self.registry).cancel_by_uuid(uuid);
        if found {
            info!("Cancelled session {} on request", uuid);
        } else {
            debug!("No in-flight session {} to cancel", uuid);
        }
        found
    }

    pub fn active_tasks(&self) -> usize {
        lock_or_recover(&self.registry).len()
    }
}

pub struct Dispatcher {
    conn: Arc<Mutex<Connection>>,
    config: Config,
    factory: Arc<dyn TaskFactory>,
    notifier: Arc<dyn SessionNotifier>,
    registry: Arc<Mutex<TaskRegistry>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl Dispatcher {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: Config,
        factory: Arc<dyn TaskFactory>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self {
            conn,
            config,
            factory,
            notifier,
            registry: Arc::new(Mutex::new(TaskRegistry::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(DispatcherState::Running as u8)),
        }
    }

    /// Wires the database notifier and the TCP sender.
    pub fn with_defaults(conn: Arc<Mutex<Connection>>, config: Config) -> Self {
        let notifier: Arc<dyn SessionNotifier> = Arc::new(DbNotifier::new(conn.clone()));
        let factory = Arc::new(SenderFactory::new(
            notifier.clone(),
            SendOptions::from_config(&config),
        ));
        Self::new(conn, config, factory, notifier)
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs the loop on its own tokio task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let interval = self.config.poll_interval();
        info!("Dispatcher started (poll interval {:?})", interval);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.claim_next() {
                Some(session) => {
                    self.dispatch(session);
                    tokio::task::yield_now().await;
                }
                None => tokio::time::sleep(interval).await,
            }
            self.reap();
        }

        self.set_state(DispatcherState::Draining);
        self.drain().await;
        self.set_state(DispatcherState::Stopped);
        info!("Dispatcher stopped");
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Store failures are logged and count as "nothing to claim".
    pub fn claim_next(&self) -> Option<OutgoingSession> {
        let res = lock_mutex(&self.conn).and_then(|conn| claim_next_session(&conn));
        match res {
            Ok(Some(session)) => {
                info!(
                    "Claimed session {} ({}) for study {}",
                    session.id, session.uuid, session.study_instance_uid
                );
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to claim queued session: {:#}", e);
                None
            }
        }
    }

    pub fn dispatch(&self, session: OutgoingSession) -> DispatchOutcome {
        let lookup = match lock_mutex(&self.conn) {
            Ok(conn) => match resolver::resolve(&conn, session.destination_id) {
                None => Err(format!("destination {} not found", session.destination_id)),
                Some(destination) => {
                    let files = enumerator::enumerate(
                        &conn,
                        Path::new(&self.config.storage_path),
                        &session.study_instance_uid,
                        &self.config.file_extension,
                    );
                    if files.is_empty() {
                        Err(format!(
                            "no files to send for study {}",
                            session.study_instance_uid
                        ))
                    } else {
                        Ok((destination, files))
                    }
                }
            },
            Err(e) => Err(format!("database unavailable: {}", e)),
        };

        let (destination, files) = match lookup {
            Ok(found) => found,
            Err(reason) => {
                self.dead_letter(&session, &reason);
                return DispatchOutcome::DeadLettered(reason);
            }
        };

        info!(
            "Session {} sending study {} ({} files) to {}:{} called AE {} calling AE {}",
            session.uuid,
            session.study_instance_uid,
            files.len(),
            destination.destination_host,
            destination.destination_port,
            destination.destination_ae,
            destination.source_ae
        );
        self.notifier
            .destination_assigned(&session, &destination.name);

        let task = self.factory.create(&session, destination, files);
        lock_or_recover(&self.registry).insert(task.clone());
        task.start();
        DispatchOutcome::Started(session.uuid)
    }

    fn dead_letter(&self, session: &OutgoingSession, reason: &str) {
        warn!("Dropping session {} ({}): {}", session.id, session.uuid, reason);
        let res = lock_mutex(&self.conn)
            .and_then(|conn| db::dead_letter_session(&conn, session.id, reason));
        if let Err(e) = res {
            error!(
                "Failed to dead-letter session {}: {:#}",
                session.uuid, e
            );
        }
    }

    /// Removes finished tasks from the registry.
    pub fn reap(&self) -> usize {
        lock_or_recover(&self.registry).reap()
    }

    /// Cancels and waits out every registered task. Returns once the registry is empty.
    async fn drain(&self) {
        let interval = self.config.poll_interval();
        loop {
            let remaining = {
                let mut registry = lock_or_recover(&self.registry);
                registry.reap();
                let cancelled = registry.cancel_running();
                if cancelled > 0 {
                    debug!("Draining: waiting on {} tasks", cancelled);
                }
                registry.len()
            };
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
