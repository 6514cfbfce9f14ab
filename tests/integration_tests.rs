// Integration tests for courier
// These tests drive the dispatcher against a real database file and a local TCP endpoint

use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use courier::core::config::Config;
use courier::core::transfer::SessionStatus;
use courier::db::{self, NewSession, OutgoingSession};
use courier::dispatcher::{DispatchOutcome, Dispatcher, DispatcherState, claim_next_session};
use courier::services::enumerator::instance_path;
use courier::utils::lock_mutex;

// --- Integration Test Helpers ---

struct StudyFixture {
    session: OutgoingSession,
    sops: Vec<String>,
}

/// Records one study with `files` instances, writes each instance file under
/// `storage` and queues a session for it.
fn seed_study(
    conn: &Connection,
    storage: &Path,
    study: &str,
    port: u16,
    files: usize,
    file_size: usize,
) -> Result<StudyFixture> {
    let dest = db::create_destination(conn, "Local PACS", "127.0.0.1", port, "PACS", "COURIER")?;
    let study_id = db::create_study(conn, study, "DOE^JOHN", "P100", "20240301")?;
    let series_uid = format!("{}.1", study);
    let series = db::create_series(conn, study_id, &series_uid, "CT")?;

    let mut sops = Vec::new();
    for n in 0..files {
        let sop = format!("{}.1.{}", study, n);
        db::create_instance(conn, series, &sop, n as i64)?;
        let path = instance_path(storage, study, &series_uid, &sop, ".dcm")?;
        std::fs::create_dir_all(path.parent().expect("instance path has a parent"))?;
        std::fs::write(&path, vec![b'x'; file_size])?;
        sops.push(sop);
    }

    let session = db::enqueue_session(
        conn,
        &NewSession {
            study_instance_uid: study,
            patient_name: "DOE^JOHN",
            patient_id: "P100",
            destination_id: dest,
            ..Default::default()
        },
    )?;
    Ok(StudyFixture { session, sops })
}

fn test_config(storage: &Path) -> Config {
    Config {
        storage_path: storage.to_string_lossy().to_string(),
        poll_interval_ms: 10,
        connect_timeout_secs: 2,
        chunk_size_kb: 16,
        ..Config::default()
    }
}

fn session_status(conn: &Arc<Mutex<Connection>>, id: i64) -> Result<SessionStatus> {
    let c = lock_mutex(conn)?;
    Ok(db::get_session(&c, id)?.expect("session exists").status)
}

async fn wait_for_status(conn: &Arc<Mutex<Connection>>, id: i64, want: SessionStatus) -> Result<()> {
    let start = Instant::now();
    loop {
        let status = session_status(conn, id)?;
        if status == want {
            return Ok(());
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "session {} stuck in {} waiting for {}",
            id,
            status,
            want
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_files_sent(conn: &Arc<Mutex<Connection>>, id: i64, at_least: i64) -> Result<()> {
    let start = Instant::now();
    loop {
        {
            let c = lock_mutex(conn)?;
            if db::get_session(&c, id)?.expect("session exists").files_sent >= at_least {
                return Ok(());
            }
        }
        assert!(start.elapsed() < Duration::from_secs(10), "no progress on session {}", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- Tests ---

#[test]
fn test_claim_race_between_connections() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join(db::DB_FILE_NAME);
    {
        let conn = db::open_db(&db_path)?;
        for n in 0..60 {
            db::enqueue_session(
                &conn,
                &NewSession {
                    study_instance_uid: &format!("1.2.{}", n),
                    destination_id: 1,
                    ..Default::default()
                },
            )?;
        }
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let path = db_path.clone();
            std::thread::spawn(move || -> Result<Vec<i64>> {
                let conn = db::open_db(&path)?;
                let mut claimed = Vec::new();
                loop {
                    match claim_next_session(&conn)? {
                        Some(session) => claimed.push(session.id),
                        None if db::count_queued_sessions(&conn)? == 0 => break,
                        None => std::thread::yield_now(),
                    }
                }
                Ok(claimed)
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().expect("worker panicked")?);
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 60, "every session claimed");
    assert_eq!(unique.len(), 60, "no session claimed twice");

    let conn = db::open_db(&db_path)?;
    assert!(claim_next_session(&conn)?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_end_to_end_send_to_local_listener() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = temp.path().join("storage");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let conn = db::init_db(&temp.path().to_string_lossy())?;
    let fixture = seed_study(&conn, &storage, "1.2.840.1", port, 3, 40_000)?;
    let conn = Arc::new(Mutex::new(conn));

    let receiver = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await?;
        anyhow::Ok(received)
    });

    let dispatcher = Dispatcher::with_defaults(conn.clone(), test_config(&storage));
    let handle = dispatcher.handle();
    let join = dispatcher.start();

    wait_for_status(&conn, fixture.session.id, SessionStatus::Completed).await?;
    let received = tokio::time::timeout(Duration::from_secs(5), receiver).await???;

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("{\"type\":\"associate\""));
    assert!(text.contains(&fixture.session.uuid));
    assert!(text.contains("\"called_ae\":\"PACS\""));
    for sop in &fixture.sops {
        assert!(text.contains(&format!("\"item\":\"{}\"", sop)));
    }
    assert!(text.trim_end().ends_with("{\"type\":\"release\"}"));
    assert_eq!(received.iter().filter(|b| **b == b'x').count(), 3 * 40_000);

    {
        let c = lock_mutex(&conn)?;
        let stored = db::get_session(&c, fixture.session.id)?.expect("session exists");
        assert!(!stored.queued);
        assert_eq!((stored.files_sent, stored.files_total), (3, 3));
        let kinds: Vec<_> = db::list_events(&c, stored.id)?
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("destination"));
        assert!(kinds.iter().any(|k| k == "completed"));
    }

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), join).await??;
    assert_eq!(handle.state(), DispatcherState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_connection_refused_marks_failed() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = temp.path().join("storage");
    // Bind then drop to get a port nothing listens on.
    let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();

    let conn = db::init_db(&temp.path().to_string_lossy())?;
    let fixture = seed_study(&conn, &storage, "1.2.840.2", port, 1, 100)?;
    let conn = Arc::new(Mutex::new(conn));

    let dispatcher = Dispatcher::with_defaults(conn.clone(), test_config(&storage));
    let handle = dispatcher.handle();
    let join = dispatcher.start();

    wait_for_status(&conn, fixture.session.id, SessionStatus::Failed).await?;
    {
        let c = lock_mutex(&conn)?;
        let stored = db::get_session(&c, fixture.session.id)?.expect("session exists");
        assert!(stored.error.unwrap_or_default().contains("connect"));
        assert!(!stored.queued, "failed sends are not re-queued");
    }

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), join).await??;
    Ok(())
}

#[test]
fn test_dead_letter_then_requeue() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = temp.path().join("storage");
    let conn = db::init_db(&temp.path().to_string_lossy())?;
    // Study recorded without any series: nothing to send.
    db::create_study(&conn, "1.2.840.3", "", "", "")?;
    let dest = db::create_destination(&conn, "PACS", "127.0.0.1", 104, "PACS", "COURIER")?;
    let session = db::enqueue_session(
        &conn,
        &NewSession {
            study_instance_uid: "1.2.840.3",
            destination_id: dest,
            ..Default::default()
        },
    )?;
    let conn = Arc::new(Mutex::new(conn));
    let dispatcher = Dispatcher::with_defaults(conn.clone(), test_config(&storage));

    let claimed = dispatcher.claim_next().expect("session is ready");
    let outcome = dispatcher.dispatch(claimed);
    assert!(matches!(outcome, DispatchOutcome::DeadLettered(_)));
    assert!(dispatcher.claim_next().is_none());
    assert_eq!(dispatcher.handle().active_tasks(), 0);

    {
        let c = lock_mutex(&conn)?;
        let stored = db::get_session(&c, session.id)?.expect("session exists");
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.error.is_some());
        assert!(!db::requeue_session(&c, "no-such-uuid")?);
        assert!(db::requeue_session(&c, &session.uuid)?);

        let requeued = db::get_session(&c, session.id)?.expect("session exists");
        assert!(requeued.queued);
        assert_eq!(requeued.status, SessionStatus::Queued);
        assert_eq!(requeued.error, None);
    }

    let again = dispatcher.claim_next().expect("requeued session is ready");
    assert_eq!(again.id, session.id);
    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_in_flight_transfer() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = temp.path().join("storage");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let conn = db::init_db(&temp.path().to_string_lossy())?;
    // More data than the loopback socket buffers hold, so the sender blocks
    // in a write while the receiver is paused.
    let fixture = seed_study(&conn, &storage, "1.2.840.4", port, 400, 64 * 1024)?;
    let conn = Arc::new(Mutex::new(conn));

    let (resume_tx, resume_rx) = oneshot::channel::<()>();
    let receiver = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let mut reader = BufReader::new(socket);
        let mut associate = String::new();
        reader.read_line(&mut associate).await?;
        let _ = resume_rx.await;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await?;
        anyhow::Ok(associate)
    });

    let dispatcher = Dispatcher::with_defaults(conn.clone(), test_config(&storage));
    let handle = dispatcher.handle();
    let join = dispatcher.start();

    wait_for_files_sent(&conn, fixture.session.id, 1).await?;
    assert_eq!(handle.active_tasks(), 1);

    // The receiver never resumes before the drain finishes: a blocked write
    // must still give way to cancellation.
    handle.stop();
    tokio::time::timeout(Duration::from_secs(10), join).await??;
    assert_eq!(handle.state(), DispatcherState::Stopped);
    assert_eq!(handle.active_tasks(), 0);
    assert_eq!(session_status(&conn, fixture.session.id)?, SessionStatus::Cancelled);
    let _ = resume_tx.send(());

    let associate = tokio::time::timeout(Duration::from_secs(5), receiver).await???;
    assert!(associate.contains(&fixture.session.uuid));
    Ok(())
}

#[tokio::test]
async fn test_cancel_by_uuid_through_handle() -> Result<()> {
    let temp = TempDir::new()?;
    let storage = temp.path().join("storage");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let conn = db::init_db(&temp.path().to_string_lossy())?;
    let fixture = seed_study(&conn, &storage, "1.2.840.5", port, 400, 64 * 1024)?;
    let conn = Arc::new(Mutex::new(conn));

    let (resume_tx, resume_rx) = oneshot::channel::<()>();
    let receiver = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let _ = resume_rx.await;
        let mut all = Vec::new();
        socket.read_to_end(&mut all).await?;
        anyhow::Ok(())
    });

    let dispatcher = Dispatcher::with_defaults(conn.clone(), test_config(&storage));
    let handle = dispatcher.handle();
    let join = dispatcher.start();

    wait_for_status(&conn, fixture.session.id, SessionStatus::Sending).await?;
    assert!(!handle.cancel_by_uuid("unknown-session"));
    assert!(handle.cancel_by_uuid(&fixture.session.uuid));

    wait_for_status(&conn, fixture.session.id, SessionStatus::Cancelled).await?;
    assert_eq!(handle.state(), DispatcherState::Running);
    let _ = resume_tx.send(());

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), join).await??;
    tokio::time::timeout(Duration::from_secs(5), receiver).await???;
    Ok(())
}
