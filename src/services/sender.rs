use crate::core::config::{Config, MAX_CHUNK_SIZE_KB};
use crate::core::transfer::{FileSet, ProgressInfo, SessionStatus};
use crate::db::{Destination, OutgoingSession};
use crate::services::notifier::SessionNotifier;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// Handle the dispatcher keeps for one running transfer.
pub trait TransferTask: Send + Sync {
    /// Begins the transfer on its own tokio task. Later calls are ignored.
    fn start(self: Arc<Self>);

    /// Becomes true once, when the transfer has finished in any way, and stays true.
    fn is_done(&self) -> bool;

    /// Requests cooperative cancellation. Safe to call at any time, any number of times.
    fn cancel(&self);

    fn uuid(&self) -> &str;

    fn matches_uuid(&self, uuid: &str) -> bool {
        self.uuid() == uuid
    }
}

/// Builds transfer tasks for claimed sessions. Construction never starts work.
pub trait TaskFactory: Send + Sync {
    fn create(
        &self,
        session: &OutgoingSession,
        destination: Destination,
        files: FileSet,
    ) -> Arc<dyn TransferTask>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub connect_timeout: Duration,
    pub chunk_size: usize,
}

impl SendOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            chunk_size: config
                .chunk_size_bytes()
                .clamp(1, MAX_CHUNK_SIZE_KB * 1024),
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct SenderFactory {
    notifier: Arc<dyn SessionNotifier>,
    options: SendOptions,
}

impl SenderFactory {
    pub fn new(notifier: Arc<dyn SessionNotifier>, options: SendOptions) -> Self {
        Self { notifier, options }
    }
}

impl TaskFactory for SenderFactory {
    fn create(
        &self,
        session: &OutgoingSession,
        destination: Destination,
        files: FileSet,
    ) -> Arc<dyn TransferTask> {
        Arc::new(SenderTask::new(
            session.uuid.clone(),
            destination,
            files,
            self.options,
            self.notifier.clone(),
        ))
    }
}

/// Sets the done flag when dropped, so a panicking or dropped transfer still reports done.
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Framing written ahead of the payload bytes, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame<'a> {
    Associate {
        session: &'a str,
        calling_ae: &'a str,
        called_ae: &'a str,
        files: usize,
    },
    File {
        item: &'a str,
        size: u64,
    },
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Completed(ProgressInfo),
    Cancelled(ProgressInfo),
}

/// Streams one session's files to its destination over TCP.
pub struct SenderTask {
    uuid: String,
    destination: Destination,
    files: FileSet,
    options: SendOptions,
    notifier: Arc<dyn SessionNotifier>,
    cancel_token: Arc<AtomicBool>,
    cancel_notify: Notify,
    done: Arc<AtomicBool>,
    started: AtomicBool,
}

impl SenderTask {
    pub fn new(
        uuid: String,
        destination: Destination,
        files: FileSet,
        options: SendOptions,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self {
            uuid,
            destination,
            files,
            options,
            notifier,
            cancel_token: Arc::new(AtomicBool::new(false)),
            cancel_notify: Notify::new(),
            done: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token.load(Ordering::Acquire)
    }

    async fn run(&self) {
        if self.is_cancelled() {
            self.notifier
                .status_changed(&self.uuid, SessionStatus::Cancelled, "cancelled before start");
            return;
        }

        self.notifier.status_changed(
            &self.uuid,
            SessionStatus::Sending,
            &format!(
                "sending {} files to {} ({}:{})",
                self.files.len(),
                self.destination.name,
                self.destination.destination_host,
                self.destination.destination_port
            ),
        );

        let (status, detail) = match self.send_all().await {
            Ok(SendOutcome::Completed(progress)) => (
                SessionStatus::Completed,
                format!("{} files sent ({} bytes)", progress.files_sent, progress.bytes_sent),
            ),
            Ok(SendOutcome::Cancelled(progress)) => (
                SessionStatus::Cancelled,
                format!(
                    "cancelled after {} of {} files",
                    progress.files_sent, progress.files_total
                ),
            ),
            Err(e) => {
                error!("Send failed for session {}: {:#}", self.uuid, e);
                (SessionStatus::Failed, format!("{:#}", e))
            }
        };

        info!("Session {} finished: {} ({})", self.uuid, status, detail);
        self.notifier.status_changed(&self.uuid, status, &detail);
    }

    async fn send_all(&self) -> Result<SendOutcome> {
        let addr = format!(
            "{}:{}",
            self.destination.destination_host, self.destination.destination_port
        );
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("timed out connecting to {}", addr))?
            .with_context(|| format!("failed to connect to {}", addr))?;
        debug!("Session {} connected to {}", self.uuid, addr);

        let mut out = BufWriter::new(stream);
        let mut progress = ProgressInfo {
            files_total: self.files.len(),
            ..Default::default()
        };

        let associate = frame_line(&Frame::Associate {
            session: &self.uuid,
            calling_ae: &self.destination.source_ae,
            called_ae: &self.destination.destination_ae,
            files: self.files.len(),
        })?;
        if !self.write_or_cancel(&mut out, &associate).await? {
            return Ok(SendOutcome::Cancelled(progress));
        }

        let mut buf = vec![0u8; self.options.chunk_size];

        for (item, path) in &self.files {
            if self.is_cancelled() {
                return Ok(SendOutcome::Cancelled(progress));
            }

            let mut file = File::open(path)
                .await
                .with_context(|| format!("open {:?}", path))?;
            let size = file
                .metadata()
                .await
                .with_context(|| format!("stat {:?}", path))?
                .len();
            if !self
                .write_or_cancel(&mut out, &frame_line(&Frame::File { item, size })?)
                .await?
            {
                return Ok(SendOutcome::Cancelled(progress));
            }

            let mut remaining = size;
            while remaining > 0 {
                if self.is_cancelled() {
                    return Ok(SendOutcome::Cancelled(progress));
                }
                let want = read_len(buf.len(), remaining);
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    bail!("{:?} shrank while sending", path);
                }
                if !self.write_or_cancel(&mut out, &buf[..n]).await? {
                    return Ok(SendOutcome::Cancelled(progress));
                }
                remaining -= n as u64;
                progress.bytes_sent += n as u64;
            }

            progress.files_sent += 1;
            self.notifier.progress(&self.uuid, &progress);
        }

        if !self.write_or_cancel(&mut out, &frame_line(&Frame::Release)?).await? {
            return Ok(SendOutcome::Cancelled(progress));
        }
        tokio::select! {
            res = out.shutdown() => res.context("close association")?,
            _ = self.cancel_notify.notified() => return Ok(SendOutcome::Cancelled(progress)),
        }
        Ok(SendOutcome::Completed(progress))
    }

    /// Writes `bytes` unless cancellation arrives first, even while the peer
    /// has stopped reading. Returns false when cancelled.
    async fn write_or_cancel<W: AsyncWrite + Unpin>(&self, out: &mut W, bytes: &[u8]) -> Result<bool> {
        tokio::select! {
            res = out.write_all(bytes) => {
                res?;
                Ok(true)
            }
            _ = self.cancel_notify.notified() => Ok(false),
        }
    }
}

/// Bytes to read next: a full buffer, or what is left of the file.
fn read_len(buf_len: usize, remaining: u64) -> usize {
    buf_len.min(usize::try_from(remaining).unwrap_or(usize::MAX))
}

fn frame_line(frame: &Frame<'_>) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

impl TransferTask for SenderTask {
    fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let guard = DoneGuard(self.done.clone());
        tokio::spawn(async move {
            let _guard = guard;
            self.run().await;
        });
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if !self.is_done() && !self.cancel_token.swap(true, Ordering::AcqRel) {
            info!("Cancellation requested for session {}", self.uuid);
            // Stores a permit, so a write that starts waiting later still wakes.
            self.cancel_notify.notify_one();
        }
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }
}
