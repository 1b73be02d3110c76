//! Transfer Session
//!
//! An authenticated connection dedicated to file operations, independent of
//! any Live Remote Session. All transfers share the one file channel and are
//! tracked by id; each can be cancelled on its own.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::path_utils::{local_file_name, remote_file_name, resolve_remote_path};
use super::progress::{format_speed, percentage, SpeedMeter};
use super::remote_fs::RemoteFs;
use super::transfer::{TransferControl, TransferGuard, TransferTable};
use super::types::{
    DirectoryListing, FileEntry, FileKind, RemoteEntry, TransferDirection, TransferFailure,
    TransferProgress, TransferRecord, TransferState, TransferSummary,
};
use crate::config::{BrokerConfig, TransferSettings};
use crate::session::{DisconnectReason, SessionKey, SessionSummary, TransferObserver};
use crate::ssh::HandleController;

/// Point-in-time view of a Transfer Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSessionInfo {
    pub connection_id: String,
    pub key: SessionKey,
    pub session: SessionSummary,
    pub connected: bool,
    pub active_transfers: usize,
    pub idle_seconds: u64,
    pub created_at: DateTime<Utc>,
}

/// One in-flight transfer; unregisters itself when dropped
struct TransferTicket {
    id: String,
    direction: TransferDirection,
    local_path: String,
    remote_path: String,
    filename: String,
    started: Instant,
    control: Arc<TransferControl>,
    /// Observer at start time; a later reconnect does not take it over
    observer: Arc<dyn TransferObserver>,
    _guard: TransferGuard,
}

pub struct TransferSession {
    key: SessionKey,
    connection_id: String,
    summary: SessionSummary,
    created_at: DateTime<Utc>,
    fs: Arc<dyn RemoteFs>,
    controller: HandleController,
    transfers: Arc<TransferTable>,
    observer: RwLock<Arc<dyn TransferObserver>>,
    settings: TransferSettings,
    operation_timeout: Duration,
    last_activity: Mutex<Instant>,
    connected: AtomicBool,
}

impl TransferSession {
    pub(crate) fn new(
        key: SessionKey,
        summary: SessionSummary,
        fs: Arc<dyn RemoteFs>,
        controller: HandleController,
        observer: Arc<dyn TransferObserver>,
        config: &BrokerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            connection_id: uuid::Uuid::new_v4().to_string(),
            summary,
            created_at: Utc::now(),
            fs,
            controller,
            transfers: Arc::new(TransferTable::new()),
            observer: RwLock::new(observer),
            settings: config.transfer.clone(),
            operation_timeout: config.session.operation_timeout(),
            last_activity: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Route notifications for later transfers and for disconnect to a new
    /// observer. Transfers already running keep reporting to their own.
    pub fn set_observer(&self, observer: Arc<dyn TransferObserver>) {
        *self.observer.write() = observer;
    }

    fn observer(&self) -> Arc<dyn TransferObserver> {
        self.observer.read().clone()
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_activity.lock())
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn info(&self) -> TransferSessionInfo {
        TransferSessionInfo {
            connection_id: self.connection_id.clone(),
            key: self.key.clone(),
            session: self.summary.clone(),
            connected: self.is_connected(),
            active_transfers: self.transfers.len(),
            idle_seconds: self.idle_for().as_secs(),
            created_at: self.created_at,
        }
    }

    /// Live records of in-flight transfers, oldest first
    pub fn active_transfers(&self) -> Vec<TransferRecord> {
        self.transfers.records()
    }

    /// Resolve `path` against the login directory.
    pub fn resolve(&self, path: &str) -> String {
        resolve_remote_path(self.fs.home(), path)
    }

    fn ensure_connected(&self) -> Result<(), SftpError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SftpError::NotConnected)
        }
    }

    async fn bounded<T, F>(&self, what: impl Into<String>, fut: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SftpError::Timeout(what.into())),
        }
    }

    /// List a directory. Kinds come from the mode bits; directories sort
    /// first, then by name.
    pub async fn list(&self, path: &str) -> Result<DirectoryListing, SftpError> {
        self.ensure_connected()?;
        let path = self.resolve(path);
        debug!("Listing {} on {}", path, self.key);

        let entries = self
            .bounded(format!("listing {}", path), self.fs.read_dir(&path))
            .await?;
        self.touch();

        let mut files: Vec<FileEntry> = entries.into_iter().map(FileEntry::from_remote).collect();
        files.sort_by(|a, b| {
            let a_dir = a.kind == FileKind::Dir;
            let b_dir = b.kind == FileKind::Dir;
            b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
        });

        Ok(DirectoryListing { path, files })
    }

    pub async fn stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        self.ensure_connected()?;
        let path = self.resolve(path);
        let attrs = self
            .bounded(format!("stat {}", path), self.fs.stat(&path))
            .await?;
        self.touch();
        Ok(FileEntry::from_remote(RemoteEntry {
            name: remote_file_name(&path).to_string(),
            attrs,
        }))
    }

    /// Create a directory; an existing directory counts as success.
    pub async fn mkdir(&self, path: &str) -> Result<String, SftpError> {
        self.ensure_connected()?;
        let path = self.resolve(path);
        info!("Creating directory {} on {}", path, self.key);

        if let Err(e) = self
            .bounded(format!("mkdir {}", path), self.fs.mkdir(&path))
            .await
        {
            let existing = self
                .bounded(format!("stat {}", path), self.fs.stat(&path))
                .await;
            match existing {
                Ok(attrs) if FileKind::from_mode(attrs.permissions.unwrap_or(0)) == FileKind::Dir => {
                    debug!("Directory {} already exists", path);
                }
                _ => return Err(e),
            }
        }
        self.touch();
        Ok(path)
    }

    pub async fn rmdir(&self, path: &str) -> Result<String, SftpError> {
        self.ensure_connected()?;
        let path = self.resolve(path);
        info!("Removing directory {} on {}", path, self.key);
        self.bounded(format!("rmdir {}", path), self.fs.rmdir(&path))
            .await?;
        self.touch();
        Ok(path)
    }

    pub async fn unlink(&self, path: &str) -> Result<String, SftpError> {
        self.ensure_connected()?;
        let path = self.resolve(path);
        info!("Deleting {} on {}", path, self.key);
        self.bounded(format!("unlink {}", path), self.fs.unlink(&path))
            .await?;
        self.touch();
        Ok(path)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(String, String), SftpError> {
        self.ensure_connected()?;
        let from = self.resolve(from);
        let to = self.resolve(to);
        info!("Renaming {} -> {} on {}", from, to, self.key);
        self.bounded(format!("rename {}", from), self.fs.rename(&from, &to))
            .await?;
        self.touch();
        Ok((from, to))
    }

    /// Stream a local file to the remote side.
    pub async fn upload(
        &self,
        local_path: &str,
        remote_path: &str,
    ) -> Result<TransferSummary, SftpError> {
        self.ensure_connected()?;
        let remote_path = self.resolve(remote_path);
        let ticket = self.begin(
            TransferDirection::Upload,
            local_path,
            &remote_path,
            local_file_name(local_path),
        );
        let result = self.upload_inner(&ticket).await;
        self.finish(ticket, result)
    }

    /// Stream a remote file to a local path.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: &str,
    ) -> Result<TransferSummary, SftpError> {
        self.ensure_connected()?;
        let remote_path = self.resolve(remote_path);
        let filename = remote_file_name(&remote_path).to_string();
        let ticket = self.begin(TransferDirection::Download, local_path, &remote_path, filename);
        let result = self.download_inner(&ticket).await;
        self.finish(ticket, result)
    }

    /// Cancel one transfer; siblings keep running.
    pub fn cancel_transfer(&self, transfer_id: &str) -> Result<(), SftpError> {
        if self.transfers.cancel(transfer_id) {
            info!("Cancelling transfer {} on {}", transfer_id, self.key);
            Ok(())
        } else {
            Err(SftpError::TransferNotFound(transfer_id.to_string()))
        }
    }

    fn begin(
        &self,
        direction: TransferDirection,
        local_path: &str,
        remote_path: &str,
        filename: String,
    ) -> TransferTicket {
        let id = uuid::Uuid::new_v4().to_string();
        let control = self.transfers.register(TransferRecord {
            id: id.clone(),
            direction,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            total_bytes: 0,
            transferred_bytes: 0,
            started_at: Utc::now(),
            state: TransferState::Starting,
            error_detail: None,
        });
        info!(
            "Starting {:?} {} ({} <-> {}) on {}",
            direction, id, local_path, remote_path, self.key
        );
        TransferTicket {
            _guard: TransferGuard::new(self.transfers.clone(), id.clone()),
            id,
            direction,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            filename,
            started: Instant::now(),
            control,
            observer: self.observer(),
        }
    }

    /// Report the outcome; the record is dropped with the ticket.
    fn finish(
        &self,
        ticket: TransferTicket,
        result: Result<(u64, u64), SftpError>,
    ) -> Result<TransferSummary, SftpError> {
        match result {
            Ok((total, transferred)) => {
                self.transfers.update(&ticket.id, |record| {
                    record.state = TransferState::Complete;
                });
                let summary = TransferSummary {
                    success: true,
                    transfer_id: ticket.id.clone(),
                    direction: ticket.direction,
                    local_path: ticket.local_path.clone(),
                    remote_path: ticket.remote_path.clone(),
                    file_size: total,
                    transferred,
                    duration_ms: ticket.started.elapsed().as_millis() as u64,
                };
                info!(
                    "Transfer {} complete: {} bytes in {} ms",
                    summary.transfer_id, summary.transferred, summary.duration_ms
                );
                ticket.observer.on_complete(&summary);
                Ok(summary)
            }
            Err(e) => {
                self.transfers.update(&ticket.id, |record| {
                    record.state = TransferState::Error;
                    record.error_detail = Some(e.to_string());
                });
                warn!("Transfer {} failed: {}", ticket.id, e);
                ticket.observer.on_failed(
                    ticket.direction,
                    &TransferFailure {
                        transfer_id: ticket.id.clone(),
                        filename: ticket.filename.clone(),
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn upload_inner(&self, ticket: &TransferTicket) -> Result<(u64, u64), SftpError> {
        let mut local = tokio::fs::File::open(&ticket.local_path).await?;
        let total = local.metadata().await?.len();
        self.transfers
            .update(&ticket.id, |record| record.total_bytes = total);

        let mut remote = self
            .bounded(
                format!("open {}", ticket.remote_path),
                self.fs.create(&ticket.remote_path),
            )
            .await?;

        let transferred = self
            .copy_chunks(ticket, total, &mut local, &mut remote)
            .await?;
        Ok((total.max(transferred), transferred))
    }

    async fn download_inner(&self, ticket: &TransferTicket) -> Result<(u64, u64), SftpError> {
        let remote_path = &ticket.remote_path;
        let attrs = self
            .bounded(format!("stat {}", remote_path), self.fs.stat(remote_path))
            .await?;
        let total = attrs.size.unwrap_or(0);
        self.transfers
            .update(&ticket.id, |record| record.total_bytes = total);

        let mut remote = self
            .bounded(format!("open {}", remote_path), self.fs.open_read(remote_path))
            .await?;
        let mut local = tokio::fs::File::create(&ticket.local_path).await?;

        match self.copy_chunks(ticket, total, &mut remote, &mut local).await {
            Ok(transferred) => Ok((total.max(transferred), transferred)),
            Err(e) => {
                drop(local);
                if let Err(remove_err) = tokio::fs::remove_file(&ticket.local_path).await {
                    debug!(
                        "Could not remove partial download {}: {}",
                        ticket.local_path, remove_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Copy in `chunk_size` pieces, reporting progress after every chunk.
    /// Cancellation is honored at chunk boundaries and while waiting on I/O.
    async fn copy_chunks<R, W>(
        &self,
        ticket: &TransferTicket,
        total: u64,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<u64, SftpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let transfer_id = ticket.id.as_str();
        let control = &ticket.control;
        let io_timeout = self.settings.io_timeout();
        let mut buffer = vec![0u8; self.settings.chunk_size.max(1)];
        let mut cancel_rx = control.subscribe();
        let mut meter = SpeedMeter::start();
        let mut transferred = 0u64;

        loop {
            if control.is_cancelled() || !self.is_connected() {
                info!("Transfer {} cancelled at {} bytes", transfer_id, transferred);
                return Err(SftpError::TransferCancelled);
            }

            let read = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    info!("Transfer {} cancelled at {} bytes", transfer_id, transferred);
                    return Err(SftpError::TransferCancelled);
                }
                read = tokio::time::timeout(io_timeout, fill(reader, &mut buffer)) => read,
            };
            let n = match read {
                Ok(result) => result?,
                Err(_) => {
                    warn!("Read timeout on transfer {} at {} bytes", transfer_id, transferred);
                    return Err(SftpError::Timeout(format!("read at {} bytes", transferred)));
                }
            };
            if n == 0 {
                break;
            }

            match tokio::time::timeout(io_timeout, writer.write_all(&buffer[..n])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SftpError::IoError(e)),
                Err(_) => {
                    warn!("Write timeout on transfer {} at {} bytes", transfer_id, transferred);
                    return Err(SftpError::Timeout(format!("write at {} bytes", transferred)));
                }
            }

            transferred += n as u64;
            self.transfers.advance(transfer_id, transferred);
            self.touch();

            let speed = meter.record(n);
            let total = total.max(transferred);
            ticket.observer.on_progress(
                ticket.direction,
                &TransferProgress {
                    transfer_id: transfer_id.to_string(),
                    filename: ticket.filename.clone(),
                    transferred,
                    total,
                    percentage: percentage(transferred, total),
                    speed,
                    speed_text: format_speed(speed),
                },
            );
        }

        match tokio::time::timeout(io_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SftpError::IoError(e)),
            Err(_) => return Err(SftpError::Timeout("closing file".into())),
        }

        debug!(
            "Transfer {} copied {} bytes in {:?}",
            transfer_id,
            transferred,
            meter.elapsed()
        );
        Ok(transferred)
    }

    /// Cancel every transfer, notify the observer and close the connection.
    /// Returns false if already shut down.
    pub async fn shutdown(&self, reason: DisconnectReason) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        let cancelled = self.transfers.cancel_all();
        self.observer().on_disconnected(&reason);
        self.controller.disconnect().await;
        info!(
            "Transfer session {} ({}) closed: {} ({} transfers cancelled)",
            self.key, self.connection_id, reason, cancelled
        );
        true
    }
}

/// Read until `buffer` is full or EOF.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
