//! Client gateway
//!
//! Typed entry point for one client-side channel (a browser tab, say). The
//! host process authenticates the user, owns the transport and feeds
//! [`ClientRequest`]s in; everything the broker has to say comes back as
//! [`BrokerEvent`]s on the channel's event queue.
//!
//! Closing a channel detaches it without force, so a persistent session
//! stays up for the next channel to reattach.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assist::AssistEvent;
use crate::broker::Broker;
use crate::error::BrokerError;
use crate::events::{
    BrokerEvent, DisconnectPayload, ErrorPayload, MessagePayload, PathPayload, RenamePayload,
    StatusPayload, TransferIdPayload,
};
use crate::session::{
    ConnectOptions, DisconnectReason, LiveSession, ObserverId, SessionDescriptor, SessionKey,
    SessionObserver, TransferObserver,
};
use crate::sftp::{
    SftpError, TransferDirection, TransferFailure, TransferProgress, TransferSession,
    TransferSummary,
};

/// Resolves stored sessions for an authenticated user.
///
/// Implementations decrypt credentials before returning; the broker never
/// stores the descriptor.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn descriptor(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<SessionDescriptor, BrokerError>;
}

fn default_true() -> bool {
    true
}

/// Inbound client message, `{"type": "<kebab-name>", ...fields}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    ConnectSession {
        session_id: String,
        #[serde(default = "default_true")]
        reuse_existing: bool,
        #[serde(default)]
        persistent: bool,
    },
    Input {
        data: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectSession {
        #[serde(default)]
        force_close: bool,
    },
    SessionStatus,

    SetAssist {
        enabled: bool,
    },
    AnalyzeOutput,
    AskAssistant {
        question: String,
    },
    ApproveCommand {
        command: String,
    },

    #[serde(rename_all = "camelCase")]
    SftpConnect {
        session_id: String,
    },
    SftpList {
        path: String,
    },
    SftpStat {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpUpload {
        local_path: String,
        remote_path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpDownload {
        remote_path: String,
        local_path: String,
    },
    SftpMkdir {
        path: String,
    },
    SftpRmdir {
        path: String,
    },
    SftpUnlink {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpRename {
        old_path: String,
        new_path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpCancel {
        transfer_id: String,
    },
    SftpTransfers,
    SftpDisconnect,
}

/// Observer side of a client channel: callbacks become queued events.
struct ChannelObserver {
    id: ObserverId,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl ChannelObserver {
    fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() {
            debug!("Client channel {} gone, event dropped", self.id);
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn id(&self) -> &ObserverId {
        &self.id
    }

    fn on_output(&self, data: &Bytes) {
        self.emit(BrokerEvent::terminal_output(data));
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.emit(BrokerEvent::TerminalDisconnected(DisconnectPayload::from(reason)));
    }

    fn on_error(&self, message: &str) {
        self.emit(BrokerEvent::TerminalError(MessagePayload {
            message: message.to_string(),
        }));
    }

    fn on_assist(&self, event: &AssistEvent) {
        self.emit(BrokerEvent::from(event));
    }
}

impl TransferObserver for ChannelObserver {
    fn on_progress(&self, direction: TransferDirection, progress: &TransferProgress) {
        self.emit(BrokerEvent::progress(direction, progress.clone()));
    }

    fn on_complete(&self, summary: &TransferSummary) {
        self.emit(BrokerEvent::transfer_complete(summary.clone()));
    }

    fn on_failed(&self, direction: TransferDirection, failure: &TransferFailure) {
        self.emit(BrokerEvent::transfer_failed(direction, failure.clone()));
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.emit(BrokerEvent::SftpDisconnected(DisconnectPayload::from(reason)));
    }
}

/// One client-side channel bound to an authenticated user
pub struct ClientChannel {
    user_id: String,
    broker: Arc<Broker>,
    store: Arc<dyn SessionStore>,
    observer: Arc<ChannelObserver>,
    transfer_key: Mutex<Option<SessionKey>>,
}

impl ClientChannel {
    /// Open a channel; events for it arrive on the returned receiver.
    pub fn new(
        user_id: impl Into<String>,
        broker: Arc<Broker>,
        store: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Self {
            user_id: user_id.into(),
            broker,
            store,
            observer: Arc::new(ChannelObserver {
                id: ObserverId::new(),
                events,
            }),
            transfer_key: Mutex::new(None),
        };
        (channel, rx)
    }

    pub fn id(&self) -> &ObserverId {
        &self.observer.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn emit(&self, event: BrokerEvent) {
        self.observer.emit(event);
    }

    /// Parse and dispatch a JSON request.
    pub async fn handle_json(&self, text: &str) {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Malformed request on channel {}: {}", self.id(), e);
                let err = BrokerError::Validation(format!("malformed request: {}", e));
                self.emit(BrokerEvent::ConnectionError(ErrorPayload::from(&err)));
            }
        }
    }

    /// Dispatch one request. Failures are reported as events, never returned.
    pub async fn handle(&self, request: ClientRequest) {
        match request {
            ClientRequest::ConnectSession {
                session_id,
                reuse_existing,
                persistent,
            } => {
                let options = ConnectOptions {
                    reuse_existing,
                    persistent,
                };
                match self.connect_session(&session_id, options).await {
                    Ok(established) => self.emit(BrokerEvent::ConnectionEstablished(established)),
                    Err(e) => self.emit(BrokerEvent::ConnectionError(ErrorPayload::from(&e))),
                }
            }
            ClientRequest::Input { data } => {
                if let Err(e) = self.broker.sessions().write(self.id(), data.as_bytes()).await {
                    self.terminal_error(&e);
                }
            }
            ClientRequest::Resize { rows, cols } => {
                if let Err(e) = self.broker.sessions().resize(self.id(), rows, cols).await {
                    self.terminal_error(&e);
                }
            }
            ClientRequest::DisconnectSession { force_close } => {
                self.disconnect_session(force_close).await;
            }
            ClientRequest::SessionStatus => self.session_status(),

            ClientRequest::SetAssist { enabled } => {
                let result = self
                    .live_session()
                    .and_then(|session| session.set_assist_enabled(enabled));
                if let Err(e) = result {
                    self.assist_error(&e);
                }
            }
            ClientRequest::AnalyzeOutput => match self.live_session() {
                Ok(session) => {
                    if let Err(e) = session.analyze_now().await {
                        self.assist_error(&e);
                    }
                }
                Err(e) => self.assist_error(&e),
            },
            ClientRequest::AskAssistant { question } => match self.live_session() {
                Ok(session) => {
                    if let Err(e) = session.ask_assistant(&question).await {
                        self.assist_error(&e);
                    }
                }
                Err(e) => self.assist_error(&e),
            },
            ClientRequest::ApproveCommand { command } => match self.live_session() {
                Ok(session) => {
                    if let Err(e) = session.execute_approved(&command).await {
                        self.assist_error(&e);
                    }
                }
                Err(e) => self.assist_error(&e),
            },

            ClientRequest::SftpConnect { session_id } => {
                match self.connect_transfer(&session_id).await {
                    Ok(established) => self.emit(BrokerEvent::SftpConnected(established)),
                    Err(e) => self.emit(BrokerEvent::SftpConnectionError(ErrorPayload::from(&e))),
                }
            }
            ClientRequest::SftpDisconnect => {
                let key = self.transfer_key.lock().take();
                let result = match key {
                    Some(key) => self.broker.transfers().disconnect(&key).await,
                    None => Err(BrokerError::not_found("transfer session", self.user_id.as_str())),
                };
                if let Err(e) = result {
                    self.sftp_error(&e);
                }
            }
            request => {
                if let Err(e) = self.handle_file_request(request).await {
                    self.sftp_error(&e);
                }
            }
        }
    }

    async fn handle_file_request(&self, request: ClientRequest) -> Result<(), BrokerError> {
        let session = self.transfer_session()?;
        let event = match request {
            ClientRequest::SftpList { path } => {
                BrokerEvent::SftpDirectoryListed(session.list(&path).await?)
            }
            ClientRequest::SftpStat { path } => BrokerEvent::SftpFileInfo(session.stat(&path).await?),
            ClientRequest::SftpMkdir { path } => BrokerEvent::SftpDirectoryCreated(PathPayload {
                remote_path: session.mkdir(&path).await?,
            }),
            ClientRequest::SftpRmdir { path } => BrokerEvent::SftpDirectoryDeleted(PathPayload {
                remote_path: session.rmdir(&path).await?,
            }),
            ClientRequest::SftpUnlink { path } => BrokerEvent::SftpFileDeleted(PathPayload {
                remote_path: session.unlink(&path).await?,
            }),
            ClientRequest::SftpRename { old_path, new_path } => {
                let (old_path, new_path) = session.rename(&old_path, &new_path).await?;
                BrokerEvent::SftpFileRenamed(RenamePayload { old_path, new_path })
            }
            ClientRequest::SftpCancel { transfer_id } => {
                session.cancel_transfer(&transfer_id)?;
                BrokerEvent::SftpTransferCancelled(TransferIdPayload { transfer_id })
            }
            ClientRequest::SftpTransfers => BrokerEvent::SftpTransfers(session.active_transfers()),
            ClientRequest::SftpUpload {
                local_path,
                remote_path,
            } => {
                // Outcome is reported through the observer
                return transfer_outcome(session.upload(&local_path, &remote_path).await);
            }
            ClientRequest::SftpDownload {
                remote_path,
                local_path,
            } => {
                return transfer_outcome(session.download(&remote_path, &local_path).await);
            }
            other => {
                return Err(BrokerError::Validation(format!(
                    "unexpected file request {:?}",
                    other
                )))
            }
        };
        self.emit(event);
        Ok(())
    }

    async fn resolve(&self, session_id: &str) -> Result<SessionDescriptor, BrokerError> {
        let descriptor = self.store.descriptor(&self.user_id, session_id).await?;
        if descriptor.user_id != self.user_id {
            return Err(BrokerError::not_found("session", session_id));
        }
        Ok(descriptor)
    }

    async fn connect_session(
        &self,
        session_id: &str,
        options: ConnectOptions,
    ) -> Result<crate::events::ConnectionEstablished, BrokerError> {
        let descriptor = self.resolve(session_id).await?;
        let observer: Arc<dyn SessionObserver> = self.observer.clone();
        self.broker
            .sessions()
            .connect(&descriptor, observer, options)
            .await
    }

    async fn connect_transfer(
        &self,
        session_id: &str,
    ) -> Result<crate::events::ConnectionEstablished, BrokerError> {
        let descriptor = self.resolve(session_id).await?;
        let observer: Arc<dyn TransferObserver> = self.observer.clone();
        let established = self
            .broker
            .transfers()
            .connect(&descriptor, observer)
            .await?;
        *self.transfer_key.lock() = Some(descriptor.key());
        Ok(established)
    }

    async fn disconnect_session(&self, force_close: bool) {
        let sessions = self.broker.sessions();
        if sessions.session_for(self.id()).is_err() {
            self.emit(BrokerEvent::ConnectionStatus(StatusPayload {
                connected: false,
                session: None,
            }));
            return;
        }
        // A closed session reports through on_disconnected
        if !sessions.detach(self.id(), force_close).await {
            self.emit(BrokerEvent::ConnectionStatus(StatusPayload {
                connected: false,
                session: None,
            }));
        }
    }

    fn session_status(&self) {
        let session = self.broker.sessions().session_for(self.id()).ok();
        self.emit(BrokerEvent::ConnectionStatus(StatusPayload {
            connected: session.as_ref().is_some_and(|s| s.is_connected()),
            session: session.map(|s| s.info()),
        }));
    }

    fn live_session(&self) -> Result<Arc<LiveSession>, BrokerError> {
        self.broker.sessions().session_for(self.id())
    }

    fn transfer_session(&self) -> Result<Arc<TransferSession>, BrokerError> {
        let key = self
            .transfer_key
            .lock()
            .clone()
            .ok_or_else(|| BrokerError::not_found("transfer session", self.user_id.as_str()))?;
        self.broker.transfers().session(&key)
    }

    fn terminal_error(&self, err: &BrokerError) {
        self.emit(BrokerEvent::TerminalError(MessagePayload {
            message: err.to_string(),
        }));
    }

    fn assist_error(&self, err: &BrokerError) {
        // Analyzer failures were already reported by the session
        if !matches!(err, BrokerError::Analysis(_)) {
            self.emit(BrokerEvent::AssistError(MessagePayload {
                message: err.to_string(),
            }));
        }
    }

    fn sftp_error(&self, err: &BrokerError) {
        self.emit(BrokerEvent::SftpError(ErrorPayload::from(err)));
    }

    /// Detach from the terminal session without force.
    pub async fn close(&self) {
        if self.broker.sessions().detach(self.id(), false).await {
            info!("Channel {} closed its session", self.id());
        } else {
            debug!("Channel {} closed", self.id());
        }
    }
}

/// Transfer failures were reported through the observer; only a refusal to
/// start is left for the caller.
fn transfer_outcome(result: Result<TransferSummary, SftpError>) -> Result<(), BrokerError> {
    match result {
        Ok(_) => Ok(()),
        Err(SftpError::NotConnected) => Err(SftpError::NotConnected.into()),
        Err(_) => Ok(()),
    }
}
