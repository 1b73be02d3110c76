//! Outbound notifications
//!
//! One closed enum for everything the broker tells a client. Serialized as
//! `{"event": "<kebab-name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::assist::{AnalysisResponse, AssistEvent};
use crate::error::{BrokerError, ErrorKind};
use crate::session::{DisconnectReason, SessionInfo, SessionSummary};
use crate::sftp::{
    DirectoryListing, FileEntry, TransferDirection, TransferFailure, TransferProgress,
    TransferRecord, TransferSummary,
};

/// Result of a successful connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub success: bool,
    pub connection_id: String,
    pub session: SessionSummary,
    /// Attached to an already running session
    #[serde(default)]
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BrokerError> for ErrorPayload {
    fn from(err: &BrokerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    pub reason: DisconnectReason,
    pub message: String,
}

impl From<&DisconnectReason> for DisconnectPayload {
    fn from(reason: &DisconnectReason) -> Self {
        Self {
            message: reason.to_string(),
            reason: reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePayload {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIdPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionPayload {
    pub command: String,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistStatusPayload {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BrokerEvent {
    // Terminal
    ConnectionEstablished(ConnectionEstablished),
    ConnectionError(ErrorPayload),
    ConnectionStatus(StatusPayload),
    /// Output as (lossy) UTF-8 text
    TerminalOutput(String),
    TerminalDisconnected(DisconnectPayload),
    TerminalError(MessagePayload),

    // Assistant
    AssistStatus(AssistStatusPayload),
    AssistProcessingStart,
    AssistProcessingEnd,
    AssistResponse(AnalysisResponse),
    AssistCommandSuggestion(SuggestionPayload),
    AssistCommandExecuted(CommandPayload),
    AssistError(MessagePayload),

    // File transfer
    SftpConnected(ConnectionEstablished),
    SftpConnectionError(ErrorPayload),
    SftpDirectoryListed(DirectoryListing),
    SftpFileInfo(FileEntry),
    SftpUploadProgress(TransferProgress),
    SftpUploadComplete(TransferSummary),
    SftpUploadError(TransferFailure),
    SftpDownloadProgress(TransferProgress),
    SftpDownloadComplete(TransferSummary),
    SftpDownloadError(TransferFailure),
    SftpDirectoryCreated(PathPayload),
    SftpFileDeleted(PathPayload),
    SftpDirectoryDeleted(PathPayload),
    SftpFileRenamed(RenamePayload),
    SftpTransferCancelled(TransferIdPayload),
    SftpTransfers(Vec<TransferRecord>),
    SftpError(ErrorPayload),
    SftpDisconnected(DisconnectPayload),
}

impl BrokerEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::ConnectionEstablished(_) => "connection-established",
            BrokerEvent::ConnectionError(_) => "connection-error",
            BrokerEvent::ConnectionStatus(_) => "connection-status",
            BrokerEvent::TerminalOutput(_) => "terminal-output",
            BrokerEvent::TerminalDisconnected(_) => "terminal-disconnected",
            BrokerEvent::TerminalError(_) => "terminal-error",
            BrokerEvent::AssistStatus(_) => "assist-status",
            BrokerEvent::AssistProcessingStart => "assist-processing-start",
            BrokerEvent::AssistProcessingEnd => "assist-processing-end",
            BrokerEvent::AssistResponse(_) => "assist-response",
            BrokerEvent::AssistCommandSuggestion(_) => "assist-command-suggestion",
            BrokerEvent::AssistCommandExecuted(_) => "assist-command-executed",
            BrokerEvent::AssistError(_) => "assist-error",
            BrokerEvent::SftpConnected(_) => "sftp-connected",
            BrokerEvent::SftpConnectionError(_) => "sftp-connection-error",
            BrokerEvent::SftpDirectoryListed(_) => "sftp-directory-listed",
            BrokerEvent::SftpFileInfo(_) => "sftp-file-info",
            BrokerEvent::SftpUploadProgress(_) => "sftp-upload-progress",
            BrokerEvent::SftpUploadComplete(_) => "sftp-upload-complete",
            BrokerEvent::SftpUploadError(_) => "sftp-upload-error",
            BrokerEvent::SftpDownloadProgress(_) => "sftp-download-progress",
            BrokerEvent::SftpDownloadComplete(_) => "sftp-download-complete",
            BrokerEvent::SftpDownloadError(_) => "sftp-download-error",
            BrokerEvent::SftpDirectoryCreated(_) => "sftp-directory-created",
            BrokerEvent::SftpFileDeleted(_) => "sftp-file-deleted",
            BrokerEvent::SftpDirectoryDeleted(_) => "sftp-directory-deleted",
            BrokerEvent::SftpFileRenamed(_) => "sftp-file-renamed",
            BrokerEvent::SftpTransferCancelled(_) => "sftp-transfer-cancelled",
            BrokerEvent::SftpTransfers(_) => "sftp-transfers",
            BrokerEvent::SftpError(_) => "sftp-error",
            BrokerEvent::SftpDisconnected(_) => "sftp-disconnected",
        }
    }

    pub fn terminal_output(data: &[u8]) -> Self {
        BrokerEvent::TerminalOutput(String::from_utf8_lossy(data).into_owned())
    }

    pub fn progress(direction: TransferDirection, progress: TransferProgress) -> Self {
        match direction {
            TransferDirection::Upload => BrokerEvent::SftpUploadProgress(progress),
            TransferDirection::Download => BrokerEvent::SftpDownloadProgress(progress),
        }
    }

    pub fn transfer_complete(summary: TransferSummary) -> Self {
        match summary.direction {
            TransferDirection::Upload => BrokerEvent::SftpUploadComplete(summary),
            TransferDirection::Download => BrokerEvent::SftpDownloadComplete(summary),
        }
    }

    pub fn transfer_failed(direction: TransferDirection, failure: TransferFailure) -> Self {
        match direction {
            TransferDirection::Upload => BrokerEvent::SftpUploadError(failure),
            TransferDirection::Download => BrokerEvent::SftpDownloadError(failure),
        }
    }
}

impl From<&AssistEvent> for BrokerEvent {
    fn from(event: &AssistEvent) -> Self {
        match event {
            AssistEvent::Status { enabled } => {
                BrokerEvent::AssistStatus(AssistStatusPayload { enabled: *enabled })
            }
            AssistEvent::ProcessingStarted { .. } => BrokerEvent::AssistProcessingStart,
            AssistEvent::ProcessingFinished { .. } => BrokerEvent::AssistProcessingEnd,
            AssistEvent::Response(response) => BrokerEvent::AssistResponse(response.clone()),
            AssistEvent::CommandSuggestion { command } => {
                BrokerEvent::AssistCommandSuggestion(SuggestionPayload {
                    command: command.clone(),
                    requires_approval: true,
                })
            }
            AssistEvent::CommandExecuted { command } => {
                BrokerEvent::AssistCommandExecuted(CommandPayload {
                    command: command.clone(),
                })
            }
            AssistEvent::Error { message } => BrokerEvent::AssistError(MessagePayload {
                message: message.clone(),
            }),
        }
    }
}
