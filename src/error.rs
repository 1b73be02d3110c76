//! Broker error taxonomy
//!
//! Lower layers keep their own enums ([`SshError`], [`SftpError`]); everything
//! that reaches a caller of the broker is folded into [`BrokerError`].

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::sftp::SftpError;
use crate::ssh::SshError;

/// Which bounded step ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPhase {
    Connect,
    Channel,
    Attach,
    Operation,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Channel => "channel negotiation",
            TimeoutPhase::Attach => "attach",
            TimeoutPhase::Operation => "operation",
        })
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timed out during {0}")]
    Timeout(TimeoutPhase),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Transfer failed: {0}")]
    Transfer(SftpError),

    #[error("Analysis failed: {0}")]
    Analysis(String),
}

/// Stable, serializable error class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Authentication,
    Timeout,
    Connection,
    Channel,
    NotFound,
    Validation,
    Transfer,
    Analysis,
}

impl BrokerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Authentication(_) => ErrorKind::Authentication,
            BrokerError::Timeout(_) => ErrorKind::Timeout,
            BrokerError::Connection(_) => ErrorKind::Connection,
            BrokerError::Channel(_) => ErrorKind::Channel,
            BrokerError::NotFound { .. } => ErrorKind::NotFound,
            BrokerError::Validation(_) => ErrorKind::Validation,
            BrokerError::Transfer(_) => ErrorKind::Transfer,
            BrokerError::Analysis(_) => ErrorKind::Analysis,
        }
    }
}

impl From<SshError> for BrokerError {
    fn from(err: SshError) -> Self {
        if err.is_auth_failure() {
            return BrokerError::Authentication(err.to_string());
        }
        match err {
            SshError::ConnectionFailed(msg) => BrokerError::Connection(msg),
            SshError::HostKeyRejected(msg) => {
                BrokerError::Connection(format!("host key rejected: {}", msg))
            }
            SshError::Timeout(_) => BrokerError::Timeout(TimeoutPhase::Connect),
            other => BrokerError::Channel(other.to_string()),
        }
    }
}

impl From<SftpError> for BrokerError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::TransferNotFound(id) => BrokerError::not_found("transfer", id),
            SftpError::ChannelError(msg) | SftpError::SubsystemNotAvailable(msg) => {
                BrokerError::Channel(msg)
            }
            SftpError::Timeout(_) => BrokerError::Timeout(TimeoutPhase::Operation),
            other => BrokerError::Transfer(other),
        }
    }
}

impl Serialize for BrokerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
