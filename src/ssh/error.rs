//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    /// Private key could not be decoded or decrypted
    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Connection owner task is gone
    #[error("Connection closed")]
    Disconnected,

    #[error("SSH agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH agent error: {0}")]
    AgentError(String),
}

impl SshError {
    /// True for failures that happened while proving identity to the server.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_)
                | SshError::KeyError(_)
                | SshError::AgentNotAvailable(_)
                | SshError::AgentError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
