//! Session Types and Data Structures

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::BrokerError;

/// Credentials carried by a [`SessionDescriptor`].
///
/// Resolution order at connect time is private key, then password, then the
/// local SSH agent when neither is present. Secrets are wiped on drop and
/// never appear in `Debug` output.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM/OpenSSH encoded private key content (not a path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl AuthMaterial {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            private_key: None,
            passphrase: None,
        }
    }

    pub fn private_key(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            password: None,
            private_key: Some(key.into()),
            passphrase,
        }
    }

    /// No explicit credential; the SSH agent is used.
    pub fn agent() -> Self {
        Self::default()
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMaterial")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Drop for AuthMaterial {
    fn drop(&mut self) {
        self.password.zeroize();
        self.private_key.zeroize();
        self.passphrase.zeroize();
    }
}

/// Immutable connection snapshot resolved by the session store.
///
/// The broker only reads it at connect time and never persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub user_id: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthMaterial,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl SessionDescriptor {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.session_id.clone())
    }

    /// Reject descriptors that could never produce a connection.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.user_id.trim().is_empty() {
            return Err(BrokerError::Validation("userId is required".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(BrokerError::Validation("sessionId is required".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(BrokerError::Validation("hostname is required".into()));
        }
        if self.hostname.chars().any(char::is_whitespace) {
            return Err(BrokerError::Validation(format!(
                "hostname '{}' contains whitespace",
                self.hostname
            )));
        }
        if self.port == 0 {
            return Err(BrokerError::Validation("port must be between 1 and 65535".into()));
        }
        if self.username.trim().is_empty() {
            return Err(BrokerError::Validation("username is required".into()));
        }
        if let Some(key) = &self.auth.private_key {
            if key.trim().is_empty() {
                return Err(BrokerError::Validation("privateKey is empty".into()));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.session_id.clone(),
            name: self
                .display_name
                .clone()
                .unwrap_or_else(|| format!("{}@{}", self.username, self.hostname)),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
        }
    }
}

/// Registry key: one live entry per (user, session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// Public part of a descriptor, safe to send to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub username: String,
}

/// Point-in-time view of a Live Remote Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub connection_id: String,
    pub key: SessionKey,
    pub session: SessionSummary,
    pub observer_count: usize,
    pub connected: bool,
    pub persistent: bool,
    pub assist_enabled: bool,
    pub idle_seconds: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity of one client-side channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(String);

impl ObserverId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ObserverId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a Live Remote Session or Transfer Session went away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Remote shell ended or the connection closed
    #[serde(rename_all = "camelCase")]
    RemoteClosed { exit_status: Option<u32> },
    /// Mid-session I/O failure
    ChannelError { message: String },
    /// Explicit disconnect with force
    ForceClosed,
    /// Last observer left a non-persistent session
    LastObserverDetached,
    /// Removed by the idle reaper
    IdleTimeout,
    /// Superseded by a fresh connection for the same key
    Replaced,
    /// Broker shutting down
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed { exit_status: Some(code) } => {
                write!(f, "remote shell exited with status {}", code)
            }
            DisconnectReason::RemoteClosed { exit_status: None } => {
                f.write_str("connection closed by remote host")
            }
            DisconnectReason::ChannelError { message } => write!(f, "channel error: {}", message),
            DisconnectReason::ForceClosed => f.write_str("disconnected by client"),
            DisconnectReason::LastObserverDetached => f.write_str("last observer detached"),
            DisconnectReason::IdleTimeout => f.write_str("idle timeout"),
            DisconnectReason::Replaced => f.write_str("replaced by a new connection"),
            DisconnectReason::Shutdown => f.write_str("broker shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            session_id: "s1".into(),
            user_id: "u1".into(),
            hostname: "example.com".into(),
            port: 22,
            username: "alice".into(),
            auth: AuthMaterial::password("hunter2"),
            display_name: None,
        }
    }

    #[test]
    fn test_validate_accepts_complete_descriptor() {
        assert!(descriptor().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut d = descriptor();
        d.hostname = "  ".into();
        assert!(matches!(d.validate(), Err(BrokerError::Validation(_))));

        let mut d = descriptor();
        d.port = 0;
        assert!(matches!(d.validate(), Err(BrokerError::Validation(_))));

        let mut d = descriptor();
        d.hostname = "bad host".into();
        assert!(matches!(d.validate(), Err(BrokerError::Validation(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let d = descriptor();
        let printed = format!("{:?}", d);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_summary_falls_back_to_user_at_host() {
        let d = descriptor();
        assert_eq!(d.summary().name, "alice@example.com");

        let mut named = descriptor();
        named.display_name = Some("prod".into());
        assert_eq!(named.summary().name, "prod");
    }

    #[test]
    fn test_descriptor_deserializes_camel_case() {
        let json = r#"{
            "sessionId": "s9",
            "userId": "u9",
            "hostname": "10.0.0.5",
            "username": "root",
            "auth": { "privateKey": "KEY", "passphrase": "pp" }
        }"#;
        let d: SessionDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.port, 22);
        assert_eq!(d.key(), SessionKey::new("u9", "s9"));
        assert_eq!(d.auth.private_key.as_deref(), Some("KEY"));
    }
}
