//! SSH Configuration

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::agent::AgentSettings;
use crate::session::SessionDescriptor;

/// SSH connection configuration for one outbound connection
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Keepalive interval in seconds (0 disables)
    pub keepalive_secs: u64,

    /// Missed keepalives before the connection is dropped
    pub keepalive_max: usize,

    /// What to do with server host keys
    pub host_key_policy: HostKeyPolicy,

    /// Agent used when the descriptor carries no credential
    pub agent: AgentSettings,
}

impl SshConfig {
    /// Build a connection config from a descriptor.
    ///
    /// Picks the first available credential: private key, password, agent.
    pub fn from_descriptor(descriptor: &SessionDescriptor, settings: &SshSettings) -> Self {
        let material = &descriptor.auth;
        let auth = if let Some(key) = &material.private_key {
            AuthMethod::KeyData {
                private_key: key.clone(),
                passphrase: material.passphrase.clone(),
            }
        } else if let Some(password) = &material.password {
            AuthMethod::Password {
                password: password.clone(),
            }
        } else {
            AuthMethod::Agent
        };

        Self {
            host: descriptor.hostname.clone(),
            port: descriptor.port,
            username: descriptor.username.clone(),
            auth,
            keepalive_secs: settings.keepalive_interval_secs,
            keepalive_max: settings.keepalive_max,
            host_key_policy: settings.host_key_policy,
            agent: settings.agent.clone(),
        }
    }
}

/// Authentication methods supported
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// In-memory private key
    KeyData {
        private_key: String,
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::KeyData { .. } => "publickey",
            AuthMethod::Agent => "agent",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthMethod::{}", self.label())
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password { password } => password.zeroize(),
            AuthMethod::KeyData {
                private_key,
                passphrase,
            } => {
                private_key.zeroize();
                passphrase.zeroize();
            }
            AuthMethod::Agent => {}
        }
    }
}

/// Server host key handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept every key without recording it
    AcceptAny,
    /// Trust on first use: record unknown keys, reject changed ones
    #[default]
    AcceptNew,
    /// Only connect to hosts already in known_hosts
    Strict,
}

/// Broker-wide SSH transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Override for the known_hosts file (defaults to ~/.oxideterm/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<std::path::PathBuf>,

    #[serde(default)]
    pub agent: AgentSettings,
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            agent: AgentSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthMaterial;

    fn descriptor(auth: AuthMaterial) -> SessionDescriptor {
        SessionDescriptor {
            session_id: "s".into(),
            user_id: "u".into(),
            hostname: "h".into(),
            port: 2222,
            username: "me".into(),
            auth,
            display_name: None,
        }
    }

    #[test]
    fn test_private_key_wins_over_password() {
        let mut auth = AuthMaterial::private_key("KEY", None);
        auth.password = Some("pw".into());
        let config = SshConfig::from_descriptor(&descriptor(auth), &SshSettings::default());
        assert!(matches!(config.auth, AuthMethod::KeyData { .. }));
        assert_eq!(config.port, 2222);
    }

    #[test]
    fn test_agent_fallback() {
        let config =
            SshConfig::from_descriptor(&descriptor(AuthMaterial::agent()), &SshSettings::default());
        assert!(matches!(config.auth, AuthMethod::Agent));
    }

    #[test]
    fn test_agent_settings_carried_into_config() {
        let settings: SshSettings = serde_json::from_str(
            r#"{ "agent": { "socket_path": "/run/broker/agent.sock", "max_identities": 3 } }"#,
        )
        .unwrap();
        assert_eq!(settings.keepalive_interval_secs, 30);

        let config = SshConfig::from_descriptor(&descriptor(AuthMaterial::agent()), &settings);
        assert!(config.agent.enabled);
        assert_eq!(
            config.agent.socket_path.as_deref(),
            Some(std::path::Path::new("/run/broker/agent.sock"))
        );
        assert_eq!(config.agent.max_identities, 3);
    }

    #[test]
    fn test_debug_hides_password() {
        let auth = AuthMethod::Password {
            password: "secret".into(),
        };
        assert_eq!(format!("{:?}", auth), "AuthMethod::password");
    }
}
