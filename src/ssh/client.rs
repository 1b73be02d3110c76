//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::*;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, HostKeyPolicy, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// Opens and authenticates one SSH connection
pub struct SshClient {
    config: SshConfig,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshClient {
    pub fn new(config: SshConfig, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            config,
            known_hosts,
        }
    }

    /// Connect, authenticate and hand the connection to its owner task.
    ///
    /// The caller bounds the whole call with its own timeout.
    pub async fn connect(self, label: String) -> Result<HandleController, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let keepalive_interval = match self.config.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval,
            keepalive_max: self.config.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_policy,
            self.known_hosts.clone(),
        );

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                SshError::HostKeyRejected(_) => e,
                other => SshError::ConnectionFailed(other.to_string()),
            })?;

        debug!("SSH handshake completed with {}", addr);

        let username = self.config.username.clone();
        let authenticated = match &self.config.auth {
            AuthMethod::KeyData {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                    .success()
            }
            AuthMethod::Password { password } => handle
                .authenticate_password(&username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success(),
            AuthMethod::Agent => {
                let mut agent = SshAgentClient::connect(&self.config.agent).await?;
                agent.authenticate(&mut handle, &username).await?;
                true
            }
        };

        if !authenticated {
            return Err(SshError::AuthenticationFailed(format!(
                "{} authentication rejected by server",
                self.config.auth.label()
            )));
        }

        info!(
            "SSH authentication successful for {}@{} via {}",
            username,
            addr,
            self.config.auth.label()
        );

        Ok(spawn_handle_owner_task(handle, label))
    }
}

/// Client handler for russh callbacks
///
/// Applies the configured [`HostKeyPolicy`] to the server key.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Arc<KnownHostsStore>,
    ) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            debug!(
                "Accepting host key for {}:{} without verification ({})",
                self.host,
                self.port,
                KnownHostsStore::fingerprint(server_public_key)
            );
            return Ok(true);
        }

        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.policy == HostKeyPolicy::Strict {
                    warn!(
                        "Unknown host key for {}:{} ({}), strict policy rejects it",
                        self.host, self.port, fingerprint
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} with fingerprint {}",
                        self.host, self.port, fingerprint
                    )));
                }

                info!(
                    "New host {}:{}, recording key {}",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self
                    .known_hosts
                    .add_host(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyRejected(format!(
                "key for {}:{} changed (expected {}, got {})",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}
