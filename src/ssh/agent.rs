//! SSH agent authentication
//!
//! Last resort for descriptors that carry neither a private key nor a
//! password. One broker process serves many users, so the agent it talks to
//! is chosen by [`AgentSettings`] rather than taken blindly from the
//! environment, and only a bounded number of its identities are offered to
//! each server.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key::{self, HashAlg};
use russh::{AgentAuthError, CryptoVec, Signer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// OpenSSH for Windows agent pipe
pub const OPENSSH_AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Broker-wide agent policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Allow agent authentication at all
    #[serde(default = "default_agent_enabled")]
    pub enabled: bool,

    /// Agent socket to use instead of `SSH_AUTH_SOCK`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Identities offered per connection; servers drop the connection
    /// after MaxAuthTries (6 by default in OpenSSH)
    #[serde(default = "default_max_identities")]
    pub max_identities: usize,
}

fn default_agent_enabled() -> bool {
    true
}

fn default_max_identities() -> usize {
    5
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: default_agent_enabled(),
            socket_path: None,
            max_identities: default_max_identities(),
        }
    }
}

/// Where the agent listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEndpoint {
    Socket(PathBuf),
    NamedPipe(String),
}

impl AgentEndpoint {
    /// Endpoint for `settings`, falling back to `SSH_AUTH_SOCK` on Unix and
    /// the OpenSSH pipe on Windows.
    pub fn resolve(settings: &AgentSettings) -> Result<Self, SshError> {
        Self::resolve_with(settings, std::env::var_os("SSH_AUTH_SOCK"))
    }

    fn resolve_with(
        settings: &AgentSettings,
        auth_sock: Option<OsString>,
    ) -> Result<Self, SshError> {
        if !settings.enabled {
            return Err(SshError::AgentNotAvailable(
                "agent authentication is disabled".to_string(),
            ));
        }
        if let Some(path) = &settings.socket_path {
            return Ok(AgentEndpoint::Socket(path.clone()));
        }
        if cfg!(windows) {
            return Ok(AgentEndpoint::NamedPipe(OPENSSH_AGENT_PIPE.to_string()));
        }
        match auth_sock {
            Some(sock) if !sock.is_empty() => Ok(AgentEndpoint::Socket(PathBuf::from(sock))),
            _ => Err(SshError::AgentNotAvailable(
                "SSH_AUTH_SOCK is not set".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentEndpoint::Socket(path) => write!(f, "{}", path.display()),
            AgentEndpoint::NamedPipe(pipe) => f.write_str(pipe),
        }
    }
}

/// `Signer` wrapper that clones the requested key before the async block so
/// the returned future only captures owned data and stays `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

#[cfg(unix)]
async fn open_socket(path: &Path) -> Result<DynAgent, SshError> {
    let agent = AgentClient::connect_uds(path).await.map_err(|e| {
        SshError::AgentNotAvailable(format!("cannot reach agent at {}: {}", path.display(), e))
    })?;
    Ok(agent.dynamic())
}

#[cfg(not(unix))]
async fn open_socket(path: &Path) -> Result<DynAgent, SshError> {
    Err(SshError::AgentNotAvailable(format!(
        "agent sockets are not supported here ({})",
        path.display()
    )))
}

#[cfg(windows)]
async fn open_pipe(pipe: &str) -> Result<DynAgent, SshError> {
    let agent = AgentClient::connect_named_pipe(pipe)
        .await
        .map_err(|e| SshError::AgentNotAvailable(format!("cannot reach agent pipe {}: {}", pipe, e)))?;
    Ok(agent.dynamic())
}

#[cfg(not(windows))]
async fn open_pipe(pipe: &str) -> Result<DynAgent, SshError> {
    Err(SshError::AgentNotAvailable(format!(
        "named pipes are not supported here ({})",
        pipe
    )))
}

pub struct SshAgentClient {
    agent: DynAgent,
    endpoint: AgentEndpoint,
    max_identities: usize,
}

impl SshAgentClient {
    pub async fn connect(settings: &AgentSettings) -> Result<Self, SshError> {
        let endpoint = AgentEndpoint::resolve(settings)?;
        let agent = match &endpoint {
            AgentEndpoint::Socket(path) => open_socket(path).await?,
            AgentEndpoint::NamedPipe(pipe) => open_pipe(pipe).await?,
        };
        debug!("Connected to SSH agent at {}", endpoint);
        Ok(Self {
            agent,
            endpoint,
            max_identities: settings.max_identities.max(1),
        })
    }

    /// Offer agent identities in order until the server accepts one.
    /// Returns the SHA-256 fingerprint of the accepted key.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<String, SshError> {
        let keys = self.agent.request_identities().await.map_err(|e| {
            SshError::AgentError(format!("cannot list identities at {}: {}", self.endpoint, e))
        })?;
        if keys.is_empty() {
            return Err(SshError::AgentError(format!(
                "agent at {} holds no identities",
                self.endpoint
            )));
        }

        let offered = keys.len().min(self.max_identities);
        if offered < keys.len() {
            debug!(
                "Agent holds {} identities, offering the first {}",
                keys.len(),
                offered
            );
        }

        let mut last_error: Option<String> = None;
        for key in &keys[..offered] {
            let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
            let result = handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await;
            match result {
                Ok(auth) if auth.success() => {
                    info!("Agent identity {} accepted for {}", fingerprint, username);
                    return Ok(fingerprint);
                }
                Ok(_) => debug!("Agent identity {} rejected", fingerprint),
                Err(e) => {
                    warn!("Agent could not sign with {}: {}", fingerprint, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SshError::AuthenticationFailed(rejection_message(
            offered,
            keys.len(),
            last_error.as_deref(),
        )))
    }
}

fn rejection_message(offered: usize, held: usize, last_error: Option<&str>) -> String {
    let mut message = format!("server accepted none of {} agent identities", offered);
    if held > offered {
        message.push_str(&format!(" ({} more not offered)", held - offered));
    }
    if let Some(e) = last_error {
        message.push_str(&format!("; last signing error: {}", e));
    }
    message
}
