//! Connector seam between the registries and the SSH transport

use std::sync::Arc;

use async_trait::async_trait;

use super::client::SshClient;
use super::config::{SshConfig, SshSettings};
use super::error::SshError;
use super::handle_owner::HandleController;
use super::known_hosts::KnownHostsStore;
use super::session::{open_shell, PtyRequest, ShellChannel};
use crate::session::SessionDescriptor;
use crate::sftp::{RemoteFs, SftpError, SftpRemoteFs};

/// Opens connections and channels for the registries.
///
/// The registries apply their own timeouts around each call.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect and authenticate with the descriptor's credentials.
    async fn authenticate(
        &self,
        descriptor: &SessionDescriptor,
        label: &str,
    ) -> Result<HandleController, SshError>;

    /// PTY + shell on an authenticated connection.
    async fn open_shell(
        &self,
        controller: &HandleController,
        pty: &PtyRequest,
        label: &str,
    ) -> Result<ShellChannel, SshError>;

    /// `sftp` subsystem on an authenticated connection.
    async fn open_file_channel(
        &self,
        controller: &HandleController,
        label: &str,
    ) -> Result<Arc<dyn RemoteFs>, SftpError>;
}

/// russh-backed connector
pub struct SshConnector {
    settings: SshSettings,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        let known_hosts = match &settings.known_hosts_path {
            Some(path) => KnownHostsStore::with_path(path.clone()),
            None => KnownHostsStore::new(),
        };
        Self {
            settings,
            known_hosts: Arc::new(known_hosts),
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn authenticate(
        &self,
        descriptor: &SessionDescriptor,
        label: &str,
    ) -> Result<HandleController, SshError> {
        let config = SshConfig::from_descriptor(descriptor, &self.settings);
        SshClient::new(config, self.known_hosts.clone())
            .connect(label.to_string())
            .await
    }

    async fn open_shell(
        &self,
        controller: &HandleController,
        pty: &PtyRequest,
        label: &str,
    ) -> Result<ShellChannel, SshError> {
        open_shell(controller, pty, label.to_string()).await
    }

    async fn open_file_channel(
        &self,
        controller: &HandleController,
        label: &str,
    ) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let fs = SftpRemoteFs::open(controller, label).await?;
        Ok(Arc::new(fs))
    }
}
