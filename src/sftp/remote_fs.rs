//! File-channel abstraction and its russh-sftp implementation

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::error::SftpError;
use super::types::{RemoteAttrs, RemoteEntry};
use crate::ssh::HandleController;

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Operations a Transfer Session needs from the remote side.
///
/// Implementations must allow concurrent calls; every transfer on a session
/// shares one instance.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Login directory, used to resolve relative paths
    fn home(&self) -> &str;

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError>;

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate `path` for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn rmdir(&self, path: &str) -> Result<(), SftpError>;

    async fn unlink(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;
}

/// [`RemoteFs`] over the `sftp` subsystem of an SSH connection
pub struct SftpRemoteFs {
    sftp: RusshSftpSession,
    home: String,
}

impl SftpRemoteFs {
    /// Open the `sftp` subsystem on a new session channel.
    pub async fn open(controller: &HandleController, label: &str) -> Result<Self, SftpError> {
        debug!("Opening SFTP subsystem for {}", label);

        let channel = controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        let home = sftp
            .canonicalize(".")
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;

        info!("SFTP subsystem opened for {} (home {})", label, home);

        Ok(Self { sftp, home })
    }

    fn map_error(err: russh_sftp::client::error::Error, path: &str) -> SftpError {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::ProtocolError(format!("{}: {}", path, err_str))
        }
    }
}

fn attrs_of(metadata: &russh_sftp::protocol::FileAttributes) -> RemoteAttrs {
    RemoteAttrs {
        permissions: metadata.permissions,
        size: metadata.size,
        mtime: metadata.mtime,
        uid: metadata.uid,
        gid: metadata.gid,
    }
}

#[async_trait]
impl RemoteFs for SftpRemoteFs {
    fn home(&self) -> &str {
        &self.home
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;

        Ok(read_dir
            .filter_map(|entry| {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry {
                    attrs: attrs_of(&entry.metadata()),
                    name,
                })
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        self.sftp
            .metadata(path)
            .await
            .map(|metadata| attrs_of(&metadata))
            .map_err(|e| Self::map_error(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| Self::map_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| Self::map_error(e, from))
    }
}
