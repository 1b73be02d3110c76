//! File transfer over the `sftp` subsystem
//!
//! Transfer Sessions run on their own connections, separate from the
//! interactive shells. Transfers are streamed in chunks with progress
//! reported at every chunk boundary.

pub mod error;
pub mod path_utils;
pub mod progress;
mod registry;
pub mod remote_fs;
mod session;
pub mod transfer;
pub mod types;

pub use error::SftpError;
pub use registry::TransferRegistry;
pub use remote_fs::{RemoteFs, RemoteReader, RemoteWriter, SftpRemoteFs};
pub use session::{TransferSession, TransferSessionInfo};
pub use transfer::{TransferControl, TransferGuard, TransferTable};
pub use types::*;
