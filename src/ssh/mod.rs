//! SSH module - outbound connections, shell channels and the connector seam
//!
//! # Features
//! - Password, in-memory private key and SSH agent authentication
//! - Host key policy backed by a known_hosts file
//! - Single-owner handle task driven through [`HandleController`]
//! - PTY shell channel exposed as command/event channels

mod agent;
mod client;
mod config;
mod connector;
mod error;
mod handle_owner;
pub mod known_hosts;
mod session;

pub use agent::{AgentEndpoint, AgentSettings, SshAgentClient};
pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, HostKeyPolicy, SshConfig, SshSettings};
pub use connector::{RemoteConnector, SshConnector};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session::{open_shell, PtyRequest, SessionCommand, ShellChannel, ShellEvent};
