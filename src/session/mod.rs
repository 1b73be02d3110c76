//! Live Remote Sessions
//!
//! - Session Registry keyed by (user, session), reuse and persistence
//! - Live Remote Session: ring buffer, observers, command history
//! - Command-boundary detector feeding the analysis collaborator
//! - Observer interfaces for terminal and transfer notifications

pub mod boundary;
mod live;
pub mod observer;
mod registry;
pub mod scroll_buffer;
pub mod types;

pub use boundary::{CommandBoundaryDetector, Handoff, OutputVerdict};
pub use live::LiveSession;
pub use observer::{SessionObserver, TransferObserver};
pub use registry::{ConnectOptions, SessionRegistry};
pub use scroll_buffer::{BufferStats, ScrollBuffer};
pub use types::{
    AuthMaterial, DisconnectReason, ObserverId, SessionDescriptor, SessionInfo, SessionKey,
    SessionSummary,
};
