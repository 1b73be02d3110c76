//! Observer interfaces
//!
//! Callbacks run on the broker's tasks, some while a session lock is held.
//! Implementations must return quickly and must not call back into the
//! broker; forwarding into a channel is the expected shape.

use bytes::Bytes;

use super::types::{DisconnectReason, ObserverId};
use crate::assist::AssistEvent;
use crate::sftp::{TransferDirection, TransferFailure, TransferProgress, TransferSummary};

/// Receives everything a Live Remote Session produces
pub trait SessionObserver: Send + Sync {
    fn id(&self) -> &ObserverId;

    /// Raw output, also used for the replay on attach
    fn on_output(&self, data: &Bytes);

    /// Delivered once, after which no further callbacks arrive
    fn on_disconnected(&self, reason: &DisconnectReason);

    /// Mid-session channel failure, sent just before `on_disconnected`
    fn on_error(&self, message: &str);

    fn on_assist(&self, _event: &AssistEvent) {}
}

/// Receives progress and lifecycle of a Transfer Session
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, direction: TransferDirection, progress: &TransferProgress);

    fn on_complete(&self, summary: &TransferSummary);

    fn on_failed(&self, direction: TransferDirection, failure: &TransferFailure);

    fn on_disconnected(&self, reason: &DisconnectReason);
}
