//! OxideTerm Broker - remote session broker
//!
//! Keeps SSH shells alive on the server side and shares them between any
//! number of client channels. Each (user, session) pair maps to at most one
//! Live Remote Session; file transfers run on separate SFTP connections.
//!
//! A host process builds one [`Broker`], authenticates users itself and
//! opens a [`ClientChannel`] per client tab.

pub mod assist;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod reaper;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use assist::{Analysis, AnalysisContext, AnalysisResponse, AssistEvent, OutputAnalyzer};
pub use broker::{Broker, BrokerStats};
pub use config::{BrokerConfig, ConfigStorage};
pub use error::{BrokerError, ErrorKind};
pub use events::BrokerEvent;
pub use gateway::{ClientChannel, ClientRequest, SessionStore};
pub use reaper::{IdleReaper, ReapReport};
pub use session::{
    ConnectOptions, DisconnectReason, ObserverId, SessionDescriptor, SessionObserver,
    TransferObserver,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if the host already installed a global subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
