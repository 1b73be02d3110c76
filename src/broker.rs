//! Broker
//!
//! Owns both registries and the idle reaper. A host process builds one
//! [`Broker`] and hands it to each client channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::assist::OutputAnalyzer;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, TimeoutPhase};
use crate::reaper::{self, IdleReaper, ReapReport};
use crate::session::{SessionDescriptor, SessionInfo, SessionRegistry, SessionSummary};
use crate::sftp::{TransferRegistry, TransferSessionInfo};
use crate::ssh::{RemoteConnector, SshConnector};

/// Counts across both registries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub live_sessions: usize,
    pub observers: usize,
    pub transfer_sessions: usize,
    pub active_transfers: usize,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    connector: Arc<dyn RemoteConnector>,
    sessions: Arc<SessionRegistry>,
    transfers: Arc<TransferRegistry>,
    reaper: AsyncMutex<Option<IdleReaper>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        connector: Arc<dyn RemoteConnector>,
        analyzer: Option<Arc<dyn OutputAnalyzer>>,
    ) -> Result<Self, BrokerError> {
        let config = Arc::new(config);
        let sessions = SessionRegistry::new(config.clone(), connector.clone(), analyzer)?;
        let transfers = TransferRegistry::new(config.clone(), connector.clone());
        Ok(Self {
            config,
            connector,
            sessions,
            transfers,
            reaper: AsyncMutex::new(None),
        })
    }

    /// Broker over real SSH connections, using `config.ssh`.
    pub fn with_ssh(
        config: BrokerConfig,
        analyzer: Option<Arc<dyn OutputAnalyzer>>,
    ) -> Result<Self, BrokerError> {
        let connector: Arc<dyn RemoteConnector> = Arc::new(SshConnector::new(config.ssh.clone()));
        Self::new(config, connector, analyzer)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn transfers(&self) -> &Arc<TransferRegistry> {
        &self.transfers
    }

    /// Start the background sweep; no-op if already running.
    pub async fn start_reaper(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.as_ref().is_some_and(IdleReaper::is_running) {
            return;
        }
        *reaper = Some(IdleReaper::start(
            &self.config.reaper,
            &self.sessions,
            &self.transfers,
        ));
    }

    pub async fn stop_reaper(&self) {
        if let Some(mut reaper) = self.reaper.lock().await.take() {
            reaper.stop().await;
        }
    }

    /// Sweep now, outside the reaper schedule.
    pub async fn reap_idle(&self) -> ReapReport {
        reaper::sweep(
            &self.sessions,
            &self.transfers,
            self.config.reaper.idle_timeout(),
        )
        .await
    }

    /// Authenticate with `descriptor` and disconnect straight away.
    pub async fn test_connection(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<SessionSummary, BrokerError> {
        descriptor.validate()?;
        let label = format!("{} (connection check)", descriptor.key());
        let timeout = self.config.session.connect_timeout();

        let controller =
            match tokio::time::timeout(timeout, self.connector.authenticate(descriptor, &label))
                .await
            {
                Ok(Ok(controller)) => controller,
                Ok(Err(e)) => {
                    warn!("Connection test failed for {}: {}", label, e);
                    return Err(e.into());
                }
                Err(_) => return Err(BrokerError::Timeout(TimeoutPhase::Connect)),
            };
        controller.disconnect().await;

        info!("Connection test succeeded for {}", label);
        Ok(descriptor.summary())
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            live_sessions: self.sessions.len(),
            observers: self.sessions.observer_count(),
            transfer_sessions: self.transfers.len(),
            active_transfers: self.transfers.active_transfer_count(),
        }
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    pub fn transfer_sessions(&self) -> Vec<TransferSessionInfo> {
        self.transfers.list()
    }

    /// Stop the reaper and close every session.
    pub async fn shutdown(&self) {
        self.stop_reaper().await;
        let live = self.sessions.shutdown_all().await;
        let transfers = self.transfers.shutdown_all().await;
        info!(
            "Broker shut down ({} live sessions, {} transfer sessions closed)",
            live, transfers
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::session::{ConnectOptions, DisconnectReason};
    use crate::testing::{config, descriptor, settle, Behavior, FakeConnector, RecordingObserver};

    fn broker(connector: &Arc<FakeConnector>) -> Broker {
        Broker::new(config(), connector.clone(), None).unwrap()
    }

    #[tokio::test]
    async fn test_connection_check_leaves_nothing_open() {
        let connector = FakeConnector::new();
        let broker = broker(&connector);

        let summary = broker
            .test_connection(&descriptor("u1", "s1"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(summary.name, "alice@example.com");
        assert_eq!(connector.authentications.load(Ordering::SeqCst), 1);
        assert_eq!(connector.live_connections(), 0);
        assert_eq!(broker.stats(), BrokerStats::default());
    }

    #[tokio::test]
    async fn test_connection_check_reports_auth_failure() {
        let connector = FakeConnector::new();
        *connector.auth.lock() = Behavior::Fail;
        let broker = broker(&connector);

        let err = broker
            .test_connection(&descriptor("u1", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authentication(_)));
        assert!(!err.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let connector = FakeConnector::new();
        let broker = broker(&connector);
        let a = RecordingObserver::new("a");
        let files = RecordingObserver::new("files");

        broker
            .sessions()
            .connect(&descriptor("u1", "s1"), a.clone(), ConnectOptions::default())
            .await
            .unwrap();
        broker
            .sessions()
            .connect(&descriptor("u1", "s1"), RecordingObserver::new("b"), ConnectOptions::default())
            .await
            .unwrap();
        broker
            .transfers()
            .connect(&descriptor("u1", "s1"), files.clone())
            .await
            .unwrap();
        broker.start_reaper().await;

        assert_eq!(
            broker.stats(),
            BrokerStats {
                live_sessions: 1,
                observers: 2,
                transfer_sessions: 1,
                active_transfers: 0,
            }
        );
        assert_eq!(broker.live_sessions()[0].observer_count, 2);

        broker.shutdown().await;
        settle().await;

        assert_eq!(broker.stats(), BrokerStats::default());
        assert_eq!(*a.disconnects.lock(), vec![DisconnectReason::Shutdown]);
        assert_eq!(*files.disconnects.lock(), vec![DisconnectReason::Shutdown]);
        assert_eq!(connector.live_connections(), 0);
    }
}
