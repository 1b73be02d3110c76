//! Transfer Session registry
//!
//! One Transfer Session per (user, session) key, each on its own
//! connection. A watcher per session tears the entry down when the
//! connection drops underneath it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use super::session::{TransferSession, TransferSessionInfo};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, TimeoutPhase};
use crate::events::ConnectionEstablished;
use crate::session::{DisconnectReason, SessionDescriptor, SessionKey, TransferObserver};
use crate::ssh::{HandleController, RemoteConnector};

pub struct TransferRegistry {
    sessions: DashMap<SessionKey, Arc<TransferSession>>,
    /// Serializes connect per key
    connect_locks: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn RemoteConnector>,
    config: Arc<BrokerConfig>,
}

impl TransferRegistry {
    pub fn new(config: Arc<BrokerConfig>, connector: Arc<dyn RemoteConnector>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            connect_locks: DashMap::new(),
            connector,
            config,
        })
    }

    /// Open a Transfer Session, or hand the connected one for this key to
    /// `observer`.
    pub async fn connect(
        self: &Arc<Self>,
        descriptor: &SessionDescriptor,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<ConnectionEstablished, BrokerError> {
        descriptor.validate()?;
        let key = descriptor.key();

        let lock = self.connect_locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.connect_locked(descriptor, &key, observer).await
        };
        if result.is_err() {
            self.connect_locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 2);
        }
        result
    }

    async fn connect_locked(
        self: &Arc<Self>,
        descriptor: &SessionDescriptor,
        key: &SessionKey,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<ConnectionEstablished, BrokerError> {
        if let Some(existing) = self.get(key) {
            if existing.is_connected() {
                existing.set_observer(observer);
                info!("Reusing transfer session {}", key);
                return Ok(established(&existing, true));
            }
            self.destroy(&existing, DisconnectReason::Replaced).await;
        }

        let label = format!("{} (sftp)", key);
        let settings = &self.config.session;

        let controller = match tokio::time::timeout(
            settings.connect_timeout(),
            self.connector.authenticate(descriptor, &label),
        )
        .await
        {
            Ok(Ok(controller)) => controller,
            Ok(Err(e)) => {
                warn!("Transfer connection failed for {}: {}", key, e);
                return Err(e.into());
            }
            Err(_) => return Err(BrokerError::Timeout(TimeoutPhase::Connect)),
        };

        let fs = match tokio::time::timeout(
            settings.channel_timeout(),
            self.connector.open_file_channel(&controller, &label),
        )
        .await
        {
            Ok(Ok(fs)) => fs,
            Ok(Err(e)) => {
                warn!("File channel setup failed for {}: {}", key, e);
                controller.disconnect().await;
                return Err(e.into());
            }
            Err(_) => {
                controller.disconnect().await;
                return Err(BrokerError::Timeout(TimeoutPhase::Channel));
            }
        };

        let session = TransferSession::new(
            key.clone(),
            descriptor.summary(),
            fs,
            controller.clone(),
            observer,
            &self.config,
        );
        self.sessions.insert(key.clone(), session.clone());
        self.spawn_disconnect_watcher(&session, &controller);

        info!(
            "Transfer session {} established ({})",
            key,
            session.connection_id()
        );
        Ok(established(&session, false))
    }

    fn spawn_disconnect_watcher(
        self: &Arc<Self>,
        session: &Arc<TransferSession>,
        controller: &HandleController,
    ) {
        let mut disconnected = controller.subscribe_disconnect();
        let registry: Weak<Self> = Arc::downgrade(self);
        let session = Arc::downgrade(session);
        tokio::spawn(async move {
            // Closed (every controller dropped) means the same thing
            let _ = disconnected.recv().await;
            let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) else {
                return;
            };
            if session.is_connected() {
                info!("Connection for transfer session {} dropped", session.key());
                registry
                    .destroy(&session, DisconnectReason::RemoteClosed { exit_status: None })
                    .await;
            }
        });
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<TransferSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Connected session for `key`
    pub fn session(&self, key: &SessionKey) -> Result<Arc<TransferSession>, BrokerError> {
        self.get(key)
            .filter(|session| session.is_connected())
            .ok_or_else(|| BrokerError::not_found("transfer session", key.to_string()))
    }

    pub fn find_by_connection_id(&self, connection_id: &str) -> Option<Arc<TransferSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().connection_id() == connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Close the session for `key`, cancelling its transfers.
    pub async fn disconnect(&self, key: &SessionKey) -> Result<(), BrokerError> {
        let session = self
            .get(key)
            .ok_or_else(|| BrokerError::not_found("transfer session", key.to_string()))?;
        self.destroy(&session, DisconnectReason::ForceClosed).await;
        Ok(())
    }

    /// Safe to call more than once.
    pub async fn destroy(&self, session: &Arc<TransferSession>, reason: DisconnectReason) {
        let key = session.key();
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session));
        session.shutdown(reason).await;
        self.connect_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<SessionKey> {
        let idle: Vec<Arc<TransferSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > threshold)
            .map(|entry| entry.value().clone())
            .collect();

        for session in &idle {
            info!(
                "Reaping idle transfer session {} (idle {:?})",
                session.key(),
                session.idle_for()
            );
            self.destroy(session, DisconnectReason::IdleTimeout).await;
        }
        idle.iter().map(|s| s.key().clone()).collect()
    }

    pub async fn shutdown_all(&self) -> usize {
        let all: Vec<Arc<TransferSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in &all {
            self.destroy(session, DisconnectReason::Shutdown).await;
        }
        all.len()
    }

    pub fn list(&self) -> Vec<TransferSessionInfo> {
        let mut sessions: Vec<TransferSessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    pub fn active_transfer_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().active_transfers().len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn established(session: &TransferSession, reused: bool) -> ConnectionEstablished {
    ConnectionEstablished {
        success: true,
        connection_id: session.connection_id().to_string(),
        session: session.summary().clone(),
        reused,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sftp::SftpError;
    use crate::testing::{
        config, descriptor, settle, wait_until, Behavior, FakeConnector, RecordingObserver,
    };

    fn registry(connector: &Arc<FakeConnector>) -> Arc<TransferRegistry> {
        TransferRegistry::new(Arc::new(config()), connector.clone())
    }

    #[tokio::test]
    async fn test_reconnect_moves_notifications_to_new_observer() {
        let connector = FakeConnector::new();
        let registry = registry(&connector);
        let old = RecordingObserver::new("old");
        let new = RecordingObserver::new("new");

        let first = registry
            .connect(&descriptor("u1", "s1"), old.clone())
            .await
            .unwrap();
        let second = registry
            .connect(&descriptor("u1", "s1"), new.clone())
            .await
            .unwrap();

        assert!(second.reused);
        assert_eq!(first.connection_id, second.connection_id);
        assert_eq!(connector.authentications.load(Ordering::SeqCst), 1);

        registry.disconnect(&SessionKey::new("u1", "s1")).await.unwrap();
        assert_eq!(old.disconnect_count(), 0);
        assert_eq!(*new.disconnects.lock(), vec![DisconnectReason::ForceClosed]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_file_channel_failure_leaves_no_entry() {
        let connector = FakeConnector::new();
        *connector.file_channel.lock() = Behavior::Fail;
        let registry = registry(&connector);

        let result = registry
            .connect(&descriptor("u1", "s1"), RecordingObserver::new("t"))
            .await;
        settle().await;

        assert!(matches!(result, Err(BrokerError::Channel(_))));
        assert!(registry.is_empty());
        assert_eq!(connector.live_connections(), 0);
        assert!(registry.connect_locks.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_connection_removes_session() {
        let connector = FakeConnector::new();
        let registry = registry(&connector);
        let observer = RecordingObserver::new("t");

        registry
            .connect(&descriptor("u1", "s1"), observer.clone())
            .await
            .unwrap();
        settle().await;
        connector.drop_connections();
        settle().await;

        assert!(registry.is_empty());
        assert_eq!(
            *observer.disconnects.lock(),
            vec![DisconnectReason::RemoteClosed { exit_status: None }]
        );
        assert!(matches!(
            registry.session(&SessionKey::new("u1", "s1")),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_running_transfers() {
        let connector = FakeConnector::new();
        let registry = registry(&connector);
        let observer = RecordingObserver::new("t");
        let key = SessionKey::new("u1", "s1");

        registry
            .connect(&descriptor("u1", "s1"), observer.clone())
            .await
            .unwrap();
        let _feed = connector.fs.stream_file("/home/alice/slow.bin", 500);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("slow.bin");

        let session = registry.session(&key).unwrap();
        let download = tokio::spawn({
            let local = local.to_str().unwrap().to_string();
            async move { session.download("slow.bin", &local).await }
        });
        wait_until(|| registry.active_transfer_count() == 1).await;

        registry.disconnect(&key).await.unwrap();

        assert!(matches!(
            download.await.unwrap(),
            Err(SftpError::TransferCancelled)
        ));
        assert_eq!(observer.failures.lock().len(), 1);
        assert_eq!(registry.active_transfer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reaps_idle_transfer_sessions() {
        let connector = FakeConnector::new();
        let registry = registry(&connector);
        let observer = RecordingObserver::new("t");

        registry
            .connect(&descriptor("u1", "s1"), observer.clone())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert!(registry.sweep_idle(Duration::from_secs(3600)).await.is_empty());

        tokio::time::advance(Duration::from_secs(700)).await;
        let reaped = registry.sweep_idle(Duration::from_secs(3600)).await;

        assert_eq!(reaped, vec![SessionKey::new("u1", "s1")]);
        assert_eq!(*observer.disconnects.lock(), vec![DisconnectReason::IdleTimeout]);
        assert!(registry.is_empty());
    }
}
