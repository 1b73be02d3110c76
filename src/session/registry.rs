//! Session Registry
//!
//! Owns every Live Remote Session, keyed by (user, session). Connects for the
//! same key are serialized so at most one authenticated connection exists
//! per key; everything else goes straight through the `DashMap`s.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::boundary::{prompt_regex, CommandBoundaryDetector};
use super::live::LiveSession;
use super::observer::SessionObserver;
use super::types::{DisconnectReason, ObserverId, SessionDescriptor, SessionInfo, SessionKey};
use crate::assist::OutputAnalyzer;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, TimeoutPhase};
use crate::events::ConnectionEstablished;
use crate::ssh::{RemoteConnector, ShellChannel, ShellEvent};

/// Options for [`SessionRegistry::connect`]
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Attach to a connected entry for the same key instead of replacing it
    pub reuse_existing: bool,
    /// Keep the session alive after its last observer detaches
    pub persistent: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reuse_existing: true,
            persistent: false,
        }
    }
}

pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<LiveSession>>,
    /// Session whose terminal I/O each observer is bound to
    attachments: DashMap<ObserverId, SessionKey>,
    /// Serializes connect per key
    connect_locks: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn RemoteConnector>,
    analyzer: Option<Arc<dyn OutputAnalyzer>>,
    prompt: Regex,
    config: Arc<BrokerConfig>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<BrokerConfig>,
        connector: Arc<dyn RemoteConnector>,
        analyzer: Option<Arc<dyn OutputAnalyzer>>,
    ) -> Result<Arc<Self>, BrokerError> {
        let prompt = prompt_regex(&config.assist)
            .map_err(|e| BrokerError::Validation(format!("invalid prompt pattern: {}", e)))?;
        Ok(Arc::new(Self {
            sessions: DashMap::new(),
            attachments: DashMap::new(),
            connect_locks: DashMap::new(),
            connector,
            analyzer,
            prompt,
            config,
        }))
    }

    /// Attach `observer` to the session for the descriptor's key, opening a
    /// new connection unless a connected one can be reused.
    ///
    /// Nothing is stored when authentication or channel setup fails.
    pub async fn connect(
        self: &Arc<Self>,
        descriptor: &SessionDescriptor,
        observer: Arc<dyn SessionObserver>,
        options: ConnectOptions,
    ) -> Result<ConnectionEstablished, BrokerError> {
        descriptor.validate()?;
        let key = descriptor.key();

        let lock = self.connect_locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.connect_locked(descriptor, &key, observer, options).await
        };
        if result.is_err() {
            // Map entry plus our clone: nobody else is waiting on it
            self.connect_locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 2);
        }
        result
    }

    async fn connect_locked(
        self: &Arc<Self>,
        descriptor: &SessionDescriptor,
        key: &SessionKey,
        observer: Arc<dyn SessionObserver>,
        options: ConnectOptions,
    ) -> Result<ConnectionEstablished, BrokerError> {
        if let Some(existing) = self.get(key) {
            if options.reuse_existing && existing.is_connected() {
                if options.persistent {
                    existing.set_persistent(true);
                }
                self.bind(&existing, observer).await?;
                info!(
                    "Reusing live session {} ({})",
                    key,
                    existing.connection_id()
                );
                return Ok(established(&existing, true));
            }
            self.destroy(&existing, DisconnectReason::Replaced).await;
        }

        let (session, events) = self.open(descriptor).await?;
        session.set_persistent(options.persistent);
        self.sessions.insert(key.clone(), session.clone());
        if let Err(e) = self.bind(&session, observer).await {
            self.destroy(&session, DisconnectReason::Shutdown).await;
            return Err(e);
        }
        self.spawn_pump(session.clone(), events);

        info!(
            "Live session {} established ({}, persistent: {})",
            key,
            session.connection_id(),
            options.persistent
        );
        Ok(established(&session, false))
    }

    async fn open(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(Arc<LiveSession>, mpsc::Receiver<ShellEvent>), BrokerError> {
        let key = descriptor.key();
        let label = key.to_string();
        let settings = &self.config.session;

        info!(
            "Connecting {} to {}@{}:{}",
            key, descriptor.username, descriptor.hostname, descriptor.port
        );

        let controller = match tokio::time::timeout(
            settings.connect_timeout(),
            self.connector.authenticate(descriptor, &label),
        )
        .await
        {
            Ok(Ok(controller)) => controller,
            Ok(Err(e)) => {
                warn!("Connection failed for {}: {}", key, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    "Connection to {} timed out after {:?}",
                    descriptor.hostname,
                    settings.connect_timeout()
                );
                return Err(BrokerError::Timeout(TimeoutPhase::Connect));
            }
        };

        let pty = settings.pty();
        let shell = match tokio::time::timeout(
            settings.channel_timeout(),
            self.connector.open_shell(&controller, &pty, &label),
        )
        .await
        {
            Ok(Ok(shell)) => shell,
            Ok(Err(e)) => {
                warn!("Shell setup failed for {}: {}", key, e);
                controller.disconnect().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!("Shell setup timed out for {}", key);
                controller.disconnect().await;
                return Err(BrokerError::Timeout(TimeoutPhase::Channel));
            }
        };

        let ShellChannel { cmd_tx, events } = shell;
        let detector = CommandBoundaryDetector::new(self.prompt.clone(), &self.config.assist);
        let session = LiveSession::new(
            key,
            descriptor.summary(),
            cmd_tx,
            controller,
            detector,
            self.analyzer.clone(),
            self.config.clone(),
        );
        Ok((session, events))
    }

    /// Forward shell events into the session until the channel ends, then
    /// tear the session down.
    fn spawn_pump(self: &Arc<Self>, session: Arc<LiveSession>, mut events: mpsc::Receiver<ShellEvent>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut exit_status = None;
            let reason = loop {
                match events.recv().await {
                    Some(ShellEvent::Output(data)) => session.broadcast_output(data),
                    Some(ShellEvent::ExitStatus(code)) => exit_status = Some(code),
                    Some(ShellEvent::Closed) | None => {
                        break DisconnectReason::RemoteClosed { exit_status }
                    }
                    Some(ShellEvent::Failed(message)) => {
                        error!("Channel failure on {}: {}", session.key(), message);
                        break DisconnectReason::ChannelError { message };
                    }
                }
            };

            match registry.upgrade() {
                Some(registry) => registry.destroy(&session, reason).await,
                None => {
                    session.shutdown(reason).await;
                }
            }
        });
    }

    /// Bind an observer's terminal I/O to `session`, releasing any previous
    /// binding first.
    async fn bind(
        &self,
        session: &Arc<LiveSession>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(), BrokerError> {
        let id = observer.id().clone();
        let previous = self.attachments.get(&id).map(|entry| entry.value().clone());
        if let Some(previous) = previous {
            if &previous != session.key() {
                debug!("Observer {} moves from {} to {}", id, previous, session.key());
                self.release(&id, &previous).await;
            }
        }

        if !session.attach(observer) {
            return Err(BrokerError::Channel(format!(
                "session {} closed while attaching",
                session.key()
            )));
        }
        self.attachments.insert(id, session.key().clone());
        Ok(())
    }

    async fn release(&self, id: &ObserverId, key: &SessionKey) {
        let Some(session) = self.get(key) else {
            return;
        };
        if matches!(session.detach(id), Some((_, 0))) && !session.is_persistent() {
            self.destroy(&session, DisconnectReason::LastObserverDetached)
                .await;
        }
    }

    /// Detach an observer. With `force_close` the session is closed for
    /// every observer; otherwise it is closed only when this was the last
    /// observer of a non-persistent session.
    ///
    /// Returns true if the session was closed. Unknown observers are a no-op.
    pub async fn detach(&self, observer_id: &ObserverId, force_close: bool) -> bool {
        let Some(key) = self.attachments.get(observer_id).map(|e| e.value().clone()) else {
            return false;
        };
        let Some(session) = self.get(&key) else {
            self.attachments.remove(observer_id);
            return false;
        };

        if force_close {
            info!("Observer {} force-closing {}", observer_id, key);
            self.destroy(&session, DisconnectReason::ForceClosed).await;
            return true;
        }

        self.attachments.remove_if(observer_id, |_, bound| bound == &key);
        match session.detach(observer_id) {
            Some((observer, 0)) if !session.is_persistent() => {
                // Already out of the observer set, so shutdown won't reach it
                let reason = DisconnectReason::LastObserverDetached;
                observer.on_disconnected(&reason);
                self.destroy(&session, reason).await;
                true
            }
            Some((_, 0)) => {
                info!("Session {} kept alive with no observers", key);
                false
            }
            _ => false,
        }
    }

    /// Session the observer's terminal I/O is bound to
    pub fn session_for(&self, observer_id: &ObserverId) -> Result<Arc<LiveSession>, BrokerError> {
        self.attachments
            .get(observer_id)
            .and_then(|key| self.get(key.value()))
            .ok_or_else(|| BrokerError::not_found("session for observer", observer_id.as_str()))
    }

    pub async fn write(&self, observer_id: &ObserverId, data: &[u8]) -> Result<(), BrokerError> {
        self.session_for(observer_id)?.write(data).await
    }

    pub async fn resize(
        &self,
        observer_id: &ObserverId,
        rows: u16,
        cols: u16,
    ) -> Result<(), BrokerError> {
        self.session_for(observer_id)?.resize(rows, cols).await
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<LiveSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    pub fn find_by_connection_id(&self, connection_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().connection_id() == connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Close a session by key, for every observer.
    pub async fn close(&self, key: &SessionKey) -> Result<(), BrokerError> {
        let session = self
            .get(key)
            .ok_or_else(|| BrokerError::not_found("session", key.to_string()))?;
        self.destroy(&session, DisconnectReason::ForceClosed).await;
        Ok(())
    }

    /// Remove the entry, notify its observers and close the connection.
    /// Safe to call more than once.
    pub async fn destroy(&self, session: &Arc<LiveSession>, reason: DisconnectReason) {
        let key = session.key();
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session));

        let detached = session.shutdown(reason).await;
        for id in detached {
            self.attachments.remove_if(&id, |_, bound| bound == key);
        }
        self.connect_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Destroy every session idle for longer than `threshold`.
    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<SessionKey> {
        let idle: Vec<Arc<LiveSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > threshold)
            .map(|entry| entry.value().clone())
            .collect();

        for session in &idle {
            info!(
                "Reaping idle session {} (idle {:?})",
                session.key(),
                session.idle_for()
            );
            self.destroy(session, DisconnectReason::IdleTimeout).await;
        }
        idle.iter().map(|s| s.key().clone()).collect()
    }

    pub async fn shutdown_all(&self) -> usize {
        let all: Vec<Arc<LiveSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in &all {
            self.destroy(session, DisconnectReason::Shutdown).await;
        }
        all.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn observer_count(&self) -> usize {
        self.attachments.len()
    }
}

fn established(session: &LiveSession, reused: bool) -> ConnectionEstablished {
    ConnectionEstablished {
        success: true,
        connection_id: session.connection_id().to_string(),
        session: session.summary().clone(),
        reused,
    }
}
