//! Idle Reaper
//!
//! Background sweep over both registries. Anything idle for longer than the
//! threshold is destroyed and its observers are told why; the persistent
//! flag does not exempt a Live Remote Session.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::ReaperSettings;
use crate::session::{SessionKey, SessionRegistry};
use crate::sftp::TransferRegistry;

/// Keys removed by one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub live_sessions: Vec<SessionKey>,
    pub transfer_sessions: Vec<SessionKey>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.live_sessions.is_empty() && self.transfer_sessions.is_empty()
    }

    pub fn total(&self) -> usize {
        self.live_sessions.len() + self.transfer_sessions.len()
    }
}

/// Sweep both registries once.
pub async fn sweep(
    sessions: &SessionRegistry,
    transfers: &TransferRegistry,
    idle_timeout: Duration,
) -> ReapReport {
    ReapReport {
        live_sessions: sessions.sweep_idle(idle_timeout).await,
        transfer_sessions: transfers.sweep_idle(idle_timeout).await,
    }
}

/// Handle to the running sweep task
pub struct IdleReaper {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IdleReaper {
    /// Spawn the sweep loop. The first sweep runs one full period after start.
    pub fn start(
        settings: &ReaperSettings,
        sessions: &Arc<SessionRegistry>,
        transfers: &Arc<TransferRegistry>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let period = settings.interval().max(Duration::from_secs(1));
        let idle_timeout = settings.idle_timeout();

        info!(
            "Idle reaper started (every {:?}, threshold {:?})",
            period, idle_timeout
        );
        let task = tokio::spawn(reaper_loop(
            period,
            idle_timeout,
            Arc::downgrade(sessions),
            Arc::downgrade(transfers),
            stop_rx,
        ));

        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn reaper_loop(
    period: Duration,
    idle_timeout: Duration,
    sessions: Weak<SessionRegistry>,
    transfers: Weak<TransferRegistry>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (Some(sessions), Some(transfers)) = (sessions.upgrade(), transfers.upgrade()) else {
                    break;
                };
                let report = sweep(&sessions, &transfers, idle_timeout).await;
                if report.is_empty() {
                    debug!("Idle sweep: nothing to reap");
                } else {
                    info!(
                        "Idle sweep reaped {} live and {} transfer sessions",
                        report.live_sessions.len(),
                        report.transfer_sessions.len()
                    );
                }
            }
            _ = &mut stop_rx => break,
        }
    }

    info!("Idle reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectOptions, DisconnectReason};
    use crate::testing::{config, descriptor, settle, FakeConnector, RecordingObserver};

    fn registries(
        connector: &Arc<FakeConnector>,
    ) -> (Arc<SessionRegistry>, Arc<TransferRegistry>) {
        let config = Arc::new(config());
        (
            SessionRegistry::new(config.clone(), connector.clone(), None).unwrap(),
            TransferRegistry::new(config, connector.clone()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_reaped_on_next_sweep() {
        let connector = FakeConnector::new();
        let (sessions, transfers) = registries(&connector);
        let terminal = RecordingObserver::new("terminal");
        let files = RecordingObserver::new("files");

        sessions
            .connect(
                &descriptor("u1", "s1"),
                terminal.clone(),
                ConnectOptions {
                    persistent: true,
                    ..ConnectOptions::default()
                },
            )
            .await
            .unwrap();
        transfers
            .connect(&descriptor("u1", "s1"), files.clone())
            .await
            .unwrap();

        let mut reaper = IdleReaper::start(&ReaperSettings::default(), &sessions, &transfers);

        tokio::time::sleep(Duration::from_secs(3500)).await;
        settle().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(transfers.len(), 1);

        tokio::time::sleep(Duration::from_secs(500)).await;
        settle().await;
        assert!(sessions.is_empty());
        assert!(transfers.is_empty());
        assert_eq!(*terminal.disconnects.lock(), vec![DisconnectReason::IdleTimeout]);
        assert_eq!(*files.disconnects.lock(), vec![DisconnectReason::IdleTimeout]);

        reaper.stop().await;
        assert!(!reaper.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_reaping() {
        let connector = FakeConnector::new();
        let (sessions, transfers) = registries(&connector);
        let observer = RecordingObserver::new("a");

        sessions
            .connect(&descriptor("u1", "s1"), observer.clone(), ConnectOptions::default())
            .await
            .unwrap();
        let _reaper = IdleReaper::start(&ReaperSettings::default(), &sessions, &transfers);

        tokio::time::sleep(Duration::from_secs(3000)).await;
        sessions
            .write(&crate::session::ObserverId::from("a"), b"\r")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3000)).await;
        settle().await;

        assert_eq!(sessions.len(), 1);
        assert_eq!(observer.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_reaper_does_not_sweep() {
        let connector = FakeConnector::new();
        let (sessions, transfers) = registries(&connector);

        sessions
            .connect(&descriptor("u1", "s1"), RecordingObserver::new("a"), ConnectOptions::default())
            .await
            .unwrap();
        let mut reaper = IdleReaper::start(&ReaperSettings::default(), &sessions, &transfers);
        assert!(reaper.is_running());
        reaper.stop().await;

        tokio::time::sleep(Duration::from_secs(10_000)).await;
        settle().await;
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_sweep_reports_nothing_when_fresh() {
        let connector = FakeConnector::new();
        let (sessions, transfers) = registries(&connector);
        sessions
            .connect(&descriptor("u1", "s1"), RecordingObserver::new("a"), ConnectOptions::default())
            .await
            .unwrap();

        let report = sweep(&sessions, &transfers, Duration::from_secs(3600)).await;
        assert!(report.is_empty());
        assert_eq!(report.total(), 0);
    }
}
