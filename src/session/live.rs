//! Live Remote Session
//!
//! One authenticated connection plus its shell channel, shared by any number
//! of observers. Output is appended to the ring buffer and pushed to the
//! observers under one lock, so an observer attaching mid-stream gets the
//! buffer once and every later chunk exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::boundary::{plain_text, CommandBoundaryDetector, Handoff, OutputVerdict};
use super::observer::SessionObserver;
use super::scroll_buffer::ScrollBuffer;
use super::types::{DisconnectReason, ObserverId, SessionInfo, SessionKey, SessionSummary};
use crate::assist::{
    AnalysisContext, AnalysisResponse, AnalysisTrigger, AssistEvent, OutputAnalyzer,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::ssh::{HandleController, SessionCommand};

struct LiveState {
    buffer: ScrollBuffer,
    observers: Vec<Arc<dyn SessionObserver>>,
    /// Submitted command lines, oldest first
    history: VecDeque<String>,
    /// Line being typed, not yet submitted
    line: String,
    escape: Escape,
    last_activity: Instant,
    connected: bool,
}

/// Position inside a terminal escape sequence sent as input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    /// After ESC
    Start,
    /// `ESC [`, ends on a final byte 0x40..=0x7E
    Csi,
    /// `ESC O`, ends on the next character
    Ss3,
}

pub struct LiveSession {
    key: SessionKey,
    connection_id: String,
    summary: SessionSummary,
    created_at: DateTime<Utc>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    controller: HandleController,
    persistent: AtomicBool,
    assist_enabled: AtomicBool,
    state: Mutex<LiveState>,
    detector: CommandBoundaryDetector,
    analyzer: Option<Arc<dyn OutputAnalyzer>>,
    config: Arc<BrokerConfig>,
}

/// Releases the detector's in-flight slot when the analysis ends or is dropped
struct InFlight<'a>(&'a CommandBoundaryDetector);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_analysis();
    }
}

impl LiveSession {
    pub(crate) fn new(
        key: SessionKey,
        summary: SessionSummary,
        cmd_tx: mpsc::Sender<SessionCommand>,
        controller: HandleController,
        detector: CommandBoundaryDetector,
        analyzer: Option<Arc<dyn OutputAnalyzer>>,
        config: Arc<BrokerConfig>,
    ) -> Arc<Self> {
        let assist_enabled = config.assist.enabled_by_default && analyzer.is_some();
        Arc::new(Self {
            key,
            connection_id: uuid::Uuid::new_v4().to_string(),
            summary,
            created_at: Utc::now(),
            cmd_tx,
            controller,
            persistent: AtomicBool::new(false),
            assist_enabled: AtomicBool::new(assist_enabled),
            state: Mutex::new(LiveState {
                buffer: ScrollBuffer::with_capacity(config.session.buffer_capacity),
                observers: Vec::new(),
                history: VecDeque::with_capacity(config.session.history_limit),
                line: String::new(),
                escape: Escape::None,
                last_activity: Instant::now(),
                connected: true,
            }),
            detector,
            analyzer,
            config,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    pub fn assist_enabled(&self) -> bool {
        self.assist_enabled.load(Ordering::Acquire)
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub fn has_observer(&self, id: &ObserverId) -> bool {
        self.state.lock().observers.iter().any(|o| o.id() == id)
    }

    /// Recent submitted commands, oldest first
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn buffer_contents(&self) -> Vec<u8> {
        self.state.lock().buffer.contents()
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.state.lock().last_activity)
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            connection_id: self.connection_id.clone(),
            key: self.key.clone(),
            session: self.summary.clone(),
            observer_count: state.observers.len(),
            connected: state.connected,
            persistent: self.is_persistent(),
            assist_enabled: self.assist_enabled(),
            idle_seconds: Instant::now()
                .saturating_duration_since(state.last_activity)
                .as_secs(),
            created_at: self.created_at,
        }
    }

    /// Add an observer and replay the buffer to it alone.
    ///
    /// Returns false when the session is already gone. Attaching the same
    /// observer again replaces it and replays again.
    pub fn attach(&self, observer: Arc<dyn SessionObserver>) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }

        let id = observer.id().clone();
        state.observers.retain(|o| o.id() != &id);
        if !state.buffer.is_empty() {
            observer.on_output(&Bytes::from(state.buffer.contents()));
        }
        state.observers.push(observer);
        state.last_activity = Instant::now();

        debug!(
            "Observer {} attached to {} ({} attached)",
            id,
            self.key,
            state.observers.len()
        );
        true
    }

    /// Remove an observer. Returns it with the remaining count, or `None`
    /// if it was not attached.
    pub fn detach(&self, id: &ObserverId) -> Option<(Arc<dyn SessionObserver>, usize)> {
        let mut state = self.state.lock();
        let index = state.observers.iter().position(|o| o.id() == id)?;
        let observer = state.observers.remove(index);
        state.last_activity = Instant::now();
        debug!(
            "Observer {} detached from {} ({} remaining)",
            id,
            self.key,
            state.observers.len()
        );
        Some((observer, state.observers.len()))
    }

    /// Forward bytes to the shell verbatim.
    pub async fn write(&self, data: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Channel(format!(
                "session {} is not connected",
                self.key
            )));
        }

        self.cmd_tx
            .send(SessionCommand::Data(data.to_vec()))
            .await
            .map_err(|_| BrokerError::Channel("shell channel closed".into()))?;

        let lines = {
            let mut state = self.state.lock();
            if !state.connected {
                return Ok(());
            }
            state.last_activity = Instant::now();
            track_input(&mut state, data, self.config.session.history_limit)
        };

        if self.assist_enabled() {
            for line in &lines {
                self.detector.on_input_line(line);
            }
        }
        Ok(())
    }

    /// Window change; ignored once disconnected.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), BrokerError> {
        if rows == 0 || cols == 0 {
            return Err(BrokerError::Validation(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }
        if !self.is_connected() {
            return Ok(());
        }
        if self
            .cmd_tx
            .send(SessionCommand::Resize(cols, rows))
            .await
            .is_err()
        {
            debug!("Resize dropped for {}: shell channel closed", self.key);
        }
        Ok(())
    }

    /// Append a chunk to the ring buffer and push it to every observer.
    pub fn broadcast_output(self: &Arc<Self>, data: Bytes) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.buffer.append(&data);
            state.last_activity = Instant::now();
            for observer in &state.observers {
                observer.on_output(&data);
            }
        }

        if !self.assist_enabled() {
            return;
        }
        match self.detector.on_output(&data) {
            OutputVerdict::CommandCompleted => self.arm_debounce(),
            // Output after a prompt means the command was not done yet
            OutputVerdict::Running | OutputVerdict::CommandStarted => self.detector.cancel(),
            OutputVerdict::Idle | OutputVerdict::PromptResync => {}
        }
    }

    fn arm_debounce(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let delay = self.config.assist.debounce();
        self.detector.schedule(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = session.upgrade() {
                session.on_debounce();
            }
        }));
    }

    fn on_debounce(self: &Arc<Self>) {
        if !self.is_connected() || !self.assist_enabled() {
            return;
        }
        match self.detector.take_snapshot() {
            Handoff::Ready(snapshot) => {
                debug!(
                    "Command completed on {}, handing off {} chars",
                    self.key,
                    snapshot.len()
                );
                // Separate task so re-arming the timer cannot abort it
                let session = self.clone();
                tokio::spawn(async move {
                    let _in_flight = InFlight(&session.detector);
                    let _ = session
                        .analyze(snapshot, AnalysisTrigger::CommandCompleted, None)
                        .await;
                });
            }
            Handoff::Noise => debug!("Output on {} too short to analyze", self.key),
            Handoff::Busy => debug!("Analysis already running on {}, skipping", self.key),
        }
    }

    /// Analyze the whole ring buffer now.
    pub async fn analyze_now(&self) -> Result<AnalysisResponse, BrokerError> {
        self.ensure_connected()?;
        let snapshot = plain_text(&self.buffer_contents()).trim().to_string();
        if snapshot.is_empty() {
            return Err(BrokerError::Validation("nothing to analyze yet".into()));
        }
        let _in_flight = self.claim_analysis()?;
        self.analyze(snapshot, AnalysisTrigger::Manual, None).await
    }

    /// Free-form question, with the ring buffer as context.
    pub async fn ask_assistant(&self, question: &str) -> Result<AnalysisResponse, BrokerError> {
        self.ensure_connected()?;
        let question = question.trim();
        if question.is_empty() {
            return Err(BrokerError::Validation("question is empty".into()));
        }
        let snapshot = plain_text(&self.buffer_contents()).trim().to_string();
        let _in_flight = self.claim_analysis()?;
        self.analyze(snapshot, AnalysisTrigger::Question, Some(question.to_string()))
            .await
    }

    /// Write a command the user approved, adding a newline when missing.
    pub async fn execute_approved(&self, command: &str) -> Result<(), BrokerError> {
        if command.trim().is_empty() {
            return Err(BrokerError::Validation("approved command is empty".into()));
        }
        let mut text = command.to_string();
        if !text.ends_with('\n') && !text.ends_with('\r') {
            text.push('\n');
        }
        self.write(text.as_bytes()).await?;

        info!("Approved command executed on {}", self.key);
        self.notify_assist(&AssistEvent::CommandExecuted {
            command: command.trim_end().to_string(),
        });
        Ok(())
    }

    pub fn set_assist_enabled(&self, enabled: bool) -> Result<(), BrokerError> {
        if enabled && self.analyzer.is_none() {
            return Err(BrokerError::Validation("no analyzer configured".into()));
        }
        if self.assist_enabled.swap(enabled, Ordering::AcqRel) != enabled {
            self.detector.reset();
            info!(
                "Assist {} for {}",
                if enabled { "enabled" } else { "disabled" },
                self.key
            );
        }
        self.notify_assist(&AssistEvent::Status { enabled });
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Channel(format!(
                "session {} is not connected",
                self.key
            )))
        }
    }

    fn claim_analysis(&self) -> Result<InFlight<'_>, BrokerError> {
        if self.analyzer.is_none() {
            return Err(BrokerError::Validation("no analyzer configured".into()));
        }
        if !self.detector.try_begin_analysis() {
            return Err(BrokerError::Validation(
                "an analysis is already running".into(),
            ));
        }
        Ok(InFlight(&self.detector))
    }

    /// Caller holds the in-flight slot.
    async fn analyze(
        &self,
        snapshot: String,
        trigger: AnalysisTrigger,
        prompt: Option<String>,
    ) -> Result<AnalysisResponse, BrokerError> {
        let Some(analyzer) = self.analyzer.clone() else {
            return Err(BrokerError::Validation("no analyzer configured".into()));
        };

        self.notify_assist(&AssistEvent::ProcessingStarted { trigger });
        let context = AnalysisContext {
            hostname: self.summary.hostname.clone(),
            username: self.summary.username.clone(),
            recent_commands: self.history(),
            prompt,
        };

        let timeout = self.config.assist.analysis_timeout();
        let result = match tokio::time::timeout(timeout, analyzer.analyze(&snapshot, &context))
            .await
        {
            Ok(Ok(analysis)) => {
                let response = AnalysisResponse::from_analysis(trigger, analysis);
                self.notify_assist(&AssistEvent::Response(response.clone()));
                if let Some(command) = &response.command {
                    self.notify_assist(&AssistEvent::CommandSuggestion {
                        command: command.clone(),
                    });
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!("Analysis failed for {}: {}", self.key, e);
                self.notify_assist(&AssistEvent::Error {
                    message: e.to_string(),
                });
                Err(BrokerError::Analysis(e.to_string()))
            }
            Err(_) => {
                let message = format!("no answer within {}s", timeout.as_secs());
                warn!("Analysis timed out for {}", self.key);
                self.notify_assist(&AssistEvent::Error {
                    message: message.clone(),
                });
                Err(BrokerError::Analysis(message))
            }
        };

        self.notify_assist(&AssistEvent::ProcessingFinished { trigger });
        result
    }

    fn notify_assist(&self, event: &AssistEvent) {
        let state = self.state.lock();
        for observer in &state.observers {
            observer.on_assist(event);
        }
    }

    /// Mark disconnected, notify every observer, close the channel and the
    /// connection. Returns the observers that were attached; empty if the
    /// session was already shut down.
    pub async fn shutdown(&self, reason: DisconnectReason) -> Vec<ObserverId> {
        let observers = {
            let mut state = self.state.lock();
            if !state.connected {
                return Vec::new();
            }
            state.connected = false;
            std::mem::take(&mut state.observers)
        };
        self.detector.reset();

        for observer in &observers {
            if let DisconnectReason::ChannelError { message } = &reason {
                observer.on_error(message);
            }
            observer.on_disconnected(&reason);
        }

        let _ = self.cmd_tx.try_send(SessionCommand::Close);
        self.controller.disconnect().await;

        info!(
            "Live session {} ({}) closed: {}",
            self.key, self.connection_id, reason
        );
        observers.iter().map(|o| o.id().clone()).collect()
    }
}

/// Fold keystrokes into submitted lines. Returns the lines completed by
/// `data`, each also recorded in the bounded history.
fn track_input(state: &mut LiveState, data: &[u8], history_limit: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for ch in String::from_utf8_lossy(data).chars() {
        match state.escape {
            Escape::None => {}
            Escape::Start => {
                state.escape = match ch {
                    '[' => Escape::Csi,
                    'O' => Escape::Ss3,
                    // Alt-modified key
                    _ => Escape::None,
                };
                continue;
            }
            Escape::Csi => {
                if ('\x40'..='\x7e').contains(&ch) {
                    state.escape = Escape::None;
                }
                continue;
            }
            Escape::Ss3 => {
                state.escape = Escape::None;
                continue;
            }
        }
        match ch {
            '\r' | '\n' => {
                let line = std::mem::take(&mut state.line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if history_limit > 0 {
                    state.history.push_back(line.to_string());
                    while state.history.len() > history_limit {
                        state.history.pop_front();
                    }
                }
                lines.push(line.to_string());
            }
            '\x7f' | '\x08' => {
                state.line.pop();
            }
            // Ctrl-C, Ctrl-U
            '\x03' | '\x15' => state.line.clear(),
            '\x1b' => state.escape = Escape::Start,
            c if c.is_control() => {}
            c => state.line.push(c),
        }
    }
    lines
}
