//! Command-boundary detection
//!
//! A command starts when the user submits a non-empty line, or when output
//! shows up while nothing is running. It completes when the accumulated
//! output, stripped of escape sequences and trimmed, ends in a shell prompt.
//! The owning session debounces completion: each chunk that still ends in a
//! prompt restarts the timer, and the snapshot is only taken once the timer
//! fires.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;

use crate::config::AssistSettings;

/// Compile the configured prompt pattern.
pub fn prompt_regex(settings: &AssistSettings) -> Result<Regex, regex::Error> {
    Regex::new(&settings.prompt_pattern)
}

/// What a chunk of output meant to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputVerdict {
    /// Nothing running, nothing new
    Idle,
    /// Output arrived without a submitted line
    CommandStarted,
    /// Running, no prompt yet
    Running,
    /// Running and the buffer now ends in a prompt
    CommandCompleted,
    /// Prompt seen while idle; pending output discarded
    PromptResync,
}

/// Result of taking a snapshot when the debounce timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// An analysis is already running
    Busy,
    /// Too short to be worth analyzing; state was still reset
    Noise,
    Ready(String),
}

#[derive(Debug, Default)]
struct DetectorState {
    running: bool,
    pending: Vec<u8>,
    last_prompt: Option<String>,
}

pub struct CommandBoundaryDetector {
    prompt: Regex,
    min_snapshot_len: usize,
    max_pending: usize,
    state: Mutex<DetectorState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    in_flight: AtomicBool,
}

impl CommandBoundaryDetector {
    pub fn new(prompt: Regex, settings: &AssistSettings) -> Self {
        Self {
            prompt,
            min_snapshot_len: settings.min_snapshot_len,
            max_pending: settings.max_pending_output.max(1),
            state: Mutex::new(DetectorState::default()),
            timer: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// A line was submitted on stdin (terminator already removed).
    pub fn on_input_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.running = true;
        state.pending.clear();
    }

    pub fn on_output(&self, chunk: &[u8]) -> OutputVerdict {
        let mut state = self.state.lock();
        state.pending.extend_from_slice(chunk);
        if state.pending.len() > self.max_pending {
            let overflow = state.pending.len() - self.max_pending;
            state.pending.drain(..overflow);
            while matches!(state.pending.first(), Some(b) if b & 0xC0 == 0x80) {
                state.pending.remove(0);
            }
        }

        let text = plain_text(&state.pending);
        let prompt = self.trailing_prompt(text.trim()).map(|(_, prompt)| prompt);

        match (prompt, state.running) {
            (Some(prompt), true) => {
                state.last_prompt = Some(prompt);
                OutputVerdict::CommandCompleted
            }
            (Some(prompt), false) => {
                state.last_prompt = Some(prompt);
                state.pending.clear();
                OutputVerdict::PromptResync
            }
            (None, true) => OutputVerdict::Running,
            (None, false) => {
                let chunk = plain_text(chunk);
                if !chunk.trim().is_empty() && chunk.contains('\n') {
                    state.running = true;
                    OutputVerdict::CommandStarted
                } else {
                    OutputVerdict::Idle
                }
            }
        }
    }

    /// Take the completed command's output and reset for the next one.
    ///
    /// On [`Handoff::Ready`] the caller owns the in-flight slot and must call
    /// [`finish_analysis`](Self::finish_analysis) when done.
    pub fn take_snapshot(&self) -> Handoff {
        let mut state = self.state.lock();
        if self.in_flight.load(Ordering::Acquire) {
            return Handoff::Busy;
        }

        let text = plain_text(&state.pending);
        let trimmed = text.trim();
        let body = match self.trailing_prompt(trimmed) {
            Some((start, _)) => trimmed[..start].trim(),
            None => trimmed,
        };
        let snapshot = body.to_string();

        state.pending.clear();
        state.running = false;

        if snapshot.chars().count() < self.min_snapshot_len {
            return Handoff::Noise;
        }
        self.in_flight.store(true, Ordering::Release);
        Handoff::Ready(snapshot)
    }

    /// Claim the in-flight slot for a manual request.
    pub fn try_begin_analysis(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_analysis(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_analysis_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.state.lock().last_prompt.clone()
    }

    /// Install a new debounce timer, aborting the previous one.
    pub fn schedule(&self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// Drop pending output and any armed timer.
    pub fn reset(&self) {
        self.cancel();
        let mut state = self.state.lock();
        state.running = false;
        state.pending.clear();
    }

    /// Start offset and text of a prompt that ends `text`, if any.
    fn trailing_prompt(&self, text: &str) -> Option<(usize, String)> {
        let caps = self.prompt.captures_iter(text).last()?;
        let whole = caps.get(0)?;
        if whole.end() != text.len() {
            return None;
        }
        let prompt = caps.get(1).unwrap_or(whole).as_str().trim().to_string();
        Some((whole.start(), prompt))
    }
}

impl Drop for CommandBoundaryDetector {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Escape sequences removed, CRLF folded to LF
pub fn plain_text(bytes: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(bytes);
    String::from_utf8_lossy(&stripped).replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn detector() -> CommandBoundaryDetector {
        let settings = AssistSettings::default();
        CommandBoundaryDetector::new(prompt_regex(&settings).unwrap(), &settings)
    }

    #[test]
    fn test_completed_command_snapshot_excludes_prompt() {
        let detector = detector();
        detector.on_input_line("ls");
        assert!(detector.is_running());

        let verdict = detector.on_output(b"file1\nfile2\nuser@host:~$ ");
        assert_eq!(verdict, OutputVerdict::CommandCompleted);
        assert_eq!(detector.last_prompt().as_deref(), Some("user@host:~$"));

        assert_eq!(detector.take_snapshot(), Handoff::Ready("file1\nfile2".into()));
        assert!(!detector.is_running());
        assert!(detector.is_analysis_in_flight());
    }

    #[test]
    fn test_output_split_across_chunks() {
        let detector = detector();
        detector.on_input_line("uptime");
        assert_eq!(detector.on_output(b" 10:00:01 up 3 days"), OutputVerdict::Running);
        assert_eq!(
            detector.on_output(b",  load average: 0.00\r\nroot@box:/var/log# "),
            OutputVerdict::CommandCompleted
        );
        assert_eq!(
            detector.take_snapshot(),
            Handoff::Ready("10:00:01 up 3 days,  load average: 0.00".into())
        );
    }

    #[test]
    fn test_escape_sequences_do_not_hide_prompt() {
        let detector = detector();
        detector.on_input_line("ls --color");
        let verdict =
            detector.on_output(b"\x1b[01;34mdir\x1b[0m  notes.txt\r\n\x1b[32muser@host\x1b[0m:~$ ");
        assert_eq!(verdict, OutputVerdict::CommandCompleted);
        assert_eq!(detector.take_snapshot(), Handoff::Ready("dir  notes.txt".into()));
    }

    #[test]
    fn test_prompt_must_be_at_the_end() {
        let detector = detector();
        detector.on_input_line("cat log");
        let verdict = detector.on_output(b"user@host:~$ earlier\nstill printing\n");
        assert_eq!(verdict, OutputVerdict::Running);
    }

    #[test]
    fn test_busy_while_analysis_in_flight() {
        let detector = detector();
        detector.on_input_line("ls");
        detector.on_output(b"file1\nfile2\nuser@host:~$ ");
        assert!(matches!(detector.take_snapshot(), Handoff::Ready(_)));

        detector.on_input_line("df");
        detector.on_output(b"Filesystem  Size\nuser@host:~$ ");
        assert_eq!(detector.take_snapshot(), Handoff::Busy);
        assert!(!detector.try_begin_analysis());

        detector.finish_analysis();
        assert!(detector.try_begin_analysis());
    }

    #[test]
    fn test_short_snapshot_is_noise() {
        let detector = detector();
        detector.on_input_line("cd /tmp");
        detector.on_output(b"user@host:/tmp$ ");
        assert_eq!(detector.take_snapshot(), Handoff::Noise);
        assert!(!detector.is_analysis_in_flight());
        assert!(!detector.is_running());
    }

    #[test]
    fn test_prompt_while_idle_resyncs() {
        let detector = detector();
        assert_eq!(detector.on_output(b"Welcome\nuser@host:~$ "), OutputVerdict::PromptResync);
        assert!(!detector.is_running());

        // Echo of keystrokes does not start a command
        assert_eq!(detector.on_output(b"l"), OutputVerdict::Idle);
    }

    #[test]
    fn test_unprompted_output_starts_command() {
        let detector = detector();
        assert_eq!(
            detector.on_output(b"Broadcast message from root\n"),
            OutputVerdict::CommandStarted
        );
        assert!(detector.is_running());
    }

    #[test]
    fn test_blank_line_does_not_start_command() {
        let detector = detector();
        detector.on_input_line("   ");
        assert!(!detector.is_running());
    }

    #[test]
    fn test_pending_output_is_capped() {
        let settings = AssistSettings {
            max_pending_output: 16,
            ..AssistSettings::default()
        };
        let detector = CommandBoundaryDetector::new(prompt_regex(&settings).unwrap(), &settings);
        detector.on_input_line("yes");
        detector.on_output(&[b'y'; 100]);
        detector.on_output(b"\nuser@host:~$ ");
        match detector.take_snapshot() {
            Handoff::Ready(snapshot) => assert!(snapshot.len() <= 16),
            Handoff::Noise => {}
            Handoff::Busy => panic!("nothing in flight"),
        }
    }

    #[tokio::test]
    async fn test_schedule_aborts_previous_timer() {
        let detector = detector();
        let (tx, rx) = oneshot::channel::<()>();
        detector.schedule(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        detector.schedule(tokio::spawn(async {}));
        assert!(rx.await.is_err());
    }
}
