//! Broker configuration types
//!
//! Every field has a serde default so partial files load cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::{PtyRequest, SshSettings};

/// Current config format version
pub const CONFIG_VERSION: u32 = 1;

/// Default trailing-prompt pattern: `user@host:path$` or `#`
pub const DEFAULT_PROMPT_PATTERN: &str = r"(?m)^(.+@.+:.+[#$])\s*$";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub assist: AssistSettings,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub reaper: ReaperSettings,

    #[serde(default)]
    pub ssh: SshSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            session: SessionSettings::default(),
            assist: AssistSettings::default(),
            transfer: TransferSettings::default(),
            reaper: ReaperSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

/// Live Remote Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// TCP connect + handshake + authentication
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Opening the channel and negotiating PTY/shell or the sftp subsystem
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,

    /// Single round-trip file operations such as listing a directory
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Output ring buffer size in bytes
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_channel_timeout() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    15
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_history_limit() -> usize {
    10
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            channel_timeout_secs: default_channel_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            buffer_capacity: default_buffer_capacity(),
            history_limit: default_history_limit(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn pty(&self) -> PtyRequest {
        PtyRequest {
            term: self.term.clone(),
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Command-boundary detection and analysis hand-off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistSettings {
    /// Whether new sessions hand output to the analyzer without an explicit toggle
    #[serde(default)]
    pub enabled_by_default: bool,

    #[serde(default = "default_prompt_pattern")]
    pub prompt_pattern: String,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Snapshots shorter than this (in chars) are treated as noise
    #[serde(default = "default_min_snapshot_len")]
    pub min_snapshot_len: usize,

    /// Cap on output held between boundaries, trimmed from the front
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,

    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout_secs: u64,
}

fn default_prompt_pattern() -> String {
    DEFAULT_PROMPT_PATTERN.to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_min_snapshot_len() -> usize {
    5
}

fn default_max_pending_output() -> usize {
    64 * 1024
}

fn default_analysis_timeout() -> u64 {
    60
}

impl Default for AssistSettings {
    fn default() -> Self {
        Self {
            enabled_by_default: false,
            prompt_pattern: default_prompt_pattern(),
            debounce_ms: default_debounce_ms(),
            min_snapshot_len: default_min_snapshot_len(),
            max_pending_output: default_max_pending_output(),
            analysis_timeout_secs: default_analysis_timeout(),
        }
    }
}

impl AssistSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

/// Streaming transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bound on each individual chunk read or write
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

fn default_chunk_size() -> usize {
    32 * 1024
}

fn default_io_timeout() -> u64 {
    60
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

impl TransferSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Idle reaper schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_reaper_interval() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    3600
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl ReaperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{ "session": { "buffer_capacity": 2048 } }"#).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.session.buffer_capacity, 2048);
        assert_eq!(config.session.history_limit, 10);
        assert_eq!(config.assist.debounce_ms, 1000);
        assert_eq!(config.reaper.idle_timeout_secs, 3600);
        assert_eq!(config.reaper.interval_secs, 300);
    }

    #[test]
    fn test_default_prompt_pattern_compiles() {
        let re = regex::Regex::new(DEFAULT_PROMPT_PATTERN).unwrap();
        assert!(re.is_match("user@host:~$"));
        assert!(re.is_match("root@box:/etc#  "));
        assert!(!re.is_match("file1"));
    }
}
