//! Configuration Management Module
//!
//! Broker tunables (timeouts, buffer sizes, detector and reaper settings)
//! loaded from a JSON file with per-field defaults.

pub mod storage;
pub mod types;

pub use storage::{broker_config_file, config_dir, ConfigStorage, StorageError};
pub use types::{
    AssistSettings, BrokerConfig, ReaperSettings, SessionSettings, TransferSettings,
    CONFIG_VERSION, DEFAULT_PROMPT_PATTERN,
};
