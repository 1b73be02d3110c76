//! Configuration Storage
//!
//! Config location: ~/.oxideterm/broker.json on macOS/Linux,
//! %APPDATA%\OxideTerm\broker.json on Windows.

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{BrokerConfig, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn broker_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("broker.json"))
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: broker_config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load configuration, falling back to defaults when the file is absent.
    /// A malformed file is an error.
    pub async fn load(&self) -> Result<BrokerConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No broker config at {:?}, using defaults", self.path);
                return Ok(BrokerConfig::default());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let config: BrokerConfig = serde_json::from_str(&contents)?;
        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        tracing::info!("Loaded broker config from {:?}", self.path);
        Ok(config)
    }

    /// Write atomically via a temp file and rename.
    pub async fn save(&self, config: &BrokerConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent_gives_defaults() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("broker.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.session.connect_timeout_secs, 20);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("broker.json"));

        let mut config = BrokerConfig::default();
        config.transfer.chunk_size = 4096;
        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.transfer.chunk_size, 4096);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broker.json");
        tokio::fs::write(&path, r#"{ "version": 99 }"#).await.unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broker.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        assert!(matches!(
            ConfigStorage::with_path(path).load().await,
            Err(StorageError::Json(_))
        ));
    }
}
