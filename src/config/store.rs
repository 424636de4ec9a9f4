use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; sessions read the config on every
/// statistics tick.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, writing a default config if the file does not exist
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the whole configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("duet.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());

        let config = store.get();
        assert_eq!(config.negotiation.stats_interval_ms, 300);
        assert_eq!(config.negotiation.adapt_every_ticks, 3);

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.negotiation.adaptive_fec = false;
                c.signaling.display_name = "alice".to_string();
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert!(!config.negotiation.adaptive_fec);

        // Reopen and verify persistence
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert!(!config.negotiation.adaptive_fec);
        assert_eq!(config.signaling.display_name, "alice");
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("duet.json");
        tokio::fs::write(&path, r#"{"negotiation":{"stats_interval_ms":500}}"#)
            .await
            .unwrap();

        let store = ConfigStore::new(&path).await.unwrap();
        let config = store.get();
        assert_eq!(config.negotiation.stats_interval_ms, 500);
        assert_eq!(config.negotiation.data_channel_label, "Data Channel");
        assert_eq!(config.audio.music.packet_time, Some(10));
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("duet.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = ConfigStore::new(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
