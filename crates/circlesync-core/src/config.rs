//! Engine configuration
//!
//! Every field has a default, so an empty (or missing) TOML file is a valid
//! configuration:
//!
//! ```toml
//! data_dir = "/var/lib/circlesync"
//! fetch_timeout_secs = 30
//! missing_file_window_days = 30
//! action_retention_days = 30
//! republish_interval_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default gossip message cap. Announcements are well under 1 KB.
pub const DEFAULT_GOSSIP_MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root for `circlesync.redb` and the `blobs/` store
    pub data_dir: PathBuf,
    /// Upper bound on a single blob fetch
    pub fetch_timeout_secs: u64,
    /// Posts newer than this are rechecked for missing attachments
    pub missing_file_window_days: u64,
    /// How long a delivered action stays listed in our manifests
    pub action_retention_days: u64,
    /// Period of the background republisher; 0 disables it
    pub republish_interval_secs: u64,
    pub gossip_max_message_size: usize,
    /// Use the on-disk blob store instead of memory
    pub persistent_blobs: bool,
    /// Period of the blob garbage collector that reclaims deleted blobs
    pub blob_gc_interval_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".circlesync"),
            fetch_timeout_secs: 30,
            missing_file_window_days: 30,
            action_retention_days: 30,
            republish_interval_secs: 300,
            gossip_max_message_size: DEFAULT_GOSSIP_MAX_MESSAGE_SIZE,
            persistent_blobs: true,
            blob_gc_interval_secs: 60,
            event_channel_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> SyncResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SyncError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(SyncError::Config(
                "fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.blob_gc_interval_secs == 0 {
            return Err(SyncError::Config(
                "blob_gc_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(SyncError::Config(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn missing_file_window(&self) -> Duration {
        Duration::from_secs(self.missing_file_window_days * 24 * 60 * 60)
    }

    pub fn action_retention(&self) -> Duration {
        Duration::from_secs(self.action_retention_days * 24 * 60 * 60)
    }

    pub fn blob_gc_interval(&self) -> Duration {
        Duration::from_secs(self.blob_gc_interval_secs)
    }

    pub fn republish_interval(&self) -> Option<Duration> {
        (self.republish_interval_secs > 0).then(|| Duration::from_secs(self.republish_interval_secs))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("circlesync.redb")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SyncConfig::from_toml("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml(
            r#"
            data_dir = "/tmp/node-a"
            fetch_timeout_secs = 5
            republish_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/node-a/circlesync.redb"));
        assert_eq!(config.republish_interval(), None);
        assert_eq!(config.missing_file_window_days, 30);
        assert_eq!(config.action_retention(), Duration::from_secs(30 * 86_400));
        assert_eq!(config.blob_gc_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            SyncConfig::from_toml("fetch_timeout_secs = 0"),
            Err(SyncError::Config(_))
        ));
        assert!(SyncConfig::from_toml("fetch_timeout_secs = \"soon\"").is_err());
        assert!(SyncConfig::from_toml("blob_gc_interval_secs = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circlesync.toml");
        std::fs::write(&path, "missing_file_window_days = 7\n").unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.missing_file_window(), Duration::from_secs(7 * 86_400));

        assert!(SyncConfig::load(dir.path().join("absent.toml")).is_err());
    }
}
