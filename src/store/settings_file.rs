//! Durable state file: one JSON object mapping user id → settings.
//!
//! The file is read wholesale at startup and rewritten wholesale on every
//! save. Saves go through a sibling temporary file that is renamed over the
//! target, so a crash mid-write leaves the previous contents intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::AppError;
use crate::store::models::UserSetting;

pub type SettingsMap = HashMap<String, UserSetting>;

#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every entry. A missing file is a first run and yields an empty map.
    pub async fn load(&self) -> Result<SettingsMap, AppError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No settings file at {}, starting with empty registry",
                    self.path.display()
                );
                return Ok(SettingsMap::new());
            }
            Err(e) => {
                return Err(AppError::PersistenceFailure(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&contents).map_err(|e| {
            AppError::PersistenceFailure(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    /// Replace the file contents with `settings`.
    pub async fn save(&self, settings: &SettingsMap) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(settings).map_err(|e| {
            AppError::PersistenceFailure(format!("Failed to serialize settings: {}", e))
        })?;

        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, json).await.map_err(|e| {
            AppError::PersistenceFailure(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            AppError::PersistenceFailure(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            "Saved {} user settings to {}",
            settings.len(),
            self.path.display()
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "usersettings.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
