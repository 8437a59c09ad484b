//! Concurrent store of per-user location and notification schedule.
//!
//! One mutex guards the map; every read and write goes through it. Mutations
//! additionally take a writer lock that is held until the new snapshot is on
//! disk, so saves land in the same order the mutations were applied.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::store::models::{Schedule, SettingUpdate, UserSetting};
use crate::store::settings_file::{SettingsFile, SettingsMap};

/// Shared handle; clones refer to the same registry.
#[derive(Debug, Clone)]
pub struct UserRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: Mutex<SettingsMap>,
    writer: Mutex<()>,
    file: SettingsFile,
}

impl UserRegistry {
    /// Empty registry backed by `file`. Call `load_all` before serving.
    pub fn new(file: SettingsFile) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: Mutex::new(SettingsMap::new()),
                writer: Mutex::new(()),
                file,
            }),
        }
    }

    /// Replace the in-memory contents with the state file. Returns the
    /// number of users loaded.
    pub async fn load_all(&self) -> Result<usize, AppError> {
        let loaded = self.inner.file.load().await?;
        let count = loaded.len();
        *self.inner.settings.lock().await = loaded;
        tracing::info!(
            "Loaded {} user settings from {}",
            count,
            self.inner.file.path().display()
        );
        Ok(count)
    }

    /// Write the current contents to the state file.
    pub async fn save_all(&self) -> Result<(), AppError> {
        let _writer = self.inner.writer.lock().await;
        let snapshot = self.inner.settings.lock().await.clone();
        self.inner.file.save(&snapshot).await
    }

    /// Merge `update` into the user's entry, creating it if absent, then
    /// persist. The in-memory change stands even if the save fails.
    pub async fn upsert(&self, user_id: &str, update: SettingUpdate) -> Result<UserSetting, AppError> {
        if user_id.is_empty() {
            return Err(AppError::BadRequest("empty user id".to_string()));
        }

        let _writer = self.inner.writer.lock().await;
        let (merged, snapshot) = {
            let mut settings = self.inner.settings.lock().await;
            let existed = settings.contains_key(user_id);
            let entry = settings.entry(user_id.to_string()).or_default();
            let overwritten = entry.apply(update);
            let merged = entry.clone();

            if existed {
                tracing::info!(
                    "Updated user setting [{}]: location={:?} schedule={:?} overwritten={:?}",
                    user_id,
                    update.location,
                    update.schedule,
                    overwritten
                );
            } else {
                tracing::info!(
                    "Added user setting [{}]: location={:?} schedule={:?}",
                    user_id,
                    update.location,
                    update.schedule
                );
            }
            (merged, settings.clone())
        };

        self.inner.file.save(&snapshot).await?;
        Ok(merged)
    }

    pub async fn get(&self, user_id: &str) -> Option<UserSetting> {
        self.inner.settings.lock().await.get(user_id).cloned()
    }

    /// Snapshot of users whose schedule is exactly `schedule`.
    pub async fn scheduled_at(&self, schedule: Schedule) -> Vec<(String, UserSetting)> {
        let settings = self.inner.settings.lock().await;
        let mut matched: Vec<(String, UserSetting)> = settings
            .iter()
            .filter(|(_, s)| s.schedule == Some(schedule))
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched
    }

    pub async fn len(&self) -> usize {
        self.inner.settings.lock().await.len()
    }
}
