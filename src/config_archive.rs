use crate::error::{SwitchError, SwitchResult};
use crate::fsutil::{copy_path, remove_path};
use crate::models::{ModelTokenUsage, UsageSnapshot};
use crate::settings::{Settings, MAIN_CONFIG_FILE, MANAGED_ITEMS, SESSION_STATE_DIR, STATS_CACHE_FILE};
use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

const CONFIG_BACKUP_DIR: &str = "config";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsCache {
    #[serde(default)]
    total_messages: u64,
    #[serde(default)]
    daily_activity: Vec<DailyActivity>,
    #[serde(default)]
    model_usage: BTreeMap<String, ModelTokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyActivity {
    date: String,
    #[serde(default)]
    message_count: u64,
}

pub struct ConfigArchiver {
    settings: Settings,
}

impl ConfigArchiver {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn backup_dir(&self, profile_id: &str) -> PathBuf {
        self.settings
            .profile_dir(profile_id)
            .join(CONFIG_BACKUP_DIR)
    }

    /// Copies every managed item that exists live into the profile's backup,
    /// replacing earlier copies. Missing items are skipped.
    pub fn backup(&self, profile_id: &str) -> SwitchResult<usize> {
        let backup_dir = self.backup_dir(profile_id);
        fs::create_dir_all(&backup_dir)
            .map_err(|err| SwitchError::io_at("create dir", &backup_dir, err))?;

        let mut copied = 0;
        for item in MANAGED_ITEMS {
            let live = self.settings.live_path(item.relative_path);
            if fs::symlink_metadata(&live).is_err() {
                continue;
            }
            let destination = backup_dir.join(item.relative_path);
            remove_path(&destination)?;
            copy_path(&live, &destination)?;
            copied += 1;
        }
        tracing::info!("backed up {} config item(s) for profile {}", copied, profile_id);
        Ok(copied)
    }

    /// Puts the profile's backed-up items back in place. Only items present
    /// in the backup are touched; live-only items stay as they are.
    pub fn restore(&self, profile_id: &str) -> SwitchResult<usize> {
        let backup_dir = self.backup_dir(profile_id);
        if !backup_dir.is_dir() {
            return Err(SwitchError::ProfileNotFound(profile_id.to_string()));
        }

        let mut restored = 0;
        for item in MANAGED_ITEMS {
            let source = backup_dir.join(item.relative_path);
            if fs::symlink_metadata(&source).is_err() {
                continue;
            }
            let live = self.settings.live_path(item.relative_path);
            remove_path(&live)?;
            copy_path(&source, &live)?;
            restored += 1;
        }
        tracing::info!("restored {} config item(s) for profile {}", restored, profile_id);
        Ok(restored)
    }

    /// Removes the main config file and session state so the next login
    /// starts from scratch.
    pub fn clear(&self) -> SwitchResult<()> {
        remove_path(&self.settings.live_path(MAIN_CONFIG_FILE))?;
        remove_path(&self.settings.live_path(SESSION_STATE_DIR))
    }

    pub fn delete_profile(&self, profile_id: &str) -> SwitchResult<()> {
        remove_path(&self.settings.profile_dir(profile_id))
    }

    /// Reads the live stats cache. Missing or malformed caches read as no
    /// data.
    pub fn read_usage_stats(&self, today: NaiveDate) -> Option<UsageSnapshot> {
        let path = self.settings.live_path(STATS_CACHE_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!("no usage stats at {}: {}", path.display(), err);
                return None;
            }
        };
        let cache = match serde_json::from_slice::<StatsCache>(&raw) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!("ignoring malformed usage stats {}: {}", path.display(), err);
                return None;
            }
        };
        Some(summarize_stats(cache, today))
    }
}

fn summarize_stats(cache: StatsCache, today: NaiveDate) -> UsageSnapshot {
    // Dates are compared as YYYY-MM-DD strings.
    let today_key = today.format("%Y-%m-%d").to_string();
    let week_start_key = (today - Duration::days(6)).format("%Y-%m-%d").to_string();

    let mut today_messages = 0;
    let mut week_messages = 0;
    for day in &cache.daily_activity {
        let date = day.date.as_str();
        if date == today_key {
            today_messages += day.message_count;
        }
        if date >= week_start_key.as_str() && date <= today_key.as_str() {
            week_messages += day.message_count;
        }
    }

    UsageSnapshot {
        total_messages: cache.total_messages,
        today_messages,
        week_messages,
        model_usage: cache.model_usage,
    }
}
