use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::types::{FolderRole, ThreadMode, ThreadingPolicy};

/// Sync tuning knobs. Defaults work without any config file; an optional TOML
/// file and `MAILBOX_*` env vars override them, in that order.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub new_page_size: usize,
    pub old_page_size: usize,
    pub delete_batch_size: usize,
    pub api_batch_size: usize,
    /// Upper bound for history backfill right after a bootstrap.
    pub old_messages_budget: i64,
    pub thread_mode: ThreadMode,
    pub single_message_roles: Vec<FolderRole>,
    pub unsnooze_concurrency: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            new_page_size: 50,
            old_page_size: 20,
            delete_batch_size: 100,
            api_batch_size: 1000,
            old_messages_budget: 1000,
            thread_mode: ThreadMode::Conversation,
            single_message_roles: vec![FolderRole::Drafts, FolderRole::ScheduledDrafts],
            unsnooze_concurrency: 4,
            data_dir: None,
        }
    }
}

impl SyncSettings {
    pub fn load() -> Result<Self> {
        let mut settings = match env::var("MAILBOX_SYNC_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: SyncSettings = toml::from_str(raw).context("invalid sync settings")?;
        Ok(settings.sanitized())
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_usize("MAILBOX_NEW_PAGE_SIZE") {
            self.new_page_size = v;
        }
        if let Some(v) = env_usize("MAILBOX_OLD_PAGE_SIZE") {
            self.old_page_size = v;
        }
        if let Some(v) = env_usize("MAILBOX_API_BATCH_SIZE") {
            self.api_batch_size = v;
        }
        if let Some(v) = env_usize("MAILBOX_OLD_MESSAGES_BUDGET") {
            self.old_messages_budget = v as i64;
        }
        if let Ok(mode) = env::var("MAILBOX_THREAD_MODE") {
            self.thread_mode = if mode.eq_ignore_ascii_case("flat") {
                ThreadMode::Flat
            } else {
                ThreadMode::Conversation
            };
        }
        if let Ok(dir) = env::var("MAILBOX_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        *self = self.clone().sanitized();
    }

    // Zero sizes would stall every paging loop.
    fn sanitized(mut self) -> Self {
        self.new_page_size = self.new_page_size.max(1);
        self.old_page_size = self.old_page_size.max(1);
        self.delete_batch_size = self.delete_batch_size.max(1);
        self.api_batch_size = self.api_batch_size.max(1);
        self.unsnooze_concurrency = self.unsnooze_concurrency.max(1);
        self.old_messages_budget = self.old_messages_budget.max(0);
        self
    }

    pub fn policy_for(&self, role: FolderRole) -> ThreadingPolicy {
        if self.single_message_roles.contains(&role) {
            ThreadingPolicy::SingleMessage
        } else {
            ThreadingPolicy::Conversation
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_given_keys() {
        let settings = SyncSettings::from_toml(
            r#"
            new_page_size = 10
            thread_mode = "flat"
            single_message_roles = ["trash"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.new_page_size, 10);
        assert_eq!(settings.old_page_size, 20);
        assert_eq!(settings.thread_mode, ThreadMode::Flat);
        assert_eq!(settings.policy_for(FolderRole::Trash), ThreadingPolicy::SingleMessage);
        assert_eq!(settings.policy_for(FolderRole::Drafts), ThreadingPolicy::Conversation);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let settings = SyncSettings::from_toml("old_page_size = 0\napi_batch_size = 0").unwrap();
        assert_eq!(settings.old_page_size, 1);
        assert_eq!(settings.api_batch_size, 1);
    }
}
