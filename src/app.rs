use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::cli::{Cli, Command};
use crate::config::SyncSettings;
use crate::errors::ApiError;
use crate::remote::{ActionResponse, DeltaResponse, FolderDescriptor, MailApi, RemoteMessage, SavedDraft, UidList};
use crate::storage::{folders, threads, Database};
use crate::sync::MailboxManager;
use crate::types::{Direction, Draft, MessageFlags, ShortUid, SnoozeFlags, Thread};

pub async fn run(cli: Cli) -> Result<()> {
    let settings = SyncSettings::load()?;
    let db = Arc::new(Database::open_for_mailbox(settings.data_dir.as_deref(), &cli.user, &cli.mailbox).await?);
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Using SQLite store");
    }
    let manager = MailboxManager::new(db.clone(), Arc::new(OfflineApi), settings);

    match cli.command {
        Command::Folders => {
            let mut conn = db.read().await?;
            let list = folders::load_folders(&mut conn).await?;
            if list.is_empty() {
                println!("No folders stored yet.");
            }
            for folder in list {
                let threads = threads::count_threads_in_folder(&mut conn, &folder.id).await?;
                let queued_new = folders::queue_len(&mut conn, &folder.id, Direction::New).await?;
                let queued_old = folders::queue_len(&mut conn, &folder.id, Direction::Old).await?;
                println!(
                    "{:<24} {:<16} threads={:<6} unread={:<5} queue={}/{} remaining={} synced={}",
                    folder.path,
                    folder.role,
                    threads,
                    folder.unread_count,
                    queued_new,
                    queued_old,
                    folder.remaining_old_messages_to_fetch,
                    format_ts(folder.last_update),
                );
            }
        }
        Command::Threads { folder, limit } => {
            let mut conn = db.read().await?;
            let list = threads::threads_in_folder(&mut conn, &folder).await?;
            for (i, thread) in list.iter().take(limit).enumerate() {
                print_thread(i + 1, thread);
            }
        }
        Command::Recompute => {
            let alive = manager.recompute_all().await?;
            println!("Recomputed {} threads.", alive);
        }
        Command::Reset { folder } => {
            manager.reset_folder(&folder).await?;
            println!("Folder {} reset; it will bootstrap on the next sync.", folder);
        }
        Command::Search { text } => {
            let results = manager.search_offline(&text).await?;
            if results.is_empty() {
                println!("No stored message matches \"{}\".", text);
            }
            for (i, thread) in results.iter().enumerate() {
                print_thread(i + 1, thread);
            }
        }
    }
    Ok(())
}

fn print_thread(index: usize, thread: &Thread) {
    let status = if thread.unseen_messages > 0 { "U" } else { "R" };
    let subject = thread.subject.as_deref().unwrap_or("(No Subject)");
    println!(
        "{}. [{}] [{}] {} ({} messages)",
        index,
        format_ts(Some(thread.date)),
        status,
        subject,
        thread.message_count
    );
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Stand-in remote for local-only commands; every call reports no network.
struct OfflineApi;

fn offline<T>() -> Result<T, ApiError> {
    Err(ApiError::Network("offline: local store only".into()))
}

#[async_trait]
impl MailApi for OfflineApi {
    async fn list_folders(&self) -> Result<Vec<FolderDescriptor>, ApiError> {
        offline()
    }

    async fn fetch_delta(&self, _folder_id: &str, _cursor: &str) -> Result<DeltaResponse<MessageFlags>, ApiError> {
        offline()
    }

    async fn fetch_snoozed_delta(&self, _folder_id: &str, _cursor: &str) -> Result<DeltaResponse<SnoozeFlags>, ApiError> {
        offline()
    }

    async fn list_all_short_uids(&self, _folder_id: &str) -> Result<UidList, ApiError> {
        offline()
    }

    async fn fetch_messages_by_uids(&self, _folder_id: &str, _uids: &[ShortUid]) -> Result<Vec<RemoteMessage>, ApiError> {
        offline()
    }

    async fn move_messages(&self, _uids: &[String], _destination_id: &str) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn delete_messages(&self, _uids: &[String]) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn report_spam(&self, _uids: &[String]) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn star(&self, _uids: &[String], _starred: bool) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn mark_seen(&self, _uids: &[String], _seen: bool) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn snooze(&self, _uids: &[String], _end_date: i64) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn update_snooze(&self, _uuids: &[String], _end_date: i64) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn delete_snooze(&self, _uuids: &[String]) -> Result<ActionResponse, ApiError> {
        offline()
    }

    async fn undo(&self, _undo_resource: &str) -> Result<bool, ApiError> {
        offline()
    }

    async fn save_draft(&self, _draft: &Draft) -> Result<SavedDraft, ApiError> {
        offline()
    }

    async fn send_draft(&self, _draft: &Draft) -> Result<(), ApiError> {
        offline()
    }
}
