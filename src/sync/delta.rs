use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info};

use super::{detach_orphan_drafts, unread, MailboxManager};
use crate::errors::ApiError;
use crate::remote::{DeltaResponse, MailApi};
use crate::storage::{folders, messages, threads, WriteTx};
use crate::threading::{self, FolderCache};
use crate::types::{now_ts, Direction, Folder, Message, MessageFlags, ShortUid, SnoozeFlags};

/// Flag shape carried by a folder delta. Lets one pipeline apply both the
/// generic message delta and the snoozed-folder delta.
#[async_trait]
pub trait DeltaFlags: Clone + Send + Sync + 'static {
    async fn fetch(api: &dyn MailApi, folder_id: &str, cursor: &str) -> Result<DeltaResponse<Self>, ApiError>;

    /// Writes these flags onto `message`; true when anything changed.
    fn apply_to(&self, message: &mut Message) -> bool;
}

#[async_trait]
impl DeltaFlags for MessageFlags {
    async fn fetch(api: &dyn MailApi, folder_id: &str, cursor: &str) -> Result<DeltaResponse<Self>, ApiError> {
        api.fetch_delta(folder_id, cursor).await
    }

    fn apply_to(&self, message: &mut Message) -> bool {
        if message.flags == *self {
            return false;
        }
        message.flags = *self;
        true
    }
}

#[async_trait]
impl DeltaFlags for SnoozeFlags {
    async fn fetch(api: &dyn MailApi, folder_id: &str, cursor: &str) -> Result<DeltaResponse<Self>, ApiError> {
        api.fetch_snoozed_delta(folder_id, cursor).await
    }

    fn apply_to(&self, message: &mut Message) -> bool {
        if message.snooze == *self {
            return false;
        }
        message.snooze = self.clone();
        true
    }
}

impl MailboxManager {
    pub(crate) async fn apply_delta<F: DeltaFlags>(&self, folder: &Folder, delta: DeltaResponse<F>) -> Result<()> {
        let start = Instant::now();
        info!(
            folder = %folder.id,
            added = delta.added.len(),
            updated = delta.updated.len(),
            deleted = delta.deleted.len(),
            "Applying folder delta"
        );

        for chunk in delta.deleted.chunks(self.settings.delete_batch_size) {
            self.check_cancelled()?;
            self.apply_deletions(folder, chunk).await?;
        }

        for chunk in delta.updated.chunks(self.settings.delete_batch_size) {
            self.check_cancelled()?;
            let mut tx = self.db.write().await?;
            let mut changed = Vec::new();
            for update in chunk {
                let uid = folder.long_uid(update.short_uid);
                let Some(mut message) = messages::load_message(tx.conn(), &uid).await? else {
                    continue;
                };
                if update.flags.apply_to(&mut message) {
                    messages::upsert_message(&mut tx, &message).await?;
                    changed.push(uid);
                }
            }
            if !changed.is_empty() {
                let mut cache = FolderCache::with(folder);
                let (_, mut impacted) = threading::recompute_threads_for_messages(&mut tx, &mut cache, &changed).await?;
                impacted.insert(folder.id.clone());
                unread::recompute_folders(&mut tx, &impacted).await?;
            }
            tx.commit().await?;
            debug!(folder = %folder.id, changed = changed.len(), "Flag batch applied");
        }

        self.check_cancelled()?;
        let mut tx = self.db.write().await?;
        let Some(mut current) = folders::load_folder(tx.conn(), &folder.id).await? else {
            return Ok(());
        };

        let added_long: Vec<String> = delta.added.iter().map(|u| current.long_uid(*u)).collect();
        let known = threads::linked_in_folder(tx.conn(), &current.id, &added_long).await?;
        let fresh: Vec<ShortUid> = delta
            .added
            .iter()
            .zip(&added_long)
            .filter(|(_, long)| !known.contains(*long))
            .map(|(short, _)| *short)
            .collect();
        let queued = folders::queue_append(&mut tx, &current.id, Direction::New, &fresh).await?;

        current.cursor = Some(delta.cursor);
        current.last_update = Some(now_ts());
        current.remote_unread_count = delta.unread_count;
        folders::save_folder(&mut tx, &current).await?;
        let purged = messages::purge_orphans(&mut tx).await?;
        tx.commit().await?;

        info!(
            folder = %folder.id,
            queued,
            purged,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Folder delta applied"
        );
        Ok(())
    }

    async fn apply_deletions(&self, folder: &Folder, short_uids: &[ShortUid]) -> Result<()> {
        let long_uids: Vec<String> = short_uids.iter().map(|u| folder.long_uid(*u)).collect();
        let mut tx = self.db.write().await?;
        folders::queue_remove(&mut tx, &folder.id, None, short_uids).await?;

        let affected = if folder.is_view() {
            unlink_from_view(&mut tx, folder, &long_uids).await?
        } else {
            detach_orphan_drafts(&mut tx, &long_uids).await?;
            let affected = threads::threads_containing(tx.conn(), &long_uids).await?;
            messages::delete_messages(&mut tx, &long_uids).await?;
            affected
        };

        let affected: Vec<String> = affected.into_iter().collect();
        let mut cache = FolderCache::with(folder);
        let (_, mut impacted) = threading::recompute_threads(&mut tx, &mut cache, &affected).await?;
        impacted.insert(folder.id.clone());
        unread::recompute_folders(&mut tx, &impacted).await?;
        tx.commit().await?;

        debug!(folder = %folder.id, deleted = long_uids.len(), threads = affected.len(), "Deletion batch applied");
        Ok(())
    }
}

// A view folder does not own its messages; they only leave its threads.
async fn unlink_from_view(tx: &mut WriteTx<'_>, folder: &Folder, long_uids: &[String]) -> Result<BTreeSet<String>> {
    let affected = threads::folder_threads_containing(tx.conn(), &folder.id, long_uids).await?;
    for thread_uid in &affected {
        threads::unlink_messages(tx, thread_uid, long_uids).await?;
    }
    Ok(affected)
}
