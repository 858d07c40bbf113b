//! Delta sync engine: keeps each folder of the local store in step with the
//! server through cursor deltas, falling back to a full resync when the
//! cursor is rejected.

mod delta;
mod paging;
mod search;
pub mod unread;

pub use delta::DeltaFlags;

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::errors::{ApiError, SyncError};
use crate::remote::{FolderDescriptor, MailApi};
use crate::storage::{drafts, folders, messages, threads, Database, WriteTx};
use crate::threading::{self, FolderCache};
use crate::types::{now_ts, Direction, Folder, FolderRole, SnoozeFlags, MessageFlags};

/// Owns the sync state of one mailbox. Cheap to clone; clones share locks,
/// cancellation and background tasks.
#[derive(Clone)]
pub struct MailboxManager {
    pub(crate) db: Arc<Database>,
    pub(crate) api: Arc<dyn MailApi>,
    pub(crate) settings: Arc<SyncSettings>,
    folder_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    cancel: CancellationToken,
    background: Arc<Mutex<JoinSet<()>>>,
}

impl MailboxManager {
    pub fn new(db: Arc<Database>, api: Arc<dyn MailApi>, settings: SyncSettings) -> Self {
        Self {
            db,
            api,
            settings: Arc::new(settings),
            folder_locks: Arc::new(StdMutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            background: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Stops running and future sync loops of this manager at their next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        Ok(())
    }

    fn folder_lock(&self, folder_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .folder_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(folder_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn load_folder(&self, folder_id: &str) -> Result<Option<Folder>> {
        let mut conn = self.db.read().await?;
        folders::load_folder(&mut conn, folder_id).await
    }

    /// Full sync of one folder: delta (or bootstrap), then the new queue
    /// entirely, then history while the backfill budget lasts.
    pub async fn sync_folder(&self, folder_id: &str) -> Result<()> {
        let lock = self.folder_lock(folder_id);
        let _guard = lock.lock().await;
        self.check_cancelled()?;

        let start = Instant::now();
        let Some(folder) = self.load_folder(folder_id).await? else {
            warn!(folder = %folder_id, "Sync requested for unknown folder");
            return Ok(());
        };

        match folder.cursor.clone() {
            None => self.bootstrap(&folder).await?,
            Some(cursor) => {
                if folder.role == FolderRole::Snoozed {
                    self.delta_pass::<SnoozeFlags>(&folder, &cursor).await?;
                } else {
                    self.delta_pass::<MessageFlags>(&folder, &cursor).await?;
                }
            }
        }

        let new_pages = self.drain_new_pages(folder_id).await?;
        let old_pages = self.drain_old_pages(folder_id).await?;

        info!(
            folder = %folder_id,
            new_pages,
            old_pages,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Folder sync completed"
        );
        Ok(())
    }

    async fn delta_pass<F: DeltaFlags>(&self, folder: &Folder, cursor: &str) -> Result<()> {
        match F::fetch(self.api.as_ref(), &folder.id, cursor).await {
            Ok(delta) => self.apply_delta(folder, delta).await,
            Err(ApiError::CursorInvalid) => {
                warn!(folder = %folder.id, "Cursor rejected by server, resyncing folder");
                self.reset_folder_unlocked(&folder.id).await?;
                let Some(fresh) = self.load_folder(&folder.id).await? else {
                    return Ok(());
                };
                self.bootstrap(&fresh).await
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("fetching delta for folder {}", folder.id))),
        }
    }

    /// Best-effort sync; failures are logged and swallowed.
    pub async fn refresh_folder_content(&self, folder_id: &str) {
        if let Err(e) = self.sync_folder(folder_id).await {
            warn!(folder = %folder_id, error = %e, "Folder refresh failed");
        }
    }

    /// Queues a background refresh of the given folders.
    pub async fn schedule_refresh(&self, folder_ids: Vec<String>) {
        if folder_ids.is_empty() {
            return;
        }
        let manager = self.clone();
        let mut tasks = self.background.lock().await;
        tasks.spawn(async move {
            for id in folder_ids {
                manager.refresh_folder_content(&id).await;
            }
        });
    }

    /// Waits for every background refresh scheduled so far.
    pub async fn wait_for_background_tasks(&self) {
        loop {
            let mut next = {
                let mut tasks = self.background.lock().await;
                if tasks.is_empty() {
                    return;
                }
                // Detach so new tasks can be scheduled while we wait.
                std::mem::take(&mut *tasks)
            };
            while let Some(result) = next.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background refresh task panicked");
                }
            }
        }
    }

    /// Drops the folder's local content and queues; the next sync bootstraps.
    pub async fn reset_folder(&self, folder_id: &str) -> Result<()> {
        let lock = self.folder_lock(folder_id);
        let _guard = lock.lock().await;
        self.reset_folder_unlocked(folder_id).await
    }

    async fn reset_folder_unlocked(&self, folder_id: &str) -> Result<()> {
        let mut tx = self.db.write().await?;
        let Some(mut folder) = folders::load_folder(tx.conn(), folder_id).await? else {
            warn!(folder = %folder_id, "Reset requested for unknown folder");
            return Ok(());
        };

        let mut impacted = BTreeSet::new();
        // Views over this folder lose their messages too and must bootstrap again.
        let views: Vec<Folder> = folders::load_folders(tx.conn())
            .await?
            .into_iter()
            .filter(|f| f.is_view() && f.source_folder_id == folder.id)
            .collect();
        for mut view in views {
            impacted.extend(purge_folder_content(&mut tx, &view).await?);
            clear_sync_state(&mut view);
            folders::save_folder(&mut tx, &view).await?;
            info!(folder = %view.id, source = %folder.id, "View folder reset with its source");
            impacted.insert(view.id);
        }

        impacted.extend(purge_folder_content(&mut tx, &folder).await?);
        clear_sync_state(&mut folder);
        folders::save_folder(&mut tx, &folder).await?;

        impacted.insert(folder.id.clone());
        unread::recompute_folders(&mut tx, &impacted).await?;
        tx.commit().await?;
        info!(folder = %folder_id, "Folder reset");
        Ok(())
    }

    /// Lists the folder's UIDs and queues them for backfill, without
    /// fetching any page.
    pub async fn bootstrap_folder(&self, folder_id: &str) -> Result<()> {
        let lock = self.folder_lock(folder_id);
        let _guard = lock.lock().await;
        let Some(folder) = self.load_folder(folder_id).await? else {
            warn!(folder = %folder_id, "Bootstrap requested for unknown folder");
            return Ok(());
        };
        self.bootstrap(&folder).await
    }

    async fn bootstrap(&self, folder: &Folder) -> Result<()> {
        let list = self
            .api
            .list_all_short_uids(&folder.id)
            .await
            .with_context(|| format!("listing uids of folder {}", folder.id))?;

        let mut tx = self.db.write().await?;
        let Some(mut folder) = folders::load_folder(tx.conn(), &folder.id).await? else {
            return Ok(());
        };

        let long_uids: Vec<String> = list.short_uids.iter().map(|u| folder.long_uid(*u)).collect();
        let known = threads::linked_in_folder(tx.conn(), &folder.id, &long_uids).await?;
        let pending: Vec<_> = list
            .short_uids
            .iter()
            .zip(&long_uids)
            .filter(|(_, long)| !known.contains(*long))
            .map(|(short, _)| *short)
            .collect();

        folders::queue_replace(&mut tx, &folder.id, Direction::Old, &pending).await?;
        folder.remaining_old_messages_to_fetch = (pending.len() as i64).min(self.settings.old_messages_budget);
        folder.cursor = Some(list.cursor);
        folder.last_update = Some(now_ts());
        folders::save_folder(&mut tx, &folder).await?;
        tx.commit().await?;

        info!(
            folder = %folder.id,
            listed = list.short_uids.len(),
            queued = pending.len(),
            remaining = folder.remaining_old_messages_to_fetch,
            "Folder bootstrapped"
        );
        Ok(())
    }

    /// Rebuilds every thread aggregate and unread counter from stored
    /// messages. Returns the number of threads that survived.
    pub async fn recompute_all(&self) -> Result<usize> {
        let mut tx = self.db.write().await?;
        let all = folders::load_folders(tx.conn()).await?;
        let mut cache = FolderCache::default();
        let mut alive = 0;
        let mut ids = BTreeSet::new();
        for folder in &all {
            let uids: Vec<String> = threads::threads_in_folder(tx.conn(), &folder.id)
                .await?
                .into_iter()
                .map(|t| t.uid)
                .collect();
            let (kept, _) = threading::recompute_threads(&mut tx, &mut cache, &uids).await?;
            alive += kept.len();
            ids.insert(folder.id.clone());
        }
        unread::recompute_folders(&mut tx, &ids).await?;
        tx.commit().await?;
        info!(folders = ids.len(), threads = alive, "Store recomputed");
        Ok(alive)
    }

    /// Mirrors the remote folder tree. Local folders that disappeared
    /// remotely are dropped together with their content.
    pub async fn refresh_folders(&self) -> Result<Vec<Folder>> {
        let remote = self.api.list_folders().await.context("listing folders")?;
        let mut flat = Vec::new();
        flatten_tree(&remote, None, &mut flat);

        let inbox_id = flat
            .iter()
            .find(|(d, _)| d.role == Some(FolderRole::Inbox))
            .map(|(d, _)| d.id.clone());

        let mut tx = self.db.write().await?;
        let existing: HashMap<String, Folder> = folders::load_folders(tx.conn())
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut seen = BTreeSet::new();
        for (descriptor, parent_id) in &flat {
            let role = descriptor.role.unwrap_or(FolderRole::Unknown);
            let mut folder = existing
                .get(&descriptor.id)
                .cloned()
                .unwrap_or_else(|| Folder::new(descriptor.id.clone(), descriptor.name.clone(), role));
            folder.name = descriptor.name.clone();
            folder.path = descriptor.path.clone();
            folder.role = role;
            folder.parent_id = parent_id.clone();
            folder.threading = self.settings.policy_for(role);
            folder.remote_unread_count = descriptor.unread_count;
            folder.source_folder_id = match (role, &inbox_id) {
                (FolderRole::Snoozed, Some(inbox)) => inbox.clone(),
                _ => folder.id.clone(),
            };
            folders::save_folder(&mut tx, &folder).await?;
            seen.insert(folder.id.clone());
        }

        let mut removed = 0usize;
        let mut impacted = BTreeSet::new();
        for folder in existing.values() {
            if seen.contains(&folder.id) || folder.role == FolderRole::Search {
                continue;
            }
            impacted.extend(purge_folder_content(&mut tx, folder).await?);
            folders::delete_folder(&mut tx, &folder.id).await?;
            impacted.remove(&folder.id);
            removed += 1;
        }
        unread::recompute_folders(&mut tx, &impacted).await?;
        let list = folders::load_folders(tx.conn()).await?;
        tx.commit().await?;

        info!(folders = list.len(), removed, "Folder list refreshed");
        Ok(list)
    }
}

fn flatten_tree<'a>(
    nodes: &'a [FolderDescriptor],
    parent_id: Option<&str>,
    out: &mut Vec<(&'a FolderDescriptor, Option<String>)>,
) {
    for node in nodes {
        out.push((node, parent_id.map(str::to_string)));
        flatten_tree(&node.children, Some(&node.id), out);
    }
}

fn clear_sync_state(folder: &mut Folder) {
    folder.cursor = None;
    folder.last_update = None;
    folder.unread_count = 0;
    folder.remaining_old_messages_to_fetch = 0;
}

/// Deletes a folder's threads and queues, plus the messages it owns.
/// Returns the other folders whose threads lost members.
pub(crate) async fn purge_folder_content(tx: &mut WriteTx<'_>, folder: &Folder) -> Result<BTreeSet<String>> {
    folders::queue_clear(tx, &folder.id).await?;
    let dropped = threads::delete_threads_in_folder(tx, &folder.id).await?;

    let mut impacted = BTreeSet::new();
    if !folder.is_view() && folder.role != FolderRole::Search {
        let owned = messages::message_uids_in_folder(tx.conn(), &folder.id).await?;
        detach_orphan_drafts(tx, &owned).await?;
        let affected: Vec<String> = threads::threads_containing(tx.conn(), &owned).await?.into_iter().collect();
        messages::delete_messages(tx, &owned).await?;
        let mut cache = FolderCache::with(folder);
        let (_, folders) = threading::recompute_threads(tx, &mut cache, &affected).await?;
        impacted.extend(folders);
    }
    let purged = messages::purge_orphans(tx).await?;
    debug!(folder = %folder.id, threads = dropped, orphans = purged, "Folder content purged");
    Ok(impacted)
}

/// Drafts whose message is going away: pending ones lose their remote
/// identity, the rest are deleted.
pub(crate) async fn detach_orphan_drafts(tx: &mut WriteTx<'_>, message_uids: &[String]) -> Result<()> {
    for mut draft in drafts::drafts_for_messages(tx.conn(), message_uids).await? {
        if draft.action.is_some() {
            draft.remote_uuid.clear();
            draft.message_uid = None;
            drafts::save_draft(tx, &draft).await?;
        } else {
            drafts::delete_draft(tx, &draft.local_uuid).await?;
        }
    }
    Ok(())
}
