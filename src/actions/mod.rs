//! Optimistic mutations: applied to the local store first, then sent to the
//! server in chunks; chunks the server rejects are rolled back locally.

mod drafts;
mod snooze;

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::{info, warn};

use crate::errors::{ApiError, SyncError};
use crate::remote::ActionResponse;
use crate::storage::{folders, messages, threads, WriteTx};
use crate::sync::{unread, MailboxManager};
use crate::threading::{self, FolderCache};
use crate::types::{Folder, FolderRole, Message, SnoozeFlags, SnoozeState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailAction {
    Move { destination_id: String },
    Delete,
    ReportSpam,
    Star,
    Unstar,
    MarkSeen,
    MarkUnseen,
    Snooze { end_date: i64 },
    UpdateSnooze { end_date: i64 },
    Unsnooze,
}

impl MailAction {
    pub fn name(&self) -> &'static str {
        match self {
            MailAction::Move { .. } => "move",
            MailAction::Delete => "delete",
            MailAction::ReportSpam => "report_spam",
            MailAction::Star => "star",
            MailAction::Unstar => "unstar",
            MailAction::MarkSeen => "mark_seen",
            MailAction::MarkUnseen => "mark_unseen",
            MailAction::Snooze { .. } => "snooze",
            MailAction::UpdateSnooze { .. } => "update_snooze",
            MailAction::Unsnooze => "unsnooze",
        }
    }

    /// Writes the action's local effect onto a message.
    fn apply_locally(&self, message: &mut Message) {
        match self {
            MailAction::Star => message.flags.flagged = true,
            MailAction::Unstar => message.flags.flagged = false,
            MailAction::MarkSeen => message.flags.seen = true,
            MailAction::MarkUnseen => message.flags.seen = false,
            MailAction::Snooze { end_date } => {
                message.snooze = SnoozeFlags {
                    state: Some(SnoozeState::Snoozed),
                    end_date: Some(*end_date),
                    uuid: message.snooze.uuid.clone(),
                }
            }
            MailAction::UpdateSnooze { end_date } => message.snooze.end_date = Some(*end_date),
            MailAction::Unsnooze => message.snooze = SnoozeFlags::default(),
            MailAction::Move { .. } | MailAction::Delete | MailAction::ReportSpam => {}
        }
    }
}

/// Handle returned by `perform_action`; feed it to `undo`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UndoAction {
    pub undo_resources: Vec<String>,
    pub affected_folders: Vec<String>,
    /// Chunks the server rejected and that were rolled back locally.
    pub failed_chunks: usize,
}

impl UndoAction {
    pub fn is_undoable(&self) -> bool {
        !self.undo_resources.is_empty()
    }
}

#[derive(Clone, Debug)]
enum RemoteOp {
    Move(String),
    DeletePermanently,
    Spam,
    Flags,
}

struct Chunk {
    messages: Vec<Message>,
    hidden_threads: Vec<String>,
}

impl MailboxManager {
    /// Applies `action` to `messages` optimistically, then remotely.
    pub async fn perform_action(
        &self,
        messages: &[Message],
        action: MailAction,
        origin_folder_id: &str,
    ) -> Result<UndoAction> {
        if messages.is_empty() {
            return Ok(UndoAction::default());
        }
        let start = Instant::now();
        let Some(origin) = self.load_folder(origin_folder_id).await? else {
            warn!(folder = %origin_folder_id, action = action.name(), "Action on unknown folder");
            return Ok(UndoAction::default());
        };

        let (op, destination) = self.resolve(&action, &origin).await?;
        let mut affected = vec![origin.id.clone()];
        affected.extend(destination.clone());

        // Phase 1: local.
        let mut tx = self.db.write().await?;
        let targets = match op {
            RemoteOp::Flags => with_duplicates(&mut tx, messages).await?,
            _ => messages.to_vec(),
        };
        let mut chunks = Vec::new();
        for batch in targets.chunks(self.settings.api_batch_size) {
            chunks.push(Chunk {
                messages: batch.to_vec(),
                hidden_threads: Vec::new(),
            });
        }
        let mut snapshot: HashMap<String, Message> = HashMap::new();

        match op {
            RemoteOp::Flags => {
                let mut changed = Vec::with_capacity(targets.len());
                for target in &targets {
                    let Some(mut current) = messages::load_message(tx.conn(), &target.uid).await? else {
                        continue;
                    };
                    snapshot.insert(current.uid.clone(), current.clone());
                    action.apply_locally(&mut current);
                    messages::upsert_message(&mut tx, &current).await?;
                    changed.push(current.uid);
                }
                let mut cache = FolderCache::with(&origin);
                let (_, impacted) = threading::recompute_threads_for_messages(&mut tx, &mut cache, &changed).await?;
                unread::recompute_folders(&mut tx, &impacted).await?;
            }
            _ => {
                let hosts = hosting_folders(&mut tx, &origin).await?;
                let mut impacted = BTreeSet::new();
                for chunk in &mut chunks {
                    let uids: Vec<String> = chunk.messages.iter().map(|m| m.uid.clone()).collect();
                    for host in &hosts {
                        chunk
                            .hidden_threads
                            .extend(threads::folder_threads_containing(tx.conn(), host, &uids).await?);
                    }
                    threads::set_moved_out_locally(&mut tx, &chunk.hidden_threads, true).await?;
                }
                impacted.extend(hosts);
                unread::recompute_folders(&mut tx, &impacted).await?;
            }
        }
        tx.commit().await?;

        // Phase 2: remote, chunk by chunk.
        let mut undo_resources = Vec::new();
        let mut rejected = Vec::new();
        let mut applied: BTreeSet<String> = BTreeSet::new();
        let mut last_error: Option<ApiError> = None;
        for chunk in &chunks {
            match self.send_chunk(&action, &op, &chunk.messages).await {
                Ok(response) => {
                    undo_resources.extend(response.undo_resource);
                    applied.extend(chunk.messages.iter().map(|m| m.uid.clone()));
                }
                Err(e) if action == MailAction::Unsnooze && e.is_already_in_target_state() => {
                    applied.extend(chunk.messages.iter().map(|m| m.uid.clone()));
                }
                Err(e) => {
                    warn!(
                        folder = %origin.id,
                        action = action.name(),
                        messages = chunk.messages.len(),
                        error = %e,
                        "Remote action failed, rolling back chunk"
                    );
                    last_error = Some(e);
                    rejected.push(chunk);
                }
            }
        }
        // Rolled back once every chunk is settled: a thread stays hidden while
        // any of its messages left through an accepted chunk.
        for chunk in &rejected {
            self.rollback_chunk(&origin, &op, chunk, &snapshot, &applied).await?;
        }
        let failed = rejected.len();

        self.schedule_refresh(affected.clone()).await;

        info!(
            folder = %origin.id,
            action = action.name(),
            messages = targets.len(),
            chunks = chunks.len(),
            failed,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Action performed"
        );

        if failed == chunks.len() {
            if let Some(e) = last_error {
                return Err(anyhow::Error::new(e).context(format!("{} failed for every chunk", action.name())));
            }
        }

        Ok(UndoAction {
            undo_resources,
            affected_folders: affected,
            failed_chunks: failed,
        })
    }

    /// Reverts a previous action through its undo tokens and refreshes the
    /// folders it touched. True when no token was refused.
    pub async fn undo(&self, action: &UndoAction) -> Result<bool> {
        if !action.is_undoable() {
            return Ok(false);
        }
        let mut success = true;
        for token in &action.undo_resources {
            match self.api.undo(token).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(token = %token, "Server refused undo");
                    success = false;
                }
                Err(e) => {
                    warn!(token = %token, error = %e, "Undo failed");
                    success = false;
                }
            }
        }
        for folder_id in &action.affected_folders {
            self.refresh_folder_content(folder_id).await;
        }
        Ok(success)
    }

    async fn resolve(&self, action: &MailAction, origin: &Folder) -> Result<(RemoteOp, Option<String>)> {
        let mut conn = self.db.read().await?;
        Ok(match action {
            MailAction::Move { destination_id } => (RemoteOp::Move(destination_id.clone()), Some(destination_id.clone())),
            MailAction::Delete if origin.role.deletes_permanently() => (RemoteOp::DeletePermanently, None),
            MailAction::Delete => {
                let trash = folders::load_folder_by_role(&mut conn, FolderRole::Trash)
                    .await?
                    .ok_or_else(|| SyncError::FolderNotFound(FolderRole::Trash.to_string()))?;
                (RemoteOp::Move(trash.id.clone()), Some(trash.id))
            }
            MailAction::ReportSpam => {
                let spam = folders::load_folder_by_role(&mut conn, FolderRole::Spam).await?;
                (RemoteOp::Spam, spam.map(|f| f.id))
            }
            _ => (RemoteOp::Flags, None),
        })
    }

    async fn send_chunk(&self, action: &MailAction, op: &RemoteOp, chunk: &[Message]) -> Result<ActionResponse, ApiError> {
        let uids: Vec<String> = chunk.iter().map(|m| m.uid.clone()).collect();
        let snooze_uuids: Vec<String> = chunk.iter().filter_map(|m| m.snooze.uuid.clone()).collect();
        match (op, action) {
            (RemoteOp::Move(destination), _) => self.api.move_messages(&uids, destination).await,
            (RemoteOp::DeletePermanently, _) => self.api.delete_messages(&uids).await,
            (RemoteOp::Spam, _) => self.api.report_spam(&uids).await,
            (RemoteOp::Flags, MailAction::Star) => self.api.star(&uids, true).await,
            (RemoteOp::Flags, MailAction::Unstar) => self.api.star(&uids, false).await,
            (RemoteOp::Flags, MailAction::MarkSeen) => self.api.mark_seen(&uids, true).await,
            (RemoteOp::Flags, MailAction::MarkUnseen) => self.api.mark_seen(&uids, false).await,
            (RemoteOp::Flags, MailAction::Snooze { end_date }) => self.api.snooze(&uids, *end_date).await,
            (RemoteOp::Flags, MailAction::UpdateSnooze { end_date }) if !snooze_uuids.is_empty() => {
                self.api.update_snooze(&snooze_uuids, *end_date).await
            }
            (RemoteOp::Flags, MailAction::Unsnooze) if !snooze_uuids.is_empty() => {
                self.api.delete_snooze(&snooze_uuids).await
            }
            // Nothing the server knows how to address.
            _ => Ok(ActionResponse::default()),
        }
    }

    async fn rollback_chunk(
        &self,
        origin: &Folder,
        op: &RemoteOp,
        chunk: &Chunk,
        snapshot: &HashMap<String, Message>,
        applied: &BTreeSet<String>,
    ) -> Result<()> {
        let mut tx = self.db.write().await?;
        let mut impacted = BTreeSet::new();
        match op {
            RemoteOp::Flags => {
                let mut restored = Vec::with_capacity(chunk.messages.len());
                for target in &chunk.messages {
                    let (Some(mut current), Some(before)) =
                        (messages::load_message(tx.conn(), &target.uid).await?, snapshot.get(&target.uid))
                    else {
                        continue;
                    };
                    current.flags = before.flags;
                    current.snooze = before.snooze.clone();
                    messages::upsert_message(&mut tx, &current).await?;
                    restored.push(current.uid);
                }
                let mut cache = FolderCache::with(origin);
                let (_, folders) = threading::recompute_threads_for_messages(&mut tx, &mut cache, &restored).await?;
                impacted.extend(folders);
            }
            _ => {
                let mut shown = Vec::with_capacity(chunk.hidden_threads.len());
                for thread_uid in &chunk.hidden_threads {
                    let members = threads::member_uids(tx.conn(), thread_uid).await?;
                    if members.is_disjoint(applied) {
                        shown.push(thread_uid.clone());
                    }
                }
                threads::set_moved_out_locally(&mut tx, &shown, false).await?;
                impacted.extend(threads::folders_of(tx.conn(), &shown).await?);
            }
        }
        impacted.insert(origin.id.clone());
        unread::recompute_folders(&mut tx, &impacted).await?;
        tx.commit().await.context("committing rollback")?;
        Ok(())
    }
}

/// Folders whose threads disappear when messages leave `origin`.
async fn hosting_folders(tx: &mut WriteTx<'_>, origin: &Folder) -> Result<Vec<String>> {
    let mut hosts = vec![origin.id.clone()];
    if let Some(role) = origin.role.associated_role() {
        if let Some(associated) = folders::load_folder_by_role(tx.conn(), role).await? {
            hosts.push(associated.id);
        }
    }
    Ok(hosts)
}

/// The messages plus every other stored copy with the same Message-ID.
async fn with_duplicates(tx: &mut WriteTx<'_>, selected: &[Message]) -> Result<Vec<Message>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(selected.len());
    for message in selected {
        if seen.insert(message.uid.clone()) {
            out.push(message.clone());
        }
        for duplicate in messages::load_duplicates(tx.conn(), message).await? {
            if seen.insert(duplicate.uid.clone()) {
                out.push(duplicate);
            }
        }
    }
    Ok(out)
}
