//! Conversation reconstruction: turns freshly fetched messages into per-folder
//! threads, merges threads that forked for the same conversation and keeps the
//! derived thread fields in step with their members.

mod recompute;

pub use recompute::{recompute_thread, recompute_threads, recompute_threads_for_messages};

use anyhow::Result;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use crate::storage::{folders, messages, threads, WriteTx};
use crate::types::{Folder, FolderRole, Message, Thread, ThreadMode, ThreadingPolicy};

/// Snoozed message that must be unsnoozed because its thread got new mail.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnsnoozeCandidate {
    pub message_uid: String,
    pub snooze_uuid: Option<String>,
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub new_threads: usize,
    /// Threads that still exist after the batch.
    pub touched_threads: BTreeSet<String>,
    pub impacted_folders: BTreeSet<String>,
    pub unsnooze: Vec<UnsnoozeCandidate>,
}

/// Folder lookups memoized for the duration of one transaction.
#[derive(Default)]
pub struct FolderCache {
    folders: HashMap<String, Option<Folder>>,
}

impl FolderCache {
    pub fn with(folder: &Folder) -> Self {
        let mut cache = Self::default();
        cache.folders.insert(folder.id.clone(), Some(folder.clone()));
        cache
    }

    pub async fn get(&mut self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Folder>> {
        if let Some(found) = self.folders.get(id) {
            return Ok(found.clone());
        }
        let loaded = folders::load_folder(conn, id).await?;
        self.folders.insert(id.to_string(), loaded.clone());
        Ok(loaded)
    }

    async fn role_of(&mut self, conn: &mut SqliteConnection, id: &str) -> Result<FolderRole> {
        Ok(self
            .get(conn, id)
            .await?
            .map(|f| f.role)
            .unwrap_or(FolderRole::Unknown))
    }
}

/// Stores a page of messages for `folder` and threads them.
pub async fn ingest_messages(
    tx: &mut WriteTx<'_>,
    folder: &Folder,
    incoming: Vec<Message>,
    mode: ThreadMode,
) -> Result<IngestOutcome> {
    let mut cache = FolderCache::with(folder);
    let mut outcome = IngestOutcome::default();
    let mut stored = Vec::with_capacity(incoming.len());
    let mut fresh: BTreeSet<String> = BTreeSet::new();

    for message in incoming {
        let merged = match messages::load_message(tx.conn(), &message.uid).await? {
            Some(existing) => merge_into_existing(existing, message),
            None => {
                fresh.insert(message.uid.clone());
                message
            }
        };
        messages::upsert_message(tx, &merged).await?;
        stored.push(merged);
    }

    let mut touched: BTreeSet<String> = BTreeSet::new();
    match mode {
        ThreadMode::Flat => {
            for message in &stored {
                if let Some(uid) = ensure_single_thread(tx, folder, message).await? {
                    touched.insert(uid);
                    outcome.new_threads += 1;
                }
            }
        }
        ThreadMode::Conversation => {
            for message in &stored {
                let (created, converged) = thread_conversation(tx, &mut cache, folder, message).await?;
                if created.is_some() {
                    outcome.new_threads += 1;
                }
                touched.extend(created);
                touched.extend(converged);
            }
            let merged_away = deduplicate(tx, &mut cache, &touched).await?;
            for uid in merged_away {
                touched.remove(&uid);
            }
        }
    }

    let stored_uids: Vec<String> = stored.iter().map(|m| m.uid.clone()).collect();
    touched.extend(threads::threads_containing(tx.conn(), &stored_uids).await?);
    let touched: Vec<String> = touched.into_iter().collect();
    let (alive, impacted) = recompute_threads(tx, &mut cache, &touched).await?;

    if mode == ThreadMode::Conversation && folder.role != FolderRole::Snoozed {
        outcome.unsnooze = unsnooze_candidates(tx, folder, &stored, &fresh).await?;
    }

    debug!(
        folder = %folder.id,
        messages = stored.len(),
        new_threads = outcome.new_threads,
        threads = alive.len(),
        "Thread reconstruction pass completed"
    );

    outcome.touched_threads = alive;
    outcome.impacted_folders = impacted;
    outcome.impacted_folders.insert(folder.id.clone());
    Ok(outcome)
}

fn merge_into_existing(existing: Message, mut incoming: Message) -> Message {
    if incoming.body.is_none() {
        incoming.body = existing.body;
        incoming.fully_downloaded = existing.fully_downloaded;
    }
    incoming.created_at = existing.created_at;
    incoming
}

/// One thread per message; returns the new thread uid when one was created.
async fn ensure_single_thread(
    tx: &mut WriteTx<'_>,
    folder: &Folder,
    message: &Message,
) -> Result<Option<String>> {
    let already = threads::folder_threads_containing(tx.conn(), &folder.id, &[message.uid.clone()]).await?;
    if !already.is_empty() {
        return Ok(None);
    }
    let thread = Thread::empty(Uuid::new_v4().to_string(), folder.id.clone());
    threads::save_thread(tx, &thread).await?;
    threads::link_message(tx, &thread.uid, &message.uid, false).await?;
    threads::add_refs(tx, &thread.uid, &message.linked_uids).await?;
    Ok(Some(thread.uid))
}

/// Conversation threading of one message. Returns the created thread (if any)
/// and every pre-existing thread the conversation converged on.
async fn thread_conversation(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    folder: &Folder,
    message: &Message,
) -> Result<(Option<String>, Vec<String>)> {
    let refs: Vec<String> = message.linked_uids.iter().cloned().collect();
    let mut existing: Vec<(String, Folder)> = Vec::new();
    for (thread_uid, folder_id) in threads::threads_by_refs(tx.conn(), &refs).await? {
        let Some(owner) = cache.get(tx.conn(), &folder_id).await? else {
            continue;
        };
        if owner.threading == ThreadingPolicy::SingleMessage || owner.role == FolderRole::Search {
            continue;
        }
        existing.push((thread_uid, owner));
    }

    let mut created = None;
    if folder.threading == ThreadingPolicy::SingleMessage {
        created = ensure_single_thread(tx, folder, message).await?;
    } else if !existing.iter().any(|(_, owner)| owner.id == folder.id) {
        let thread = Thread::empty(Uuid::new_v4().to_string(), folder.id.clone());
        threads::save_thread(tx, &thread).await?;
        add_with_conditions(tx, cache, &thread.uid, folder, message).await?;
        // Carry over the rest of the conversation from other folders.
        for (other_uid, _) in &existing {
            for member in threads::members(tx.conn(), other_uid).await? {
                add_with_conditions(tx, cache, &thread.uid, folder, &member.message).await?;
            }
        }
        created = Some(thread.uid);
    }

    if existing.is_empty() {
        return Ok((created, Vec::new()));
    }

    let mut conversation: BTreeMap<String, Message> = BTreeMap::new();
    conversation.insert(message.uid.clone(), message.clone());
    for (thread_uid, _) in &existing {
        for member in threads::members(tx.conn(), thread_uid).await? {
            conversation.entry(member.message.uid.clone()).or_insert(member.message);
        }
    }

    let mut converged = Vec::with_capacity(existing.len());
    for (thread_uid, owner) in &existing {
        let present = threads::member_uids(tx.conn(), thread_uid).await?;
        for (uid, candidate) in &conversation {
            if !present.contains(uid) {
                add_with_conditions(tx, cache, thread_uid, owner, candidate).await?;
            }
        }
        converged.push(thread_uid.clone());
    }
    Ok((created, converged))
}

/// Links `message` into a thread unless the trash boundary forbids it. A
/// second copy of an already-present Message-ID is linked as a duplicate.
async fn add_with_conditions(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    thread_uid: &str,
    thread_folder: &Folder,
    message: &Message,
) -> Result<bool> {
    let message_in_trash = cache.role_of(tx.conn(), &message.folder_id).await? == FolderRole::Trash;
    let thread_in_trash = thread_folder.role == FolderRole::Trash;
    if message_in_trash != thread_in_trash {
        return Ok(false);
    }

    let mut is_duplicate = false;
    if let Some(message_id) = message.message_id.as_deref() {
        let members = threads::members(tx.conn(), thread_uid).await?;
        let twin = members.iter().find(|m| {
            !m.is_duplicate && m.message.uid != message.uid && m.message.message_id.as_deref() == Some(message_id)
        });
        if let Some(twin) = twin {
            if thread_folder.holds(message) && !thread_folder.holds(&twin.message) {
                threads::link_message(tx, thread_uid, &twin.message.uid, true).await?;
            } else {
                is_duplicate = true;
            }
        }
    }

    threads::link_message(tx, thread_uid, &message.uid, is_duplicate).await?;
    threads::add_refs(tx, thread_uid, &message.linked_uids).await?;
    Ok(true)
}

/// Collapses threads of the same folder connected through shared reference
/// ids into a single survivor. Returns the uids of the deleted threads.
pub async fn deduplicate(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    touched: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let touched_vec: Vec<String> = touched.iter().cloned().collect();
    let mut by_folder: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for thread in threads::load_threads(tx.conn(), &touched_vec).await? {
        by_folder.entry(thread.folder_id.clone()).or_default().push(thread.uid);
    }

    let mut removed = BTreeSet::new();
    for (folder_id, seeds) in by_folder {
        let Some(folder) = cache.get(tx.conn(), &folder_id).await? else {
            continue;
        };
        if folder.threading == ThreadingPolicy::SingleMessage || folder.role == FolderRole::Search {
            continue;
        }

        let mut visited: BTreeSet<String> = BTreeSet::new();
        for seed in seeds {
            if visited.contains(&seed) || removed.contains(&seed) {
                continue;
            }
            let component = connected_threads(tx.conn(), &folder_id, &seed).await?;
            visited.extend(component.iter().cloned());
            if component.len() < 2 {
                continue;
            }
            removed.extend(merge_component(tx, cache, &folder, component).await?);
        }
    }
    Ok(removed)
}

/// Threads of `folder_id` reachable from `seed` through shared reference ids.
async fn connected_threads(
    conn: &mut SqliteConnection,
    folder_id: &str,
    seed: &str,
) -> Result<BTreeSet<String>> {
    let mut component = BTreeSet::new();
    let mut queue = VecDeque::from([seed.to_string()]);
    component.insert(seed.to_string());

    while let Some(current) = queue.pop_front() {
        let refs = threads::thread_refs(conn, &current).await?;
        for (neighbour, neighbour_folder) in threads::threads_by_refs(conn, &refs).await? {
            if neighbour_folder == folder_id && component.insert(neighbour.clone()) {
                queue.push_back(neighbour);
            }
        }
    }
    Ok(component)
}

async fn merge_component(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    folder: &Folder,
    component: BTreeSet<String>,
) -> Result<Vec<String>> {
    let uids: Vec<String> = component.into_iter().collect();
    let mut ranked = Vec::with_capacity(uids.len());
    for thread in threads::load_threads(tx.conn(), &uids).await? {
        let count = threads::member_uids(tx.conn(), &thread.uid).await?.len();
        ranked.push((count, thread));
    }
    // Most members first, then the oldest thread, then uid for determinism.
    ranked.sort_by(|(ca, a), (cb, b)| {
        cb.cmp(ca)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.uid.cmp(&b.uid))
    });

    let mut ranked = ranked.into_iter();
    let Some((_, survivor)) = ranked.next() else {
        return Ok(Vec::new());
    };

    let mut removed = Vec::new();
    for (_, duplicate) in ranked {
        let present = threads::member_uids(tx.conn(), &survivor.uid).await?;
        for member in threads::members(tx.conn(), &duplicate.uid).await? {
            if !present.contains(&member.message.uid) {
                add_with_conditions(tx, cache, &survivor.uid, folder, &member.message).await?;
            }
        }
        threads::delete_thread(tx, &duplicate).await?;
        removed.push(duplicate.uid.clone());
    }

    info!(
        folder = %folder.id,
        survivor = %survivor.uid,
        merged = removed.len(),
        "Merged duplicate threads"
    );
    Ok(removed)
}

async fn unsnooze_candidates(
    tx: &mut WriteTx<'_>,
    folder: &Folder,
    stored: &[Message],
    fresh: &BTreeSet<String>,
) -> Result<Vec<UnsnoozeCandidate>> {
    let mut out: BTreeSet<UnsnoozeCandidate> = BTreeSet::new();
    for message in stored {
        if !fresh.contains(&message.uid) || message.is_snoozed() {
            continue;
        }
        let owning = threads::folder_threads_containing(tx.conn(), &folder.id, &[message.uid.clone()]).await?;
        for thread_uid in owning {
            for member in threads::members(tx.conn(), &thread_uid).await? {
                if member.message.is_snoozed() {
                    out.insert(UnsnoozeCandidate {
                        message_uid: member.message.uid.clone(),
                        snooze_uuid: member.message.snooze.uuid.clone(),
                    });
                }
            }
        }
    }
    Ok(out.into_iter().collect())
}
