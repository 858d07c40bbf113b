use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use super::FolderCache;
use crate::storage::{threads, WriteTx};
use crate::types::{Folder, SnoozeFlags, SnoozeState, Thread};

/// Re-derives every aggregate of a thread from its members. A thread left
/// without any message its folder holds is deleted; `None` is returned then.
pub async fn recompute_thread(tx: &mut WriteTx<'_>, folder: &Folder, thread_uid: &str) -> Result<Option<Thread>> {
    let Some(mut thread) = threads::load_thread(tx.conn(), thread_uid).await? else {
        return Ok(None);
    };
    let members = threads::members(tx.conn(), thread_uid).await?;

    if !members.iter().any(|m| folder.holds(&m.message)) {
        threads::delete_thread(tx, &thread).await?;
        return Ok(None);
    }

    // One primary per Message-ID, preferring the copy this folder holds.
    let mut primary_for: BTreeMap<&str, &str> = BTreeMap::new();
    for member in &members {
        let Some(id) = member.message.message_id.as_deref() else {
            continue;
        };
        match primary_for.get(id) {
            None => {
                primary_for.insert(id, &member.message.uid);
            }
            Some(current) => {
                let current_held = members
                    .iter()
                    .any(|m| m.message.uid == *current && folder.holds(&m.message));
                if !current_held && folder.holds(&member.message) {
                    primary_for.insert(id, &member.message.uid);
                }
            }
        }
    }

    let mut primaries = Vec::with_capacity(members.len());
    let mut relinks = Vec::new();
    for member in &members {
        let is_duplicate = match member.message.message_id.as_deref() {
            Some(id) => primary_for.get(id).copied() != Some(member.message.uid.as_str()),
            None => false,
        };
        if is_duplicate != member.is_duplicate {
            relinks.push((member.message.uid.clone(), is_duplicate));
        }
        if !is_duplicate {
            primaries.push(&member.message);
        }
    }

    for (uid, is_duplicate) in relinks {
        threads::link_message(tx, thread_uid, &uid, is_duplicate).await?;
    }

    thread.subject = primaries
        .iter()
        .find_map(|m| m.subject.clone())
        .or_else(|| thread.subject.take());
    thread.date = primaries.iter().map(|m| m.date).max().unwrap_or(thread.date);
    thread.message_count = primaries.len() as i64;
    thread.unseen_messages = primaries.iter().filter(|m| !m.flags.seen).count() as i64;
    thread.flagged = primaries.iter().any(|m| m.flags.flagged);
    thread.answered = primaries.iter().any(|m| m.flags.answered);
    thread.forwarded = primaries.iter().any(|m| m.flags.forwarded);
    thread.has_attachments = primaries.iter().any(|m| m.has_attachments);
    thread.has_drafts = primaries.iter().any(|m| m.is_draft);
    thread.snooze = primaries
        .iter()
        .filter(|m| m.is_snoozed() && folder.holds(m))
        .max_by_key(|m| m.snooze.end_date)
        .map(|m| SnoozeFlags {
            state: Some(SnoozeState::Snoozed),
            end_date: m.snooze.end_date,
            uuid: m.snooze.uuid.clone(),
        })
        .unwrap_or_default();

    let refs: BTreeSet<String> = members
        .iter()
        .flat_map(|m| m.message.linked_uids.iter().cloned())
        .collect();
    threads::replace_refs(tx, thread_uid, &refs).await?;
    threads::save_thread(tx, &thread).await?;
    Ok(Some(thread))
}

/// Recomputes a set of threads. Returns the threads that survived and every
/// folder that owned one of them before the pass.
pub async fn recompute_threads(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    thread_uids: &[String],
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut alive = BTreeSet::new();
    let mut folders = BTreeSet::new();
    for thread in threads::load_threads(tx.conn(), thread_uids).await? {
        folders.insert(thread.folder_id.clone());
        let Some(folder) = cache.get(tx.conn(), &thread.folder_id).await? else {
            continue;
        };
        if recompute_thread(tx, &folder, &thread.uid).await?.is_some() {
            alive.insert(thread.uid);
        }
    }
    Ok((alive, folders))
}

/// Recomputes every thread that links one of `message_uids`.
pub async fn recompute_threads_for_messages(
    tx: &mut WriteTx<'_>,
    cache: &mut FolderCache,
    message_uids: &[String],
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let affected: Vec<String> = threads::threads_containing(tx.conn(), message_uids)
        .await?
        .into_iter()
        .collect();
    recompute_threads(tx, cache, &affected).await
}
