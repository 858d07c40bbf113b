use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::storage::messages;
use crate::sync::{unread, MailboxManager};
use crate::threading::{self, FolderCache, UnsnoozeCandidate};
use crate::types::SnoozeFlags;

impl MailboxManager {
    /// A snoozed conversation that receives new mail wakes up: its snoozed
    /// messages are unsnoozed remotely, a few requests at a time, and the
    /// local snooze state is cleared for every one the server agrees on.
    pub(crate) async fn unsnooze_after_new_mail(&self, candidates: Vec<UnsnoozeCandidate>) -> Result<()> {
        let api = self.api.clone();
        let results: Vec<(String, Result<(), ApiError>)> = stream::iter(candidates)
            .map(|candidate| {
                let api = api.clone();
                async move {
                    let outcome = match candidate.snooze_uuid {
                        Some(uuid) => api.delete_snooze(&[uuid]).await.map(|_| ()),
                        // Never acknowledged by the server; nothing to undo there.
                        None => Ok(()),
                    };
                    (candidate.message_uid, outcome)
                }
            })
            .buffer_unordered(self.settings.unsnooze_concurrency)
            .collect()
            .await;

        let mut cleared = Vec::new();
        for (uid, outcome) in results {
            match outcome {
                Ok(()) => cleared.push(uid),
                Err(e) if e.is_already_in_target_state() => cleared.push(uid),
                Err(e) => warn!(message = %uid, error = %e, "Auto-unsnooze failed"),
            }
        }
        if cleared.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.write().await?;
        for uid in &cleared {
            if let Some(mut message) = messages::load_message(tx.conn(), uid).await? {
                message.snooze = SnoozeFlags::default();
                messages::upsert_message(&mut tx, &message).await?;
            }
        }
        let mut cache = FolderCache::default();
        let (_, impacted) = threading::recompute_threads_for_messages(&mut tx, &mut cache, &cleared).await?;
        unread::recompute_folders(&mut tx, &impacted).await?;
        tx.commit().await?;

        debug!(messages = cleared.len(), "Snoozed conversations woken by new mail");
        Ok(())
    }
}
