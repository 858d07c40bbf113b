use anyhow::{Context, Result};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, warn};

use super::{unread, MailboxManager};
use crate::storage::folders;
use crate::threading;
use crate::types::{Direction, Message, ShortUid};

#[derive(Debug, Default)]
struct PageOutcome {
    progressed: bool,
    new_threads: usize,
}

impl MailboxManager {
    /// Fetches the next page of a folder's queue. False when the queue was empty.
    pub async fn fetch_one_page(&self, folder_id: &str, direction: Direction) -> Result<bool> {
        let lock = self.folder_lock(folder_id);
        let _guard = lock.lock().await;
        Ok(self.fetch_page(folder_id, direction).await?.progressed)
    }

    /// Fetches one page of history. Returns the number of threads it created,
    /// or `None` when there was nothing left to fetch.
    pub async fn fetch_one_old_page(&self, folder_id: &str) -> Result<Option<usize>> {
        let lock = self.folder_lock(folder_id);
        let _guard = lock.lock().await;
        let outcome = self.fetch_page(folder_id, Direction::Old).await?;
        Ok(outcome.progressed.then_some(outcome.new_threads))
    }

    pub(super) async fn drain_new_pages(&self, folder_id: &str) -> Result<usize> {
        let mut pages = 0;
        loop {
            self.check_cancelled()?;
            if !self.fetch_page(folder_id, Direction::New).await?.progressed {
                return Ok(pages);
            }
            pages += 1;
        }
    }

    pub(super) async fn drain_old_pages(&self, folder_id: &str) -> Result<usize> {
        let mut pages = 0;
        loop {
            self.check_cancelled()?;
            let Some(folder) = self.load_folder(folder_id).await? else {
                return Ok(pages);
            };
            if folder.remaining_old_messages_to_fetch <= 0 {
                return Ok(pages);
            }
            if !self.fetch_page(folder_id, Direction::Old).await?.progressed {
                return Ok(pages);
            }
            pages += 1;
        }
    }

    async fn fetch_page(&self, folder_id: &str, direction: Direction) -> Result<PageOutcome> {
        let start = Instant::now();
        let page_size = match direction {
            Direction::New => self.settings.new_page_size,
            Direction::Old => self.settings.old_page_size,
        };

        let (folder, uids) = {
            let mut conn = self.db.read().await?;
            let Some(folder) = folders::load_folder(&mut conn, folder_id).await? else {
                warn!(folder = %folder_id, "Page requested for unknown folder");
                return Ok(PageOutcome::default());
            };
            let uids = folders::queue_front(&mut conn, folder_id, direction, page_size).await?;
            (folder, uids)
        };
        if uids.is_empty() {
            return Ok(PageOutcome::default());
        }

        let requested: HashSet<ShortUid> = uids.iter().copied().collect();
        let fetched = self
            .api
            .fetch_messages_by_uids(&folder.source_folder_id, &uids)
            .await
            .with_context(|| format!("fetching {} page of folder {}", direction.as_str(), folder_id))?;
        let incoming: Vec<Message> = fetched
            .into_iter()
            .filter(|m| requested.contains(&m.short_uid))
            .map(|m| m.into_message())
            .collect();
        let received = incoming.len();

        let mut tx = self.db.write().await?;
        let Some(mut folder) = folders::load_folder(tx.conn(), folder_id).await? else {
            return Ok(PageOutcome::default());
        };
        let outcome = threading::ingest_messages(&mut tx, &folder, incoming, self.settings.thread_mode).await?;
        folders::queue_remove(&mut tx, folder_id, Some(direction), &uids).await?;

        if direction == Direction::Old {
            let left = folders::queue_len(tx.conn(), folder_id, Direction::Old).await?;
            folder.remaining_old_messages_to_fetch = if left == 0 {
                0
            } else {
                (folder.remaining_old_messages_to_fetch - page_size as i64).clamp(0, left)
            };
            folders::save_folder(&mut tx, &folder).await?;
        }

        unread::recompute_folders(&mut tx, &outcome.impacted_folders).await?;
        tx.commit().await?;

        debug!(
            folder = %folder_id,
            direction = direction.as_str(),
            requested = uids.len(),
            received,
            new_threads = outcome.new_threads,
            elapsed_ms = ?start.elapsed().as_millis(),
            "Page ingested"
        );

        if !outcome.unsnooze.is_empty() {
            self.unsnooze_after_new_mail(outcome.unsnooze).await?;
        }

        Ok(PageOutcome {
            progressed: true,
            new_threads: outcome.new_threads,
        })
    }
}
