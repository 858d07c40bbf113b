use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use super::MailboxManager;
use crate::storage::{folders, messages, threads};
use crate::threading;
use crate::types::{Folder, FolderRole, Thread, ThreadingPolicy};

const SEARCH_FOLDER_ID: &str = "search";
const SEARCH_LIMIT: usize = 200;

impl MailboxManager {
    /// Searches stored messages by subject and sender. Results replace the
    /// content of the local search folder, one thread per message.
    pub async fn search_offline(&self, text: &str) -> Result<Vec<Thread>> {
        let mut tx = self.db.write().await?;
        let folder = match folders::load_folder_by_role(tx.conn(), FolderRole::Search).await? {
            Some(folder) => folder,
            None => {
                let mut folder = Folder::new(SEARCH_FOLDER_ID, "Search", FolderRole::Search);
                folder.threading = ThreadingPolicy::SingleMessage;
                folders::save_folder(&mut tx, &folder).await?;
                folder
            }
        };

        threads::delete_threads_in_folder(&mut tx, &folder.id).await?;
        let found = messages::search_messages(tx.conn(), text, SEARCH_LIMIT).await?;
        for message in &found {
            let thread = Thread::empty(Uuid::new_v4().to_string(), folder.id.clone());
            threads::save_thread(&mut tx, &thread).await?;
            threads::link_message(&mut tx, &thread.uid, &message.uid, false).await?;
            threading::recompute_thread(&mut tx, &folder, &thread.uid).await?;
        }
        let results = threads::threads_in_folder(tx.conn(), &folder.id).await?;
        tx.commit().await?;

        info!(query = %text, results = results.len(), "Offline search completed");
        Ok(results)
    }
}
