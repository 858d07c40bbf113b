use anyhow::{Context, Result};
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::debug;

use crate::storage::{folders, WriteTx};
use crate::types::FolderRole;

/// Recomputes the unread counter of `folder_ids` and of their associated
/// folders (inbox and snoozed mirror each other). Returns the folders whose
/// stored counter changed.
pub async fn recompute_folders(tx: &mut WriteTx<'_>, folder_ids: &BTreeSet<String>) -> Result<BTreeSet<String>> {
    let mut targets = BTreeSet::new();
    for id in folder_ids {
        let Some(folder) = folders::load_folder(tx.conn(), id).await? else {
            continue;
        };
        if let Some(role) = folder.role.associated_role() {
            if let Some(associated) = folders::load_folder_by_role(tx.conn(), role).await? {
                targets.insert((associated.id, associated.role));
            }
        }
        targets.insert((folder.id, folder.role));
    }

    let mut changed = BTreeSet::new();
    for (id, role) in targets {
        let unread = count_unread(tx, &id, role == FolderRole::Inbox).await?;
        if folders::set_unread_count(tx, &id, unread).await? {
            debug!(folder = %id, unread, "Unread count changed");
            changed.insert(id);
        }
    }
    Ok(changed)
}

// Snoozed threads are only counted in the snoozed folder.
async fn count_unread(tx: &mut WriteTx<'_>, folder_id: &str, exclude_snoozed: bool) -> Result<i64> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(unseen_messages), 0) FROM threads
        WHERE folder_id = ?1
          AND moved_out_locally = 0
          AND (?2 = 0 OR snooze_state IS NULL OR snooze_state != 'snoozed');
        "#,
    )
    .bind(folder_id)
    .bind(exclude_snoozed)
    .fetch_one(tx.conn())
    .await
    .context("summing unseen messages")?;
    Ok(row.get::<i64, _>(0))
}
