use anyhow::Result;
use tracing::{info, warn};

use crate::errors::ApiError;
use crate::storage::drafts;
use crate::sync::MailboxManager;
use crate::types::{Draft, DraftAction};

impl MailboxManager {
    /// Runs the pending action of a local draft against the server.
    pub async fn process_draft(&self, local_uuid: &str) -> Result<()> {
        let draft = {
            let mut conn = self.db.read().await?;
            drafts::load_draft(&mut conn, local_uuid).await?
        };
        let Some(mut draft) = draft else {
            warn!(draft = %local_uuid, "Draft not found");
            return Ok(());
        };

        match draft.action {
            None => Ok(()),
            Some(DraftAction::Save) => match self.api.save_draft(&draft).await {
                Ok(saved) => {
                    draft.remote_uuid = saved.remote_uuid;
                    draft.message_uid = Some(saved.message_uid);
                    draft.action = None;
                    let mut tx = self.db.write().await?;
                    drafts::save_draft(&mut tx, &draft).await?;
                    tx.commit().await?;
                    info!(draft = %local_uuid, remote = %draft.remote_uuid, "Draft saved");
                    Ok(())
                }
                Err(e) => self.draft_failed(&draft, e).await,
            },
            Some(DraftAction::Send) => match self.api.send_draft(&draft).await {
                Ok(()) => {
                    let mut tx = self.db.write().await?;
                    drafts::delete_draft(&mut tx, local_uuid).await?;
                    tx.commit().await?;
                    info!(draft = %local_uuid, "Draft sent");
                    Ok(())
                }
                Err(e) => self.draft_failed(&draft, e).await,
            },
        }
    }

    // Identity and network failures keep the draft so it can be retried.
    async fn draft_failed(&self, draft: &Draft, error: ApiError) -> Result<()> {
        if !error.is_identity_error() && !error.is_transient() {
            let mut tx = self.db.write().await?;
            drafts::delete_draft(&mut tx, &draft.local_uuid).await?;
            tx.commit().await?;
        }
        warn!(draft = %draft.local_uuid, error = %error, "Draft action failed");
        Err(anyhow::Error::new(error).context(format!("processing draft {}", draft.local_uuid)))
    }

    /// Stores a new local draft carrying a pending action.
    pub async fn queue_draft(&self, draft: &Draft) -> Result<()> {
        let mut tx = self.db.write().await?;
        drafts::save_draft(&mut tx, draft).await?;
        tx.commit().await?;
        Ok(())
    }
}
