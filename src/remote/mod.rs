//! Typed surface of the remote mail API. Transport and authentication live
//! behind the `MailApi` implementation.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::ApiError;
use crate::types::{
    long_uid, now_ts, Draft, FolderRole, Message, MessageFlags, ShortUid, SnoozeFlags,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderDescriptor {
    pub id: String,
    pub name: String,
    pub path: String,
    pub role: Option<FolderRole>,
    pub unread_count: Option<i64>,
    #[serde(default)]
    pub children: Vec<FolderDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagUpdate<F> {
    pub short_uid: ShortUid,
    pub flags: F,
}

/// Changes of one folder since a cursor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaResponse<F> {
    pub added: Vec<ShortUid>,
    pub updated: Vec<FlagUpdate<F>>,
    pub deleted: Vec<ShortUid>,
    pub cursor: String,
    pub unread_count: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UidList {
    pub short_uids: Vec<ShortUid>,
    pub cursor: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMessage {
    pub short_uid: ShortUid,
    /// Folder that issued `short_uid`.
    pub folder_id: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: i64,
    pub flags: MessageFlags,
    pub is_draft: bool,
    pub has_attachments: bool,
    #[serde(default)]
    pub snooze: SnoozeFlags,
    pub body: Option<String>,
}

impl RemoteMessage {
    pub fn long_uid(&self) -> String {
        long_uid(self.short_uid, &self.folder_id)
    }

    /// Converts the wire record into a store message with its reference set.
    pub fn into_message(self) -> Message {
        let uid = self.long_uid();
        let mut linked = BTreeSet::new();
        if let Some(id) = self.message_id.as_deref() {
            linked.extend(parse_message_ids(id));
        }
        if let Some(raw) = self.in_reply_to.as_deref() {
            linked.extend(parse_message_ids(raw));
        }
        if let Some(raw) = self.references.as_deref() {
            linked.extend(parse_message_ids(raw));
        }
        if linked.is_empty() {
            // Headerless messages only ever thread with themselves.
            linked.insert(uid.clone());
        }

        let message_id = self
            .message_id
            .as_deref()
            .and_then(|raw| parse_message_ids(raw).into_iter().next());
        let now = now_ts();
        Message {
            uid,
            short_uid: self.short_uid,
            folder_id: self.folder_id,
            message_id,
            subject: self.subject,
            from: self.from,
            date: self.date,
            flags: self.flags,
            is_draft: self.is_draft,
            has_attachments: self.has_attachments,
            snooze: self.snooze,
            linked_uids: linked,
            fully_downloaded: self.body.is_some(),
            body: self.body,
            created_at: now,
            updated_at: now,
        }
    }
}

static MESSAGE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>\s]+)>").expect("valid regex"));

/// Extracts bare ids from a Message-ID / In-Reply-To / References header value.
pub fn parse_message_ids(raw: &str) -> Vec<String> {
    let bracketed: Vec<String> = MESSAGE_ID_RE
        .captures_iter(raw)
        .map(|c| c[1].to_string())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }
    raw.split_whitespace()
        .map(|s| s.trim_matches(|c| c == '<' || c == '>' || c == ','))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Server acknowledgement of a mutation; carries an undo token when reversible.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    pub undo_resource: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedDraft {
    pub remote_uuid: String,
    pub message_uid: String,
}

#[async_trait]
pub trait MailApi: Send + Sync {
    async fn list_folders(&self) -> Result<Vec<FolderDescriptor>, ApiError>;

    async fn fetch_delta(
        &self,
        folder_id: &str,
        cursor: &str,
    ) -> Result<DeltaResponse<MessageFlags>, ApiError>;

    async fn fetch_snoozed_delta(
        &self,
        folder_id: &str,
        cursor: &str,
    ) -> Result<DeltaResponse<SnoozeFlags>, ApiError>;

    async fn list_all_short_uids(&self, folder_id: &str) -> Result<UidList, ApiError>;

    async fn fetch_messages_by_uids(
        &self,
        folder_id: &str,
        short_uids: &[ShortUid],
    ) -> Result<Vec<RemoteMessage>, ApiError>;

    async fn move_messages(
        &self,
        message_uids: &[String],
        destination_id: &str,
    ) -> Result<ActionResponse, ApiError>;

    async fn delete_messages(&self, message_uids: &[String]) -> Result<ActionResponse, ApiError>;

    async fn report_spam(&self, message_uids: &[String]) -> Result<ActionResponse, ApiError>;

    async fn star(&self, message_uids: &[String], starred: bool) -> Result<ActionResponse, ApiError>;

    async fn mark_seen(&self, message_uids: &[String], seen: bool) -> Result<ActionResponse, ApiError>;

    async fn snooze(&self, message_uids: &[String], end_date: i64) -> Result<ActionResponse, ApiError>;

    async fn update_snooze(
        &self,
        snooze_uuids: &[String],
        end_date: i64,
    ) -> Result<ActionResponse, ApiError>;

    async fn delete_snooze(&self, snooze_uuids: &[String]) -> Result<ActionResponse, ApiError>;

    async fn undo(&self, undo_resource: &str) -> Result<bool, ApiError>;

    async fn save_draft(&self, draft: &Draft) -> Result<SavedDraft, ApiError>;

    async fn send_draft(&self, draft: &Draft) -> Result<(), ApiError>;
}
