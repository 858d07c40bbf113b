use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Server-local message identifier, only unique within one folder.
pub type ShortUid = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Snoozed,
    ScheduledDrafts,
    Search,
    Commercial,
    SocialNetworks,
    Unknown,
}

impl FolderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderRole::Inbox => "inbox",
            FolderRole::Sent => "sent",
            FolderRole::Drafts => "drafts",
            FolderRole::Trash => "trash",
            FolderRole::Spam => "spam",
            FolderRole::Archive => "archive",
            FolderRole::Snoozed => "snoozed",
            FolderRole::ScheduledDrafts => "scheduled_drafts",
            FolderRole::Search => "search",
            FolderRole::Commercial => "commercial",
            FolderRole::SocialNetworks => "social_networks",
            FolderRole::Unknown => "unknown",
        }
    }

    /// Folder role whose derived state mirrors this one.
    pub fn associated_role(&self) -> Option<FolderRole> {
        match self {
            FolderRole::Inbox => Some(FolderRole::Snoozed),
            FolderRole::Snoozed => Some(FolderRole::Inbox),
            _ => None,
        }
    }

    /// Deleting from these folders is permanent instead of a move to trash.
    pub fn deletes_permanently(&self) -> bool {
        matches!(
            self,
            FolderRole::Trash | FolderRole::Spam | FolderRole::Drafts | FolderRole::ScheduledDrafts
        )
    }
}

impl FromStr for FolderRole {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.to_ascii_lowercase().as_str() {
            "inbox" => FolderRole::Inbox,
            "sent" => FolderRole::Sent,
            "drafts" | "draft" => FolderRole::Drafts,
            "trash" => FolderRole::Trash,
            "spam" => FolderRole::Spam,
            "archive" => FolderRole::Archive,
            "snoozed" => FolderRole::Snoozed,
            "scheduled_drafts" => FolderRole::ScheduledDrafts,
            "search" => FolderRole::Search,
            "commercial" => FolderRole::Commercial,
            "social_networks" => FolderRole::SocialNetworks,
            _ => FolderRole::Unknown,
        })
    }
}

impl fmt::Display for FolderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingPolicy {
    #[default]
    Conversation,
    /// Every message gets its own thread in this folder.
    SingleMessage,
}

impl ThreadingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadingPolicy::Conversation => "conversation",
            ThreadingPolicy::SingleMessage => "single_message",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "single_message" => ThreadingPolicy::SingleMessage,
            _ => ThreadingPolicy::Conversation,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    #[default]
    Conversation,
    Flat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Newest messages, drained completely on every sync.
    New,
    /// History backfill, bounded by `remaining_old_messages_to_fetch`.
    Old,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::New => "new",
            Direction::Old => "old",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub path: String,
    pub role: FolderRole,
    pub parent_id: Option<String>,
    /// Folder whose short UIDs this folder's messages carry.
    pub source_folder_id: String,
    pub threading: ThreadingPolicy,
    pub cursor: Option<String>,
    pub last_update: Option<i64>,
    pub unread_count: i64,
    pub remote_unread_count: Option<i64>,
    pub remaining_old_messages_to_fetch: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: FolderRole) -> Self {
        let id = id.into();
        let name = name.into();
        let now = now_ts();
        Self {
            source_folder_id: id.clone(),
            path: name.clone(),
            id,
            name,
            role,
            parent_id: None,
            threading: ThreadingPolicy::Conversation,
            cursor: None,
            last_update: None,
            unread_count: 0,
            remote_unread_count: None,
            remaining_old_messages_to_fetch: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when this folder does not own its messages (snoozed view over inbox).
    pub fn is_view(&self) -> bool {
        self.source_folder_id != self.id
    }

    /// Whether `message` counts as living in this folder. The snoozed view
    /// only holds inbox messages that are still snoozed.
    pub fn holds(&self, message: &Message) -> bool {
        match self.role {
            FolderRole::Search => true,
            FolderRole::Snoozed => message.folder_id == self.source_folder_id && message.is_snoozed(),
            _ => message.folder_id == self.source_folder_id,
        }
    }

    pub fn long_uid(&self, short_uid: ShortUid) -> String {
        long_uid(short_uid, &self.source_folder_id)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnoozeState {
    Snoozed,
    Unsnoozed,
}

impl SnoozeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnoozeState::Snoozed => "snoozed",
            SnoozeState::Unsnoozed => "unsnoozed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "snoozed" => Some(SnoozeState::Snoozed),
            "unsnoozed" => Some(SnoozeState::Unsnoozed),
            _ => None,
        }
    }
}

/// Flag shape returned by the generic message delta.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFlags {
    pub seen: bool,
    pub flagged: bool,
    pub answered: bool,
    pub forwarded: bool,
    pub scheduled: bool,
}

/// Flag shape returned by the snoozed-folder delta.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnoozeFlags {
    pub state: Option<SnoozeState>,
    pub end_date: Option<i64>,
    pub uuid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Long UID, `shortUid@folderId`.
    pub uid: String,
    pub short_uid: ShortUid,
    pub folder_id: String,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: i64,
    pub flags: MessageFlags,
    pub is_draft: bool,
    pub has_attachments: bool,
    pub snooze: SnoozeFlags,
    pub linked_uids: BTreeSet<String>,
    pub fully_downloaded: bool,
    pub body: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn is_snoozed(&self) -> bool {
        self.snooze.state == Some(SnoozeState::Snoozed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thread {
    pub uid: String,
    pub folder_id: String,
    pub subject: Option<String>,
    pub date: i64,
    pub message_count: i64,
    pub unseen_messages: i64,
    pub flagged: bool,
    pub answered: bool,
    pub forwarded: bool,
    pub has_attachments: bool,
    pub has_drafts: bool,
    pub snooze: SnoozeFlags,
    pub moved_out_locally: bool,
    pub created_at: i64,
}

impl Thread {
    pub fn empty(uid: impl Into<String>, folder_id: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            folder_id: folder_id.into(),
            subject: None,
            date: 0,
            message_count: 0,
            unseen_messages: 0,
            flagged: false,
            answered: false,
            forwarded: false,
            has_attachments: false,
            has_drafts: false,
            snooze: SnoozeFlags::default(),
            moved_out_locally: false,
            created_at: now_ts(),
        }
    }

    pub fn is_snoozed(&self) -> bool {
        self.snooze.state == Some(SnoozeState::Snoozed)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftAction {
    Save,
    Send,
}

impl DraftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftAction::Save => "save",
            DraftAction::Send => "send",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "save" => Some(DraftAction::Save),
            "send" => Some(DraftAction::Send),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    pub local_uuid: String,
    /// Empty until the server has acknowledged the draft.
    pub remote_uuid: String,
    pub message_uid: Option<String>,
    pub action: Option<DraftAction>,
    pub identity_id: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub date: i64,
}

impl Draft {
    pub fn new_local(action: DraftAction) -> Self {
        Self {
            local_uuid: uuid::Uuid::new_v4().to_string(),
            remote_uuid: String::new(),
            message_uid: None,
            action: Some(action),
            identity_id: None,
            subject: None,
            body: None,
            date: now_ts(),
        }
    }
}

pub fn long_uid(short_uid: ShortUid, folder_id: &str) -> String {
    format!("{}@{}", short_uid, folder_id)
}

/// Splits a long UID back into its short UID and folder id.
pub fn split_long_uid(uid: &str) -> Option<(ShortUid, &str)> {
    let (short, folder) = uid.split_once('@')?;
    let short = short.parse::<ShortUid>().ok()?;
    if folder.is_empty() {
        return None;
    }
    Some((short, folder))
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
