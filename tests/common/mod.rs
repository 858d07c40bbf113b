#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailbox_sync::config::SyncSettings;
use mailbox_sync::errors::ApiError;
use mailbox_sync::remote::{
    ActionResponse, DeltaResponse, FlagUpdate, FolderDescriptor, MailApi, RemoteMessage, SavedDraft, UidList,
};
use mailbox_sync::storage::{folders, messages, threads, Database};
use mailbox_sync::sync::MailboxManager;
use mailbox_sync::types::{Draft, Folder, FolderRole, Message, MessageFlags, ShortUid, SnoozeFlags, SnoozeState, Thread};

pub const INBOX: &str = "inbox";
pub const SENT: &str = "sent";
pub const TRASH: &str = "trash";
pub const SPAM: &str = "spam";
pub const ARCHIVE: &str = "archive";
pub const SNOOZED: &str = "snoozed";
pub const DRAFTS: &str = "drafts";

/// One recorded mutation call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub name: &'static str,
    pub ids: Vec<String>,
}

#[derive(Default)]
pub struct ServerState {
    pub folders: Vec<FolderDescriptor>,
    pub messages: BTreeMap<String, BTreeMap<ShortUid, RemoteMessage>>,
    pub cursors: HashMap<String, u64>,
    pub deltas: HashMap<String, VecDeque<DeltaResponse<MessageFlags>>>,
    pub snoozed_deltas: HashMap<String, VecDeque<DeltaResponse<SnoozeFlags>>>,
    pub invalid_cursor: HashSet<String>,
    pub delta_error: Option<ApiError>,
    /// Zero-based indices of mutation calls that must fail.
    pub failing_calls: HashSet<usize>,
    pub calls: Vec<Call>,
    pub refused_undo: HashSet<String>,
    pub undone: Vec<String>,
    pub delete_snooze_error: Option<ApiError>,
    pub draft_error: Option<ApiError>,
    pub fetch_requests: Vec<(String, Vec<ShortUid>)>,
}

#[derive(Default)]
pub struct FakeServer {
    pub state: Mutex<ServerState>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let server = FakeServer::default();
        {
            let mut state = server.state.lock().unwrap();
            state.folders = vec![
                descriptor(INBOX, FolderRole::Inbox),
                descriptor(SENT, FolderRole::Sent),
                descriptor(TRASH, FolderRole::Trash),
                descriptor(SPAM, FolderRole::Spam),
                descriptor(ARCHIVE, FolderRole::Archive),
                descriptor(SNOOZED, FolderRole::Snoozed),
                descriptor(DRAFTS, FolderRole::Drafts),
            ];
        }
        Arc::new(server)
    }

    pub fn put(&self, message: RemoteMessage) {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .entry(message.folder_id.clone())
            .or_default()
            .insert(message.short_uid, message);
    }

    pub fn remove(&self, folder_id: &str, short_uid: ShortUid) {
        let mut state = self.state.lock().unwrap();
        if let Some(folder) = state.messages.get_mut(folder_id) {
            folder.remove(&short_uid);
        }
    }

    pub fn push_delta(&self, folder_id: &str, delta: DeltaResponse<MessageFlags>) {
        let mut state = self.state.lock().unwrap();
        state.deltas.entry(folder_id.to_string()).or_default().push_back(delta);
    }

    pub fn push_snoozed_delta(&self, folder_id: &str, delta: DeltaResponse<SnoozeFlags>) {
        let mut state = self.state.lock().unwrap();
        state
            .snoozed_deltas
            .entry(folder_id.to_string())
            .or_default()
            .push_back(delta);
    }

    pub fn invalidate_cursor(&self, folder_id: &str) {
        self.state.lock().unwrap().invalid_cursor.insert(folder_id.to_string());
    }

    pub fn fail_call(&self, index: usize) {
        self.state.lock().unwrap().failing_calls.insert(index);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn next_cursor(state: &mut ServerState, folder_id: &str) -> String {
        let version = state.cursors.entry(folder_id.to_string()).or_insert(0);
        *version += 1;
        format!("{}-c{}", folder_id, version)
    }

    fn record(&self, name: &'static str, ids: &[String], reversible: bool) -> Result<ActionResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        let index = state.calls.len();
        state.calls.push(Call {
            name,
            ids: ids.to_vec(),
        });
        if state.failing_calls.contains(&index) {
            return Err(ApiError::Server {
                code: "mail__action_failed".into(),
                description: format!("{} call {} rejected", name, index),
            });
        }
        Ok(ActionResponse {
            undo_resource: reversible.then(|| format!("undo-{}", index)),
        })
    }
}

#[async_trait]
impl MailApi for FakeServer {
    async fn list_folders(&self) -> Result<Vec<FolderDescriptor>, ApiError> {
        Ok(self.state.lock().unwrap().folders.clone())
    }

    async fn fetch_delta(&self, folder_id: &str, _cursor: &str) -> Result<DeltaResponse<MessageFlags>, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.invalid_cursor.remove(folder_id) {
            return Err(ApiError::CursorInvalid);
        }
        if let Some(e) = state.delta_error.take() {
            return Err(e);
        }
        if let Some(delta) = state.deltas.get_mut(folder_id).and_then(|q| q.pop_front()) {
            return Ok(delta);
        }
        let cursor = Self::next_cursor(&mut state, folder_id);
        Ok(empty_delta(cursor))
    }

    async fn fetch_snoozed_delta(&self, folder_id: &str, _cursor: &str) -> Result<DeltaResponse<SnoozeFlags>, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.invalid_cursor.remove(folder_id) {
            return Err(ApiError::CursorInvalid);
        }
        if let Some(delta) = state.snoozed_deltas.get_mut(folder_id).and_then(|q| q.pop_front()) {
            return Ok(delta);
        }
        let cursor = Self::next_cursor(&mut state, folder_id);
        Ok(empty_delta(cursor))
    }

    async fn list_all_short_uids(&self, folder_id: &str) -> Result<UidList, ApiError> {
        let mut state = self.state.lock().unwrap();
        let short_uids: Vec<ShortUid> = if folder_id == SNOOZED {
            state
                .messages
                .get(INBOX)
                .map(|m| {
                    m.values()
                        .filter(|r| r.snooze.state == Some(SnoozeState::Snoozed))
                        .map(|r| r.short_uid)
                        .rev()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            // Newest first, like the real endpoint.
            state
                .messages
                .get(folder_id)
                .map(|m| m.keys().rev().copied().collect())
                .unwrap_or_default()
        };
        let cursor = Self::next_cursor(&mut state, folder_id);
        Ok(UidList { short_uids, cursor })
    }

    async fn fetch_messages_by_uids(
        &self,
        folder_id: &str,
        short_uids: &[ShortUid],
    ) -> Result<Vec<RemoteMessage>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_requests.push((folder_id.to_string(), short_uids.to_vec()));
        let Some(folder) = state.messages.get(folder_id) else {
            return Ok(Vec::new());
        };
        Ok(short_uids.iter().filter_map(|u| folder.get(u).cloned()).collect())
    }

    async fn move_messages(&self, message_uids: &[String], _destination_id: &str) -> Result<ActionResponse, ApiError> {
        self.record("move", message_uids, true)
    }

    async fn delete_messages(&self, message_uids: &[String]) -> Result<ActionResponse, ApiError> {
        self.record("delete", message_uids, false)
    }

    async fn report_spam(&self, message_uids: &[String]) -> Result<ActionResponse, ApiError> {
        self.record("spam", message_uids, true)
    }

    async fn star(&self, message_uids: &[String], starred: bool) -> Result<ActionResponse, ApiError> {
        self.record(if starred { "star" } else { "unstar" }, message_uids, true)
    }

    async fn mark_seen(&self, message_uids: &[String], seen: bool) -> Result<ActionResponse, ApiError> {
        self.record(if seen { "seen" } else { "unseen" }, message_uids, false)
    }

    async fn snooze(&self, message_uids: &[String], _end_date: i64) -> Result<ActionResponse, ApiError> {
        self.record("snooze", message_uids, false)
    }

    async fn update_snooze(&self, snooze_uuids: &[String], _end_date: i64) -> Result<ActionResponse, ApiError> {
        self.record("update_snooze", snooze_uuids, false)
    }

    async fn delete_snooze(&self, snooze_uuids: &[String]) -> Result<ActionResponse, ApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.state.lock().unwrap().delete_snooze_error.clone();
        if let Some(e) = scripted {
            self.state.lock().unwrap().calls.push(Call {
                name: "delete_snooze",
                ids: snooze_uuids.to_vec(),
            });
            return Err(e);
        }
        self.record("delete_snooze", snooze_uuids, false)
    }

    async fn undo(&self, undo_resource: &str) -> Result<bool, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.undone.push(undo_resource.to_string());
        Ok(!state.refused_undo.contains(undo_resource))
    }

    async fn save_draft(&self, draft: &Draft) -> Result<SavedDraft, ApiError> {
        if let Some(e) = self.state.lock().unwrap().draft_error.clone() {
            return Err(e);
        }
        Ok(SavedDraft {
            remote_uuid: format!("remote-{}", draft.local_uuid),
            message_uid: format!("1@{}", DRAFTS),
        })
    }

    async fn send_draft(&self, _draft: &Draft) -> Result<(), ApiError> {
        if let Some(e) = self.state.lock().unwrap().draft_error.clone() {
            return Err(e);
        }
        Ok(())
    }
}

pub fn descriptor(id: &str, role: FolderRole) -> FolderDescriptor {
    FolderDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        path: id.to_string(),
        role: Some(role),
        unread_count: None,
        children: Vec::new(),
    }
}

pub fn empty_delta<F>(cursor: String) -> DeltaResponse<F> {
    DeltaResponse {
        added: Vec::new(),
        updated: Vec::new(),
        deleted: Vec::new(),
        cursor,
        unread_count: None,
    }
}

pub fn delta(
    cursor: &str,
    added: Vec<ShortUid>,
    updated: Vec<(ShortUid, MessageFlags)>,
    deleted: Vec<ShortUid>,
) -> DeltaResponse<MessageFlags> {
    DeltaResponse {
        added,
        updated: updated
            .into_iter()
            .map(|(short_uid, flags)| FlagUpdate { short_uid, flags })
            .collect(),
        deleted,
        cursor: cursor.to_string(),
        unread_count: None,
    }
}

/// A standalone message: its own conversation.
pub fn mail(folder_id: &str, short_uid: ShortUid) -> RemoteMessage {
    RemoteMessage {
        short_uid,
        folder_id: folder_id.to_string(),
        message_id: Some(format!("<m{}-{}@test>", short_uid, folder_id)),
        in_reply_to: None,
        references: None,
        subject: Some(format!("Subject {}", short_uid)),
        from: Some("alice@example.com".into()),
        date: 1_700_000_000 + short_uid as i64,
        flags: MessageFlags::default(),
        is_draft: false,
        has_attachments: false,
        snooze: SnoozeFlags::default(),
        body: None,
    }
}

/// A message with an explicit Message-ID and reference list.
pub fn conversation_mail(folder_id: &str, short_uid: ShortUid, message_id: &str, refs: &[&str]) -> RemoteMessage {
    let mut message = mail(folder_id, short_uid);
    message.message_id = Some(format!("<{}>", message_id));
    if !refs.is_empty() {
        let joined = refs.iter().map(|r| format!("<{}>", r)).collect::<Vec<_>>().join(" ");
        message.in_reply_to = refs.last().map(|r| format!("<{}>", r));
        message.references = Some(joined);
    }
    message
}

pub fn snoozed(mut message: RemoteMessage, uuid: &str) -> RemoteMessage {
    message.snooze = SnoozeFlags {
        state: Some(SnoozeState::Snoozed),
        end_date: Some(1_900_000_000),
        uuid: Some(uuid.to_string()),
    };
    message
}

pub fn settings() -> SyncSettings {
    SyncSettings::default()
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub db: Arc<Database>,
    pub manager: MailboxManager,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(settings()).await
    }

    pub async fn with_settings(settings: SyncSettings) -> Self {
        let server = FakeServer::new();
        let db = Arc::new(Database::open_in_memory().await.expect("in-memory db"));
        let api: Arc<dyn MailApi> = server.clone();
        let manager = MailboxManager::new(db.clone(), api, settings);
        manager.refresh_folders().await.expect("folders");
        Self { server, db, manager }
    }

    pub async fn folder(&self, id: &str) -> Folder {
        let mut conn = self.db.read().await.unwrap();
        folders::load_folder(&mut conn, id).await.unwrap().expect("folder exists")
    }

    pub async fn threads(&self, folder_id: &str) -> Vec<Thread> {
        let mut conn = self.db.read().await.unwrap();
        threads::threads_in_folder(&mut conn, folder_id).await.unwrap()
    }

    pub async fn thread_members(&self, thread_uid: &str) -> Vec<String> {
        let mut conn = self.db.read().await.unwrap();
        threads::member_uids(&mut conn, thread_uid).await.unwrap().into_iter().collect()
    }

    pub async fn message(&self, uid: &str) -> Option<Message> {
        let mut conn = self.db.read().await.unwrap();
        messages::load_message(&mut conn, uid).await.unwrap()
    }

    pub async fn messages_in(&self, folder_id: &str) -> Vec<Message> {
        let mut conn = self.db.read().await.unwrap();
        messages::load_messages_in_folder(&mut conn, folder_id).await.unwrap()
    }

    pub async fn queue_len(&self, folder_id: &str, direction: mailbox_sync::types::Direction) -> i64 {
        let mut conn = self.db.read().await.unwrap();
        folders::queue_len(&mut conn, folder_id, direction).await.unwrap()
    }
}
