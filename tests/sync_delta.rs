mod common;

use std::collections::BTreeMap;

use common::*;
use mailbox_sync::errors::{ApiError, SyncError};
use mailbox_sync::types::{Direction, MessageFlags};

fn seen() -> MessageFlags {
    MessageFlags {
        seen: true,
        ..MessageFlags::default()
    }
}

/// Two conversations (1-4 and 5-6) plus four standalone messages.
fn seed_ten(h: &Harness) {
    h.server.put(conversation_mail(INBOX, 1, "a1", &[]));
    h.server.put(conversation_mail(INBOX, 2, "a2", &["a1"]));
    h.server.put(conversation_mail(INBOX, 3, "a3", &["a1", "a2"]));
    h.server.put(conversation_mail(INBOX, 4, "a4", &["a1", "a3"]));
    h.server.put(conversation_mail(INBOX, 5, "b1", &[]));
    h.server.put(conversation_mail(INBOX, 6, "b2", &["b1"]));
    for uid in 7..=10 {
        h.server.put(mail(INBOX, uid));
    }
}

#[tokio::test]
async fn delta_delete_removes_messages_and_empty_threads() {
    let h = Harness::new().await;
    seed_ten(&h);
    h.manager.sync_folder(INBOX).await.unwrap();
    assert_eq!(h.messages_in(INBOX).await.len(), 10);
    assert_eq!(h.threads(INBOX).await.len(), 6);

    for uid in [2, 5, 6] {
        h.server.remove(INBOX, uid);
    }
    h.server.push_delta(INBOX, delta("inbox-d1", vec![], vec![], vec![2, 5, 6]));
    h.manager.sync_folder(INBOX).await.unwrap();

    assert_eq!(h.messages_in(INBOX).await.len(), 7);
    let threads = h.threads(INBOX).await;
    assert_eq!(threads.len(), 5);

    let conversation = threads
        .iter()
        .find(|t| t.message_count > 1)
        .expect("partially deleted thread survives");
    assert_eq!(conversation.message_count, 3);
    let members = h.thread_members(&conversation.uid).await;
    assert!(!members.contains(&"2@inbox".to_string()));
    assert_eq!(h.folder(INBOX).await.cursor.as_deref(), Some("inbox-d1"));
}

#[tokio::test]
async fn flag_updates_are_merged_without_refetch() {
    let h = Harness::new().await;
    seed_ten(&h);
    h.manager.sync_folder(INBOX).await.unwrap();
    assert_eq!(h.folder(INBOX).await.unread_count, 10);
    let fetches_before = h.server.state.lock().unwrap().fetch_requests.len();

    let flagged = MessageFlags {
        seen: true,
        flagged: true,
        ..MessageFlags::default()
    };
    h.server
        .push_delta(INBOX, delta("inbox-d1", vec![], vec![(1, seen()), (7, flagged)], vec![]));
    h.manager.sync_folder(INBOX).await.unwrap();

    assert_eq!(h.server.state.lock().unwrap().fetch_requests.len(), fetches_before);
    assert!(h.message("1@inbox").await.unwrap().flags.seen);
    assert!(h.message("7@inbox").await.unwrap().flags.flagged);
    assert_eq!(h.folder(INBOX).await.unread_count, 8);

    let starred: Vec<_> = h.threads(INBOX).await.into_iter().filter(|t| t.flagged).collect();
    assert_eq!(starred.len(), 1);
}

#[tokio::test]
async fn added_uids_already_stored_are_not_queued() {
    let h = Harness::new().await;
    h.server.put(mail(INBOX, 1));
    h.manager.sync_folder(INBOX).await.unwrap();

    h.server.put(mail(INBOX, 2));
    h.server.push_delta(INBOX, delta("inbox-d1", vec![1, 2], vec![], vec![]));
    h.server.state.lock().unwrap().fetch_requests.clear();
    h.manager.sync_folder(INBOX).await.unwrap();

    let requests = h.server.state.lock().unwrap().fetch_requests.clone();
    assert_eq!(requests, vec![(INBOX.to_string(), vec![2])]);
    assert_eq!(h.messages_in(INBOX).await.len(), 2);
}

type Snapshot = (BTreeMap<String, MessageFlags>, Vec<(Option<String>, i64, i64)>, i64);

async fn snapshot(h: &Harness) -> Snapshot {
    let messages = h
        .messages_in(INBOX)
        .await
        .into_iter()
        .map(|m| (m.uid, m.flags))
        .collect();
    let mut threads: Vec<_> = h
        .threads(INBOX)
        .await
        .into_iter()
        .map(|t| (t.subject, t.message_count, t.unseen_messages))
        .collect();
    threads.sort();
    (messages, threads, h.folder(INBOX).await.unread_count)
}

#[tokio::test]
async fn sequential_deltas_converge_to_a_fresh_sync() {
    let h = Harness::new().await;
    for uid in 1..=5 {
        h.server.put(mail(INBOX, uid));
    }
    h.manager.sync_folder(INBOX).await.unwrap();

    // D1: +6, 1 read, -2.  D2: +7, -3.
    h.server.put(mail(INBOX, 6));
    h.server.remove(INBOX, 2);
    let mut read = mail(INBOX, 1);
    read.flags = seen();
    h.server.put(read);
    h.server.push_delta(INBOX, delta("inbox-d1", vec![6], vec![(1, seen())], vec![2]));
    h.manager.sync_folder(INBOX).await.unwrap();

    h.server.put(mail(INBOX, 7));
    h.server.remove(INBOX, 3);
    h.server.push_delta(INBOX, delta("inbox-d2", vec![7], vec![], vec![3]));
    h.manager.sync_folder(INBOX).await.unwrap();

    let fresh = Harness::new().await;
    for uid in [4, 5, 6, 7] {
        fresh.server.put(mail(INBOX, uid));
    }
    let mut read = mail(INBOX, 1);
    read.flags = seen();
    fresh.server.put(read);
    fresh.manager.sync_folder(INBOX).await.unwrap();

    assert_eq!(snapshot(&h).await, snapshot(&fresh).await);
}

#[tokio::test]
async fn rejected_cursor_resets_and_resyncs_the_folder() {
    let h = Harness::new().await;
    for uid in 1..=5 {
        h.server.put(mail(INBOX, uid));
    }
    h.manager.sync_folder(INBOX).await.unwrap();
    let old_cursor = h.folder(INBOX).await.cursor;

    h.server.remove(INBOX, 1);
    h.server.put(mail(INBOX, 6));
    h.server.invalidate_cursor(INBOX);
    h.manager.sync_folder(INBOX).await.unwrap();

    let folder = h.folder(INBOX).await;
    assert!(folder.cursor.is_some());
    assert_ne!(folder.cursor, old_cursor);
    assert_eq!(h.queue_len(INBOX, Direction::Old).await, 0);

    let fresh = Harness::new().await;
    for uid in 2..=6 {
        fresh.server.put(mail(INBOX, uid));
    }
    fresh.manager.sync_folder(INBOX).await.unwrap();

    assert_eq!(snapshot(&h).await, snapshot(&fresh).await);
}

#[tokio::test]
async fn reset_clears_folder_state() {
    let h = Harness::new().await;
    for uid in 1..=3 {
        h.server.put(mail(INBOX, uid));
    }
    h.manager.sync_folder(INBOX).await.unwrap();

    h.manager.reset_folder(INBOX).await.unwrap();

    let folder = h.folder(INBOX).await;
    assert_eq!(folder.cursor, None);
    assert_eq!(folder.last_update, None);
    assert_eq!(folder.unread_count, 0);
    assert_eq!(folder.remaining_old_messages_to_fetch, 0);
    assert!(h.threads(INBOX).await.is_empty());
    assert!(h.messages_in(INBOX).await.is_empty());
}

#[tokio::test]
async fn cancelled_manager_stops_syncing() {
    let h = Harness::new().await;
    h.server.put(mail(INBOX, 1));
    h.manager.cancel();

    let err = h.manager.sync_folder(INBOX).await.unwrap_err();
    assert_eq!(err.downcast_ref::<SyncError>(), Some(&SyncError::Cancelled));
    assert!(h.messages_in(INBOX).await.is_empty());
}

#[tokio::test]
async fn added_uid_missing_remotely_is_dropped_from_the_queue() {
    let h = Harness::new().await;
    h.manager.sync_folder(INBOX).await.unwrap();

    h.server.push_delta(INBOX, delta("inbox-d1", vec![9], vec![], vec![]));
    h.manager.sync_folder(INBOX).await.unwrap();

    assert_eq!(h.queue_len(INBOX, Direction::New).await, 0);
    assert!(h.messages_in(INBOX).await.is_empty());
}

#[tokio::test]
async fn failing_delta_is_reported_but_refresh_swallows_it() {
    let h = Harness::new().await;
    h.manager.sync_folder(INBOX).await.unwrap();
    let cursor = h.folder(INBOX).await.cursor;

    h.server.state.lock().unwrap().delta_error = Some(ApiError::Network("timeout".into()));
    let err = h.manager.sync_folder(INBOX).await.unwrap_err();
    assert_eq!(err.downcast_ref::<ApiError>(), Some(&ApiError::Network("timeout".into())));

    h.server.state.lock().unwrap().delta_error = Some(ApiError::Network("timeout".into()));
    h.manager.refresh_folder_content(INBOX).await;
    assert_eq!(h.folder(INBOX).await.cursor, cursor);
}
