mod common;

use std::sync::atomic::Ordering;

use common::*;
use mailbox_sync::errors::ApiError;
use mailbox_sync::types::{Message, SnoozeState};
use mailbox_sync::MailAction;

async fn synced_inbox(h: &Harness, count: u32) -> Vec<Message> {
    for uid in 1..=count {
        h.server.put(mail(INBOX, uid));
    }
    h.manager.sync_folder(INBOX).await.unwrap();
    let mut list = h.messages_in(INBOX).await;
    list.sort_by_key(|m| m.short_uid);
    list
}

#[tokio::test]
async fn rejected_chunk_is_rolled_back_alone() {
    let mut settings = settings();
    settings.api_batch_size = 2;
    let h = Harness::with_settings(settings).await;
    let selected = synced_inbox(&h, 6).await;
    h.server.fail_call(1);

    let undo = h.manager.perform_action(&selected, MailAction::Star, INBOX).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(undo.failed_chunks, 1);
    assert_eq!(undo.undo_resources, vec!["undo-0", "undo-2"]);

    let calls = h.server.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.name == "star" && c.ids.len() == 2));
    let rejected = &calls[1].ids;
    for message in h.messages_in(INBOX).await {
        assert_eq!(message.flags.flagged, !rejected.contains(&message.uid), "{}", message.uid);
    }
    let starred = h.threads(INBOX).await.into_iter().filter(|t| t.flagged).count();
    assert_eq!(starred, 4);
}

#[tokio::test]
async fn action_failing_everywhere_returns_the_error() {
    let h = Harness::new().await;
    let selected = synced_inbox(&h, 3).await;
    h.server.fail_call(0);

    let err = h
        .manager
        .perform_action(&selected, MailAction::MarkSeen, INBOX)
        .await
        .unwrap_err();
    h.manager.wait_for_background_tasks().await;

    assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Server { .. })));
    assert!(h.messages_in(INBOX).await.iter().all(|m| !m.flags.seen));
    assert_eq!(h.folder(INBOX).await.unread_count, 3);
}

#[tokio::test]
async fn move_hides_threads_until_the_server_catches_up() {
    let h = Harness::new().await;
    let selected = synced_inbox(&h, 3).await;
    assert_eq!(h.folder(INBOX).await.unread_count, 3);

    let moved = &selected[..2];
    let undo = h
        .manager
        .perform_action(
            moved,
            MailAction::Move {
                destination_id: ARCHIVE.into(),
            },
            INBOX,
        )
        .await
        .unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(h.folder(INBOX).await.unread_count, 1);
    let hidden: Vec<_> = h
        .threads(INBOX)
        .await
        .into_iter()
        .filter(|t| t.moved_out_locally)
        .collect();
    assert_eq!(hidden.len(), 2);
    assert_eq!(undo.undo_resources, vec!["undo-0"]);
    assert_eq!(undo.affected_folders, vec![INBOX.to_string(), ARCHIVE.to_string()]);
    assert_eq!(h.server.calls()[0].name, "move");

    assert!(h.manager.undo(&undo).await.unwrap());
    assert_eq!(h.server.state.lock().unwrap().undone, vec!["undo-0"]);
}

#[tokio::test]
async fn refused_undo_is_reported() {
    let h = Harness::new().await;
    let selected = synced_inbox(&h, 1).await;
    let undo = h
        .manager
        .perform_action(&selected, MailAction::ReportSpam, INBOX)
        .await
        .unwrap();
    h.manager.wait_for_background_tasks().await;
    h.server
        .state
        .lock()
        .unwrap()
        .refused_undo
        .insert(undo.undo_resources[0].clone());

    assert!(!h.manager.undo(&undo).await.unwrap());
    assert!(!h.manager.undo(&Default::default()).await.unwrap());
}

#[tokio::test]
async fn failed_move_shows_the_threads_again() {
    let h = Harness::new().await;
    let selected = synced_inbox(&h, 3).await;
    h.server.fail_call(0);

    let result = h
        .manager
        .perform_action(
            &selected,
            MailAction::Move {
                destination_id: ARCHIVE.into(),
            },
            INBOX,
        )
        .await;
    h.manager.wait_for_background_tasks().await;

    assert!(result.is_err());
    assert!(h.threads(INBOX).await.iter().all(|t| !t.moved_out_locally));
    assert_eq!(h.folder(INBOX).await.unread_count, 3);
}

#[tokio::test]
async fn delete_moves_to_trash_unless_already_there() {
    let h = Harness::new().await;
    let inbox = synced_inbox(&h, 1).await;
    h.server.put(mail(TRASH, 1));
    h.manager.sync_folder(TRASH).await.unwrap();
    let trash = h.messages_in(TRASH).await;

    let from_inbox = h.manager.perform_action(&inbox, MailAction::Delete, INBOX).await.unwrap();
    let from_trash = h.manager.perform_action(&trash, MailAction::Delete, TRASH).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    let calls = h.server.calls();
    assert_eq!(calls[0].name, "move");
    assert_eq!(calls[1].name, "delete");
    assert!(from_inbox.is_undoable());
    assert!(from_inbox.affected_folders.contains(&TRASH.to_string()));
    assert!(!from_trash.is_undoable());
    assert_eq!(from_trash.affected_folders, vec![TRASH.to_string()]);
}

#[tokio::test]
async fn unsnoozing_an_already_awake_message_succeeds() {
    let h = Harness::new().await;
    h.server.put(snoozed(mail(INBOX, 1), "snooze-1"));
    h.manager.sync_folder(INBOX).await.unwrap();
    let selected = h.messages_in(INBOX).await;
    assert!(selected[0].is_snoozed());
    h.server.state.lock().unwrap().delete_snooze_error = Some(ApiError::MessageNotSnoozed);

    let undo = h.manager.perform_action(&selected, MailAction::Unsnooze, INBOX).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(undo.failed_chunks, 0);
    assert_eq!(h.server.calls()[0].ids, vec!["snooze-1"]);
    let message = h.message("1@inbox").await.unwrap();
    assert_eq!(message.snooze.state, None);
}

#[tokio::test]
async fn inbox_and_snoozed_counters_stay_consistent() {
    let h = Harness::new().await;
    h.server.put(mail(INBOX, 1));
    h.server.put(snoozed(mail(INBOX, 2), "snooze-2"));
    h.manager.sync_folder(INBOX).await.unwrap();
    h.manager.sync_folder(SNOOZED).await.unwrap();

    assert_eq!(h.folder(INBOX).await.unread_count, 1);
    assert_eq!(h.folder(SNOOZED).await.unread_count, 1);
    let snoozed_threads = h.threads(SNOOZED).await;
    assert_eq!(snoozed_threads.len(), 1);
    assert_eq!(snoozed_threads[0].snooze.state, Some(SnoozeState::Snoozed));

    let target = vec![h.message("2@inbox").await.unwrap()];
    h.manager.perform_action(&target, MailAction::MarkSeen, SNOOZED).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(h.folder(SNOOZED).await.unread_count, 0);
    assert_eq!(h.folder(INBOX).await.unread_count, 1);

    let awake = vec![h.message("1@inbox").await.unwrap()];
    h.manager.perform_action(&awake, MailAction::MarkSeen, INBOX).await.unwrap();
    h.manager.wait_for_background_tasks().await;
    assert_eq!(h.folder(INBOX).await.unread_count, 0);
}

#[tokio::test]
async fn new_mail_wakes_a_snoozed_conversation() {
    let mut settings = settings();
    settings.unsnooze_concurrency = 2;
    let h = Harness::with_settings(settings).await;
    for uid in 1..=6 {
        let id = format!("s{}", uid);
        let refs: &[&str] = if uid == 1 { &[] } else { &["s1"] };
        h.server
            .put(snoozed(conversation_mail(INBOX, uid, &id, refs), &format!("snooze-{}", uid)));
    }
    h.manager.sync_folder(INBOX).await.unwrap();
    assert!(h.server.calls().is_empty());
    assert_eq!(h.threads(INBOX).await.len(), 1);

    h.server.put(conversation_mail(INBOX, 7, "s7", &["s1"]));
    h.server.push_delta(INBOX, delta("inbox-d1", vec![7], vec![], vec![]));
    h.manager.sync_folder(INBOX).await.unwrap();

    let calls = h.server.calls();
    assert_eq!(calls.len(), 6);
    assert!(calls.iter().all(|c| c.name == "delete_snooze"));
    let max = h.server.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "max in flight {}", max);

    assert!(h.messages_in(INBOX).await.iter().all(|m| !m.is_snoozed()));
    let thread = &h.threads(INBOX).await[0];
    assert_eq!(thread.message_count, 7);
    assert_eq!(thread.snooze.state, None);
}

#[tokio::test]
async fn thread_stays_hidden_while_part_of_it_moved() {
    let mut settings = settings();
    settings.api_batch_size = 1;
    let h = Harness::with_settings(settings).await;
    h.server.put(conversation_mail(INBOX, 1, "h1", &[]));
    h.server.put(conversation_mail(INBOX, 2, "h2", &["h1"]));
    h.manager.sync_folder(INBOX).await.unwrap();
    let mut selected = h.messages_in(INBOX).await;
    selected.sort_by_key(|m| m.short_uid);
    h.server.fail_call(1);

    let undo = h
        .manager
        .perform_action(
            &selected,
            MailAction::Move {
                destination_id: ARCHIVE.into(),
            },
            INBOX,
        )
        .await
        .unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(undo.failed_chunks, 1);
    assert_eq!(h.server.calls()[0].ids, vec!["1@inbox"]);
    let threads = h.threads(INBOX).await;
    assert_eq!(threads.len(), 1);
    assert!(threads[0].moved_out_locally);
    assert_eq!(h.folder(INBOX).await.unread_count, 0);
}
