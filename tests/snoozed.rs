mod common;

use common::*;
use mailbox_sync::remote::{DeltaResponse, FlagUpdate};
use mailbox_sync::types::{ShortUid, SnoozeFlags, SnoozeState};

fn snooze_delta(cursor: &str, updated: Vec<(ShortUid, SnoozeFlags)>, deleted: Vec<ShortUid>) -> DeltaResponse<SnoozeFlags> {
    DeltaResponse {
        added: Vec::new(),
        updated: updated
            .into_iter()
            .map(|(short_uid, flags)| FlagUpdate { short_uid, flags })
            .collect(),
        deleted,
        cursor: cursor.to_string(),
        unread_count: None,
    }
}

fn snoozed_until(end_date: i64, uuid: &str) -> SnoozeFlags {
    SnoozeFlags {
        state: Some(SnoozeState::Snoozed),
        end_date: Some(end_date),
        uuid: Some(uuid.to_string()),
    }
}

#[tokio::test]
async fn view_thread_goes_away_with_its_last_snoozed_message() {
    let h = Harness::new().await;
    h.server.put(conversation_mail(INBOX, 1, "root", &[]));
    h.server.put(snoozed(conversation_mail(INBOX, 2, "reply", &["root"]), "snooze-2"));
    h.manager.sync_folder(INBOX).await.unwrap();
    h.manager.sync_folder(SNOOZED).await.unwrap();

    assert_eq!(h.threads(SNOOZED).await.len(), 1);
    assert!(h.folder(SNOOZED).await.unread_count > 0);

    h.server
        .push_snoozed_delta(SNOOZED, snooze_delta("snoozed-d1", vec![], vec![2]));
    h.manager.sync_folder(SNOOZED).await.unwrap();

    assert!(h.threads(SNOOZED).await.is_empty());
    assert_eq!(h.folder(SNOOZED).await.unread_count, 0);
    // The view never owned the message.
    assert!(h.message("2@inbox").await.is_some());
    let inbox = h.threads(INBOX).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].message_count, 2);
}

#[tokio::test]
async fn snooze_updates_flow_into_both_folders() {
    let h = Harness::new().await;
    h.server.put(snoozed(mail(INBOX, 1), "snooze-1"));
    h.manager.sync_folder(INBOX).await.unwrap();
    h.manager.sync_folder(SNOOZED).await.unwrap();
    assert_eq!(h.folder(INBOX).await.unread_count, 0);
    assert_eq!(h.folder(SNOOZED).await.unread_count, 1);

    h.server.push_snoozed_delta(
        SNOOZED,
        snooze_delta("snoozed-d1", vec![(1, snoozed_until(1_950_000_000, "snooze-1"))], vec![]),
    );
    h.manager.sync_folder(SNOOZED).await.unwrap();

    let message = h.message("1@inbox").await.unwrap();
    assert_eq!(message.snooze.end_date, Some(1_950_000_000));
    let view = h.threads(SNOOZED).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].snooze.end_date, Some(1_950_000_000));
    assert_eq!(h.folder(SNOOZED).await.cursor.as_deref(), Some("snoozed-d1"));

    h.server
        .push_snoozed_delta(SNOOZED, snooze_delta("snoozed-d2", vec![(1, SnoozeFlags::default())], vec![]));
    h.manager.sync_folder(SNOOZED).await.unwrap();

    assert!(!h.message("1@inbox").await.unwrap().is_snoozed());
    assert!(h.threads(SNOOZED).await.is_empty());
    assert_eq!(h.folder(SNOOZED).await.unread_count, 0);
    assert_eq!(h.folder(INBOX).await.unread_count, 1);
    assert_eq!(h.threads(INBOX).await[0].snooze.state, None);
}

#[tokio::test]
async fn inbox_resync_rebuilds_the_snoozed_view() {
    let h = Harness::new().await;
    h.server.put(snoozed(mail(INBOX, 1), "snooze-1"));
    h.manager.sync_folder(INBOX).await.unwrap();
    h.manager.sync_folder(SNOOZED).await.unwrap();
    let stale_cursor = h.folder(SNOOZED).await.cursor;
    assert!(stale_cursor.is_some());

    h.server.invalidate_cursor(INBOX);
    h.manager.sync_folder(INBOX).await.unwrap();

    let view = h.folder(SNOOZED).await;
    assert_eq!(view.cursor, None);
    assert_eq!(view.unread_count, 0);
    assert!(h.threads(SNOOZED).await.is_empty());

    h.manager.sync_folder(SNOOZED).await.unwrap();

    let view = h.folder(SNOOZED).await;
    assert!(view.cursor.is_some());
    assert_ne!(view.cursor, stale_cursor);
    assert_eq!(h.threads(SNOOZED).await.len(), 1);
    assert_eq!(view.unread_count, 1);
    assert_eq!(h.threads(INBOX).await.len(), 1);
}
