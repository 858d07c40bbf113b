use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::BTreeSet;

use super::{push_str_list, WriteTx, MAX_BIND};
use crate::types::{now_ts, Message, MessageFlags, ShortUid, SnoozeFlags, SnoozeState};

const MESSAGE_COLUMNS: &str = "uid, short_uid, folder_id, message_id, subject, from_addr, date, seen, flagged, \
     answered, forwarded, scheduled, is_draft, has_attachments, snooze_state, snooze_end_date, snooze_uuid, \
     linked_uids, fully_downloaded, body, created_at, updated_at";

pub(crate) fn message_from_row(row: &SqliteRow) -> Message {
    let linked: BTreeSet<String> =
        serde_json::from_str(&row.get::<String, _>("linked_uids")).unwrap_or_default();
    Message {
        uid: row.get("uid"),
        short_uid: row.get::<i64, _>("short_uid") as ShortUid,
        folder_id: row.get("folder_id"),
        message_id: row.get("message_id"),
        subject: row.get("subject"),
        from: row.get("from_addr"),
        date: row.get("date"),
        flags: MessageFlags {
            seen: row.get("seen"),
            flagged: row.get("flagged"),
            answered: row.get("answered"),
            forwarded: row.get("forwarded"),
            scheduled: row.get("scheduled"),
        },
        is_draft: row.get("is_draft"),
        has_attachments: row.get("has_attachments"),
        snooze: SnoozeFlags {
            state: row
                .get::<Option<String>, _>("snooze_state")
                .as_deref()
                .and_then(SnoozeState::parse),
            end_date: row.get("snooze_end_date"),
            uuid: row.get("snooze_uuid"),
        },
        linked_uids: linked,
        fully_downloaded: row.get("fully_downloaded"),
        body: row.get("body"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn load_message(conn: &mut SqliteConnection, uid: &str) -> Result<Option<Message>> {
    let row = sqlx::query(&format!("SELECT {} FROM messages WHERE uid = ?1", MESSAGE_COLUMNS))
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await
        .context("loading message")?;
    Ok(row.as_ref().map(message_from_row))
}

pub async fn load_messages_in_folder(conn: &mut SqliteConnection, folder_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM messages WHERE folder_id = ?1 ORDER BY date DESC, uid ASC",
        MESSAGE_COLUMNS
    ))
    .bind(folder_id)
    .fetch_all(&mut *conn)
    .await
    .context("loading messages by folder")?;
    Ok(rows.iter().map(message_from_row).collect())
}

/// Other copies of the same logical message (same Message-ID, different uid).
pub async fn load_duplicates(conn: &mut SqliteConnection, message: &Message) -> Result<Vec<Message>> {
    let Some(message_id) = message.message_id.as_deref() else {
        return Ok(Vec::new());
    };
    let rows = sqlx::query(&format!(
        "SELECT {} FROM messages WHERE message_id = ?1 AND uid != ?2",
        MESSAGE_COLUMNS
    ))
    .bind(message_id)
    .bind(&message.uid)
    .fetch_all(&mut *conn)
    .await
    .context("loading duplicate messages")?;
    Ok(rows.iter().map(message_from_row).collect())
}

pub async fn search_messages(conn: &mut SqliteConnection, text: &str, limit: usize) -> Result<Vec<Message>> {
    let pattern = format!("%{}%", text.replace('%', "\\%").replace('_', "\\_"));
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM messages
        WHERE subject LIKE ?1 ESCAPE '\' OR from_addr LIKE ?1 ESCAPE '\'
        ORDER BY date DESC
        LIMIT ?2
        "#,
        MESSAGE_COLUMNS
    ))
    .bind(pattern)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await
    .context("searching messages")?;
    Ok(rows.iter().map(message_from_row).collect())
}

pub async fn upsert_message(tx: &mut WriteTx<'_>, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (
            uid, short_uid, folder_id, message_id, subject, from_addr, date,
            seen, flagged, answered, forwarded, scheduled, is_draft, has_attachments,
            snooze_state, snooze_end_date, snooze_uuid, linked_uids, fully_downloaded, body,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
        ON CONFLICT(uid) DO UPDATE SET
            short_uid = excluded.short_uid,
            folder_id = excluded.folder_id,
            message_id = excluded.message_id,
            subject = excluded.subject,
            from_addr = excluded.from_addr,
            date = excluded.date,
            seen = excluded.seen,
            flagged = excluded.flagged,
            answered = excluded.answered,
            forwarded = excluded.forwarded,
            scheduled = excluded.scheduled,
            is_draft = excluded.is_draft,
            has_attachments = excluded.has_attachments,
            snooze_state = excluded.snooze_state,
            snooze_end_date = excluded.snooze_end_date,
            snooze_uuid = excluded.snooze_uuid,
            linked_uids = excluded.linked_uids,
            fully_downloaded = excluded.fully_downloaded,
            body = excluded.body,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(&message.uid)
    .bind(message.short_uid as i64)
    .bind(&message.folder_id)
    .bind(&message.message_id)
    .bind(&message.subject)
    .bind(&message.from)
    .bind(message.date)
    .bind(message.flags.seen)
    .bind(message.flags.flagged)
    .bind(message.flags.answered)
    .bind(message.flags.forwarded)
    .bind(message.flags.scheduled)
    .bind(message.is_draft)
    .bind(message.has_attachments)
    .bind(message.snooze.state.map(|s| s.as_str()))
    .bind(message.snooze.end_date)
    .bind(&message.snooze.uuid)
    .bind(serde_json::to_string(&message.linked_uids).unwrap_or_else(|_| "[]".into()))
    .bind(message.fully_downloaded)
    .bind(&message.body)
    .bind(message.created_at)
    .bind(now_ts())
    .execute(tx.conn())
    .await
    .context("upserting message")?;
    tx.touch_message(&message.uid);
    Ok(())
}

pub async fn delete_messages(tx: &mut WriteTx<'_>, uids: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for chunk in uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM messages WHERE uid IN ");
        push_str_list(&mut qb, chunk);
        deleted += qb
            .build()
            .execute(tx.conn())
            .await
            .context("deleting messages")?
            .rows_affected();
        for uid in chunk {
            tx.touch_message(uid);
        }
    }
    Ok(deleted)
}

pub async fn message_uids_in_folder(conn: &mut SqliteConnection, folder_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT uid FROM messages WHERE folder_id = ?1")
        .bind(folder_id)
        .fetch_all(&mut *conn)
        .await
        .context("listing message uids by folder")?;
    Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
}

/// Deletes messages that no thread references anymore.
pub async fn purge_orphans(tx: &mut WriteTx<'_>) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        SELECT uid FROM messages
        WHERE NOT EXISTS (SELECT 1 FROM thread_messages tm WHERE tm.message_uid = messages.uid);
        "#,
    )
    .fetch_all(tx.conn())
    .await
    .context("finding orphan messages")?;
    let orphans: Vec<String> = rows.iter().map(|r| r.get::<String, _>(0)).collect();
    if orphans.is_empty() {
        return Ok(0);
    }
    delete_messages(tx, &orphans).await
}

