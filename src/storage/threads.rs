use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::BTreeSet;

use super::messages::message_from_row;
use super::{push_str_list, WriteTx, MAX_BIND};
use crate::types::{Message, SnoozeFlags, SnoozeState, Thread};

const THREAD_COLUMNS: &str = "uid, folder_id, subject, date, message_count, unseen_messages, flagged, answered, \
     forwarded, has_attachments, has_drafts, snooze_state, snooze_end_date, snooze_uuid, moved_out_locally, created_at";

fn thread_from_row(row: &SqliteRow) -> Thread {
    Thread {
        uid: row.get("uid"),
        folder_id: row.get("folder_id"),
        subject: row.get("subject"),
        date: row.get("date"),
        message_count: row.get("message_count"),
        unseen_messages: row.get("unseen_messages"),
        flagged: row.get("flagged"),
        answered: row.get("answered"),
        forwarded: row.get("forwarded"),
        has_attachments: row.get("has_attachments"),
        has_drafts: row.get("has_drafts"),
        snooze: SnoozeFlags {
            state: row
                .get::<Option<String>, _>("snooze_state")
                .as_deref()
                .and_then(SnoozeState::parse),
            end_date: row.get("snooze_end_date"),
            uuid: row.get("snooze_uuid"),
        },
        moved_out_locally: row.get("moved_out_locally"),
        created_at: row.get("created_at"),
    }
}

/// A thread member together with its duplicate marker.
#[derive(Clone, Debug)]
pub struct Member {
    pub message: Message,
    pub is_duplicate: bool,
}

pub async fn load_thread(conn: &mut SqliteConnection, uid: &str) -> Result<Option<Thread>> {
    let row = sqlx::query(&format!("SELECT {} FROM threads WHERE uid = ?1", THREAD_COLUMNS))
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await
        .context("loading thread")?;
    Ok(row.as_ref().map(thread_from_row))
}

pub async fn load_threads(conn: &mut SqliteConnection, uids: &[String]) -> Result<Vec<Thread>> {
    let mut out = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM threads WHERE uid IN ", THREAD_COLUMNS));
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("loading threads by uid")?;
        out.extend(rows.iter().map(thread_from_row));
    }
    Ok(out)
}

/// Threads of a folder, newest first.
pub async fn threads_in_folder(conn: &mut SqliteConnection, folder_id: &str) -> Result<Vec<Thread>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM threads WHERE folder_id = ?1 ORDER BY date DESC, uid ASC",
        THREAD_COLUMNS
    ))
    .bind(folder_id)
    .fetch_all(&mut *conn)
    .await
    .context("loading threads by folder")?;
    Ok(rows.iter().map(thread_from_row).collect())
}

pub async fn members(conn: &mut SqliteConnection, thread_uid: &str) -> Result<Vec<Member>> {
    let rows = sqlx::query(
        r#"
        SELECT m.*, tm.is_duplicate AS member_is_duplicate
        FROM thread_messages tm
        JOIN messages m ON m.uid = tm.message_uid
        WHERE tm.thread_uid = ?1
        ORDER BY m.date ASC, m.uid ASC;
        "#,
    )
    .bind(thread_uid)
    .fetch_all(&mut *conn)
    .await
    .context("loading thread members")?;
    Ok(rows
        .iter()
        .map(|row| Member {
            message: message_from_row(row),
            is_duplicate: row.get("member_is_duplicate"),
        })
        .collect())
}

pub async fn member_uids(conn: &mut SqliteConnection, thread_uid: &str) -> Result<BTreeSet<String>> {
    let rows = sqlx::query("SELECT message_uid FROM thread_messages WHERE thread_uid = ?1")
        .bind(thread_uid)
        .fetch_all(&mut *conn)
        .await
        .context("loading thread member uids")?;
    Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
}

/// Threads (any folder) that contain at least one of `message_uids`.
pub async fn threads_containing(
    conn: &mut SqliteConnection,
    message_uids: &[String],
) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for chunk in message_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT thread_uid FROM thread_messages WHERE message_uid IN ",
        );
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("finding threads by message")?;
        out.extend(rows.iter().map(|r| r.get::<String, _>(0)));
    }
    Ok(out)
}

/// Same as `threads_containing`, restricted to one folder.
pub async fn folder_threads_containing(
    conn: &mut SqliteConnection,
    folder_id: &str,
    message_uids: &[String],
) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for chunk in message_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT tm.thread_uid FROM thread_messages tm JOIN threads t ON t.uid = tm.thread_uid WHERE t.folder_id = ",
        );
        qb.push_bind(folder_id.to_string());
        qb.push(" AND tm.message_uid IN ");
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("finding folder threads by message")?;
        out.extend(rows.iter().map(|r| r.get::<String, _>(0)));
    }
    Ok(out)
}

/// Threads whose reference index intersects `refs`, paired with their folder id.
pub async fn threads_by_refs(
    conn: &mut SqliteConnection,
    refs: &[String],
) -> Result<Vec<(String, String)>> {
    let mut out: Vec<(String, String)> = Vec::new();
    for chunk in refs.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT t.uid, t.folder_id FROM thread_refs r JOIN threads t ON t.uid = r.thread_uid WHERE r.ref_id IN ",
        );
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("finding threads by reference")?;
        for row in rows {
            let pair = (row.get::<String, _>(0), row.get::<String, _>(1));
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
    }
    out.sort();
    Ok(out)
}

pub async fn thread_refs(conn: &mut SqliteConnection, thread_uid: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT ref_id FROM thread_refs WHERE thread_uid = ?1 ORDER BY ref_id")
        .bind(thread_uid)
        .fetch_all(&mut *conn)
        .await
        .context("loading thread refs")?;
    Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
}

pub async fn save_thread(tx: &mut WriteTx<'_>, thread: &Thread) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO threads (uid, folder_id, subject, date, message_count, unseen_messages, flagged, answered,
                             forwarded, has_attachments, has_drafts, snooze_state, snooze_end_date, snooze_uuid,
                             moved_out_locally, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(uid) DO UPDATE SET
            folder_id = excluded.folder_id,
            subject = excluded.subject,
            date = excluded.date,
            message_count = excluded.message_count,
            unseen_messages = excluded.unseen_messages,
            flagged = excluded.flagged,
            answered = excluded.answered,
            forwarded = excluded.forwarded,
            has_attachments = excluded.has_attachments,
            has_drafts = excluded.has_drafts,
            snooze_state = excluded.snooze_state,
            snooze_end_date = excluded.snooze_end_date,
            snooze_uuid = excluded.snooze_uuid,
            moved_out_locally = excluded.moved_out_locally;
        "#,
    )
    .bind(&thread.uid)
    .bind(&thread.folder_id)
    .bind(&thread.subject)
    .bind(thread.date)
    .bind(thread.message_count)
    .bind(thread.unseen_messages)
    .bind(thread.flagged)
    .bind(thread.answered)
    .bind(thread.forwarded)
    .bind(thread.has_attachments)
    .bind(thread.has_drafts)
    .bind(thread.snooze.state.map(|s| s.as_str()))
    .bind(thread.snooze.end_date)
    .bind(&thread.snooze.uuid)
    .bind(thread.moved_out_locally)
    .bind(thread.created_at)
    .execute(tx.conn())
    .await
    .context("upserting thread")?;
    tx.touch_thread(&thread.uid);
    tx.touch_folder(&thread.folder_id);
    Ok(())
}

pub async fn delete_thread(tx: &mut WriteTx<'_>, thread: &Thread) -> Result<()> {
    sqlx::query("DELETE FROM threads WHERE uid = ?1")
        .bind(&thread.uid)
        .execute(tx.conn())
        .await
        .context("deleting thread")?;
    tx.touch_thread(&thread.uid);
    tx.touch_folder(&thread.folder_id);
    Ok(())
}

pub async fn delete_threads_in_folder(tx: &mut WriteTx<'_>, folder_id: &str) -> Result<u64> {
    let uids: Vec<String> = sqlx::query("SELECT uid FROM threads WHERE folder_id = ?1")
        .bind(folder_id)
        .fetch_all(tx.conn())
        .await
        .context("listing folder threads")?
        .iter()
        .map(|r| r.get::<String, _>(0))
        .collect();
    let res = sqlx::query("DELETE FROM threads WHERE folder_id = ?1")
        .bind(folder_id)
        .execute(tx.conn())
        .await
        .context("deleting folder threads")?;
    for uid in &uids {
        tx.touch_thread(uid);
    }
    tx.touch_folder(folder_id);
    Ok(res.rows_affected())
}

pub async fn link_message(
    tx: &mut WriteTx<'_>,
    thread_uid: &str,
    message_uid: &str,
    is_duplicate: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO thread_messages (thread_uid, message_uid, is_duplicate)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(thread_uid, message_uid) DO UPDATE SET is_duplicate = excluded.is_duplicate;
        "#,
    )
    .bind(thread_uid)
    .bind(message_uid)
    .bind(is_duplicate)
    .execute(tx.conn())
    .await
    .context("linking message to thread")?;
    tx.touch_thread(thread_uid);
    Ok(())
}

pub async fn unlink_messages(tx: &mut WriteTx<'_>, thread_uid: &str, message_uids: &[String]) -> Result<u64> {
    let mut removed = 0;
    for chunk in message_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM thread_messages WHERE thread_uid = ");
        qb.push_bind(thread_uid.to_string());
        qb.push(" AND message_uid IN ");
        push_str_list(&mut qb, chunk);
        removed += qb
            .build()
            .execute(tx.conn())
            .await
            .context("unlinking messages from thread")?
            .rows_affected();
    }
    if removed > 0 {
        tx.touch_thread(thread_uid);
    }
    Ok(removed)
}

pub async fn replace_refs(tx: &mut WriteTx<'_>, thread_uid: &str, refs: &BTreeSet<String>) -> Result<()> {
    sqlx::query("DELETE FROM thread_refs WHERE thread_uid = ?1")
        .bind(thread_uid)
        .execute(tx.conn())
        .await
        .context("clearing thread refs")?;
    for ref_id in refs {
        sqlx::query("INSERT OR IGNORE INTO thread_refs (thread_uid, ref_id) VALUES (?1, ?2)")
            .bind(thread_uid)
            .bind(ref_id)
            .execute(tx.conn())
            .await
            .context("indexing thread ref")?;
    }
    Ok(())
}

pub async fn add_refs(tx: &mut WriteTx<'_>, thread_uid: &str, refs: &BTreeSet<String>) -> Result<()> {
    for ref_id in refs {
        sqlx::query("INSERT OR IGNORE INTO thread_refs (thread_uid, ref_id) VALUES (?1, ?2)")
            .bind(thread_uid)
            .bind(ref_id)
            .execute(tx.conn())
            .await
            .context("indexing thread ref")?;
    }
    Ok(())
}

pub async fn set_moved_out_locally(tx: &mut WriteTx<'_>, thread_uids: &[String], moved: bool) -> Result<()> {
    for chunk in thread_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE threads SET moved_out_locally = ");
        qb.push_bind(moved);
        qb.push(" WHERE uid IN ");
        push_str_list(&mut qb, chunk);
        qb.build()
            .execute(tx.conn())
            .await
            .context("flagging threads moved out locally")?;
        for uid in chunk {
            tx.touch_thread(uid);
        }
    }
    Ok(())
}

/// Folder ids owning the given threads.
pub async fn folders_of(conn: &mut SqliteConnection, thread_uids: &[String]) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for chunk in thread_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT DISTINCT folder_id FROM threads WHERE uid IN ");
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("loading thread folders")?;
        out.extend(rows.iter().map(|r| r.get::<String, _>(0)));
    }
    Ok(out)
}

pub async fn count_threads_in_folder(conn: &mut SqliteConnection, folder_id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) FROM threads WHERE folder_id = ?1")
        .bind(folder_id)
        .fetch_one(&mut *conn)
        .await
        .context("counting threads")?;
    Ok(row.get::<i64, _>(0))
}

/// The subset of `message_uids` already linked to a thread of `folder_id`.
pub async fn linked_in_folder(
    conn: &mut SqliteConnection,
    folder_id: &str,
    message_uids: &[String],
) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for chunk in message_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT tm.message_uid FROM thread_messages tm JOIN threads t ON t.uid = tm.thread_uid WHERE t.folder_id = ",
        );
        qb.push_bind(folder_id.to_string());
        qb.push(" AND tm.message_uid IN ");
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("finding messages linked in folder")?;
        out.extend(rows.iter().map(|r| r.get::<String, _>(0)));
    }
    Ok(out)
}
