use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use super::{push_str_list, WriteTx, MAX_BIND};
use crate::types::{Draft, DraftAction};

fn draft_from_row(row: &SqliteRow) -> Draft {
    Draft {
        local_uuid: row.get("local_uuid"),
        remote_uuid: row.get("remote_uuid"),
        message_uid: row.get("message_uid"),
        action: row
            .get::<Option<String>, _>("action")
            .as_deref()
            .and_then(DraftAction::parse),
        identity_id: row.get("identity_id"),
        subject: row.get("subject"),
        body: row.get("body"),
        date: row.get("date"),
    }
}

pub async fn save_draft(tx: &mut WriteTx<'_>, draft: &Draft) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO drafts (local_uuid, remote_uuid, message_uid, action, identity_id, subject, body, date)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(local_uuid) DO UPDATE SET
            remote_uuid = excluded.remote_uuid,
            message_uid = excluded.message_uid,
            action = excluded.action,
            identity_id = excluded.identity_id,
            subject = excluded.subject,
            body = excluded.body,
            date = excluded.date;
        "#,
    )
    .bind(&draft.local_uuid)
    .bind(&draft.remote_uuid)
    .bind(&draft.message_uid)
    .bind(draft.action.map(|a| a.as_str()))
    .bind(&draft.identity_id)
    .bind(&draft.subject)
    .bind(&draft.body)
    .bind(draft.date)
    .execute(tx.conn())
    .await
    .context("upserting draft")?;
    Ok(())
}

pub async fn load_draft(conn: &mut SqliteConnection, local_uuid: &str) -> Result<Option<Draft>> {
    let row = sqlx::query("SELECT * FROM drafts WHERE local_uuid = ?1")
        .bind(local_uuid)
        .fetch_optional(&mut *conn)
        .await
        .context("loading draft")?;
    Ok(row.as_ref().map(draft_from_row))
}

pub async fn drafts_for_messages(conn: &mut SqliteConnection, message_uids: &[String]) -> Result<Vec<Draft>> {
    let mut out = Vec::new();
    for chunk in message_uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM drafts WHERE message_uid IN ");
        push_str_list(&mut qb, chunk);
        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .context("loading drafts by message")?;
        out.extend(rows.iter().map(draft_from_row));
    }
    Ok(out)
}

pub async fn delete_draft(tx: &mut WriteTx<'_>, local_uuid: &str) -> Result<()> {
    sqlx::query("DELETE FROM drafts WHERE local_uuid = ?1")
        .bind(local_uuid)
        .execute(tx.conn())
        .await
        .context("deleting draft")?;
    Ok(())
}
