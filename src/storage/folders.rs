use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use super::{push_uid_list, WriteTx, MAX_BIND};
use crate::types::{now_ts, Direction, Folder, FolderRole, ShortUid, ThreadingPolicy};

const FOLDER_COLUMNS: &str = "id, name, path, role, parent_id, source_folder_id, threading, cursor, last_update, \
     unread_count, remote_unread_count, remaining_old_messages_to_fetch, created_at, updated_at";

fn folder_from_row(row: &SqliteRow) -> Folder {
    Folder {
        id: row.get("id"),
        name: row.get("name"),
        path: row.get("path"),
        role: row
            .get::<String, _>("role")
            .parse()
            .unwrap_or(FolderRole::Unknown),
        parent_id: row.get("parent_id"),
        source_folder_id: row.get("source_folder_id"),
        threading: ThreadingPolicy::parse(&row.get::<String, _>("threading")),
        cursor: row.get("cursor"),
        last_update: row.get("last_update"),
        unread_count: row.get("unread_count"),
        remote_unread_count: row.get("remote_unread_count"),
        remaining_old_messages_to_fetch: row.get("remaining_old_messages_to_fetch"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn load_folder(conn: &mut SqliteConnection, id: &str) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .context("loading folder")?;
    Ok(row.as_ref().map(folder_from_row))
}

pub async fn load_folders(conn: &mut SqliteConnection) -> Result<Vec<Folder>> {
    let rows = sqlx::query(&format!("SELECT {} FROM folders ORDER BY path ASC", FOLDER_COLUMNS))
        .fetch_all(&mut *conn)
        .await
        .context("loading folders")?;
    Ok(rows.iter().map(folder_from_row).collect())
}

pub async fn load_folder_by_role(
    conn: &mut SqliteConnection,
    role: FolderRole,
) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM folders WHERE role = ?1 ORDER BY created_at ASC LIMIT 1",
        FOLDER_COLUMNS
    ))
    .bind(role.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("loading folder by role")?;
    Ok(row.as_ref().map(folder_from_row))
}

pub async fn save_folder(tx: &mut WriteTx<'_>, folder: &Folder) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO folders (id, name, path, role, parent_id, source_folder_id, threading, cursor, last_update,
                             unread_count, remote_unread_count, remaining_old_messages_to_fetch, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            path = excluded.path,
            role = excluded.role,
            parent_id = excluded.parent_id,
            source_folder_id = excluded.source_folder_id,
            threading = excluded.threading,
            cursor = excluded.cursor,
            last_update = excluded.last_update,
            unread_count = excluded.unread_count,
            remote_unread_count = excluded.remote_unread_count,
            remaining_old_messages_to_fetch = excluded.remaining_old_messages_to_fetch,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(&folder.id)
    .bind(&folder.name)
    .bind(&folder.path)
    .bind(folder.role.as_str())
    .bind(&folder.parent_id)
    .bind(&folder.source_folder_id)
    .bind(folder.threading.as_str())
    .bind(&folder.cursor)
    .bind(folder.last_update)
    .bind(folder.unread_count)
    .bind(folder.remote_unread_count)
    .bind(folder.remaining_old_messages_to_fetch)
    .bind(folder.created_at)
    .bind(now_ts())
    .execute(tx.conn())
    .await
    .context("upserting folder")?;
    tx.touch_folder(&folder.id);
    Ok(())
}

pub async fn set_unread_count(tx: &mut WriteTx<'_>, folder_id: &str, unread: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE folders SET unread_count = ?1, updated_at = ?2 WHERE id = ?3 AND unread_count != ?1",
    )
    .bind(unread)
    .bind(now_ts())
    .bind(folder_id)
    .execute(tx.conn())
    .await
    .context("updating folder unread count")?;
    let changed = res.rows_affected() > 0;
    if changed {
        tx.touch_folder(folder_id);
    }
    Ok(changed)
}

pub async fn delete_folder(tx: &mut WriteTx<'_>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM folders WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await
        .context("deleting folder")?;
    tx.touch_folder(id);
    Ok(())
}

/// First `limit` UIDs of a queue, in FIFO order.
pub async fn queue_front(
    conn: &mut SqliteConnection,
    folder_id: &str,
    direction: Direction,
    limit: usize,
) -> Result<Vec<ShortUid>> {
    let rows = sqlx::query(
        r#"
        SELECT short_uid FROM folder_queue
        WHERE folder_id = ?1 AND direction = ?2
        ORDER BY seq ASC
        LIMIT ?3;
        "#,
    )
    .bind(folder_id)
    .bind(direction.as_str())
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await
    .context("reading fetch queue")?;
    Ok(rows.iter().map(|r| r.get::<i64, _>(0) as ShortUid).collect())
}

pub async fn queue_len(conn: &mut SqliteConnection, folder_id: &str, direction: Direction) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) FROM folder_queue WHERE folder_id = ?1 AND direction = ?2")
        .bind(folder_id)
        .bind(direction.as_str())
        .fetch_one(&mut *conn)
        .await
        .context("counting fetch queue")?;
    Ok(row.get::<i64, _>(0))
}

/// Appends UIDs at the back; UIDs already queued in that direction keep their place.
pub async fn queue_append(
    tx: &mut WriteTx<'_>,
    folder_id: &str,
    direction: Direction,
    uids: &[ShortUid],
) -> Result<usize> {
    if uids.is_empty() {
        return Ok(0);
    }

    let row = sqlx::query(
        "SELECT COALESCE(MAX(seq), 0) FROM folder_queue WHERE folder_id = ?1 AND direction = ?2",
    )
    .bind(folder_id)
    .bind(direction.as_str())
    .fetch_one(tx.conn())
    .await
    .context("reading queue tail")?;
    let mut seq: i64 = row.get(0);

    let mut inserted = 0usize;
    for uid in uids {
        seq += 1;
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO folder_queue (folder_id, direction, seq, short_uid)
            VALUES (?1, ?2, ?3, ?4);
            "#,
        )
        .bind(folder_id)
        .bind(direction.as_str())
        .bind(seq)
        .bind(*uid as i64)
        .execute(tx.conn())
        .await
        .context("appending to fetch queue")?;
        inserted += res.rows_affected() as usize;
    }
    tx.touch_folder(folder_id);
    Ok(inserted)
}

pub async fn queue_replace(
    tx: &mut WriteTx<'_>,
    folder_id: &str,
    direction: Direction,
    uids: &[ShortUid],
) -> Result<()> {
    sqlx::query("DELETE FROM folder_queue WHERE folder_id = ?1 AND direction = ?2")
        .bind(folder_id)
        .bind(direction.as_str())
        .execute(tx.conn())
        .await
        .context("clearing fetch queue")?;
    queue_append(tx, folder_id, direction, uids).await?;
    Ok(())
}

/// Removes UIDs from the queue(s) of a folder; `None` means both directions.
pub async fn queue_remove(
    tx: &mut WriteTx<'_>,
    folder_id: &str,
    direction: Option<Direction>,
    uids: &[ShortUid],
) -> Result<u64> {
    let mut removed = 0;
    for chunk in uids.chunks(MAX_BIND) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM folder_queue WHERE folder_id = ");
        qb.push_bind(folder_id.to_string());
        if let Some(direction) = direction {
            qb.push(" AND direction = ");
            qb.push_bind(direction.as_str());
        }
        qb.push(" AND short_uid IN ");
        push_uid_list(&mut qb, chunk);

        removed += qb
            .build()
            .execute(tx.conn())
            .await
            .context("removing uids from fetch queue")?
            .rows_affected();
    }
    if removed > 0 {
        tx.touch_folder(folder_id);
    }
    Ok(removed)
}

pub async fn queue_clear(tx: &mut WriteTx<'_>, folder_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM folder_queue WHERE folder_id = ?1")
        .bind(folder_id)
        .execute(tx.conn())
        .await
        .context("clearing fetch queues")?;
    tx.touch_folder(folder_id);
    Ok(())
}
