//! SQLite-backed object store: folders, queues, messages, threads and drafts.
//!
//! Reads take any `&mut SqliteConnection` (a pooled read connection or the
//! open write transaction); writes take the `WriteTx` so touched ids end up
//! in the committed `ChangeSet`.

mod db;
pub mod drafts;
pub mod folders;
pub mod messages;
pub mod threads;

pub use db::{ChangeSet, Database, WriteTx, SCHEMA_VERSION};

use sqlx::{QueryBuilder, Sqlite};

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
pub(crate) const MAX_BIND: usize = 500;

pub(crate) fn push_str_list(qb: &mut QueryBuilder<'_, Sqlite>, items: &[String]) {
    qb.push("(");
    {
        let mut separated = qb.separated(", ");
        for item in items {
            separated.push_bind(item.clone());
        }
    }
    qb.push(")");
}

pub(crate) fn push_uid_list(qb: &mut QueryBuilder<'_, Sqlite>, uids: &[u32]) {
    qb.push("(");
    {
        let mut separated = qb.separated(", ");
        for uid in uids {
            separated.push_bind(*uid as i64);
        }
    }
    qb.push(")");
}
