use anyhow::{Context, Result};
use dirs::home_dir;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{info, warn};

/// Bump on every schema change.
pub const SCHEMA_VERSION: i64 = 3;
/// Stores older than this lose their synced content on open.
const LAST_BREAKING_VERSION: i64 = 3;

const SYNCED_TABLES: &[&str] = &[
    "thread_refs",
    "thread_messages",
    "threads",
    "messages",
    "folder_queue",
    "folders",
];

/// Ids touched by one committed write transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub folders: BTreeSet<String>,
    pub threads: BTreeSet<String>,
    pub messages: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.threads.is_empty() && self.messages.is_empty()
    }
}

#[derive(Debug)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
    writer: Mutex<()>,
    notifier: broadcast::Sender<ChangeSet>,
}

impl Database {
    /// Opens the store of one (user, mailbox) pair.
    pub async fn open_for_mailbox(data_dir: Option<&Path>, user_id: &str, mailbox_id: &str) -> Result<Self> {
        let base = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating data directory {}", dir.display()))?;
                dir.to_path_buf()
            }
            None => default_data_dir()?,
        };
        let db_path = base.join(format!("{}-{}.sqlite", user_id, mailbox_id));
        Self::open(&db_path).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Self::from_pool(pool, Some(db_path.to_path_buf()));
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory store, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;

        let db = Self::from_pool(pool, None);
        db.migrate().await?;
        Ok(db)
    }

    fn from_pool(pool: SqlitePool, path: Option<PathBuf>) -> Self {
        let (notifier, _) = broadcast::channel(256);
        Self {
            pool,
            path,
            writer: Mutex::new(()),
            notifier,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Connection for reads. Everything loaded through it is an owned snapshot.
    pub async fn read(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.context("acquiring read connection")
    }

    /// Opens the single write transaction. Never hold it across a network call.
    pub async fn write(&self) -> Result<WriteTx<'_>> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await.context("beginning write transaction")?;
        Ok(WriteTx {
            tx,
            _guard: guard,
            changes: ChangeSet::default(),
            notifier: &self.notifier,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.notifier.subscribe()
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self.read().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_meta (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);",
        )
        .execute(&mut *conn)
        .await
        .context("creating schema_meta")?;

        let stored: Option<i64> = sqlx::query("SELECT version FROM schema_meta WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await
            .context("reading schema version")?
            .map(|row| row.get(0));

        if let Some(version) = stored {
            if version < LAST_BREAKING_VERSION {
                warn!(
                    from = version,
                    to = SCHEMA_VERSION,
                    "Breaking schema change, wiping synced content"
                );
                for table in SYNCED_TABLES {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {};", table))
                        .execute(&mut *conn)
                        .await
                        .with_context(|| format!("dropping {}", table))?;
                }
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                role TEXT NOT NULL,
                parent_id TEXT,
                source_folder_id TEXT NOT NULL,
                threading TEXT NOT NULL,
                cursor TEXT,
                last_update INTEGER,
                unread_count INTEGER NOT NULL DEFAULT 0,
                remote_unread_count INTEGER,
                remaining_old_messages_to_fetch INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_folders_role ON folders(role);

            CREATE TABLE IF NOT EXISTS folder_queue (
                folder_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                seq INTEGER NOT NULL,
                short_uid INTEGER NOT NULL,
                PRIMARY KEY (folder_id, direction, short_uid),
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_queue_order ON folder_queue(folder_id, direction, seq);

            CREATE TABLE IF NOT EXISTS messages (
                uid TEXT PRIMARY KEY,
                short_uid INTEGER NOT NULL,
                folder_id TEXT NOT NULL,
                message_id TEXT,
                subject TEXT,
                from_addr TEXT,
                date INTEGER NOT NULL,
                seen INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                answered INTEGER NOT NULL DEFAULT 0,
                forwarded INTEGER NOT NULL DEFAULT 0,
                scheduled INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                snooze_state TEXT,
                snooze_end_date INTEGER,
                snooze_uuid TEXT,
                linked_uids TEXT NOT NULL,
                fully_downloaded INTEGER NOT NULL DEFAULT 0,
                body TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder_id);
            CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id);

            CREATE TABLE IF NOT EXISTS threads (
                uid TEXT PRIMARY KEY,
                folder_id TEXT NOT NULL,
                subject TEXT,
                date INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                unseen_messages INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                answered INTEGER NOT NULL DEFAULT 0,
                forwarded INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                has_drafts INTEGER NOT NULL DEFAULT 0,
                snooze_state TEXT,
                snooze_end_date INTEGER,
                snooze_uuid TEXT,
                moved_out_locally INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_threads_folder_date ON threads(folder_id, date DESC);

            CREATE TABLE IF NOT EXISTS thread_messages (
                thread_uid TEXT NOT NULL,
                message_uid TEXT NOT NULL,
                is_duplicate INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (thread_uid, message_uid),
                FOREIGN KEY (thread_uid) REFERENCES threads(uid) ON DELETE CASCADE,
                FOREIGN KEY (message_uid) REFERENCES messages(uid) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_message ON thread_messages(message_uid);

            CREATE TABLE IF NOT EXISTS thread_refs (
                thread_uid TEXT NOT NULL,
                ref_id TEXT NOT NULL,
                PRIMARY KEY (thread_uid, ref_id),
                FOREIGN KEY (thread_uid) REFERENCES threads(uid) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_thread_refs_ref ON thread_refs(ref_id);

            CREATE TABLE IF NOT EXISTS drafts (
                local_uuid TEXT PRIMARY KEY,
                remote_uuid TEXT NOT NULL DEFAULT '',
                message_uid TEXT,
                action TEXT,
                identity_id TEXT,
                subject TEXT,
                body TEXT,
                date INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_message ON drafts(message_uid);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("running migrations")?;

        sqlx::query(
            r#"
            INSERT INTO schema_meta (id, version) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET version = excluded.version;
            "#,
        )
        .bind(SCHEMA_VERSION)
        .execute(&mut *conn)
        .await
        .context("recording schema version")?;

        if stored != Some(SCHEMA_VERSION) {
            info!(from = ?stored, to = SCHEMA_VERSION, "Store schema migrated");
        }
        Ok(())
    }
}

/// The one open write transaction. Dropping it without `commit` rolls back.
pub struct WriteTx<'a> {
    tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
    changes: ChangeSet,
    notifier: &'a broadcast::Sender<ChangeSet>,
}

impl WriteTx<'_> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub(crate) fn touch_folder(&mut self, id: &str) {
        self.changes.folders.insert(id.to_string());
    }

    pub(crate) fn touch_thread(&mut self, uid: &str) {
        self.changes.threads.insert(uid.to_string());
    }

    pub(crate) fn touch_message(&mut self, uid: &str) {
        self.changes.messages.insert(uid.to_string());
    }

    pub async fn commit(self) -> Result<ChangeSet> {
        let WriteTx {
            tx,
            _guard: guard,
            changes,
            notifier,
        } = self;
        tx.commit().await.context("committing write transaction")?;
        drop(guard);
        if !changes.is_empty() {
            // No subscriber is fine.
            let _ = notifier.send(changes.clone());
        }
        Ok(changes)
    }
}

pub(crate) fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("MAILBOX_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating MAILBOX_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("mailbox-sync");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/mailbox-sync; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("mailbox-sync-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
