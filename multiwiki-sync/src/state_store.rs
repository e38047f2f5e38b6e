//! Persistent client-side sync state.
//!
//! Holds the poll watermark and, per title, the bag and revision the
//! server last reported. A restarted client resumes polling from the
//! stored watermark.

use crate::error::{SyncError, SyncResult};
use crate::protocol::RemoteInfo;
use multiwiki_types::{Revision, TiddlerId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const WATERMARK_KEY: &str = "last_tiddler_id";

/// SQLite-backed store for one client's sync state.
pub struct SyncStateStore {
    conn: Mutex<Connection>,
}

impl SyncStateStore {
    /// Opens (or creates) a state store at the given path.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SyncError::Storage(format!("failed to open sync state: {e}")))?;
        Self::init(conn)
    }

    /// Opens an in-memory state store.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("failed to open in-memory sync state: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS remote_tiddlers (
                title TEXT PRIMARY KEY,
                bag TEXT NOT NULL,
                revision TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("sync state lock poisoned".to_string()))
    }

    // ── Watermark ────────────────────────────────────────────────

    /// The highest tiddler id already polled; zero before the first poll.
    pub fn last_tiddler_id(&self) -> SyncResult<TiddlerId> {
        let conn = self.lock()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(TiddlerId::new(value.unwrap_or(0)))
    }

    /// Moves the watermark to `id` unless it is already at or past it.
    /// Returns the resulting watermark.
    pub fn advance_watermark(&self, id: TiddlerId) -> SyncResult<TiddlerId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![WATERMARK_KEY, id.get()],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            params![WATERMARK_KEY],
            |row| row.get(0),
        )?;
        debug!("Watermark now {}", value);
        Ok(TiddlerId::new(value))
    }

    // ── Per-title records ────────────────────────────────────────

    /// Records where a title lives on the server, replacing any earlier
    /// record unconditionally.
    pub fn set_remote_info(&self, title: &str, bag: &str, revision: &Revision) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO remote_tiddlers (title, bag, revision) VALUES (?1, ?2, ?3)",
            params![title, bag, revision.as_str()],
        )?;
        Ok(())
    }

    pub fn remote_info(&self, title: &str) -> SyncResult<Option<RemoteInfo>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT bag, revision FROM remote_tiddlers WHERE title = ?1",
                params![title],
                |row| {
                    Ok(RemoteInfo {
                        title: title.to_string(),
                        bag: row.get(0)?,
                        revision: Revision::new(row.get::<_, String>(1)?),
                    })
                },
            )
            .optional()?)
    }

    /// Drops the record of a title. Returns false if there was none.
    pub fn remove_remote_info(&self, title: &str) -> SyncResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM remote_tiddlers WHERE title = ?1", params![title])?;
        Ok(removed > 0)
    }

    /// All records, sorted by title.
    pub fn all_remote_info(&self) -> SyncResult<Vec<RemoteInfo>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT title, bag, revision FROM remote_tiddlers ORDER BY title")?;
        let rows = stmt.query_map([], |row| {
            Ok(RemoteInfo {
                title: row.get(0)?,
                bag: row.get(1)?,
                revision: Revision::new(row.get::<_, String>(2)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
