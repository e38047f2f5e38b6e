//! SQLite storage layer for MultiWiki.
//!
//! Provides layered tiddler storage: the same title may exist in several
//! layers, and an ordered layer list decides which copy is visible.
//!
//! # Architecture
//!
//! - [`BagStore`]: layers are bags, layer lists are recipes
//! - [`ShadowStore`]: layers are plugins ordered by priority, under a single
//!   user layer that always wins
//! - [`ResolutionEngine`]: keeps each list's materialized title index in step
//!   with every write, delete and reordering, inside the same transaction

mod bag_store;
mod error;
mod layer;
mod resolution;
mod shadow_store;

pub use bag_store::{BagInfo, BagStore, SavedTiddler, StoredTiddler};
pub use error::{StorageError, StorageResult};
pub use layer::LayerStore;
pub use resolution::{Rank, ResolutionEngine, ResolutionIndex, winner};
pub use shadow_store::{ShadowLayer, ShadowStore};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Opens a SQLite database file with WAL journaling and foreign keys on,
/// creating missing parent directories.
pub(crate) fn open_connection(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(conn)
}

/// Opens a private in-memory database with foreign keys on.
pub(crate) fn open_memory_connection() -> StorageResult<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Locks the shared connection.
pub(crate) fn lock(conn: &Mutex<Connection>) -> StorageResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StorageError::LockPoisoned)
}
