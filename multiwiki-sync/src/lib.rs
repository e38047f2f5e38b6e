//! Sync client for MultiWiki recipe servers.
//!
//! A client polls one recipe's change feed, loads changed tiddlers, and
//! writes local edits back:
//! - [`SyncClient`]: the HTTP protocol (poll, load, save, delete)
//! - [`SyncStateStore`]: the watermark and per-title bag/revision records
//! - [`Syncer`]: poll-then-apply cycles against a [`LocalReplica`]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state_store;
pub mod syncer;

pub use client::SyncClient;
pub use config::{SyncConfig, WatermarkPolicy};
pub use error::{SyncError, SyncResult};
pub use protocol::{DeleteOutcome, RemoteInfo, SaveOutcome, ServerStatus, UpdatedTiddlers};
pub use state_store::SyncStateStore;
pub use syncer::{LocalReplica, SyncReport, Syncer};
