//! Wire-level types of the recipe sync protocol.
//!
//! Paths, all relative to the configured host:
//! - `GET recipes/{recipe}/tiddlers.json?last_known_tiddler_id=&include_deleted=true`
//! - `GET|PUT recipes/{recipe}/tiddlers/{title}`
//! - `DELETE bags/{bag}/tiddlers/{title}`
//!
//! Item reads and writes carry the winning bag and the revision in the
//! response headers below.

use multiwiki_types::{Revision, TiddlerId, TiddlerInfo};
use serde::{Deserialize, Serialize};

pub use multiwiki_types::{BAG_HEADER, REVISION_HEADER};

/// Query parameter carrying the poll watermark.
pub const LAST_KNOWN_PARAM: &str = "last_known_tiddler_id";

/// Query parameter asking for deletions to be reported.
pub const INCLUDE_DELETED_PARAM: &str = "include_deleted";

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatedTiddlers {
    /// Titles with a new live copy, in feed order.
    pub modifications: Vec<String>,
    /// Titles with nothing visible any more, in feed order.
    pub deletions: Vec<String>,
    /// Highest tiddler id seen, or the previous watermark if none is higher.
    pub last_tiddler_id: TiddlerId,
}

impl UpdatedTiddlers {
    /// Splits a change feed received for watermark `since`.
    pub fn from_feed(since: TiddlerId, feed: &[TiddlerInfo]) -> Self {
        let mut updates = Self {
            last_tiddler_id: since,
            ..Self::default()
        };
        for info in feed {
            updates.last_tiddler_id = updates.last_tiddler_id.max(info.tiddler_id);
            if info.is_deleted {
                updates.deletions.push(info.title.clone());
            } else {
                updates.modifications.push(info.title.clone());
            }
        }
        updates
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.deletions.is_empty()
    }
}

/// The server-side identity of a tiddler as last seen by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub title: String,
    pub bag: String,
    pub revision: Revision,
}

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The server stored the tiddler.
    Saved { bag: String, revision: Revision },
    /// Read-only client; nothing was sent.
    Skipped,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The server deleted the tiddler.
    Deleted,
    /// No bag is recorded for the title, so the server never had it.
    NotOnServer,
    /// Read-only client; nothing was sent.
    Skipped,
}

/// Connection status as reported to the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub logged_in: bool,
    pub username: Option<String>,
    pub read_only: bool,
    pub anonymous: bool,
}
