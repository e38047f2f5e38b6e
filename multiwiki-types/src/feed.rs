//! Change-feed entries exchanged between the server and sync clients.

use crate::TiddlerId;
use serde::{Deserialize, Deserializer, Serialize};

/// Response header carrying the revision of an item read or written.
pub const REVISION_HEADER: &str = "X-Revision-Number";

/// Response header carrying the bag an item lives in.
pub const BAG_HEADER: &str = "X-Bag-Name";

/// One title in a recipe's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiddlerInfo {
    /// The tiddler title.
    pub title: String,
    /// Latest row id touching this title; feeds the client watermark.
    pub tiddler_id: TiddlerId,
    /// True when no live copy remains visible through the recipe.
    #[serde(default, deserialize_with = "bool_or_int")]
    pub is_deleted: bool,
}

impl TiddlerInfo {
    /// Creates a feed entry.
    pub fn new(title: impl Into<String>, tiddler_id: TiddlerId, is_deleted: bool) -> Self {
        Self {
            title: title.into(),
            tiddler_id,
            is_deleted,
        }
    }
}

/// SQLite-backed servers emit the flag as 0/1; accept either form.
fn bool_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}
