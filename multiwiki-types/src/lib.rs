//! Core type definitions for MultiWiki.
//!
//! This crate defines the storage-agnostic types shared by the store, the
//! sync client and the server:
//! - `Tiddler`: a titled item with an open map of string fields
//! - `TiddlerId`, `LayerId`: database-assigned identifiers
//! - `Revision`: the opaque revision token handed out by the server
//! - `TiddlerInfo`: one entry of a recipe's change feed
//! - TiddlyWiki string-list parsing (`tags`, `list` fields)

mod feed;
mod ids;
mod list;
mod tiddler;

pub use feed::{BAG_HEADER, REVISION_HEADER, TiddlerInfo};
pub use ids::{LayerId, Revision, TiddlerId};
pub use list::{parse_string_array, stringify_list};
pub use tiddler::{Tiddler, TEXT_FIELD, TITLE_FIELD};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tiddler has no title field")]
    MissingTitle,

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] std::num::ParseIntError),
}
