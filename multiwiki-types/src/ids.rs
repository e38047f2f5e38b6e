//! Identifier types used throughout the MultiWiki core.
//!
//! Identifiers are SQLite rowids. Tiddler ids come from an AUTOINCREMENT
//! column, so they only ever grow and double as the sync watermark.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned to every stored tiddler row.
///
/// A fresh id is issued on each write and each deletion, which makes the
/// id of a title's current row both its revision and its position in the
/// change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TiddlerId(i64);

impl TiddlerId {
    /// Creates a tiddler ID from a raw rowid.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw rowid.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TiddlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TiddlerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<i64> for TiddlerId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Identifier of a layer (a bag, or a plugin) in a layer store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(i64);

impl LayerId {
    /// Creates a layer ID from a raw rowid.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw rowid.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued revision token.
///
/// Clients treat it as opaque; the server currently fills it with the
/// tiddler id of the written row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wraps a revision string received from the server.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<TiddlerId> for Revision {
    fn from(id: TiddlerId) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
