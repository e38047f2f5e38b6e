//! The tiddler: a title plus an open map of string fields.

use crate::{Error, parse_string_array};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the field holding a tiddler's title.
pub const TITLE_FIELD: &str = "title";

/// Name of the field holding a tiddler's body.
pub const TEXT_FIELD: &str = "text";

/// A titled content item.
///
/// On the wire and in JSON a tiddler is a flat object of string fields,
/// `title` included. In memory the title is kept apart so it can never be
/// missing. Writes always replace a whole tiddler; there is no partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct Tiddler {
    title: String,
    fields: BTreeMap<String, String>,
}

impl Tiddler {
    /// Creates an empty tiddler with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builds a tiddler from a flat field map that includes `title`.
    pub fn from_fields(mut fields: BTreeMap<String, String>) -> crate::Result<Self> {
        let title = fields.remove(TITLE_FIELD).ok_or(Error::MissingTitle)?;
        Ok(Self { title, fields })
    }

    /// Builds a tiddler from a title and the remaining fields. A stray
    /// `title` entry in `fields` is ignored.
    pub fn with_fields(title: impl Into<String>, mut fields: BTreeMap<String, String>) -> Self {
        fields.remove(TITLE_FIELD);
        Self {
            title: title.into(),
            fields,
        }
    }

    /// Builder: sets a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Builder: sets the `text` field.
    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_field(TEXT_FIELD, text)
    }

    /// Returns the title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the `text` field, if present.
    pub fn text(&self) -> Option<&str> {
        self.field(TEXT_FIELD)
    }

    /// Returns a field by name. `title` resolves to the title.
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == TITLE_FIELD {
            return Some(&self.title);
        }
        self.fields.get(name).map(String::as_str)
    }

    /// Returns every field except the title.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Sets a field. Setting `title` renames the tiddler.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name == TITLE_FIELD {
            self.title = value;
        } else {
            self.fields.insert(name, value);
        }
    }

    /// Removes a field, returning its value.
    pub fn remove_field(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    /// Parses the `tags` field as a TiddlyWiki string list.
    pub fn tags(&self) -> Vec<String> {
        self.field("tags").map(parse_string_array).unwrap_or_default()
    }

    /// Returns true if the tiddler carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t == tag)
    }

    /// Flattens back into a field map that includes `title`.
    pub fn into_field_map(self) -> BTreeMap<String, String> {
        let mut map = self.fields;
        map.insert(TITLE_FIELD.to_string(), self.title);
        map
    }
}

impl TryFrom<BTreeMap<String, String>> for Tiddler {
    type Error = Error;

    fn try_from(fields: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_fields(fields)
    }
}

impl From<Tiddler> for BTreeMap<String, String> {
    fn from(tiddler: Tiddler) -> Self {
        tiddler.into_field_map()
    }
}
