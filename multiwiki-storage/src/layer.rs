//! Layer store abstraction.
//!
//! A layer store keeps tiddlers in named layers, unique by title within a
//! layer. Both concrete stores implement it: bags for the multi-wiki
//! server, plugins plus the user layer for the shadow overlay. Every
//! mutation runs in one transaction together with the resolution index
//! updates it causes.

use crate::error::StorageResult;
use multiwiki_types::{LayerId, Tiddler};

/// Common item operations over a set of layers.
pub trait LayerStore {
    /// How a layer is addressed.
    type Layer: ?Sized;

    /// Creates a layer, or returns the existing one with its metadata
    /// reset. Callers must not expect metadata to survive a re-create.
    fn create_layer(&self, name: &str) -> StorageResult<LayerId>;

    /// Writes a tiddler into a layer, replacing any previous copy.
    fn put_item(&self, layer: &Self::Layer, item: &Tiddler) -> StorageResult<()>;

    /// Removes a title from a layer. Returns false if it was not there.
    fn delete_item(&self, layer: &Self::Layer, title: &str) -> StorageResult<bool>;

    /// Reads a tiddler from a layer.
    fn get_item(&self, layer: &Self::Layer, title: &str) -> StorageResult<Option<Tiddler>>;

    /// Lists the titles held by a layer, sorted ascending.
    fn list_titles(&self, layer: &Self::Layer) -> StorageResult<Vec<String>>;
}
