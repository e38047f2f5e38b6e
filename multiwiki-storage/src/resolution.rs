//! Resolution engine.
//!
//! A layer list orders layers by ascending rank; for every title the layer
//! with the highest rank that holds a live copy is the visible one. The
//! winners are materialized in a per-list index that each store keeps next
//! to its item tables. The engine owns the maintenance rules and talks to
//! the index through [`ResolutionIndex`], whose implementations issue their
//! statements on the caller's open transaction, so an item write and its
//! index update commit or roll back together.

use crate::error::StorageResult;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Position of a layer within a layer list. Higher ranks shadow lower ones.
///
/// Ranks compare by position first and by layer key second, so two layers
/// that share a position still resolve the same way every time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rank<K> {
    /// Position in the list (recipe position, plugin priority).
    pub position: i64,
    /// Key of the layer at that position.
    pub layer: K,
}

impl<K> Rank<K> {
    /// Creates a rank.
    pub const fn new(position: i64, layer: K) -> Self {
        Self { position, layer }
    }
}

/// Storage side of a materialized resolution index scoped to one layer list.
pub trait ResolutionIndex {
    /// Key identifying a layer in this list.
    type Layer: Clone + Ord + Debug;

    /// Returns the indexed winner for `title`.
    fn indexed(&self, title: &str) -> StorageResult<Option<Rank<Self::Layer>>>;

    /// Returns every layer of the list holding a live copy of `title`.
    fn owners(&self, title: &str) -> StorageResult<Vec<Rank<Self::Layer>>>;

    /// Returns every `(title, owner)` pair across the whole list.
    fn all_owners(&self) -> StorageResult<Vec<(String, Rank<Self::Layer>)>>;

    /// Points the index entry for `title` at `winner`.
    fn set_winner(&self, title: &str, winner: &Rank<Self::Layer>) -> StorageResult<()>;

    /// Removes the index entry for `title`.
    fn clear(&self, title: &str) -> StorageResult<()>;

    /// Removes every index entry of the list.
    fn clear_all(&self) -> StorageResult<()>;
}

/// Picks the winning rank out of a set of candidates.
pub fn winner<K: Ord>(candidates: impl IntoIterator<Item = Rank<K>>) -> Option<Rank<K>> {
    candidates.into_iter().max()
}

/// Applies the maintenance rules to one resolution index.
pub struct ResolutionEngine<'a, I: ResolutionIndex> {
    index: &'a I,
}

impl<'a, I: ResolutionIndex> ResolutionEngine<'a, I> {
    /// Creates an engine over the given index.
    pub const fn new(index: &'a I) -> Self {
        Self { index }
    }

    /// Records that `title` was written into the layer at `written`.
    ///
    /// The written copy takes over when it ranks at or above the indexed
    /// winner; a rewrite of the winning layer keeps it in place. Returns
    /// true if the index entry changed.
    pub fn record_put(&self, title: &str, written: &Rank<I::Layer>) -> StorageResult<bool> {
        match self.index.indexed(title)? {
            Some(current) if current > *written => Ok(false),
            Some(current) if current == *written => Ok(false),
            _ => {
                self.index.set_winner(title, written)?;
                debug!("Resolution of {:?} now {:?}", title, written);
                Ok(true)
            }
        }
    }

    /// Records that `title` was removed from `removed`.
    ///
    /// Only removing the winning copy needs a rescan of the list; the next
    /// highest owner takes over, or the entry goes away.
    pub fn record_delete(&self, title: &str, removed: &I::Layer) -> StorageResult<()> {
        match self.index.indexed(title)? {
            Some(current) if current.layer != *removed => Ok(()),
            _ => self.recompute(title).map(|_| ()),
        }
    }

    /// Rescans the list for `title` and rewrites its entry.
    pub fn recompute(&self, title: &str) -> StorageResult<Option<Rank<I::Layer>>> {
        let best = winner(self.index.owners(title)?);
        match &best {
            Some(rank) => self.index.set_winner(title, rank)?,
            None => self.index.clear(title)?,
        }
        debug!("Recomputed resolution of {:?}: {:?}", title, best);
        Ok(best)
    }

    /// Rebuilds the whole index from one scan of the list. Used when the
    /// list itself changes order or membership. Returns the number of
    /// resolved titles.
    pub fn rebuild(&self) -> StorageResult<usize> {
        let mut winners: BTreeMap<String, Rank<I::Layer>> = BTreeMap::new();
        for (title, rank) in self.index.all_owners()? {
            match winners.get(&title) {
                Some(best) if *best >= rank => {}
                _ => {
                    winners.insert(title, rank);
                }
            }
        }
        self.index.clear_all()?;
        for (title, rank) in &winners {
            self.index.set_winner(title, rank)?;
        }
        debug!("Rebuilt resolution index with {} titles", winners.len());
        Ok(winners.len())
    }
}
