//! Bag and recipe storage.
//!
//! Bags are flat, access-controlled containers of tiddlers. A recipe is an
//! ordered list of bags; a title resolves to the copy in the bag with the
//! highest position that holds it. Each recipe keeps its resolved titles in
//! `recipe_titles`, maintained by the resolution engine on every write.
//!
//! Every write (and every deletion) inserts a fresh `tiddlers` row with a new
//! AUTOINCREMENT id. Deletions leave a tombstone row with no fields so that
//! incremental polls can report them. Tombstones never resolve.
//!
//! Changing a recipe's bag list, or deleting one of its bags, can change
//! what the recipe shows without touching any row the recipe still lists.
//! Such titles get a `recipe_changes` row whose id is drawn from the same
//! sequence as `tiddlers`, so the change feed reports them after any
//! watermark taken earlier.

use crate::error::{StorageError, StorageResult};
use crate::layer::LayerStore;
use crate::resolution::{Rank, ResolutionEngine, ResolutionIndex};
use crate::{lock, open_connection, open_memory_connection};
use multiwiki_types::{LayerId, Tiddler, TiddlerId, TiddlerInfo};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = "
    -- Bags have names and access control settings
    CREATE TABLE IF NOT EXISTS bags (
        bag_id INTEGER PRIMARY KEY,
        bag_name TEXT UNIQUE NOT NULL,
        accesscontrol TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS recipes (
        recipe_id INTEGER PRIMARY KEY,
        recipe_name TEXT UNIQUE NOT NULL
    );

    -- Ordered bag list of each recipe; higher positions win
    CREATE TABLE IF NOT EXISTS recipe_bags (
        recipe_id INTEGER NOT NULL REFERENCES recipes(recipe_id) ON UPDATE CASCADE ON DELETE CASCADE,
        bag_id INTEGER NOT NULL REFERENCES bags(bag_id) ON UPDATE CASCADE ON DELETE CASCADE,
        position INTEGER NOT NULL,
        UNIQUE (recipe_id, bag_id)
    );

    CREATE TABLE IF NOT EXISTS tiddlers (
        tiddler_id INTEGER PRIMARY KEY AUTOINCREMENT,
        bag_id INTEGER NOT NULL REFERENCES bags(bag_id) ON UPDATE CASCADE ON DELETE CASCADE,
        title TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        UNIQUE (bag_id, title)
    );
    CREATE INDEX IF NOT EXISTS tiddlers_title_index ON tiddlers(title);

    CREATE TABLE IF NOT EXISTS fields (
        tiddler_id INTEGER NOT NULL REFERENCES tiddlers(tiddler_id) ON UPDATE CASCADE ON DELETE CASCADE,
        field_name TEXT NOT NULL,
        field_value TEXT NOT NULL,
        UNIQUE (tiddler_id, field_name)
    );

    -- Resolved bag of every title visible through a recipe
    CREATE TABLE IF NOT EXISTS recipe_titles (
        recipe_id INTEGER NOT NULL REFERENCES recipes(recipe_id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        bag_id INTEGER NOT NULL REFERENCES bags(bag_id) ON DELETE CASCADE,
        PRIMARY KEY (recipe_id, title)
    );

    -- Latest visibility change of a title caused by the bag list itself
    CREATE TABLE IF NOT EXISTS recipe_changes (
        recipe_id INTEGER NOT NULL REFERENCES recipes(recipe_id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        change_id INTEGER NOT NULL,
        PRIMARY KEY (recipe_id, title)
    );
";

/// A bag and its access control descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagInfo {
    pub bag_name: String,
    pub accesscontrol: String,
}

/// A tiddler together with the bag row it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTiddler {
    /// Bag physically holding this copy.
    pub bag_name: String,
    /// Row id of this copy; also its revision.
    pub tiddler_id: TiddlerId,
    pub tiddler: Tiddler,
}

/// Where a write landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedTiddler {
    pub bag_name: String,
    pub tiddler_id: TiddlerId,
}

/// Persistent bag/recipe store backed by SQLite.
pub struct BagStore {
    conn: Mutex<Connection>,
}

impl BagStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init(open_connection(path.as_ref())?)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(open_memory_connection()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Bags and recipes ─────────────────────────────────────────

    /// Creates a bag if needed and (re)sets its access control descriptor.
    pub fn create_bag(&self, bag_name: &str, accesscontrol: &str) -> StorageResult<LayerId> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO bags (bag_name, accesscontrol) VALUES (?1, '')",
            params![bag_name],
        )?;
        tx.execute(
            "UPDATE bags SET accesscontrol = ?2 WHERE bag_name = ?1",
            params![bag_name, accesscontrol],
        )?;
        let bag_id: i64 = tx.query_row(
            "SELECT bag_id FROM bags WHERE bag_name = ?1",
            params![bag_name],
            |row| row.get(0),
        )?;
        tx.commit()?;
        debug!("Created bag {:?} ({})", bag_name, bag_id);
        Ok(LayerId::new(bag_id))
    }

    /// Lists all bags, sorted by name.
    pub fn list_bags(&self) -> StorageResult<Vec<BagInfo>> {
        let conn = lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT bag_name, accesscontrol FROM bags ORDER BY bag_name")?;
        let rows = stmt.query_map([], |row| {
            Ok(BagInfo {
                bag_name: row.get(0)?,
                accesscontrol: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Deletes a bag together with its tiddlers and recipe memberships.
    /// Returns false if there was no such bag.
    ///
    /// Titles that vanish from (or move within) a recipe because of the
    /// deletion are reported by that recipe's change feed.
    pub fn delete_bag(&self, bag_name: &str) -> StorageResult<bool> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let Some(bag_id) = bag_id(&tx, bag_name)? else {
            return Ok(false);
        };
        let mut affected: Vec<(i64, HashMap<String, i64>)> = Vec::new();
        for (recipe_id, _) in recipes_containing(&tx, bag_id)? {
            carry_tombstones(&tx, recipe_id, bag_id)?;
            affected.push((recipe_id, recipe_view(&tx, recipe_id)?));
        }
        tx.execute(
            "DELETE FROM fields WHERE tiddler_id IN (SELECT tiddler_id FROM tiddlers WHERE bag_id = ?1)",
            params![bag_id],
        )?;
        tx.execute("DELETE FROM tiddlers WHERE bag_id = ?1", params![bag_id])?;
        tx.execute("DELETE FROM recipe_titles WHERE bag_id = ?1", params![bag_id])?;
        tx.execute("DELETE FROM recipe_bags WHERE bag_id = ?1", params![bag_id])?;
        tx.execute("DELETE FROM bags WHERE bag_id = ?1", params![bag_id])?;
        for (recipe_id, before) in &affected {
            ResolutionEngine::new(&RecipeIndex::new(&tx, *recipe_id)).rebuild()?;
            record_view_changes(&tx, *recipe_id, before)?;
        }
        tx.commit()?;
        info!("Deleted bag {:?}", bag_name);
        Ok(true)
    }

    /// Creates or redefines a recipe.
    ///
    /// The bag list is replaced wholesale. Every bag must exist; otherwise
    /// the call fails with `NotFound` and the recipe is left as it was.
    /// Redefining a recipe records every title whose visibility changed.
    pub fn create_recipe<S: AsRef<str>>(
        &self,
        recipe_name: &str,
        bag_names: &[S],
    ) -> StorageResult<LayerId> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let mut bag_ids: Vec<i64> = Vec::with_capacity(bag_names.len());
        for name in bag_names {
            let name = name.as_ref();
            let id = bag_id(&tx, name)?
                .ok_or_else(|| StorageError::NotFound(format!("bag {name:?}")))?;
            if bag_ids.contains(&id) {
                return Err(StorageError::InvalidData(format!(
                    "bag {name:?} listed twice in recipe {recipe_name:?}"
                )));
            }
            bag_ids.push(id);
        }

        let previous = match recipe_id(&tx, recipe_name)? {
            Some(id) => Some((recipe_bag_ids(&tx, id)?, recipe_view(&tx, id)?)),
            None => None,
        };
        tx.execute(
            "INSERT OR IGNORE INTO recipes (recipe_name) VALUES (?1)",
            params![recipe_name],
        )?;
        let recipe_id = recipe_id(&tx, recipe_name)?
            .ok_or_else(|| StorageError::NotFound(format!("recipe {recipe_name:?}")))?;
        tx.execute(
            "DELETE FROM recipe_bags WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO recipe_bags (recipe_id, bag_id, position) VALUES (?1, ?2, ?3)",
            )?;
            for (position, bag_id) in bag_ids.iter().enumerate() {
                insert.execute(params![recipe_id, bag_id, position as i64])?;
            }
        }
        let resolved = ResolutionEngine::new(&RecipeIndex::new(&tx, recipe_id)).rebuild()?;
        if let Some((old_bags, before)) = previous {
            for dropped in old_bags.iter().filter(|bag| !bag_ids.contains(bag)) {
                carry_tombstones(&tx, recipe_id, *dropped)?;
            }
            let changed = record_view_changes(&tx, recipe_id, &before)?;
            if changed > 0 {
                debug!("Recipe {:?}: {} titles changed visibility", recipe_name, changed);
            }
        }
        tx.commit()?;
        debug!(
            "Defined recipe {:?} with {} bags, {} titles resolved",
            recipe_name,
            bag_ids.len(),
            resolved
        );
        Ok(LayerId::new(recipe_id))
    }

    /// Lists all recipe names, sorted.
    pub fn list_recipes(&self) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT recipe_name FROM recipes ORDER BY recipe_name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Returns the bags of a recipe, lowest position first. Empty for an
    /// unknown recipe.
    pub fn get_recipe_bags(&self, recipe_name: &str) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT b.bag_name
             FROM recipe_bags AS rb
             JOIN recipes AS r ON rb.recipe_id = r.recipe_id
             JOIN bags AS b ON rb.bag_id = b.bag_id
             WHERE r.recipe_name = ?1
             ORDER BY rb.position",
        )?;
        let rows = stmt.query_map(params![recipe_name], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Deletes a recipe. Its bags and their tiddlers are untouched.
    pub fn delete_recipe(&self, recipe_name: &str) -> StorageResult<bool> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let Some(recipe_id) = recipe_id(&tx, recipe_name)? else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM recipe_titles WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        tx.execute(
            "DELETE FROM recipe_changes WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        tx.execute(
            "DELETE FROM recipe_bags WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        tx.execute("DELETE FROM recipes WHERE recipe_id = ?1", params![recipe_id])?;
        tx.commit()?;
        info!("Deleted recipe {:?}", recipe_name);
        Ok(true)
    }

    // ── Tiddler writes ───────────────────────────────────────────

    /// Writes a tiddler straight into a bag, bypassing recipe resolution.
    pub fn save_bag_tiddler(&self, tiddler: &Tiddler, bag_name: &str) -> StorageResult<TiddlerId> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let bag_id = bag_id(&tx, bag_name)?
            .ok_or_else(|| StorageError::NotFound(format!("bag {bag_name:?}")))?;
        let tiddler_id = write_tiddler(&tx, bag_id, tiddler)?;
        tx.commit()?;
        debug!("Saved {:?} to bag {:?} as {}", tiddler.title(), bag_name, tiddler_id);
        Ok(tiddler_id)
    }

    /// Writes a tiddler into the topmost bag of a recipe.
    ///
    /// The top bag is always the target, even when a lower bag already
    /// holds the title; lower layers are overridden, never updated.
    pub fn save_recipe_tiddler(
        &self,
        tiddler: &Tiddler,
        recipe_name: &str,
    ) -> StorageResult<SavedTiddler> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let (bag_id, bag_name): (i64, String) = tx
            .query_row(
                "SELECT b.bag_id, b.bag_name
                 FROM recipe_bags AS rb
                 JOIN recipes AS r ON rb.recipe_id = r.recipe_id
                 JOIN bags AS b ON rb.bag_id = b.bag_id
                 WHERE r.recipe_name = ?1
                 ORDER BY rb.position DESC
                 LIMIT 1",
                params![recipe_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("recipe {recipe_name:?} has no bags")))?;
        let tiddler_id = write_tiddler(&tx, bag_id, tiddler)?;
        tx.commit()?;
        debug!(
            "Saved {:?} through recipe {:?} to bag {:?} as {}",
            tiddler.title(),
            recipe_name,
            bag_name,
            tiddler_id
        );
        Ok(SavedTiddler {
            bag_name,
            tiddler_id,
        })
    }

    /// Deletes a title from one bag, leaving a tombstone.
    ///
    /// Deleting from a bag that is not the top of a recipe can reveal a
    /// lower bag's copy through that recipe. Returns the tombstone id, or
    /// `None` if the bag did not hold the title.
    pub fn delete_tiddler(&self, title: &str, bag_name: &str) -> StorageResult<Option<TiddlerId>> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let Some(bag_id) = bag_id(&tx, bag_name)? else {
            return Ok(None);
        };
        let tombstone = remove_tiddler(&tx, bag_id, title)?;
        tx.commit()?;
        if let Some(id) = tombstone {
            debug!("Deleted {:?} from bag {:?} (tombstone {})", title, bag_name, id);
        }
        Ok(tombstone)
    }

    // ── Tiddler reads ────────────────────────────────────────────

    /// Reads a tiddler from one bag.
    pub fn get_bag_tiddler(&self, title: &str, bag_name: &str) -> StorageResult<Option<StoredTiddler>> {
        let conn = lock(&self.conn)?;
        let tiddler_id: Option<i64> = conn
            .query_row(
                "SELECT t.tiddler_id
                 FROM tiddlers AS t
                 JOIN bags AS b ON t.bag_id = b.bag_id
                 WHERE b.bag_name = ?1 AND t.title = ?2 AND t.is_deleted = 0",
                params![bag_name, title],
                |row| row.get(0),
            )
            .optional()?;
        match tiddler_id {
            Some(id) => Ok(Some(StoredTiddler {
                bag_name: bag_name.to_string(),
                tiddler_id: TiddlerId::new(id),
                tiddler: read_tiddler(&conn, id, title)?,
            })),
            None => Ok(None),
        }
    }

    /// Resolves a title through a recipe, returning the winning copy and
    /// the bag it lives in.
    pub fn get_recipe_tiddler(
        &self,
        title: &str,
        recipe_name: &str,
    ) -> StorageResult<Option<StoredTiddler>> {
        let conn = lock(&self.conn)?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT t.tiddler_id, b.bag_name
                 FROM recipe_titles AS rt
                 JOIN recipes AS r ON rt.recipe_id = r.recipe_id
                 JOIN bags AS b ON rt.bag_id = b.bag_id
                 JOIN tiddlers AS t ON t.bag_id = rt.bag_id AND t.title = rt.title
                 WHERE r.recipe_name = ?1 AND rt.title = ?2 AND t.is_deleted = 0",
                params![recipe_name, title],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, bag_name)) => Ok(Some(StoredTiddler {
                bag_name,
                tiddler_id: TiddlerId::new(id),
                tiddler: read_tiddler(&conn, id, title)?,
            })),
            None => Ok(None),
        }
    }

    /// Titles held by a bag, sorted. Empty for an unknown bag.
    pub fn get_bag_tiddlers(&self, bag_name: &str) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT t.title
             FROM tiddlers AS t
             JOIN bags AS b ON t.bag_id = b.bag_id
             WHERE b.bag_name = ?1 AND t.is_deleted = 0
             ORDER BY t.title ASC",
        )?;
        let rows = stmt.query_map(params![bag_name], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Titles visible through a recipe, sorted. Empty for an unknown recipe.
    pub fn get_recipe_tiddlers(&self, recipe_name: &str) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT rt.title
             FROM recipe_titles AS rt
             JOIN recipes AS r ON rt.recipe_id = r.recipe_id
             WHERE r.recipe_name = ?1
             ORDER BY rt.title ASC",
        )?;
        let rows = stmt.query_map(params![recipe_name], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Resolves every title of a recipe in a single query.
    pub fn resolve_recipe(&self, recipe_name: &str) -> StorageResult<Vec<StoredTiddler>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT rt.title, t.tiddler_id, b.bag_name, f.field_name, f.field_value
             FROM recipe_titles AS rt
             JOIN recipes AS r ON rt.recipe_id = r.recipe_id
             JOIN bags AS b ON rt.bag_id = b.bag_id
             JOIN tiddlers AS t ON t.bag_id = rt.bag_id AND t.title = rt.title AND t.is_deleted = 0
             LEFT JOIN fields AS f ON f.tiddler_id = t.tiddler_id
             WHERE r.recipe_name = ?1
             ORDER BY rt.title ASC, f.field_name ASC",
        )?;
        let rows = stmt.query_map(params![recipe_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut result: Vec<StoredTiddler> = Vec::new();
        for row in rows {
            let (title, tiddler_id, bag_name, field_name, field_value) = row?;
            let tiddler_id = TiddlerId::new(tiddler_id);
            let needs_new = result
                .last()
                .is_none_or(|last| last.tiddler_id != tiddler_id);
            if needs_new {
                result.push(StoredTiddler {
                    bag_name,
                    tiddler_id,
                    tiddler: Tiddler::new(title),
                });
            }
            if let (Some(name), Some(value), Some(current)) =
                (field_name, field_value, result.last_mut())
            {
                current.tiddler.set_field(name, value);
            }
        }
        Ok(result)
    }

    /// Change feed of a recipe: each title touched after `last_known`, with
    /// the newest row or change id among the recipe's bags and its bag list
    /// changes, oldest change first.
    ///
    /// A title is flagged deleted when nothing visible remains for it.
    /// Deleted titles are left out unless `include_deleted` is set.
    pub fn get_recipe_tiddler_infos(
        &self,
        recipe_name: &str,
        last_known: Option<TiddlerId>,
        include_deleted: bool,
    ) -> StorageResult<Vec<TiddlerInfo>> {
        let conn = lock(&self.conn)?;
        let Some(recipe_id) = recipe_id(&conn, recipe_name)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT c.title,
                    MAX(c.change_id) AS latest,
                    EXISTS (
                        SELECT 1 FROM recipe_titles AS rt
                        WHERE rt.recipe_id = ?1 AND rt.title = c.title
                    ) AS visible
             FROM (
                 SELECT t.title AS title, t.tiddler_id AS change_id
                 FROM recipe_bags AS rb
                 JOIN tiddlers AS t ON t.bag_id = rb.bag_id
                 WHERE rb.recipe_id = ?1 AND t.tiddler_id > ?2
                 UNION ALL
                 SELECT title, change_id
                 FROM recipe_changes
                 WHERE recipe_id = ?1 AND change_id > ?2
             ) AS c
             GROUP BY c.title
             ORDER BY latest ASC",
        )?;
        let since = last_known.map_or(0, TiddlerId::get);
        let rows = stmt.query_map(params![recipe_id, since], |row| {
            Ok(TiddlerInfo::new(
                row.get::<_, String>(0)?,
                TiddlerId::new(row.get(1)?),
                !row.get::<_, bool>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let info = row?;
            if include_deleted || !info.is_deleted {
                result.push(info);
            }
        }
        Ok(result)
    }
}

impl LayerStore for BagStore {
    type Layer = str;

    fn create_layer(&self, name: &str) -> StorageResult<LayerId> {
        self.create_bag(name, "")
    }

    fn put_item(&self, bag_name: &str, item: &Tiddler) -> StorageResult<()> {
        self.save_bag_tiddler(item, bag_name).map(|_| ())
    }

    fn delete_item(&self, bag_name: &str, title: &str) -> StorageResult<bool> {
        Ok(self.delete_tiddler(title, bag_name)?.is_some())
    }

    fn get_item(&self, bag_name: &str, title: &str) -> StorageResult<Option<Tiddler>> {
        Ok(self.get_bag_tiddler(title, bag_name)?.map(|stored| stored.tiddler))
    }

    fn list_titles(&self, bag_name: &str) -> StorageResult<Vec<String>> {
        self.get_bag_tiddlers(bag_name)
    }
}

// ── Recipe resolution index ──────────────────────────────────────

/// `recipe_titles` rows of one recipe. Layers are keyed by bag id.
struct RecipeIndex<'a> {
    conn: &'a Connection,
    recipe_id: i64,
}

impl<'a> RecipeIndex<'a> {
    fn new(conn: &'a Connection, recipe_id: i64) -> Self {
        Self { conn, recipe_id }
    }
}

impl ResolutionIndex for RecipeIndex<'_> {
    type Layer = i64;

    fn indexed(&self, title: &str) -> StorageResult<Option<Rank<i64>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT rb.position, rt.bag_id
                 FROM recipe_titles AS rt
                 JOIN recipe_bags AS rb ON rb.recipe_id = rt.recipe_id AND rb.bag_id = rt.bag_id
                 WHERE rt.recipe_id = ?1 AND rt.title = ?2",
                params![self.recipe_id, title],
                |row| Ok(Rank::new(row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    fn owners(&self, title: &str) -> StorageResult<Vec<Rank<i64>>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT rb.position, rb.bag_id
             FROM recipe_bags AS rb
             JOIN tiddlers AS t ON t.bag_id = rb.bag_id
             WHERE rb.recipe_id = ?1 AND t.title = ?2 AND t.is_deleted = 0",
        )?;
        let rows = stmt.query_map(params![self.recipe_id, title], |row| {
            Ok(Rank::new(row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_owners(&self) -> StorageResult<Vec<(String, Rank<i64>)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.title, rb.position, rb.bag_id
             FROM recipe_bags AS rb
             JOIN tiddlers AS t ON t.bag_id = rb.bag_id
             WHERE rb.recipe_id = ?1 AND t.is_deleted = 0",
        )?;
        let rows = stmt.query_map(params![self.recipe_id], |row| {
            Ok((row.get(0)?, Rank::new(row.get(1)?, row.get(2)?)))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_winner(&self, title: &str, winner: &Rank<i64>) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO recipe_titles (recipe_id, title, bag_id) VALUES (?1, ?2, ?3)",
            params![self.recipe_id, title, winner.layer],
        )?;
        Ok(())
    }

    fn clear(&self, title: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM recipe_titles WHERE recipe_id = ?1 AND title = ?2",
            params![self.recipe_id, title],
        )?;
        Ok(())
    }

    fn clear_all(&self) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM recipe_titles WHERE recipe_id = ?1",
            params![self.recipe_id],
        )?;
        Ok(())
    }
}

// ── Helpers (all run on an open transaction) ─────────────────────

fn bag_id(conn: &Connection, bag_name: &str) -> StorageResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT bag_id FROM bags WHERE bag_name = ?1",
            params![bag_name],
            |row| row.get(0),
        )
        .optional()?)
}

fn recipe_id(conn: &Connection, recipe_name: &str) -> StorageResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT recipe_id FROM recipes WHERE recipe_name = ?1",
            params![recipe_name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Bag ids of a recipe, in no particular order.
fn recipe_bag_ids(conn: &Connection, recipe_id: i64) -> StorageResult<Vec<i64>> {
    let mut stmt = conn.prepare_cached("SELECT bag_id FROM recipe_bags WHERE recipe_id = ?1")?;
    let rows = stmt.query_map(params![recipe_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Resolved bag of every title visible through a recipe.
fn recipe_view(conn: &Connection, recipe_id: i64) -> StorageResult<HashMap<String, i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT title, bag_id FROM recipe_titles WHERE recipe_id = ?1")?;
    let rows = stmt.query_map(params![recipe_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Takes the next id of the `tiddlers` sequence without inserting a row.
fn next_change_id(conn: &Connection) -> StorageResult<i64> {
    let bumped = conn.execute(
        "UPDATE sqlite_sequence SET seq = seq + 1 WHERE name = 'tiddlers'",
        [],
    )?;
    if bumped == 0 {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES ('tiddlers', 1)",
            [],
        )?;
    }
    Ok(conn.query_row(
        "SELECT seq FROM sqlite_sequence WHERE name = 'tiddlers'",
        [],
        |row| row.get(0),
    )?)
}

fn record_change(conn: &Connection, recipe_id: i64, title: &str, change_id: i64) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO recipe_changes (recipe_id, title, change_id) VALUES (?1, ?2, ?3)
         ON CONFLICT (recipe_id, title) DO UPDATE SET change_id = MAX(change_id, excluded.change_id)",
        params![recipe_id, title, change_id],
    )?;
    Ok(())
}

/// Copies the tombstones of a bag leaving a recipe into the recipe's
/// changes, keeping their ids.
fn carry_tombstones(conn: &Connection, recipe_id: i64, bag_id: i64) -> StorageResult<()> {
    let tombstones: Vec<(String, i64)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT title, tiddler_id FROM tiddlers WHERE bag_id = ?1 AND is_deleted = 1",
        )?;
        let rows = stmt.query_map(params![bag_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    for (title, tombstone) in tombstones {
        record_change(conn, recipe_id, &title, tombstone)?;
    }
    Ok(())
}

/// Gives a fresh change id to every title whose resolved bag differs from
/// `before`. Returns how many titles changed.
fn record_view_changes(
    conn: &Connection,
    recipe_id: i64,
    before: &HashMap<String, i64>,
) -> StorageResult<usize> {
    let after = recipe_view(conn, recipe_id)?;
    let mut changed: Vec<&str> = before
        .iter()
        .filter(|(title, bag)| after.get(*title) != Some(*bag))
        .map(|(title, _)| title.as_str())
        .collect();
    changed.extend(
        after
            .keys()
            .filter(|title| !before.contains_key(*title))
            .map(String::as_str),
    );
    changed.sort_unstable();
    for title in &changed {
        let change_id = next_change_id(conn)?;
        record_change(conn, recipe_id, title, change_id)?;
    }
    Ok(changed.len())
}

/// `(recipe_id, position)` of every recipe listing the bag.
fn recipes_containing(conn: &Connection, bag_id: i64) -> StorageResult<Vec<(i64, i64)>> {
    let mut stmt =
        conn.prepare_cached("SELECT recipe_id, position FROM recipe_bags WHERE bag_id = ?1")?;
    let rows = stmt.query_map(params![bag_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Removes the current row (live or tombstone) of a title in a bag.
fn drop_row(conn: &Connection, bag_id: i64, title: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM fields WHERE tiddler_id IN
            (SELECT tiddler_id FROM tiddlers WHERE bag_id = ?1 AND title = ?2)",
        params![bag_id, title],
    )?;
    conn.execute(
        "DELETE FROM tiddlers WHERE bag_id = ?1 AND title = ?2",
        params![bag_id, title],
    )?;
    Ok(())
}

fn write_tiddler(conn: &Connection, bag_id: i64, tiddler: &Tiddler) -> StorageResult<TiddlerId> {
    let title = tiddler.title();
    drop_row(conn, bag_id, title)?;
    conn.execute(
        "INSERT INTO tiddlers (bag_id, title, is_deleted) VALUES (?1, ?2, 0)",
        params![bag_id, title],
    )?;
    let tiddler_id = conn.last_insert_rowid();
    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO fields (tiddler_id, field_name, field_value) VALUES (?1, ?2, ?3)",
        )?;
        for (name, value) in tiddler.fields() {
            insert.execute(params![tiddler_id, name, value])?;
        }
    }
    for (recipe_id, position) in recipes_containing(conn, bag_id)? {
        ResolutionEngine::new(&RecipeIndex::new(conn, recipe_id))
            .record_put(title, &Rank::new(position, bag_id))?;
    }
    Ok(TiddlerId::new(tiddler_id))
}

fn remove_tiddler(conn: &Connection, bag_id: i64, title: &str) -> StorageResult<Option<TiddlerId>> {
    let live: Option<i64> = conn
        .query_row(
            "SELECT tiddler_id FROM tiddlers WHERE bag_id = ?1 AND title = ?2 AND is_deleted = 0",
            params![bag_id, title],
            |row| row.get(0),
        )
        .optional()?;
    if live.is_none() {
        return Ok(None);
    }
    drop_row(conn, bag_id, title)?;
    conn.execute(
        "INSERT INTO tiddlers (bag_id, title, is_deleted) VALUES (?1, ?2, 1)",
        params![bag_id, title],
    )?;
    let tombstone = conn.last_insert_rowid();
    for (recipe_id, _) in recipes_containing(conn, bag_id)? {
        ResolutionEngine::new(&RecipeIndex::new(conn, recipe_id)).record_delete(title, &bag_id)?;
    }
    Ok(Some(TiddlerId::new(tombstone)))
}

fn read_tiddler(conn: &Connection, tiddler_id: i64, title: &str) -> StorageResult<Tiddler> {
    let mut stmt = conn.prepare_cached(
        "SELECT field_name, field_value FROM fields WHERE tiddler_id = ?1",
    )?;
    let rows = stmt.query_map(params![tiddler_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut tiddler = Tiddler::new(title);
    for row in rows {
        let (name, value) = row?;
        tiddler.set_field(name, value);
    }
    Ok(tiddler)
}
