//! Shadow overlay storage.
//!
//! Plugins supply "shadow" tiddlers, layered by plugin priority. Above them
//! sits the single user layer, which always wins: a shadow is visible only
//! while no user copy of the same title exists. The `titles` table is the
//! resolution index; a NULL `plugintitle` there means the user copy won.
//!
//! Plugins without a registered priority rank below every registered one.

use crate::error::{StorageError, StorageResult};
use crate::layer::LayerStore;
use crate::resolution::{Rank, ResolutionEngine, ResolutionIndex};
use crate::{lock, open_connection, open_memory_connection};
use multiwiki_types::{LayerId, TEXT_FIELD, Tiddler};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS plugins (
        plugintitle TEXT NOT NULL,
        priority INTEGER NOT NULL,
        PRIMARY KEY (plugintitle)
    );

    CREATE TABLE IF NOT EXISTS tiddlers (
        title TEXT NOT NULL,
        plugintitle TEXT, -- NULL for the user layer
        meta TEXT NOT NULL,
        text TEXT,
        PRIMARY KEY (title, plugintitle)
    );
    CREATE UNIQUE INDEX IF NOT EXISTS tiddlers_layer_index ON tiddlers(title, IFNULL(plugintitle, ''));
    CREATE INDEX IF NOT EXISTS tiddlers_title_index ON tiddlers(title);

    CREATE TABLE IF NOT EXISTS titles (
        title TEXT NOT NULL,
        plugintitle TEXT, -- NULL when the user copy wins
        PRIMARY KEY (title)
    );
";

/// Position of the user layer: above any plugin priority.
const USER_POSITION: i64 = i64::MAX;

/// Priority of plugins that hold tiddlers but were never registered.
const UNREGISTERED_PRIORITY: i64 = 0;

/// A layer of the shadow overlay.
///
/// Ordered so that `User` sorts above every plugin when positions tie.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShadowLayer {
    /// Shadow tiddlers supplied by the named plugin.
    Plugin(String),
    /// Ordinary tiddlers.
    User,
}

impl ShadowLayer {
    /// Creates a plugin layer.
    pub fn plugin(title: impl Into<String>) -> Self {
        Self::Plugin(title.into())
    }

    /// Returns the plugin title, or `None` for the user layer.
    pub fn plugin_title(&self) -> Option<&str> {
        match self {
            Self::Plugin(title) => Some(title),
            Self::User => None,
        }
    }
}

/// Shadow overlay store backed by SQLite.
pub struct ShadowStore {
    conn: Mutex<Connection>,
}

impl ShadowStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init(open_connection(path.as_ref())?)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(open_memory_connection()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Plugins ──────────────────────────────────────────────────

    /// Replaces all plugin priorities: the first title gets priority 1, the
    /// last one wins among plugins. Plugins left out lose their priority;
    /// plugins kept retain their layer id. Rebuilds the title index.
    pub fn set_plugin_priorities<S: AsRef<str>>(&self, plugin_titles: &[S]) -> StorageResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let wanted: HashSet<&str> = plugin_titles.iter().map(|t| t.as_ref()).collect();
        let registered: Vec<String> = {
            let mut stmt = tx.prepare_cached("SELECT plugintitle FROM plugins")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for title in registered.iter().filter(|t| !wanted.contains(t.as_str())) {
            tx.execute("DELETE FROM plugins WHERE plugintitle = ?1", params![title])?;
        }
        for (index, title) in plugin_titles.iter().enumerate() {
            upsert_plugin(&tx, title.as_ref(), index as i64 + 1)?;
        }
        let resolved = ResolutionEngine::new(&ShadowIndex::new(&tx)).rebuild()?;
        tx.commit()?;
        debug!(
            "Set priorities for {} plugins, {} titles resolved",
            plugin_titles.len(),
            resolved
        );
        Ok(())
    }

    /// Registers a plugin above every other plugin. An existing plugin is
    /// moved to the top and keeps its layer id.
    pub fn register_plugin(&self, plugin_title: &str) -> StorageResult<LayerId> {
        check_plugin_title(plugin_title)?;
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(priority), 0) + 1 FROM plugins WHERE plugintitle != ?1",
            params![plugin_title],
            |row| row.get(0),
        )?;
        upsert_plugin(&tx, plugin_title, next)?;
        let rowid: i64 = tx.query_row(
            "SELECT rowid FROM plugins WHERE plugintitle = ?1",
            params![plugin_title],
            |row| row.get(0),
        )?;
        ResolutionEngine::new(&ShadowIndex::new(&tx)).rebuild()?;
        tx.commit()?;
        debug!("Registered plugin {:?} at priority {}", plugin_title, next);
        Ok(LayerId::new(rowid))
    }

    /// Returns `(plugin, priority)` pairs, lowest priority first.
    pub fn plugin_priorities(&self) -> StorageResult<Vec<(String, i64)>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT plugintitle, priority FROM plugins ORDER BY priority, plugintitle")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Saves a tiddler into the user layer (`None`) or a plugin layer.
    pub fn save_tiddler(&self, tiddler: &Tiddler, plugin_title: Option<&str>) -> StorageResult<()> {
        let layer = match plugin_title {
            Some(title) => ShadowLayer::plugin(title),
            None => ShadowLayer::User,
        };
        self.save_to_layer(tiddler, &layer)
    }

    /// Saves a tiddler into the given layer.
    ///
    /// `text` is stored NULL when the tiddler has no text field, and read
    /// back without one; an empty text stays an empty string.
    pub fn save_to_layer(&self, tiddler: &Tiddler, layer: &ShadowLayer) -> StorageResult<()> {
        if let Some(plugin) = layer.plugin_title() {
            check_plugin_title(plugin)?;
        }
        let mut meta = tiddler.fields().clone();
        let text = meta.remove(TEXT_FIELD);
        let meta = serde_json::to_string(&meta)?;

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM tiddlers WHERE title = ?1 AND plugintitle IS ?2",
            params![tiddler.title(), layer.plugin_title()],
        )?;
        tx.execute(
            "INSERT INTO tiddlers (title, plugintitle, meta, text) VALUES (?1, ?2, ?3, ?4)",
            params![tiddler.title(), layer.plugin_title(), meta, text],
        )?;
        let rank = layer_rank(&tx, layer)?;
        ResolutionEngine::new(&ShadowIndex::new(&tx)).record_put(tiddler.title(), &rank)?;
        tx.commit()?;
        debug!("Saved {:?} to {:?}", tiddler.title(), layer);
        Ok(())
    }

    /// Deletes the user copy of a title, revealing any shadow beneath it.
    pub fn delete_tiddler(&self, title: &str) -> StorageResult<bool> {
        self.delete_from_layer(title, &ShadowLayer::User)
    }

    /// Deletes a title from one layer. Returns false if it was not there.
    pub fn delete_from_layer(&self, title: &str, layer: &ShadowLayer) -> StorageResult<bool> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM tiddlers WHERE title = ?1 AND plugintitle IS ?2",
            params![title, layer.plugin_title()],
        )?;
        if removed > 0 {
            ResolutionEngine::new(&ShadowIndex::new(&tx)).record_delete(title, layer)?;
        }
        tx.commit()?;
        if removed > 0 {
            debug!("Deleted {:?} from {:?}", title, layer);
        }
        Ok(removed > 0)
    }

    /// Removes every shadow tiddler. User tiddlers are untouched.
    pub fn clear_shadows(&self) -> StorageResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tiddlers WHERE plugintitle IS NOT NULL", [])?;
        tx.execute("DELETE FROM titles WHERE plugintitle IS NOT NULL", [])?;
        tx.commit()?;
        debug!("Cleared shadow tiddlers");
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────

    /// True if a user copy of the title exists.
    pub fn tiddler_exists(&self, title: &str) -> StorageResult<bool> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT 1 FROM titles WHERE title = ?1 AND plugintitle IS NULL",
                params![title],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// True if any plugin supplies the title.
    pub fn is_shadow_tiddler(&self, title: &str) -> StorageResult<bool> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT 1 FROM tiddlers WHERE title = ?1 AND plugintitle IS NOT NULL LIMIT 1",
                params![title],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Returns the visible copy of a title.
    pub fn get_tiddler(&self, title: &str) -> StorageResult<Option<Tiddler>> {
        let conn = lock(&self.conn)?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT t.meta, t.text
                 FROM titles AS ti
                 JOIN tiddlers AS t ON t.title = ti.title AND t.plugintitle IS ti.plugintitle
                 WHERE ti.title = ?1",
                params![title],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(meta, text)| decode_tiddler(title.to_string(), &meta, text))
            .transpose()
    }

    /// Returns the highest-priority plugin supplying a title, whether or
    /// not a user copy overrides it.
    pub fn get_shadow_source(&self, title: &str) -> StorageResult<Option<String>> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT t.plugintitle
                 FROM tiddlers AS t
                 LEFT JOIN plugins AS p ON p.plugintitle = t.plugintitle
                 WHERE t.title = ?1 AND t.plugintitle IS NOT NULL
                 ORDER BY COALESCE(p.priority, ?2) DESC, t.plugintitle DESC
                 LIMIT 1",
                params![title, UNREGISTERED_PRIORITY],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Every visible title, sorted.
    pub fn all_titles(&self) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT title FROM titles ORDER BY title")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every title supplied by at least one plugin, sorted.
    pub fn all_shadow_titles(&self) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT title FROM tiddlers WHERE plugintitle IS NOT NULL ORDER BY title",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// User tiddlers, sorted by title.
    pub fn each_tiddler(&self) -> StorageResult<Vec<Tiddler>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT title, meta, text FROM tiddlers WHERE plugintitle IS NULL ORDER BY title",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let raw: Vec<(String, String, Option<String>)> = rows.collect::<Result<_, _>>()?;
        raw.into_iter()
            .map(|(title, meta, text)| decode_tiddler(title, &meta, text))
            .collect()
    }

    /// The top shadow copy of every shadowed title, sorted by title,
    /// including shadows overridden by a user copy.
    pub fn each_shadow_tiddler(&self) -> StorageResult<Vec<Tiddler>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT t.title, t.meta, t.text
             FROM tiddlers AS t
             LEFT JOIN plugins AS p ON p.plugintitle = t.plugintitle
             WHERE t.plugintitle IS NOT NULL
             ORDER BY t.title, COALESCE(p.priority, ?1) DESC, t.plugintitle DESC",
        )?;
        let rows = stmt.query_map(params![UNREGISTERED_PRIORITY], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let raw: Vec<(String, String, Option<String>)> = rows.collect::<Result<_, _>>()?;

        let mut result: Vec<Tiddler> = Vec::new();
        for (title, meta, text) in raw {
            if result.last().is_some_and(|last| last.title() == title) {
                continue;
            }
            result.push(decode_tiddler(title, &meta, text)?);
        }
        Ok(result)
    }

    /// User tiddlers, then the shadows no user tiddler overrides.
    pub fn each_tiddler_plus_shadows(&self) -> StorageResult<Vec<Tiddler>> {
        let mut result = self.each_tiddler()?;
        let seen: HashSet<String> = result.iter().map(|t| t.title().to_string()).collect();
        result.extend(
            self.each_shadow_tiddler()?
                .into_iter()
                .filter(|t| !seen.contains(t.title())),
        );
        Ok(result)
    }

    /// Shadows, then the user tiddlers that do not override a shadow.
    pub fn each_shadow_plus_tiddlers(&self) -> StorageResult<Vec<Tiddler>> {
        let mut result = self.each_shadow_tiddler()?;
        let seen: HashSet<String> = result.iter().map(|t| t.title().to_string()).collect();
        result.extend(
            self.each_tiddler()?
                .into_iter()
                .filter(|t| !seen.contains(t.title())),
        );
        Ok(result)
    }

    /// Every visible tiddler, sorted by title, read in one query.
    pub fn resolve_all(&self) -> StorageResult<Vec<Tiddler>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT ti.title, t.meta, t.text
             FROM titles AS ti
             JOIN tiddlers AS t ON t.title = ti.title AND t.plugintitle IS ti.plugintitle
             ORDER BY ti.title",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let raw: Vec<(String, String, Option<String>)> = rows.collect::<Result<_, _>>()?;
        raw.into_iter()
            .map(|(title, meta, text)| decode_tiddler(title, &meta, text))
            .collect()
    }

    /// Titles of visible tiddlers carrying `tag`, sorted.
    ///
    /// Tags are read from the visible copy only: a user copy overriding a
    /// shadow hides the shadow's tags.
    pub fn get_tiddlers_with_tag(&self, tag: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .resolve_all()?
            .into_iter()
            .filter(|t| t.has_tag(tag))
            .map(|t| t.title().to_string())
            .collect())
    }
}

impl LayerStore for ShadowStore {
    type Layer = ShadowLayer;

    fn create_layer(&self, name: &str) -> StorageResult<LayerId> {
        self.register_plugin(name)
    }

    fn put_item(&self, layer: &ShadowLayer, item: &Tiddler) -> StorageResult<()> {
        self.save_to_layer(item, layer)
    }

    fn delete_item(&self, layer: &ShadowLayer, title: &str) -> StorageResult<bool> {
        self.delete_from_layer(title, layer)
    }

    fn get_item(&self, layer: &ShadowLayer, title: &str) -> StorageResult<Option<Tiddler>> {
        let conn = lock(&self.conn)?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT meta, text FROM tiddlers WHERE title = ?1 AND plugintitle IS ?2",
                params![title, layer.plugin_title()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(meta, text)| decode_tiddler(title.to_string(), &meta, text))
            .transpose()
    }

    fn list_titles(&self, layer: &ShadowLayer) -> StorageResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT title FROM tiddlers WHERE plugintitle IS ?1 ORDER BY title")?;
        let rows = stmt.query_map(params![layer.plugin_title()], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

// ── Title index ──────────────────────────────────────────────────

/// The `titles` table.
struct ShadowIndex<'a> {
    conn: &'a Connection,
}

impl<'a> ShadowIndex<'a> {
    fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ResolutionIndex for ShadowIndex<'_> {
    type Layer = ShadowLayer;

    fn indexed(&self, title: &str) -> StorageResult<Option<Rank<ShadowLayer>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT ti.plugintitle, COALESCE(p.priority, ?2)
                 FROM titles AS ti
                 LEFT JOIN plugins AS p ON p.plugintitle = ti.plugintitle
                 WHERE ti.title = ?1",
                params![title, UNREGISTERED_PRIORITY],
                |row| Ok(rank_of(row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    fn owners(&self, title: &str) -> StorageResult<Vec<Rank<ShadowLayer>>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.plugintitle, COALESCE(p.priority, ?2)
             FROM tiddlers AS t
             LEFT JOIN plugins AS p ON p.plugintitle = t.plugintitle
             WHERE t.title = ?1",
        )?;
        let rows = stmt.query_map(params![title, UNREGISTERED_PRIORITY], |row| {
            Ok(rank_of(row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_owners(&self) -> StorageResult<Vec<(String, Rank<ShadowLayer>)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.title, t.plugintitle, COALESCE(p.priority, ?1)
             FROM tiddlers AS t
             LEFT JOIN plugins AS p ON p.plugintitle = t.plugintitle",
        )?;
        let rows = stmt.query_map(params![UNREGISTERED_PRIORITY], |row| {
            Ok((row.get(0)?, rank_of(row.get(1)?, row.get(2)?)))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_winner(&self, title: &str, winner: &Rank<ShadowLayer>) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO titles (title, plugintitle) VALUES (?1, ?2)",
            params![title, winner.layer.plugin_title()],
        )?;
        Ok(())
    }

    fn clear(&self, title: &str) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM titles WHERE title = ?1", params![title])?;
        Ok(())
    }

    fn clear_all(&self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM titles", [])?;
        Ok(())
    }
}

fn rank_of(plugintitle: Option<String>, priority: i64) -> Rank<ShadowLayer> {
    match plugintitle {
        Some(title) => Rank::new(priority, ShadowLayer::Plugin(title)),
        None => Rank::new(USER_POSITION, ShadowLayer::User),
    }
}

fn layer_rank(conn: &Connection, layer: &ShadowLayer) -> StorageResult<Rank<ShadowLayer>> {
    match layer {
        ShadowLayer::User => Ok(Rank::new(USER_POSITION, ShadowLayer::User)),
        ShadowLayer::Plugin(title) => {
            let priority: Option<i64> = conn
                .query_row(
                    "SELECT priority FROM plugins WHERE plugintitle = ?1",
                    params![title],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(Rank::new(
                priority.unwrap_or(UNREGISTERED_PRIORITY),
                layer.clone(),
            ))
        }
    }
}

/// Sets a plugin's priority, updating in place so its rowid is stable.
fn upsert_plugin(conn: &Connection, plugin_title: &str, priority: i64) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO plugins (plugintitle, priority) VALUES (?1, ?2)
         ON CONFLICT (plugintitle) DO UPDATE SET priority = excluded.priority",
        params![plugin_title, priority],
    )?;
    Ok(())
}

fn check_plugin_title(title: &str) -> StorageResult<()> {
    if title.is_empty() {
        return Err(StorageError::InvalidData(
            "plugin title must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn decode_tiddler(title: String, meta: &str, text: Option<String>) -> StorageResult<Tiddler> {
    let fields: BTreeMap<String, String> = serde_json::from_str(meta)?;
    let mut tiddler = Tiddler::with_fields(title, fields);
    if let Some(text) = text {
        tiddler.set_field(TEXT_FIELD, text);
    }
    Ok(tiddler)
}
