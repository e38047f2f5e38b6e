//! HTTP API for a MultiWiki bag/recipe store.
//!
//! Every store call runs on the blocking pool; the store serializes its own
//! writes, so handlers share one `Arc<BagStore>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use multiwiki_storage::{BagInfo, BagStore, StorageError, StorageResult, StoredTiddler};
use multiwiki_types::{BAG_HEADER, REVISION_HEADER, Tiddler, TiddlerId, TiddlerInfo};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Errors ───────────────────────────────────────────────────────

/// Failure of an API call, mapped onto an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) | Self::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(StorageError::InvalidData(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a store call on the blocking pool.
async fn with_store<T, F>(store: &Arc<BagStore>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&BagStore) -> StorageResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ApiError::Task(e.to_string()))?
        .map_err(ApiError::from)
}

// ── Change feed ──────────────────────────────────────────────────

/// Query string of the change feed.
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub last_known_tiddler_id: Option<i64>,
    pub include_deleted: Option<String>,
}

async fn recipe_feed(
    State(store): State<Arc<BagStore>>,
    Path(recipe): Path<String>,
    Query(query): Query<FeedQuery>,
) -> ApiResult<Json<Vec<TiddlerInfo>>> {
    let since = query.last_known_tiddler_id.map(TiddlerId::new);
    let include_deleted = query.include_deleted.as_deref() == Some("true");
    let feed = with_store(&store, move |s| {
        s.get_recipe_tiddler_infos(&recipe, since, include_deleted)
    })
    .await?;
    Ok(Json(feed))
}

// ── Items ────────────────────────────────────────────────────────

fn item_response(stored: StoredTiddler) -> Response {
    (
        [
            (REVISION_HEADER, stored.tiddler_id.to_string()),
            (BAG_HEADER, stored.bag_name),
        ],
        Json(stored.tiddler),
    )
        .into_response()
}

async fn get_recipe_tiddler(
    State(store): State<Arc<BagStore>>,
    Path((recipe, title)): Path<(String, String)>,
) -> ApiResult<Response> {
    let lookup = title.clone();
    with_store(&store, move |s| s.get_recipe_tiddler(&lookup, &recipe))
        .await?
        .map(item_response)
        .ok_or(ApiError::NotFound(title))
}

/// The title comes from the path; a `title` field in the body is ignored.
async fn put_recipe_tiddler(
    State(store): State<Arc<BagStore>>,
    Path((recipe, title)): Path<(String, String)>,
    Json(fields): Json<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    let tiddler = Tiddler::with_fields(title, fields);
    let saved = with_store(&store, move |s| s.save_recipe_tiddler(&tiddler, &recipe)).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [
            (REVISION_HEADER, saved.tiddler_id.to_string()),
            (BAG_HEADER, saved.bag_name),
        ],
    )
        .into_response())
}

async fn get_bag_tiddler(
    State(store): State<Arc<BagStore>>,
    Path((bag, title)): Path<(String, String)>,
) -> ApiResult<Response> {
    let lookup = title.clone();
    with_store(&store, move |s| s.get_bag_tiddler(&lookup, &bag))
        .await?
        .map(item_response)
        .ok_or(ApiError::NotFound(title))
}

async fn delete_bag_tiddler(
    State(store): State<Arc<BagStore>>,
    Path((bag, title)): Path<(String, String)>,
) -> ApiResult<Response> {
    let lookup = title.clone();
    let tombstone = with_store(&store, move |s| s.delete_tiddler(&lookup, &bag))
        .await?
        .ok_or(ApiError::NotFound(title))?;
    Ok((
        StatusCode::NO_CONTENT,
        [(REVISION_HEADER, tombstone.to_string())],
    )
        .into_response())
}

// ── Listings ─────────────────────────────────────────────────────

async fn list_bags(State(store): State<Arc<BagStore>>) -> ApiResult<Json<Vec<BagInfo>>> {
    Ok(Json(with_store(&store, |s| s.list_bags()).await?))
}

async fn list_recipes(State(store): State<Arc<BagStore>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(with_store(&store, |s| s.list_recipes()).await?))
}

async fn recipe_bags(
    State(store): State<Arc<BagStore>>,
    Path(recipe): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(with_store(&store, move |s| s.get_recipe_bags(&recipe)).await?))
}

/// Build the HTTP API router over the given store.
pub fn build_router(store: Arc<BagStore>) -> Router {
    Router::new()
        .route("/bags.json", get(list_bags))
        .route("/recipes.json", get(list_recipes))
        .route("/recipes/{recipe}/bags.json", get(recipe_bags))
        .route("/recipes/{recipe}/tiddlers.json", get(recipe_feed))
        .route(
            "/recipes/{recipe}/tiddlers/{title}",
            get(get_recipe_tiddler).put(put_recipe_tiddler),
        )
        .route(
            "/bags/{bag}/tiddlers/{title}",
            get(get_bag_tiddler).delete(delete_bag_tiddler),
        )
        .with_state(store)
}

// ── Seeding ──────────────────────────────────────────────────────

/// A recipe given on the command line as `NAME=BAG1,BAG2`, lowest bag
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeDefinition {
    pub name: String,
    pub bags: Vec<String>,
}

impl FromStr for RecipeDefinition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, bags) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=BAG1,BAG2, got {s:?}"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("recipe name missing in {s:?}"));
        }
        let bags: Vec<String> = bags
            .split(',')
            .map(str::trim)
            .filter(|bag| !bag.is_empty())
            .map(str::to_string)
            .collect();
        if bags.is_empty() {
            return Err(format!("recipe {name:?} lists no bags"));
        }
        Ok(Self {
            name: name.to_string(),
            bags,
        })
    }
}

/// Creates the given bags, then every bag the recipes mention, then the
/// recipes. When nothing is given and the store has no recipe yet, a
/// `default` recipe over a `default` bag is created.
pub fn seed_store(store: &BagStore, bags: &[String], recipes: &[RecipeDefinition]) -> StorageResult<()> {
    if bags.is_empty() && recipes.is_empty() {
        if store.list_recipes()?.is_empty() {
            store.create_bag("default", "")?;
            store.create_recipe("default", &["default"])?;
            info!("Created default recipe");
        }
        return Ok(());
    }
    let existing: Vec<String> = store.list_bags()?.into_iter().map(|b| b.bag_name).collect();
    let wanted = bags.iter().chain(recipes.iter().flat_map(|r| r.bags.iter()));
    for bag in wanted {
        // Re-creating would reset the bag's access control.
        if !existing.contains(bag) {
            store.create_bag(bag, "")?;
        }
    }
    for recipe in recipes {
        store.create_recipe(&recipe.name, &recipe.bags)?;
        info!("Recipe {:?}: {}", recipe.name, recipe.bags.join(", "));
    }
    Ok(())
}
