//! HTTP sync client for one recipe.
//!
//! At most one poll is outstanding per client. Saves and deletes may
//! overlap each other, but a poll waits for every in-flight write to
//! finish and holds new writes back until it completes. Requests are
//! never cancelled once sent.
//!
//! Local sync state lives in SQLite; the async operations reach it through
//! the blocking pool. The plain accessors read it on the calling thread.

use crate::config::{SyncConfig, WatermarkPolicy};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    BAG_HEADER, DeleteOutcome, INCLUDE_DELETED_PARAM, LAST_KNOWN_PARAM, REVISION_HEADER,
    RemoteInfo, SaveOutcome, ServerStatus, UpdatedTiddlers,
};
use crate::state_store::SyncStateStore;
use multiwiki_types::{Revision, Tiddler, TiddlerId, TiddlerInfo};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Sync client bound to one server and recipe.
pub struct SyncClient {
    config: SyncConfig,
    base_url: String,
    http: Client,
    state: Arc<SyncStateStore>,
    /// Held for the whole of a poll; `try_lock` rejects overlapping polls.
    poll: Mutex<()>,
    /// Writes share it, polls take it exclusively.
    ordering: RwLock<()>,
}

impl SyncClient {
    /// Creates a client. No request is made until the first call.
    pub fn new(config: SyncConfig, state: Arc<SyncStateStore>) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url(),
            config,
            http,
            state,
            poll: Mutex::new(()),
            ordering: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    /// Reports the connection status. The server runs without user
    /// accounts, so every client is an anonymous, logged-in user.
    pub fn get_status(&self) -> ServerStatus {
        ServerStatus {
            logged_in: true,
            username: None,
            read_only: self.config.read_only,
            anonymous: true,
        }
    }

    /// Bag and revision last reported for a title; `None` unless both
    /// are known.
    pub fn get_tiddler_info(&self, title: &str) -> SyncResult<Option<RemoteInfo>> {
        self.state.remote_info(title)
    }

    /// Current poll watermark.
    pub fn last_tiddler_id(&self) -> SyncResult<TiddlerId> {
        self.state.last_tiddler_id()
    }

    /// Advances the watermark after a batch was applied. Never moves it
    /// backwards.
    pub fn commit_watermark(&self, id: TiddlerId) -> SyncResult<TiddlerId> {
        self.state.advance_watermark(id)
    }

    /// Drops the local record of a title the server reported deleted.
    pub fn forget_tiddler(&self, title: &str) -> SyncResult<bool> {
        self.state.remove_remote_info(title)
    }

    /// Runs a sync state call on the blocking pool.
    pub(crate) async fn with_state<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SyncStateStore) -> SyncResult<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(state.as_ref()))
            .await
            .map_err(|e| SyncError::Storage(format!("sync state task failed: {e}")))?
    }

    // ── Poll ─────────────────────────────────────────────────────

    /// Fetches every change after the watermark.
    ///
    /// Under [`WatermarkPolicy::AdvanceOnReceipt`] the watermark is stored
    /// before returning; otherwise the caller commits it with
    /// [`commit_watermark`](Self::commit_watermark).
    pub async fn get_updated_tiddlers(&self) -> SyncResult<UpdatedTiddlers> {
        let _poll = self.poll.try_lock().map_err(|_| SyncError::PollInProgress)?;
        let _writes_done = self.ordering.write().await;

        let since = self.with_state(|s| s.last_tiddler_id()).await?;
        let url = format!(
            "{}recipes/{}/tiddlers.json",
            self.base_url,
            urlencoding::encode(&self.config.recipe)
        );
        debug!("Polling {} from {}", url, since);
        let response = self
            .http
            .get(&url)
            .query(&[
                (LAST_KNOWN_PARAM, since.to_string()),
                (INCLUDE_DELETED_PARAM, "true".to_string()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("poll failed: {e}")))?;
        let body = check_status(response).await?.text().await?;
        let feed: Vec<TiddlerInfo> = serde_json::from_str(&body)
            .map_err(|e| SyncError::Protocol(format!("malformed change feed: {e}")))?;

        let updates = UpdatedTiddlers::from_feed(since, &feed);
        if self.config.watermark_policy == WatermarkPolicy::AdvanceOnReceipt {
            let received = updates.last_tiddler_id;
            self.with_state(move |s| s.advance_watermark(received)).await?;
        }
        info!(
            "Poll of recipe {:?}: {} modified, {} deleted, watermark {}",
            self.config.recipe,
            updates.modifications.len(),
            updates.deletions.len(),
            updates.last_tiddler_id
        );
        Ok(updates)
    }

    // ── Items ────────────────────────────────────────────────────

    /// Loads a tiddler through the recipe and records its bag and
    /// revision. A 404 means the server has no such tiddler.
    pub async fn load_tiddler(&self, title: &str) -> SyncResult<Option<Tiddler>> {
        let url = self.recipe_tiddler_url(title);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("load of {title:?} failed: {e}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{:?} not found on server", title);
            return Ok(None);
        }
        let response = check_status(response).await?;
        let (bag, revision) = location(response.headers())?;
        let body = response.text().await?;
        let tiddler: Tiddler = serde_json::from_str(&body)
            .map_err(|e| SyncError::Protocol(format!("malformed tiddler {title:?}: {e}")))?;

        self.record_location(title, &bag, &revision).await?;
        debug!("Loaded {:?} from bag {:?} at revision {}", title, bag, revision);
        Ok(Some(tiddler))
    }

    /// Saves a tiddler through the recipe. The server picks the bag and
    /// assigns the revision; both replace whatever was recorded before.
    pub async fn save_tiddler(&self, tiddler: &Tiddler) -> SyncResult<SaveOutcome> {
        if self.config.read_only {
            debug!("Read-only: not saving {:?}", tiddler.title());
            return Ok(SaveOutcome::Skipped);
        }
        let _ordered = self.ordering.read().await;

        let url = self.recipe_tiddler_url(tiddler.title());
        let response = self
            .http
            .put(&url)
            .json(tiddler)
            .send()
            .await
            .map_err(|e| {
                SyncError::Transport(format!("save of {:?} failed: {e}", tiddler.title()))
            })?;
        let response = check_status(response).await?;
        let (bag, revision) = location(response.headers())?;

        self.record_location(tiddler.title(), &bag, &revision).await?;
        debug!(
            "Saved {:?} to bag {:?} at revision {}",
            tiddler.title(),
            bag,
            revision
        );
        Ok(SaveOutcome::Saved { bag, revision })
    }

    /// Deletes a tiddler from the bag it was last seen in.
    ///
    /// Without a recorded bag the server never had the tiddler, so the
    /// call succeeds without a request.
    pub async fn delete_tiddler(&self, title: &str) -> SyncResult<DeleteOutcome> {
        if self.config.read_only {
            debug!("Read-only: not deleting {:?}", title);
            return Ok(DeleteOutcome::Skipped);
        }
        let _ordered = self.ordering.read().await;

        let lookup = title.to_string();
        let Some(info) = self.with_state(move |s| s.remote_info(&lookup)).await? else {
            debug!("{:?} was never on the server", title);
            return Ok(DeleteOutcome::NotOnServer);
        };
        let url = format!(
            "{}bags/{}/tiddlers/{}",
            self.base_url,
            urlencoding::encode(&info.bag),
            urlencoding::encode(title)
        );
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("delete of {title:?} failed: {e}")))?;
        check_status(response).await?;

        let forgotten = title.to_string();
        self.with_state(move |s| s.remove_remote_info(&forgotten)).await?;
        debug!("Deleted {:?} from bag {:?}", title, info.bag);
        Ok(DeleteOutcome::Deleted)
    }

    async fn record_location(&self, title: &str, bag: &str, revision: &Revision) -> SyncResult<()> {
        let (title, bag, revision) = (title.to_string(), bag.to_string(), revision.clone());
        self.with_state(move |s| s.set_remote_info(&title, &bag, &revision))
            .await
    }

    fn recipe_tiddler_url(&self, title: &str) -> String {
        format!(
            "{}recipes/{}/tiddlers/{}",
            self.base_url,
            urlencoding::encode(&self.config.recipe),
            urlencoding::encode(title)
        )
    }
}

/// Turns any non-success status into [`SyncError::Http`].
async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Server returned {}: {}", status, body);
    Err(SyncError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Reads the bag and revision headers of an item response.
fn location(headers: &HeaderMap) -> SyncResult<(String, Revision)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SyncError::Protocol(format!("missing {name} header")))
    };
    let revision = Revision::new(header(REVISION_HEADER)?);
    let bag = header(BAG_HEADER)?;
    Ok((bag, revision))
}
