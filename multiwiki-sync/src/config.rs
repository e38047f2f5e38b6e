//! Sync client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the poll watermark moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Advance as soon as a poll response is parsed. A batch that fails to
    /// apply locally is not fetched again.
    #[default]
    AdvanceOnReceipt,
    /// Advance only once every change of the batch applied locally. A
    /// failed batch is fetched again by the next poll.
    AdvanceAfterApply,
}

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the server. A trailing slash is added if missing.
    pub host: String,
    /// Recipe this client reads from and saves through.
    pub recipe: String,
    /// Skip every write without contacting the server.
    pub read_only: bool,
    /// Seconds between polls when driven by [`Syncer::run`](crate::Syncer::run).
    pub poll_interval_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// When the poll watermark advances.
    pub watermark_policy: WatermarkPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:8080/".to_string(),
            recipe: "default".to_string(),
            read_only: false,
            poll_interval_secs: 60,
            request_timeout_secs: 30,
            watermark_policy: WatermarkPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Creates a config for `recipe` on `host`, other settings default.
    pub fn new(host: impl Into<String>, recipe: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            recipe: recipe.into(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The host with exactly one trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}/", self.host.trim_end_matches('/'))
    }
}
