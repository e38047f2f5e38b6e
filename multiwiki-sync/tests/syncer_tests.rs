use async_trait::async_trait;
use multiwiki_sync::{
    LocalReplica, SyncClient, SyncConfig, SyncError, SyncResult, SyncStateStore, Syncer,
    WatermarkPolicy,
};
use multiwiki_types::{Tiddler, TiddlerId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// In-memory replica that can be told to reject some titles.
#[derive(Default)]
struct MemoryReplica {
    tiddlers: Mutex<BTreeMap<String, Tiddler>>,
    rejected: HashSet<String>,
}

impl MemoryReplica {
    fn rejecting(titles: &[&str]) -> Self {
        Self {
            rejected: titles.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn titles(&self) -> Vec<String> {
        self.tiddlers.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl LocalReplica for MemoryReplica {
    async fn store_tiddler(&self, tiddler: Tiddler) -> SyncResult<()> {
        if self.rejected.contains(tiddler.title()) {
            return Err(SyncError::Replica(format!("rejected {}", tiddler.title())));
        }
        self.tiddlers.lock().await.insert(tiddler.title().to_string(), tiddler);
        Ok(())
    }

    async fn remove_tiddler(&self, title: &str) -> SyncResult<()> {
        self.tiddlers.lock().await.remove(title);
        Ok(())
    }
}

async fn mount_item(server: &MockServer, title: &str, text: &str, revision: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/recipes/default/tiddlers/{title}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Revision-Number", revision)
                .insert_header("X-Bag-Name", "user")
                .set_body_json(json!({"title": title, "text": text})),
        )
        .mount(server)
        .await;
}

fn syncer(server: &MockServer, policy: WatermarkPolicy, replica: Arc<MemoryReplica>) -> Syncer {
    let config = SyncConfig {
        host: server.uri(),
        watermark_policy: policy,
        ..SyncConfig::default()
    };
    let state = Arc::new(SyncStateStore::open_in_memory().unwrap());
    let client = Arc::new(SyncClient::new(config, state).unwrap());
    Syncer::new(client, replica)
}

#[tokio::test]
async fn sync_once_applies_modifications_and_deletions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "A", "tiddler_id": 3, "is_deleted": false},
            {"title": "Old", "tiddler_id": 4, "is_deleted": true},
        ])))
        .mount(&server)
        .await;
    mount_item(&server, "A", "alpha", "3").await;

    let replica = Arc::new(MemoryReplica::default());
    replica
        .store_tiddler(Tiddler::new("Old").with_text("stale"))
        .await
        .unwrap();
    let syncer = syncer(&server, WatermarkPolicy::AdvanceOnReceipt, replica.clone());
    syncer
        .client()
        .state()
        .set_remote_info("Old", "user", &multiwiki_types::Revision::new("1"))
        .unwrap();

    let report = syncer.sync_once().await.unwrap();
    assert_eq!(report.modified, vec!["A"]);
    assert_eq!(report.deleted, vec!["Old"]);
    assert!(report.failed.is_empty());
    assert_eq!(report.watermark, TiddlerId::new(4));

    assert_eq!(replica.titles().await, vec!["A"]);
    assert!(syncer.client().get_tiddler_info("Old").unwrap().is_none());
    assert_eq!(syncer.client().get_tiddler_info("A").unwrap().unwrap().bag, "user");
}

#[tokio::test]
async fn title_gone_before_load_is_treated_as_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "Flicker", "tiddler_id": 2, "is_deleted": false},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers/Flicker"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let replica = Arc::new(MemoryReplica::default());
    let report = syncer(&server, WatermarkPolicy::AdvanceOnReceipt, replica)
        .sync_once()
        .await
        .unwrap();
    assert!(report.modified.is_empty());
    assert_eq!(report.deleted, vec!["Flicker"]);
}

#[tokio::test]
async fn failed_apply_is_not_refetched_when_advancing_on_receipt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .and(query_param("last_known_tiddler_id", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "Bad", "tiddler_id": 5, "is_deleted": false},
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .and(query_param("last_known_tiddler_id", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    mount_item(&server, "Bad", "x", "5").await;

    let replica = Arc::new(MemoryReplica::rejecting(&["Bad"]));
    let syncer = syncer(&server, WatermarkPolicy::AdvanceOnReceipt, replica);

    let first = syncer.sync_once().await.unwrap();
    assert_eq!(first.failed, vec!["Bad"]);
    assert_eq!(first.watermark, TiddlerId::new(5));

    let second = syncer.sync_once().await.unwrap();
    assert!(second.failed.is_empty());
    assert!(second.modified.is_empty());
}

#[tokio::test]
async fn failed_apply_is_refetched_when_advancing_after_apply() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .and(query_param("last_known_tiddler_id", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "Good", "tiddler_id": 5, "is_deleted": false},
            {"title": "Bad", "tiddler_id": 6, "is_deleted": false},
        ])))
        .expect(2)
        .mount(&server)
        .await;
    mount_item(&server, "Good", "g", "5").await;
    mount_item(&server, "Bad", "b", "6").await;

    let replica = Arc::new(MemoryReplica::rejecting(&["Bad"]));
    let syncer = syncer(&server, WatermarkPolicy::AdvanceAfterApply, replica.clone());

    for _ in 0..2 {
        let report = syncer.sync_once().await.unwrap();
        assert_eq!(report.modified, vec!["Good"]);
        assert_eq!(report.failed, vec!["Bad"]);
        assert_eq!(report.watermark, TiddlerId::new(0));
    }
    assert_eq!(replica.titles().await, vec!["Good"]);
}

#[tokio::test]
async fn successful_batch_commits_watermark_after_apply() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "Good", "tiddler_id": 8, "is_deleted": false},
        ])))
        .mount(&server)
        .await;
    mount_item(&server, "Good", "g", "8").await;

    let syncer = syncer(
        &server,
        WatermarkPolicy::AdvanceAfterApply,
        Arc::new(MemoryReplica::default()),
    );
    let report = syncer.sync_once().await.unwrap();
    assert_eq!(report.watermark, TiddlerId::new(8));
    assert_eq!(syncer.client().last_tiddler_id().unwrap(), TiddlerId::new(8));
}

#[tokio::test]
async fn run_polls_until_shutdown() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("multiwiki_sync=debug")
        .with_test_writer()
        .try_init();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recipes/default/tiddlers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let syncer = Arc::new(syncer(
        &server,
        WatermarkPolicy::AdvanceOnReceipt,
        Arc::new(MemoryReplica::default()),
    ));
    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn({
        let syncer = syncer.clone();
        async move { syncer.run(stopped).await }
    });

    // The first tick fires immediately.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    let polls = server.received_requests().await.unwrap();
    assert_eq!(polls.len(), 1);
}
