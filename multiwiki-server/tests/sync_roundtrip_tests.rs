//! The sync client driven against a live server.

use multiwiki_server::build_router;
use multiwiki_storage::BagStore;
use multiwiki_sync::{DeleteOutcome, SaveOutcome, SyncClient, SyncConfig, SyncStateStore};
use multiwiki_types::{Tiddler, TiddlerId};
use pretty_assertions::assert_eq;
use std::sync::Arc;

async fn spawn_server() -> (Arc<BagStore>, String) {
    let store = BagStore::open_in_memory().unwrap();
    store.create_bag("system", "").unwrap();
    store.create_bag("user", "").unwrap();
    store.create_recipe("default", &["system", "user"]).unwrap();
    let store = Arc::new(store);

    let app = build_router(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (store, format!("http://127.0.0.1:{}", port))
}

fn client(base: &str) -> SyncClient {
    let state = Arc::new(SyncStateStore::open_in_memory().unwrap());
    SyncClient::new(SyncConfig::new(base, "default"), state).unwrap()
}

#[tokio::test]
async fn save_poll_load_delete() {
    let (store, base) = spawn_server().await;
    let client = client(&base);

    let outcome = client
        .save_tiddler(&Tiddler::new("Note/1").with_text("first"))
        .await
        .unwrap();
    let SaveOutcome::Saved { bag, revision } = outcome else {
        panic!("save skipped");
    };
    assert_eq!(bag, "user");

    let updates = client.get_updated_tiddlers().await.unwrap();
    assert_eq!(updates.modifications, vec!["Note/1"]);
    assert_eq!(updates.last_tiddler_id.to_string(), revision.as_str());

    let loaded = client.load_tiddler("Note/1").await.unwrap().unwrap();
    assert_eq!(loaded.text(), Some("first"));

    assert_eq!(client.delete_tiddler("Note/1").await.unwrap(), DeleteOutcome::Deleted);
    assert!(store.get_recipe_tiddler("Note/1", "default").unwrap().is_none());
    assert_eq!(client.load_tiddler("Note/1").await.unwrap(), None);

    let updates = client.get_updated_tiddlers().await.unwrap();
    assert!(updates.modifications.is_empty());
    assert_eq!(updates.deletions, vec!["Note/1"]);
}

#[tokio::test]
async fn second_client_sees_first_clients_changes() {
    let (_store, base) = spawn_server().await;
    let writer = client(&base);
    let reader = client(&base);

    writer.save_tiddler(&Tiddler::new("Shared").with_text("v1")).await.unwrap();
    let first = reader.get_updated_tiddlers().await.unwrap();
    assert_eq!(first.modifications, vec!["Shared"]);

    // Nothing new: the watermark keeps the same change from coming back.
    assert!(reader.get_updated_tiddlers().await.unwrap().is_empty());

    writer.save_tiddler(&Tiddler::new("Shared").with_text("v2")).await.unwrap();
    let second = reader.get_updated_tiddlers().await.unwrap();
    assert_eq!(second.modifications, vec!["Shared"]);
    assert!(second.last_tiddler_id > first.last_tiddler_id);
    assert_eq!(
        reader.load_tiddler("Shared").await.unwrap().unwrap().text(),
        Some("v2")
    );
}

#[tokio::test]
async fn deleting_override_reports_revealed_copy_as_modified() {
    let (store, base) = spawn_server().await;
    store
        .save_bag_tiddler(&Tiddler::new("Config").with_text("default"), "system")
        .unwrap();
    let client = client(&base);

    client.save_tiddler(&Tiddler::new("Config").with_text("custom")).await.unwrap();
    client.get_updated_tiddlers().await.unwrap();

    client.delete_tiddler("Config").await.unwrap();
    let updates = client.get_updated_tiddlers().await.unwrap();
    assert_eq!(updates.modifications, vec!["Config"]);
    assert!(updates.deletions.is_empty());

    let revealed = client.load_tiddler("Config").await.unwrap().unwrap();
    assert_eq!(revealed.text(), Some("default"));
    assert_eq!(client.get_tiddler_info("Config").unwrap().unwrap().bag, "system");
    assert!(client.last_tiddler_id().unwrap() > TiddlerId::new(0));
}
