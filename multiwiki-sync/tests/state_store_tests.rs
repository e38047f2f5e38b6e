use multiwiki_sync::SyncStateStore;
use multiwiki_types::{Revision, TiddlerId};
use pretty_assertions::assert_eq;

#[test]
fn watermark_starts_at_zero() {
    let store = SyncStateStore::open_in_memory().unwrap();
    assert_eq!(store.last_tiddler_id().unwrap(), TiddlerId::new(0));
}

#[test]
fn watermark_never_moves_backwards() {
    let store = SyncStateStore::open_in_memory().unwrap();
    assert_eq!(store.advance_watermark(TiddlerId::new(9)).unwrap(), TiddlerId::new(9));
    assert_eq!(store.advance_watermark(TiddlerId::new(4)).unwrap(), TiddlerId::new(9));
    assert_eq!(store.last_tiddler_id().unwrap(), TiddlerId::new(9));
}

#[test]
fn remote_info_replaced_and_removed() {
    let store = SyncStateStore::open_in_memory().unwrap();
    store.set_remote_info("A", "system", &Revision::new("1")).unwrap();
    store.set_remote_info("A", "user", &Revision::new("5")).unwrap();
    store.set_remote_info("B", "user", &Revision::new("6")).unwrap();

    let a = store.remote_info("A").unwrap().unwrap();
    assert_eq!(a.bag, "user");
    assert_eq!(a.revision, Revision::new("5"));

    let titles: Vec<String> = store.all_remote_info().unwrap().into_iter().map(|i| i.title).collect();
    assert_eq!(titles, vec!["A", "B"]);

    assert!(store.remove_remote_info("A").unwrap());
    assert!(!store.remove_remote_info("A").unwrap());
    assert!(store.remote_info("A").unwrap().is_none());
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.sqlite");
    {
        let store = SyncStateStore::open(&path).unwrap();
        store.advance_watermark(TiddlerId::new(42)).unwrap();
        store.set_remote_info("A", "user", &Revision::new("42")).unwrap();
    }
    let store = SyncStateStore::open(&path).unwrap();
    assert_eq!(store.last_tiddler_id().unwrap(), TiddlerId::new(42));
    assert_eq!(store.remote_info("A").unwrap().unwrap().bag, "user");
}
