use multiwiki_storage::{BagStore, LayerStore, ShadowLayer, ShadowStore};
use multiwiki_types::Tiddler;
use pretty_assertions::assert_eq;

/// Behaviour every layer store shares, checked against one layer.
fn check_layer_contract<S: LayerStore>(store: &S, layer: &S::Layer) {
    assert!(store.list_titles(layer).unwrap().is_empty());
    assert!(store.get_item(layer, "A").unwrap().is_none());

    store.put_item(layer, &Tiddler::new("B").with_text("b")).unwrap();
    store.put_item(layer, &Tiddler::new("A").with_text("1")).unwrap();
    store.put_item(layer, &Tiddler::new("A").with_text("2")).unwrap();

    assert_eq!(store.list_titles(layer).unwrap(), vec!["A", "B"]);
    assert_eq!(store.get_item(layer, "A").unwrap().unwrap().text(), Some("2"));

    assert!(store.delete_item(layer, "A").unwrap());
    assert!(!store.delete_item(layer, "A").unwrap());
    assert!(store.get_item(layer, "A").unwrap().is_none());
    assert_eq!(store.list_titles(layer).unwrap(), vec!["B"]);
}

#[test]
fn bag_store_honours_layer_contract() {
    let store = BagStore::open_in_memory().unwrap();
    store.create_layer("user").unwrap();
    check_layer_contract(&store, "user");
}

#[test]
fn shadow_store_plugin_layer_honours_layer_contract() {
    let store = ShadowStore::open_in_memory().unwrap();
    store.create_layer("$:/core").unwrap();
    check_layer_contract(&store, &ShadowLayer::plugin("$:/core"));
}

#[test]
fn shadow_store_user_layer_honours_layer_contract() {
    let store = ShadowStore::open_in_memory().unwrap();
    check_layer_contract(&store, &ShadowLayer::User);
}

#[test]
fn create_layer_is_idempotent() {
    let bags = BagStore::open_in_memory().unwrap();
    assert_eq!(bags.create_layer("a").unwrap(), bags.create_layer("a").unwrap());

    bags.create_layer("b").unwrap();
    assert_eq!(bags.create_layer("a").unwrap(), bags.create_layer("a").unwrap());

    let shadows = ShadowStore::open_in_memory().unwrap();
    let first = shadows.create_layer("a").unwrap();
    shadows.create_layer("b").unwrap();
    assert_eq!(shadows.create_layer("a").unwrap(), first);
}

#[test]
fn reassigning_plugin_priorities_keeps_layer_ids() {
    let shadows = ShadowStore::open_in_memory().unwrap();
    let a = shadows.create_layer("a").unwrap();
    let b = shadows.create_layer("b").unwrap();
    shadows.create_layer("c").unwrap();

    shadows.set_plugin_priorities(&["b", "a"]).unwrap();
    assert_eq!(
        shadows.plugin_priorities().unwrap(),
        vec![("b".to_string(), 1), ("a".to_string(), 2)]
    );
    assert_eq!(shadows.create_layer("b").unwrap(), b);
    assert_eq!(shadows.create_layer("a").unwrap(), a);
}
