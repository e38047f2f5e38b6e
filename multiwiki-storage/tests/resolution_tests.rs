//! Property tests: the materialized indexes always agree with a direct
//! computation of the winner, whatever the order of operations.

use multiwiki_storage::{BagStore, Rank, ShadowLayer, ShadowStore, winner};
use multiwiki_types::Tiddler;
use proptest::prelude::*;
use std::collections::BTreeMap;

const BAGS: [&str; 3] = ["low", "mid", "high"];
const TITLES: [&str; 4] = ["A", "B", "C", "D"];

#[derive(Debug, Clone)]
enum Op {
    Put { bag: usize, title: usize },
    Delete { bag: usize, title: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..BAGS.len(), 0..TITLES.len()).prop_map(|(bag, title)| Op::Put { bag, title }),
        1 => (0..BAGS.len(), 0..TITLES.len()).prop_map(|(bag, title)| Op::Delete { bag, title }),
    ]
}

fn recipe_store() -> BagStore {
    let store = BagStore::open_in_memory().unwrap();
    for bag in BAGS {
        store.create_bag(bag, "").unwrap();
    }
    store.create_recipe("r", &BAGS).unwrap();
    store
}

/// Applies the ops and returns the expected winning bag per title.
fn apply(store: &BagStore, ops: &[Op]) -> BTreeMap<String, String> {
    let mut held: BTreeMap<(usize, usize), String> = BTreeMap::new();
    for (step, op) in ops.iter().enumerate() {
        match *op {
            Op::Put { bag, title } => {
                let text = format!("{}@{}", BAGS[bag], step);
                store
                    .save_bag_tiddler(&Tiddler::new(TITLES[title]).with_text(&text), BAGS[bag])
                    .unwrap();
                held.insert((bag, title), text);
            }
            Op::Delete { bag, title } => {
                store.delete_tiddler(TITLES[title], BAGS[bag]).unwrap();
                held.remove(&(bag, title));
            }
        }
    }
    let mut expected = BTreeMap::new();
    for title in 0..TITLES.len() {
        let candidates = held
            .keys()
            .filter(|(_, t)| *t == title)
            .map(|(bag, _)| Rank::new(*bag as i64, *bag));
        if let Some(best) = winner(candidates) {
            expected.insert(TITLES[title].to_string(), BAGS[best.layer].to_string());
        }
    }
    expected
}

proptest! {
    #[test]
    fn recipe_index_matches_direct_resolution(ops in prop::collection::vec(op(), 0..40)) {
        let store = recipe_store();
        let expected = apply(&store, &ops);

        let titles: Vec<String> = expected.keys().cloned().collect();
        prop_assert_eq!(store.get_recipe_tiddlers("r").unwrap(), titles);
        for (title, bag) in &expected {
            let stored = store.get_recipe_tiddler(title, "r").unwrap().unwrap();
            prop_assert_eq!(&stored.bag_name, bag);
        }
    }

    #[test]
    fn resolve_recipe_agrees_with_single_lookups(ops in prop::collection::vec(op(), 0..40)) {
        let store = recipe_store();
        apply(&store, &ops);

        for stored in store.resolve_recipe("r").unwrap() {
            let single = store
                .get_recipe_tiddler(stored.tiddler.title(), "r")
                .unwrap()
                .unwrap();
            prop_assert_eq!(stored, single);
        }
    }

    #[test]
    fn reordering_equals_building_in_final_order(ops in prop::collection::vec(op(), 0..30)) {
        let reordered = recipe_store();
        apply(&reordered, &ops);
        reordered.create_recipe("r", &["high", "low", "mid"]).unwrap();

        let direct = BagStore::open_in_memory().unwrap();
        for bag in BAGS {
            direct.create_bag(bag, "").unwrap();
        }
        direct.create_recipe("r", &["high", "low", "mid"]).unwrap();
        apply(&direct, &ops);

        let winners = |store: &BagStore| {
            store
                .resolve_recipe("r")
                .unwrap()
                .into_iter()
                .map(|s| (s.tiddler.title().to_string(), s.bag_name))
                .collect::<Vec<_>>()
        };
        prop_assert_eq!(winners(&reordered), winners(&direct));
    }

    #[test]
    fn shadow_user_layer_always_wins(plugins in prop::collection::vec(0..3usize, 0..6), user in any::<bool>()) {
        let store = ShadowStore::open_in_memory().unwrap();
        store.set_plugin_priorities(&["p0", "p1", "p2"]).unwrap();
        for p in &plugins {
            store
                .save_tiddler(&Tiddler::new("T").with_text(format!("p{p}")), Some(format!("p{p}").as_str()))
                .unwrap();
        }
        if user {
            store.save_tiddler(&Tiddler::new("T").with_text("user"), None).unwrap();
        }

        let expected = if user {
            Some("user".to_string())
        } else {
            plugins.iter().max().map(|p| format!("p{p}"))
        };
        let visible = store.get_tiddler("T").unwrap().and_then(|t| t.text().map(str::to_string));
        prop_assert_eq!(visible, expected);
    }
}

#[test]
fn user_layer_sorts_above_plugins() {
    assert!(ShadowLayer::User > ShadowLayer::plugin("zzz"));
}
