use multiwiki_types::{Error, Tiddler};
use std::collections::BTreeMap;

// ── Construction ─────────────────────────────────────────────────

#[test]
fn new_tiddler_has_title_and_no_fields() {
    let t = Tiddler::new("HelloThere");
    assert_eq!(t.title(), "HelloThere");
    assert!(t.fields().is_empty());
    assert_eq!(t.text(), None);
}

#[test]
fn builder_sets_text_and_fields() {
    let t = Tiddler::new("A").with_text("body").with_field("type", "text/vnd.tiddlywiki");
    assert_eq!(t.text(), Some("body"));
    assert_eq!(t.field("type"), Some("text/vnd.tiddlywiki"));
    assert_eq!(t.field("title"), Some("A"));
}

#[test]
fn setting_title_field_renames() {
    let mut t = Tiddler::new("Old");
    t.set_field("title", "New");
    assert_eq!(t.title(), "New");
    assert!(!t.fields().contains_key("title"));
}

#[test]
fn with_fields_ignores_stray_title() {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "Other".to_string());
    fields.insert("text".to_string(), "x".to_string());
    let t = Tiddler::with_fields("Mine", fields);
    assert_eq!(t.title(), "Mine");
    assert_eq!(t.fields().len(), 1);
}

#[test]
fn from_fields_requires_title() {
    let mut fields = BTreeMap::new();
    fields.insert("text".to_string(), "x".to_string());
    assert!(matches!(Tiddler::from_fields(fields), Err(Error::MissingTitle)));
}

#[test]
fn remove_field() {
    let mut t = Tiddler::new("A").with_text("x");
    assert_eq!(t.remove_field("text"), Some("x".to_string()));
    assert_eq!(t.text(), None);
}

// ── JSON shape ───────────────────────────────────────────────────

#[test]
fn serializes_as_flat_object() {
    let t = Tiddler::new("A").with_text("hello").with_field("tags", "x y");
    let value = serde_json::to_value(&t).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"title": "A", "text": "hello", "tags": "x y"})
    );
}

#[test]
fn deserializes_from_flat_object() {
    let t: Tiddler = serde_json::from_str(r#"{"title":"B","text":"body","modified":"20240101"}"#).unwrap();
    assert_eq!(t.title(), "B");
    assert_eq!(t.text(), Some("body"));
    assert_eq!(t.field("modified"), Some("20240101"));
}

#[test]
fn deserialize_without_title_fails() {
    let result: Result<Tiddler, _> = serde_json::from_str(r#"{"text":"body"}"#);
    assert!(result.is_err());
}

// ── Tags ─────────────────────────────────────────────────────────

#[test]
fn tags_parse_bracketed_titles() {
    let t = Tiddler::new("A").with_field("tags", "one [[two words]] three");
    assert_eq!(t.tags(), vec!["one", "two words", "three"]);
    assert!(t.has_tag("two words"));
    assert!(!t.has_tag("two"));
}

#[test]
fn tags_absent_is_empty() {
    assert!(Tiddler::new("A").tags().is_empty());
}
