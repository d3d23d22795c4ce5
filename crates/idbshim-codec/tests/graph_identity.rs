//! Identity preservation through the graph codec

use idbshim_codec::graph::{self, structured_clone};
use idbshim_codec::{ObjectRef, Value};
use serde_json::json;

#[test]
fn test_shared_child_is_decoded_once() {
    let child = ObjectRef::from_fields([("n", 1)]);
    let root = ObjectRef::new();
    root.set("left", child.clone());
    root.set("right", child.clone());

    let text = graph::to_string(&Value::Object(root)).unwrap();
    let decoded = graph::from_str(&text).unwrap();

    let left = decoded.get("left").unwrap();
    let right = decoded.get("right").unwrap();
    assert!(left.as_object().unwrap().ptr_eq(right.as_object().unwrap()));
    assert!(!left.as_object().unwrap().ptr_eq(&child));

    // Mutations through one path are visible through the other.
    left.as_object().unwrap().set("n", 2);
    assert_eq!(right.get("n"), Some(Value::from(2)));
}

#[test]
fn test_cycle_through_array_survives() {
    let parent = ObjectRef::from_fields([("name", "parent")]);
    let kid = ObjectRef::from_fields([("name", "kid")]);
    kid.set("parent", parent.clone());
    parent.set("children", Value::Array(vec![kid.clone().into(), kid.into()]));

    let decoded = structured_clone(&Value::Object(parent.clone())).unwrap();
    assert_eq!(decoded, Value::Object(parent));

    let decoded_parent = decoded.as_object().unwrap();
    let children = match decoded_parent.get("children").unwrap() {
        Value::Array(items) => items,
        other => panic!("unexpected children: {other:?}"),
    };
    let first = children[0].as_object().unwrap();
    let second = children[1].as_object().unwrap();
    assert!(first.ptr_eq(second));
    assert!(first
        .get("parent")
        .unwrap()
        .as_object()
        .unwrap()
        .ptr_eq(decoded_parent));
}

#[test]
fn test_structured_clone_is_detached_from_source() {
    let source = ObjectRef::from_fields([("tags", json!(["a", "b"]))]);
    let copy = structured_clone(&Value::Object(source.clone())).unwrap();

    source.set("tags", Value::Null);
    assert_eq!(copy.get("tags"), Some(Value::from(json!(["a", "b"]))));
}

#[test]
fn test_plain_json_decodes_without_markers() {
    let decoded = graph::decode(&json!({"id": 1, "nested": {"k": [true, null]}})).unwrap();
    assert_eq!(decoded.get("id"), Some(Value::from(1)));
    assert_eq!(
        decoded.get("nested").unwrap().get("k"),
        Some(Value::Array(vec![Value::Bool(true), Value::Null]))
    );
}

#[test]
fn test_raw_nodes_decode_structurally() {
    let raw = json!({"kind": "blob", "size": 3});
    let text = graph::to_string(&Value::Raw(raw.clone())).unwrap();
    let decoded = graph::from_str(&text).unwrap();
    assert_eq!(decoded, Value::from(raw));
}

#[test]
fn test_truncated_text_is_an_error() {
    assert!(graph::from_str("{\"@id\":\"0\",").is_err());
}
