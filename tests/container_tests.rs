use dddkit::common::id_generator::extract_id_salt;
use dddkit::prelude::*;
use dddkit::types::{ElementType, EntitySetObject, ListObject, MapObject, SetObject};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

fn child_schema() -> Arc<EntitySchema> {
    EntitySchema::builder("ChildEntity")
        .field(FieldInfo::string("child_id").primary_key())
        .field(FieldInfo::string("name").optional())
        .build()
        .unwrap()
}

fn strings(value: &serde_json::Value) -> BTreeSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_entity_set_generates_distinct_ids() {
    let mut set = EntitySetObject::new(child_schema(), 2, RequestContext::default());
    let first = set
        .add(attrs! { "child_id" => Value::Null })
        .unwrap()
        .primary_id();
    let second = set
        .add(attrs! { "child_id" => Value::Null })
        .unwrap()
        .primary_id();

    assert_ne!(first, second);
    assert!(set.get(&first).is_some());
    assert!(set.get(&second).is_some());

    let dirty = set.dirty().unwrap();
    let added = dirty["data"]["added"].as_array().unwrap();
    assert_eq!(added.len(), 2);
    let ids: BTreeSet<&str> = added.iter().filter_map(|c| c["child_id"].as_str()).collect();
    assert_eq!(ids, BTreeSet::from([first.as_str(), second.as_str()]));
}

#[test]
fn test_generated_ids_skip_external_suffixes() {
    let schema = child_schema();
    let ctx = RequestContext::default();
    let stored = ["1-2-7", "5-9-120", "plain"]
        .iter()
        .map(|id| Entity::new(&schema, attrs! { "child_id" => *id }, &ctx).unwrap())
        .collect();
    let mut set = EntitySetObject::loaded(schema, stored, 2, ctx).unwrap();

    let mut seen: BTreeSet<String> = set.iter().map(Entity::primary_id).collect();
    set.add(attrs! { "child_id" => "3-3-500" }).unwrap();
    seen.insert("3-3-500".to_string());
    for _ in 0..20 {
        let id = set.add(attrs! {}).unwrap().primary_id();
        assert!(extract_id_salt(&id).unwrap() > 500);
        assert!(seen.insert(id), "generated id repeated");
    }
}

#[test]
fn test_list_partitions_touched_items() {
    let mut list = ListObject::with_items(
        ElementType::Str,
        vec![Value::from("a"), Value::from("b"), Value::from("c")],
    )
    .unwrap();
    list.add("d").unwrap();
    list.remove("a").unwrap();
    list.add("e").unwrap();
    list.remove("e").unwrap();

    let dirty = list.dirty().unwrap();
    let added = strings(&dirty["data"]["added"]);
    let deleted = strings(&dirty["data"]["deleted"]);
    assert_eq!(added, BTreeSet::from(["d".to_string()]));
    assert_eq!(deleted, BTreeSet::from(["a".to_string()]));
    assert!(added.is_disjoint(&deleted));

    list.mark_persisted();
    assert!(list.dirty().is_none());
}

#[test]
fn test_set_partitions_touched_items() {
    let mut set =
        SetObject::with_items(ElementType::Str, vec![Value::from("x"), Value::from("y")]).unwrap();
    set.add("z").unwrap();
    set.add("x").unwrap();
    set.remove("y").unwrap();
    set.add("y").unwrap();
    set.remove("x").unwrap();

    let first = set.dirty().unwrap();
    let added = strings(&first["data"]["added"]);
    let removed = strings(&first["data"]["removed"]);
    assert_eq!(added, BTreeSet::from(["z".to_string()]));
    assert_eq!(removed, BTreeSet::from(["x".to_string()]));
    assert!(added.is_disjoint(&removed));
    assert!(!added.contains("y") && !removed.contains("y"));

    assert_eq!(set.dirty().unwrap(), first);
}

#[test]
fn test_map_partitions_touched_keys() {
    let mut map = MapObject::with_items(
        ElementType::Int,
        [("cpu", 2), ("mem", 512), ("disk", 10)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::from(v)))
            .collect(),
    )
    .unwrap();
    map.set("gpu", 1).unwrap();
    map.set("mem", 1024).unwrap();
    map.delete("cpu").unwrap();
    map.set("tmp", 5).unwrap();
    map.delete("tmp").unwrap();

    let dirty = map.dirty().unwrap();
    let data = &dirty["data"];
    assert_eq!(data["added"], json!({"gpu": {"old": null, "new": 1}}));
    assert_eq!(data["updated"], json!({"mem": {"old": 512, "new": 1024}}));
    assert_eq!(data["deleted"], json!({"cpu": {"old": 2, "new": null}}));
    assert!(map.contains_key("disk"));
}

#[test]
fn test_entity_set_update_partitions_children() {
    let schema = child_schema();
    let ctx = RequestContext::default();
    let stored = ["a", "b", "c"]
        .iter()
        .map(|id| Entity::new(&schema, attrs! { "child_id" => *id }, &ctx).unwrap())
        .collect();
    let mut set = EntitySetObject::loaded(schema, stored, 2, ctx).unwrap();

    set.update(Value::List(vec![
        Value::Map(attrs! { "child_id" => "a", "name" => "renamed" }),
        Value::Map(attrs! { "child_id" => "c" }),
        Value::Map(attrs! { "child_id" => "d", "name" => "new" }),
    ]))
    .unwrap();

    let dirty = set.dirty().unwrap();
    let data = &dirty["data"];
    let ids = |key: &str| -> BTreeSet<String> {
        data[key]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["child_id"].as_str().or_else(|| c["id"].as_str()))
            .map(str::to_string)
            .collect()
    };
    assert_eq!(ids("added"), BTreeSet::from(["d".to_string()]));
    assert_eq!(ids("deleted"), BTreeSet::from(["b".to_string()]));
    assert_eq!(ids("updated"), BTreeSet::from(["a".to_string()]));
}
