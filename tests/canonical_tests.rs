use std::path::Path;

use serde_json::{json, Map, Value};
use winetrace::{canonicalize, Stage, TraceError};

fn fixture(name: &str) -> Map<String, Value> {
    let raw = std::fs::read_to_string(Path::new("tests/fixtures").join(name)).unwrap();
    serde_json::from_str::<Value>(&raw).unwrap().as_object().cloned().unwrap()
}

#[test]
fn test_produce_hash_of_bottle_fixture() {
    let record = canonicalize(Stage::Produce, &fixture("bottle.json")).unwrap();
    assert_eq!(
        record.to_json(),
        r#"{"id":"coco1514","batch_id":1,"current_status":"Produced","retailer":"","vineyard":"Ch\u00e2teau Margaux"}"#
    );
    assert_eq!(
        record.content_hash().to_hex(),
        "0x8827e20e3da6726dcf30b023191cfb414362cf57264829ab77b8ee68335a2c91"
    );
}

#[test]
fn test_ship_hash_of_milestone_fixture() {
    let record = canonicalize(Stage::Ship, &fixture("ship_lyon.json")).unwrap();
    assert_eq!(
        record.to_json(),
        r#"{"location":"Lyon","status":"in-transit","ts":1700000000,"is_milestone":1,"bottle_id":"coco1514"}"#
    );
    assert_eq!(
        record.content_hash().to_hex(),
        "0x6cb4b0d308537113c94d9da0b42885c31a00bf07c81eb931fb28783b0c504619"
    );
}

#[test]
fn test_deliver_hash_of_sale_fixture() {
    let record = canonicalize(Stage::Deliver, &fixture("deliver_paris.json")).unwrap();
    assert_eq!(
        record.content_hash().to_hex(),
        "0x11348c999f1f4db4403e9a3e6604d6e1320b8938321df46938f13dfa7e9b139c"
    );
}

#[test]
fn test_same_fields_hash_differently_per_stage() {
    let bottle = fixture("deliver_paris.json");
    let produce = canonicalize(Stage::Produce, &bottle).unwrap();
    let deliver = canonicalize(Stage::Deliver, &bottle).unwrap();
    assert_eq!(produce.to_json(), deliver.to_json());
    assert_eq!(produce.content_hash(), deliver.content_hash());

    let reordered = json!({"ts": 1700050000, "store": "Paris-5", "bottle_id": "coco1514"});
    let reordered = reordered.as_object().unwrap();
    assert_eq!(
        canonicalize(Stage::Deliver, reordered).unwrap().content_hash(),
        deliver.content_hash()
    );
    assert_ne!(canonicalize(Stage::Produce, reordered).unwrap().content_hash(), produce.content_hash());
}

#[test]
fn test_missing_or_mistyped_fields_rejected() {
    let mut event = fixture("ship_lyon.json");
    event.remove("location");
    assert!(matches!(canonicalize(Stage::Ship, &event), Err(TraceError::Canonical(_))));

    let mut event = fixture("ship_lyon.json");
    event.insert("is_milestone".into(), json!(2));
    assert!(matches!(canonicalize(Stage::Ship, &event), Err(TraceError::Canonical(_))));

    let mut sale = fixture("deliver_paris.json");
    sale.insert("ts".into(), json!("1700050000"));
    assert!(matches!(canonicalize(Stage::Deliver, &sale), Err(TraceError::Canonical(_))));
}
