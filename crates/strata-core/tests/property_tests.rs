//! # Property-Based Tests
//!
//! Identity and staging invariants checked over generated inputs.

use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::sync::Arc;
use strata_core::{
    GraphObject, GraphType, IdentifierStem, InternalId, MemoryStateStore, PotentialVertex,
    PropertyValue, RecordKey, Stage, StateStore, StrataError,
};

// =============================================================================
// STRATEGIES
// =============================================================================

fn property_value() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        "[ -~]{0,12}".prop_map(PropertyValue::String),
        any::<i64>().prop_map(|n| PropertyValue::Number(n.into())),
        Just(PropertyValue::Missing),
    ]
}

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[ -~]{0,12}".prop_map(Value::String),
        any::<i64>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn stem() -> impl Strategy<Value = IdentifierStem> {
    (
        prop_oneof![Just(GraphType::Vertex), Just(GraphType::Edge)],
        "[A-Za-z_][A-Za-z0-9_]{0,10}",
        btree_map("[a-z_]{1,8}", json_leaf(), 0..5),
        any::<bool>(),
    )
        .prop_map(|(graph_type, object_type, properties, stub)| {
            let properties: Map<String, Value> = properties.into_iter().collect();
            let stem = IdentifierStem::new(graph_type, object_type, properties);
            if stub { stem.to_stub() } else { stem }
        })
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Every well-formed stem survives its canonical string form.
    #[test]
    fn stem_round_trip(stem in stem()) {
        let raw = stem.to_string();
        let parsed = IdentifierStem::from_raw(&raw).expect("parse");
        prop_assert_eq!(&parsed, &stem);
        prop_assert_eq!(parsed.to_string(), raw);
    }

    /// Arbitrary text never panics the parser.
    #[test]
    fn from_raw_never_panics(raw in "\\PC{0,40}") {
        let _ = IdentifierStem::from_raw(&raw);
    }

    /// Identical inputs always derive the identical id.
    #[test]
    fn internal_id_is_pure(
        object_type in "[A-Za-z]{1,10}",
        values in vec(property_value(), 0..6)
    ) {
        let a = InternalId::derive(&object_type, &values);
        let b = InternalId::derive(&object_type, values.clone().iter());
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.as_str().len(), 32);
    }

    /// Changing any single identity component changes the id.
    #[test]
    fn internal_id_tracks_each_component(
        values in vec("[a-z]{1,6}".prop_map(PropertyValue::String), 1..5),
        index in any::<prop::sample::Index>()
    ) {
        let position = index.index(values.len());
        let mut changed = values.clone();
        changed[position] = PropertyValue::string(format!("{}!", values[position]));
        prop_assert_ne!(
            InternalId::derive("T", &values),
            InternalId::derive("T", &changed)
        );
    }

    /// A candidate with any missing property is never complete.
    #[test]
    fn missing_property_is_never_complete(
        properties in btree_map("[a-z]{1,6}", property_value(), 0..6),
        missing in "[a-z]{1,6}"
    ) {
        let mut properties = properties;
        properties.insert(missing, PropertyValue::Missing);
        let vertex = PotentialVertex {
            object_type: "T".to_string(),
            properties,
            internal_id: Some(InternalId::from_stored("x")),
            identifier_stem: "#vertex#T#{}#".to_string(),
            id_value: PropertyValue::string("1"),
            id_value_field: "id".to_string(),
        };
        prop_assert!(!vertex.is_properties_complete());
    }

    /// A candidate whose stem does not parse is never identifiable.
    #[test]
    fn unparseable_stem_is_never_identifiable(raw in "[^#]{0,20}") {
        let vertex = PotentialVertex {
            object_type: "T".to_string(),
            properties: Default::default(),
            internal_id: Some(InternalId::from_stored("x")),
            identifier_stem: raw,
            id_value: PropertyValue::string("1"),
            id_value_field: "id".to_string(),
        };
        prop_assert!(!vertex.is_identifiable());
    }

    /// The watermark is the maximum of everything claimed.
    #[test]
    fn query_max_is_maximum_claimed(ids in vec(-1000i64..1000, 1..20)) {
        let store = MemoryStateStore::new();
        let stem = "#vertex#T#{}#";
        for id in &ids {
            store.claim(stem, *id, "T").expect("claim");
        }
        prop_assert_eq!(store.query_max(stem).expect("max"), *ids.iter().max().expect("non-empty"));
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[test]
fn racing_stage_clears_have_one_winner() {
    let store = Arc::new(MemoryStateStore::new());
    let stem = "#vertex#T#{}#";
    assert!(store.claim(stem, 1, "T").expect("claim"));

    let key = RecordKey::new(stem, "1");
    let handles: Vec<_> = (0..12)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            std::thread::spawn(move || store.record_stage_clear(&key, Stage::Extracted).expect("clear"))
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn empty_index_is_not_zero() {
    let store = MemoryStateStore::new();
    assert!(matches!(store.query_max("#vertex#T#{}#"), Err(StrataError::EmptyIndex(_))));
    store.claim("#vertex#T#{}#", 0, "T").expect("claim");
    assert_eq!(store.query_max("#vertex#T#{}#").expect("max"), 0);
}
