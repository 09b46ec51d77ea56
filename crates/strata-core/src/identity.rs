//! # Identity Model
//!
//! Deterministic, content-addressed identity for graph objects.
//!
//! - [`IdentifierStem`] namespaces an object's graph type, object type and
//!   discriminating properties. Its canonical string is the partition key of
//!   the state store and the namespace of the secondary index.
//! - [`InternalId`] is a fixed-length content hash over an object's identity
//!   fields in schema order. It is never randomly generated.
//!
//! ## Wire form
//!
//! ```text
//! #vertex#Patient#{"id_source":"Algernon"}#
//! #vertex#Provider#{"id_source":null}#::stub
//! ```
//!
//! The JSON section is compact and insertion-ordered. Any change to key
//! ordering or formatting changes every persisted key.

use crate::primitives::{ID_TAG_MISSING, ID_TAG_VALUE, INTERNAL_ID_LEN, STEM_DELIMITER, STUB_SUFFIX};
use crate::types::{GraphType, PropertyValue, StrataError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =============================================================================
// IDENTIFIER STEM
// =============================================================================

/// Canonical namespacing key: graph type + object type + identity properties.
///
/// Equal stems mean "same kind of object". Serialized as its canonical
/// string so it can travel inside queue messages unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentifierStem {
    graph_type: GraphType,
    object_type: String,
    properties: Map<String, Value>,
    stub: bool,
}

impl IdentifierStem {
    /// Create a confirmed stem. Property order is preserved as given.
    #[must_use]
    pub fn new(
        graph_type: GraphType,
        object_type: impl Into<String>,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            graph_type,
            object_type: object_type.into(),
            properties,
            stub: false,
        }
    }

    /// Create a vertex stem from ordered `(name, value)` pairs.
    #[must_use]
    pub fn vertex<'a>(
        object_type: impl Into<String>,
        properties: impl IntoIterator<Item = (&'a str, &'a PropertyValue)>,
    ) -> Self {
        let properties = properties
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        Self::new(GraphType::Vertex, object_type, properties)
    }

    /// Parse the canonical string form.
    ///
    /// Fails with [`StrataError::StemParse`] when any structural marker is
    /// absent or the property section is not a JSON object.
    pub fn from_raw(raw: &str) -> Result<Self, StrataError> {
        let malformed = |reason: &str| StrataError::StemParse(format!("{reason}: {raw:?}"));

        let (body, stub) = match raw.strip_suffix(STUB_SUFFIX) {
            Some(body) => (body, true),
            None => (raw, false),
        };

        let inner = body
            .strip_prefix(STEM_DELIMITER)
            .and_then(|s| s.strip_suffix(STEM_DELIMITER))
            .ok_or_else(|| malformed("missing outer delimiters"))?;

        let mut sections = inner.splitn(3, STEM_DELIMITER);
        let graph_type = sections
            .next()
            .and_then(GraphType::parse)
            .ok_or_else(|| malformed("unknown graph type"))?;
        let object_type = sections
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("missing object type"))?;
        let json = sections
            .next()
            .ok_or_else(|| malformed("missing property section"))?;

        let properties = match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(map)) => map,
            _ => return Err(malformed("property section is not a JSON object")),
        };

        Ok(Self {
            graph_type,
            object_type: object_type.to_string(),
            properties,
            stub,
        })
    }

    #[must_use]
    pub fn graph_type(&self) -> GraphType {
        self.graph_type
    }

    #[must_use]
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    #[must_use]
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Whether this stem marks an object with unconfirmed identity.
    #[must_use]
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// The same stem marked as a stub.
    #[must_use]
    pub fn to_stub(&self) -> Self {
        Self {
            stub: true,
            ..self.clone()
        }
    }

    /// Whether every discriminating property carries a value.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.object_type.is_empty() && self.properties.values().all(|v| !v.is_null())
    }

    /// Flatten the stem into the keyword map handed to extraction adapters.
    #[must_use]
    pub fn for_extractor(&self) -> Map<String, Value> {
        let mut keywords = Map::new();
        keywords.insert(
            "graph_type".to_string(),
            Value::String(self.graph_type.as_str().to_string()),
        );
        keywords.insert(
            "object_type".to_string(),
            Value::String(self.object_type.clone()),
        );
        for (name, value) in &self.properties {
            keywords.insert(name.clone(), value.clone());
        }
        keywords
    }
}

impl fmt::Display for IdentifierStem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.properties).map_err(|_| fmt::Error)?;
        write!(
            f,
            "{d}{}{d}{}{d}{}{d}",
            self.graph_type,
            self.object_type,
            json,
            d = STEM_DELIMITER
        )?;
        if self.stub {
            f.write_str(STUB_SUFFIX)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for IdentifierStem {
    type Error = StrataError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::from_raw(&raw)
    }
}

impl From<IdentifierStem> for String {
    fn from(stem: IdentifierStem) -> Self {
        stem.to_string()
    }
}

// =============================================================================
// INTERNAL ID
// =============================================================================

/// Content hash uniquely identifying a graph object.
///
/// A pure function of `(object_type, identity values)`: recomputing from
/// identical inputs always yields the identical id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalId(String);

impl InternalId {
    /// Derive an internal id from the identity components in schema order.
    ///
    /// Every part is length-prefixed and a missing component hashes as a
    /// lone tag byte, so no known value can stand in for an unknown one and
    /// a stub still receives a stable id.
    #[must_use]
    pub fn derive<'a>(
        object_type: &str,
        components: impl IntoIterator<Item = &'a PropertyValue>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hash_text(&mut hasher, object_type);
        for component in components {
            if component.is_missing() {
                hasher.update(&[ID_TAG_MISSING]);
            } else {
                hasher.update(&[ID_TAG_VALUE]);
                hash_text(&mut hasher, &component.identity_string());
            }
        }
        let hex = hasher.finalize().to_hex();
        Self(hex.chars().take(INTERNAL_ID_LEN).collect())
    }

    /// Wrap an id read back from storage or a wire message.
    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hash_text(hasher: &mut blake3::Hasher, text: &str) {
    hasher.update(&(text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::MISSING_TOKEN;

    fn patient_stem() -> IdentifierStem {
        let source = PropertyValue::string("Algernon");
        IdentifierStem::vertex("Patient", [("id_source", &source)])
    }

    #[test]
    fn canonical_form() {
        assert_eq!(
            patient_stem().to_string(),
            r##"#vertex#Patient#{"id_source":"Algernon"}#"##
        );
    }

    #[test]
    fn round_trip_preserves_order() {
        let raw = r##"#edge#_received_#{"to":"Encounter","from":"Patient"}#"##;
        let stem = IdentifierStem::from_raw(raw).expect("parse");
        assert_eq!(stem.graph_type(), GraphType::Edge);
        assert_eq!(stem.to_string(), raw);
    }

    #[test]
    fn stub_suffix_round_trips() {
        let stub = patient_stem().to_stub();
        let raw = stub.to_string();
        assert!(raw.ends_with("::stub"));
        let parsed = IdentifierStem::from_raw(&raw).expect("parse");
        assert!(parsed.is_stub());
        assert_eq!(parsed, stub);
    }

    #[test]
    fn json_may_contain_delimiters() {
        let value = PropertyValue::string("a#b");
        let stem = IdentifierStem::vertex("Tag", [("label", &value)]);
        let parsed = IdentifierStem::from_raw(&stem.to_string()).expect("parse");
        assert_eq!(parsed, stem);
    }

    #[test]
    fn rejects_malformed_stems() {
        for raw in [
            "",
            "#",
            "vertex#Patient#{}#",
            "#vertex#Patient#{}",
            "#node#Patient#{}#",
            "#vertex##{}#",
            "#vertex#Patient#[1,2]#",
            "#vertex#Patient#",
            "plain text",
        ] {
            assert!(
                matches!(IdentifierStem::from_raw(raw), Err(StrataError::StemParse(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn for_extractor_flattens() {
        let keywords = patient_stem().for_extractor();
        assert_eq!(keywords["graph_type"], "vertex");
        assert_eq!(keywords["object_type"], "Patient");
        assert_eq!(keywords["id_source"], "Algernon");
    }

    #[test]
    fn well_formed_requires_known_properties() {
        assert!(patient_stem().is_well_formed());
        let stub = IdentifierStem::vertex("Provider", [("id_source", &PropertyValue::Missing)]);
        assert!(!stub.is_well_formed());
    }

    #[test]
    fn derive_is_pure_and_fixed_length() {
        let values = [PropertyValue::string("Algernon"), PropertyValue::string("1002")];
        let a = InternalId::derive("Patient", &values);
        let b = InternalId::derive("Patient", &values);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), INTERNAL_ID_LEN);
    }

    #[test]
    fn derive_distinguishes_order_type_and_boundaries() {
        let ab = [PropertyValue::string("a"), PropertyValue::string("b")];
        let ba = [PropertyValue::string("b"), PropertyValue::string("a")];
        assert_ne!(InternalId::derive("T", &ab), InternalId::derive("T", &ba));
        assert_ne!(InternalId::derive("T", &ab), InternalId::derive("U", &ab));

        let split_1 = [PropertyValue::string("ab"), PropertyValue::string("c")];
        let split_2 = [PropertyValue::string("a"), PropertyValue::string("bc")];
        assert_ne!(InternalId::derive("T", &split_1), InternalId::derive("T", &split_2));
    }

    #[test]
    fn derive_succeeds_with_missing_components() {
        let values = [PropertyValue::string("Algernon"), PropertyValue::Missing];
        let stub_id = InternalId::derive("Provider", &values);
        assert_eq!(stub_id, InternalId::derive("Provider", &values));

        let real = [PropertyValue::string("Algernon"), PropertyValue::string("77")];
        assert_ne!(stub_id, InternalId::derive("Provider", &real));
    }

    #[test]
    fn missing_never_equals_its_text_form() {
        let missing = [PropertyValue::Missing];
        let literal = [PropertyValue::string(MISSING_TOKEN)];
        assert_ne!(
            InternalId::derive("Provider", &missing),
            InternalId::derive("Provider", &literal)
        );
        let empty = [PropertyValue::string("")];
        assert_ne!(
            InternalId::derive("Provider", &missing),
            InternalId::derive("Provider", &empty)
        );
    }

    #[test]
    fn stem_serializes_as_string() {
        let json = serde_json::to_value(patient_stem()).expect("serialize");
        assert_eq!(json, Value::String(patient_stem().to_string()));
        let back: IdentifierStem = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, patient_stem());
    }
}
