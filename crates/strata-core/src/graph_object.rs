//! # Potential Graph Objects
//!
//! Regulated, not-yet-persisted candidates produced by the regulators and
//! the rule arbiter. The identifier stem is kept in its raw string form so a
//! candidate built from bad data can still be represented and rejected by
//! [`GraphObject::is_identifiable`].

use crate::identity::{IdentifierStem, InternalId};
use crate::types::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readiness checks shared by vertices and edges.
pub trait GraphObject {
    fn object_type(&self) -> &str;
    fn properties(&self) -> &BTreeMap<String, PropertyValue>;
    fn internal_id(&self) -> Option<&InternalId>;
    fn identifier_stem(&self) -> &str;
    fn id_value(&self) -> &PropertyValue;
    fn id_value_field(&self) -> &str;

    /// Stem parses and is well formed, internal id is set, and the id value
    /// is neither missing nor the field-name placeholder.
    fn is_identifiable(&self) -> bool {
        let stem_ok = IdentifierStem::from_raw(self.identifier_stem())
            .map(|stem| stem.is_well_formed() && !stem.is_stub())
            .unwrap_or(false);
        let id_ok = match self.id_value() {
            PropertyValue::Missing => false,
            PropertyValue::String(s) => s != self.id_value_field(),
            _ => true,
        };
        stem_ok && self.internal_id().is_some() && id_ok
    }

    /// No property is missing.
    fn is_properties_complete(&self) -> bool {
        self.properties().values().all(|v| !v.is_missing())
    }
}

/// A candidate vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialVertex {
    pub object_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub internal_id: Option<InternalId>,
    pub identifier_stem: String,
    pub id_value: PropertyValue,
    pub id_value_field: String,
}

impl PotentialVertex {
    /// Value of a property, `Missing` when undeclared.
    #[must_use]
    pub fn property(&self, name: &str) -> &PropertyValue {
        self.properties.get(name).unwrap_or(&PropertyValue::Missing)
    }

    /// Whether the stem carries the stub marker.
    #[must_use]
    pub fn is_stub(&self) -> bool {
        IdentifierStem::from_raw(&self.identifier_stem)
            .map(|stem| stem.is_stub())
            .unwrap_or(false)
    }
}

impl GraphObject for PotentialVertex {
    fn object_type(&self) -> &str {
        &self.object_type
    }
    fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }
    fn internal_id(&self) -> Option<&InternalId> {
        self.internal_id.as_ref()
    }
    fn identifier_stem(&self) -> &str {
        &self.identifier_stem
    }
    fn id_value(&self) -> &PropertyValue {
        &self.id_value
    }
    fn id_value_field(&self) -> &str {
        &self.id_value_field
    }
}

/// A candidate directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialEdge {
    pub object_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub internal_id: Option<InternalId>,
    pub identifier_stem: String,
    pub id_value: PropertyValue,
    pub id_value_field: String,
    pub from_id: InternalId,
    pub to_id: InternalId,
    pub from_type: String,
    pub to_type: String,
}

impl GraphObject for PotentialEdge {
    fn object_type(&self) -> &str {
        &self.object_type
    }
    fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }
    fn internal_id(&self) -> Option<&InternalId> {
        self.internal_id.as_ref()
    }
    fn identifier_stem(&self) -> &str {
        &self.identifier_stem
    }
    fn id_value(&self) -> &PropertyValue {
        &self.id_value
    }
    fn id_value_field(&self) -> &str {
        &self.id_value_field
    }
}
