//! # Object Regulators
//!
//! Convert raw, loosely-typed rows into schema-validated candidates.
//!
//! - [`VertexRegulator`] coerces every declared property, derives the
//!   identifier stem, internal id and id value, and redacts sensitive
//!   values into a [`SecretStore`].
//! - [`EdgeRegulator`] computes edge properties from their declared
//!   sources, validates endpoint types and derives the edge identity.
//!
//! ## Coercion
//!
//! | Declared type | Accepted raw input                                   |
//! |---------------|------------------------------------------------------|
//! | `Number`      | JSON number, numeric string (plain or scientific)    |
//! | `String`      | JSON string, number or bool (stringified)            |
//! | `DateTime`    | RFC 3339, `YYYY-MM-DD[ HH:MM:SS]`, epoch s or ms      |
//!
//! Absent keys and JSON `null` become [`PropertyValue::Missing`].

use crate::arbiter::ExtractedContext;
use crate::graph_object::{GraphObject, PotentialEdge, PotentialVertex};
use crate::identity::{IdentifierStem, InternalId};
use crate::primitives::{FROM_REF_PREFIX, INTERNAL_ID_FIELD, TO_REF_PREFIX};
use crate::schema::{
    EdgeDefinition, FunctionInput, PropertySource, Schema, VertexDefinition,
};
use crate::storage::SecretStore;
use crate::types::{GraphType, PropertyType, PropertyValue, StrataError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Naive timestamp layouts tried after RFC 3339, interpreted as UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Epoch values above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

// =============================================================================
// COERCION
// =============================================================================

/// Coerce one raw JSON value to its declared type.
pub fn coerce_value(
    field: &str,
    raw: Option<&Value>,
    property_type: PropertyType,
) -> Result<PropertyValue, StrataError> {
    let raw = match raw {
        None | Some(Value::Null) => return Ok(PropertyValue::Missing),
        Some(raw) => raw,
    };
    let rejected = || {
        StrataError::RegulationError(format!(
            "field {field:?}: cannot coerce {raw} to {property_type:?}"
        ))
    };

    match property_type {
        PropertyType::String => match raw {
            Value::String(s) => Ok(PropertyValue::String(s.clone())),
            Value::Number(n) => Ok(PropertyValue::String(n.to_string())),
            Value::Bool(b) => Ok(PropertyValue::String(b.to_string())),
            _ => Err(rejected()),
        },
        PropertyType::Number => {
            let text = match raw {
                Value::Number(n) => n.to_string(),
                Value::String(s) if s.trim().is_empty() => return Ok(PropertyValue::Missing),
                Value::String(s) => s.trim().to_string(),
                _ => return Err(rejected()),
            };
            parse_decimal(&text)
                .map(PropertyValue::Number)
                .ok_or_else(rejected)
        }
        PropertyType::DateTime => {
            let parsed = match raw {
                Value::String(s) if s.trim().is_empty() => return Ok(PropertyValue::Missing),
                Value::String(s) => parse_timestamp(s.trim())
                    .or_else(|| parse_decimal(s.trim()).and_then(from_epoch)),
                Value::Number(n) => parse_decimal(&n.to_string()).and_then(from_epoch),
                _ => None,
            };
            parsed.map(PropertyValue::DateTime).ok_or_else(rejected)
        }
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn from_epoch(value: Decimal) -> Option<DateTime<Utc>> {
    let whole = value.trunc().to_i64()?;
    if whole.abs() > EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(whole)
    } else {
        DateTime::from_timestamp(whole, 0)
    }
}

// =============================================================================
// VERTEX REGULATOR
// =============================================================================

/// Explicit identity values that replace the derived ones.
#[derive(Debug, Clone, Default)]
pub struct VertexOverrides {
    pub identifier_stem: Option<String>,
    pub internal_id: Option<InternalId>,
    pub id_value: Option<PropertyValue>,
}

/// Builds potential vertices of one object type.
pub struct VertexRegulator<'a> {
    definition: &'a VertexDefinition,
    secrets: Option<&'a dyn SecretStore>,
}

impl<'a> VertexRegulator<'a> {
    pub fn new(schema: &'a Schema, object_type: &str) -> Result<Self, StrataError> {
        Ok(Self {
            definition: schema.vertex(object_type)?,
            secrets: None,
        })
    }

    /// Enable redaction of sensitive properties into `secrets`.
    #[must_use]
    pub fn with_secrets(mut self, secrets: &'a dyn SecretStore) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Regulate one raw row into a potential vertex.
    ///
    /// Undeclared keys in `raw` are ignored. When any identity field is
    /// missing the stem is marked as a stub and the internal id is derived
    /// with the missing-marker token in that position.
    pub fn create_potential_vertex(
        &self,
        raw: &Map<String, Value>,
        overrides: &VertexOverrides,
    ) -> Result<PotentialVertex, StrataError> {
        let definition = self.definition;
        let mut properties = BTreeMap::new();
        for (name, property) in &definition.properties {
            let value = coerce_value(name, raw.get(name), property.property_type)?;
            properties.insert(name.clone(), value);
        }

        let identity: Vec<&PropertyValue> = definition
            .internal_id_key
            .iter()
            .map(|name| value_of(&properties, name))
            .collect();
        let unresolved = identity.iter().any(|v| v.is_missing());

        let identifier_stem = match &overrides.identifier_stem {
            Some(stem) => stem.clone(),
            None => {
                let stem = IdentifierStem::vertex(
                    definition.object_type.clone(),
                    definition
                        .identifier_stem
                        .iter()
                        .map(|name| (name.as_str(), value_of(&properties, name))),
                );
                let stem = if unresolved { stem.to_stub() } else { stem };
                stem.to_string()
            }
        };
        let internal_id = overrides
            .internal_id
            .clone()
            .unwrap_or_else(|| InternalId::derive(&definition.object_type, identity));
        let id_value = overrides
            .id_value
            .clone()
            .unwrap_or_else(|| value_of(&properties, &definition.id_value_field).clone());

        let mut vertex = PotentialVertex {
            object_type: definition.object_type.clone(),
            properties,
            internal_id: Some(internal_id),
            identifier_stem,
            id_value,
            id_value_field: definition.id_value_field.clone(),
        };
        self.redact(&mut vertex)?;
        Ok(vertex)
    }

    fn redact(&self, vertex: &mut PotentialVertex) -> Result<(), StrataError> {
        let sensitive: Vec<&str> = self
            .definition
            .sensitive_properties()
            .filter(|name| !vertex.property(name).is_missing())
            .collect();
        if sensitive.is_empty() {
            return Ok(());
        }
        if !vertex.is_identifiable() {
            return Err(StrataError::RegulationError(format!(
                "cannot redact {:?} on unidentifiable {} {}",
                sensitive, vertex.object_type, vertex.identifier_stem
            )));
        }
        let (Some(secrets), Some(internal_id)) = (self.secrets, vertex.internal_id.clone()) else {
            return Err(StrataError::RegulationError(format!(
                "{} declares sensitive properties but no secret store is attached",
                vertex.object_type
            )));
        };
        for name in sensitive {
            if let Some(value) = vertex.properties.get_mut(name) {
                let token = secrets.put_secret(&internal_id, name, value)?;
                tracing::debug!(internal_id = %internal_id, property = name, "redacted");
                *value = PropertyValue::String(token);
            }
        }
        Ok(())
    }
}

fn value_of<'p>(properties: &'p BTreeMap<String, PropertyValue>, name: &str) -> &'p PropertyValue {
    properties.get(name).unwrap_or(&PropertyValue::Missing)
}

// =============================================================================
// EDGE REGULATOR
// =============================================================================

/// Builds potential edges of one label.
pub struct EdgeRegulator<'a> {
    definition: &'a EdgeDefinition,
}

impl<'a> EdgeRegulator<'a> {
    pub fn new(schema: &'a Schema, label: &str) -> Result<Self, StrataError> {
        Ok(Self {
            definition: schema.edge(label)?,
        })
    }

    /// Generate the edge linking `source` to `other`.
    ///
    /// With `inbound` the edge runs from `other` to `source`. Disallowed
    /// endpoint types and ambiguous extraction slices are consistency
    /// violations.
    pub fn generate_potential_edge(
        &self,
        source: &PotentialVertex,
        other: &PotentialVertex,
        context: &ExtractedContext,
        inbound: bool,
    ) -> Result<PotentialEdge, StrataError> {
        let definition = self.definition;
        let label = definition.label.as_str();
        let (from, to) = if inbound { (other, source) } else { (source, other) };

        if !definition.allows_from(&from.object_type) || !definition.allows_to(&to.object_type) {
            tracing::error!(
                label,
                from = %from.object_type,
                to = %to.object_type,
                source_stem = %source.identifier_stem,
                "edge endpoint types not allowed"
            );
            return Err(StrataError::ConsistencyViolation(format!(
                "edge {} does not allow {} -> {}",
                label, from.object_type, to.object_type
            )));
        }
        let from_id = endpoint_id(label, from)?;
        let to_id = endpoint_id(label, to)?;

        let mut properties = BTreeMap::new();
        for (name, property) in &definition.properties {
            let value = match &property.source {
                PropertySource::SourceField(field) => source.property(field).clone(),
                PropertySource::OtherField(field) => other.property(field).clone(),
                PropertySource::Extraction { slice, field } => {
                    let raw = context.single_value(slice, field)?;
                    coerce_value(name, Some(&raw), property.property_type)?
                }
                PropertySource::Function { function, .. } => function.compute(&FunctionInput {
                    edge_label: label,
                    source,
                    other,
                    context,
                })?,
            };
            properties.insert(name.clone(), value);
        }

        let mut identity = Vec::with_capacity(definition.internal_id_key.len());
        for entry in &definition.internal_id_key {
            let value = if let Some(field) = entry.strip_prefix(FROM_REF_PREFIX) {
                endpoint_value(from, &from_id, field)
            } else if let Some(field) = entry.strip_prefix(TO_REF_PREFIX) {
                endpoint_value(to, &to_id, field)
            } else {
                properties.get(entry).cloned().unwrap_or(PropertyValue::Missing)
            };
            identity.push(value);
        }
        let internal_id = InternalId::derive(label, &identity);

        let mut stem_properties = Map::new();
        stem_properties.insert("from".to_string(), Value::String(from.object_type.clone()));
        stem_properties.insert("to".to_string(), Value::String(to.object_type.clone()));
        let identifier_stem = IdentifierStem::new(GraphType::Edge, label, stem_properties);

        Ok(PotentialEdge {
            object_type: label.to_string(),
            properties,
            id_value: PropertyValue::String(internal_id.to_string()),
            internal_id: Some(internal_id),
            identifier_stem: identifier_stem.to_string(),
            id_value_field: INTERNAL_ID_FIELD.to_string(),
            from_id,
            to_id,
            from_type: from.object_type.clone(),
            to_type: to.object_type.clone(),
        })
    }
}

fn endpoint_id(label: &str, vertex: &PotentialVertex) -> Result<InternalId, StrataError> {
    vertex.internal_id().cloned().ok_or_else(|| {
        StrataError::ConsistencyViolation(format!(
            "edge {} endpoint {} has no internal id",
            label, vertex.identifier_stem
        ))
    })
}

fn endpoint_value(vertex: &PotentialVertex, id: &InternalId, field: &str) -> PropertyValue {
    if field == INTERNAL_ID_FIELD {
        PropertyValue::String(id.to_string())
    } else {
        vertex.property(field).clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::clinical;
    use crate::storage::MemoryGraph;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn coerces_declared_types() {
        assert_eq!(
            coerce_value("n", Some(&json!(1002)), PropertyType::Number).expect("number"),
            PropertyValue::Number(Decimal::from(1002))
        );
        assert_eq!(
            coerce_value("n", Some(&json!("1.5e3")), PropertyType::Number).expect("scientific"),
            PropertyValue::Number(Decimal::from(1500))
        );
        assert_eq!(
            coerce_value("s", Some(&json!(7)), PropertyType::String).expect("string"),
            PropertyValue::string("7")
        );
        assert!(coerce_value("n", None, PropertyType::Number)
            .expect("absent")
            .is_missing());
        assert!(coerce_value("n", Some(&json!("abc")), PropertyType::Number).is_err());
    }

    #[test]
    fn datetime_falls_back_to_epoch() {
        let rfc = coerce_value("t", Some(&json!("2024-03-04T08:00:00Z")), PropertyType::DateTime)
            .expect("rfc3339");
        let secs = coerce_value("t", Some(&json!(1_709_539_200)), PropertyType::DateTime)
            .expect("seconds");
        let millis = coerce_value("t", Some(&json!("1709539200000")), PropertyType::DateTime)
            .expect("millis");
        let date = coerce_value("t", Some(&json!("2024-03-04")), PropertyType::DateTime)
            .expect("date");
        assert_eq!(secs, millis);
        assert_eq!(secs, rfc);
        assert_eq!(date.identity_string(), "2024-03-04T00:00:00Z");
        assert!(coerce_value("t", Some(&json!("yesterday")), PropertyType::DateTime).is_err());
    }

    #[test]
    fn vertex_identity_is_derived() {
        let schema = clinical();
        let secrets = MemoryGraph::new();
        let regulator = VertexRegulator::new(&schema, "Patient")
            .expect("regulator")
            .with_secrets(&secrets);
        let raw = row(json!({
            "id_source": "Algernon",
            "patient_id": 1002,
            "first_name": "Ada",
            "ssn": "123-45-6789"
        }));
        let vertex = regulator
            .create_potential_vertex(&raw, &VertexOverrides::default())
            .expect("vertex");
        assert_eq!(
            vertex.identifier_stem,
            r##"#vertex#Patient#{"id_source":"Algernon"}#"##
        );
        assert_eq!(vertex.id_value, PropertyValue::Number(Decimal::from(1002)));
        assert!(vertex.is_identifiable());
        assert!(vertex.property("last_name").is_missing());
        assert!(!vertex.is_properties_complete());

        let again = regulator
            .create_potential_vertex(&raw, &VertexOverrides::default())
            .expect("vertex");
        assert_eq!(vertex.internal_id, again.internal_id);
    }

    #[test]
    fn sensitive_values_are_redacted() {
        let schema = clinical();
        let secrets = MemoryGraph::new();
        let regulator = VertexRegulator::new(&schema, "Patient")
            .expect("regulator")
            .with_secrets(&secrets);
        let raw = row(json!({"id_source": "Algernon", "patient_id": 1002, "ssn": "123-45-6789"}));
        let vertex = regulator
            .create_potential_vertex(&raw, &VertexOverrides::default())
            .expect("vertex");
        let PropertyValue::String(token) = vertex.property("ssn") else {
            unreachable!("ssn is a string")
        };
        assert!(token.starts_with("secret::"));
        assert_eq!(
            secrets.get_secret(token).expect("lookup"),
            Some(PropertyValue::string("123-45-6789"))
        );
    }

    #[test]
    fn redaction_requires_identity_and_store() {
        let schema = clinical();
        let raw = row(json!({"id_source": "Algernon", "ssn": "123-45-6789"}));
        let secrets = MemoryGraph::new();
        let with_store = VertexRegulator::new(&schema, "Patient")
            .expect("regulator")
            .with_secrets(&secrets);
        assert!(matches!(
            with_store.create_potential_vertex(&raw, &VertexOverrides::default()),
            Err(StrataError::RegulationError(_))
        ));

        let identified = row(json!({"id_source": "Algernon", "patient_id": 1, "ssn": "x"}));
        let without_store = VertexRegulator::new(&schema, "Patient").expect("regulator");
        assert!(without_store
            .create_potential_vertex(&identified, &VertexOverrides::default())
            .is_err());
    }

    #[test]
    fn missing_identity_field_yields_stub() {
        let schema = clinical();
        let regulator = VertexRegulator::new(&schema, "Provider").expect("regulator");
        let raw = row(json!({"id_source": "Algernon", "provider_name": "Dr. Lovelace"}));
        let vertex = regulator
            .create_potential_vertex(&raw, &VertexOverrides::default())
            .expect("vertex");
        assert!(vertex.is_stub());
        assert!(vertex.internal_id.is_some());
        assert!(!vertex.is_identifiable());
    }

    #[test]
    fn overrides_replace_derived_identity() {
        let schema = clinical();
        let regulator = VertexRegulator::new(&schema, "Provider").expect("regulator");
        let overrides = VertexOverrides {
            identifier_stem: None,
            internal_id: Some(InternalId::from_stored("fixed")),
            id_value: Some(PropertyValue::string("77")),
        };
        let vertex = regulator
            .create_potential_vertex(&row(json!({"id_source": "Algernon"})), &overrides)
            .expect("vertex");
        assert_eq!(vertex.internal_id, Some(InternalId::from_stored("fixed")));
        assert_eq!(vertex.id_value, PropertyValue::string("77"));
    }

    fn patient_and_provider() -> (PotentialVertex, PotentialVertex) {
        let schema = clinical();
        let secrets = MemoryGraph::new();
        let patient = VertexRegulator::new(&schema, "Patient")
            .expect("regulator")
            .with_secrets(&secrets)
            .create_potential_vertex(
                &row(json!({"id_source": "Algernon", "patient_id": 1002})),
                &VertexOverrides::default(),
            )
            .expect("patient");
        let provider = VertexRegulator::new(&schema, "Provider")
            .expect("regulator")
            .create_potential_vertex(
                &row(json!({"id_source": "Algernon", "provider_id": 77})),
                &VertexOverrides::default(),
            )
            .expect("provider");
        (patient, provider)
    }

    #[test]
    fn inbound_edge_swaps_endpoints() {
        let schema = clinical();
        let (patient, provider) = patient_and_provider();
        let regulator = EdgeRegulator::new(&schema, "_attends_").expect("regulator");
        let edge = regulator
            .generate_potential_edge(&patient, &provider, &ExtractedContext::default(), true)
            .expect("edge");
        assert_eq!(edge.from_type, "Provider");
        assert_eq!(edge.to_type, "Patient");
        assert_eq!(Some(&edge.from_id), provider.internal_id.as_ref());
        assert_eq!(edge.properties["relationship"], PropertyValue::string("attends"));
        assert_eq!(edge.properties["source_system"], PropertyValue::string("Algernon"));
        assert_eq!(
            edge.identifier_stem,
            r##"#edge#_attends_#{"from":"Provider","to":"Patient"}#"##
        );
        assert!(edge.is_identifiable());
    }

    #[test]
    fn disallowed_endpoints_are_fatal() {
        let schema = clinical();
        let (patient, provider) = patient_and_provider();
        let regulator = EdgeRegulator::new(&schema, "_attends_").expect("regulator");
        assert!(matches!(
            regulator.generate_potential_edge(&patient, &provider, &ExtractedContext::default(), false),
            Err(StrataError::ConsistencyViolation(_))
        ));
    }

    #[test]
    fn extraction_slice_must_be_unambiguous() {
        let schema = clinical();
        let (patient, _) = patient_and_provider();
        let encounter = VertexRegulator::new(&schema, "Encounter")
            .expect("regulator")
            .create_potential_vertex(
                &row(json!({"id_source": "Algernon", "encounter_id": 9001})),
                &VertexOverrides::default(),
            )
            .expect("encounter");
        let regulator = EdgeRegulator::new(&schema, "_received_").expect("regulator");

        let single = ExtractedContext::default().with_slice(
            "facility",
            vec![row(json!({"name": "North"})), row(json!({"name": "North"}))],
        );
        let edge = regulator
            .generate_potential_edge(&patient, &encounter, &single, false)
            .expect("edge");
        assert_eq!(edge.properties["facility"], PropertyValue::string("North"));

        let ambiguous = ExtractedContext::default().with_slice(
            "facility",
            vec![row(json!({"name": "North"})), row(json!({"name": "South"}))],
        );
        assert!(matches!(
            regulator.generate_potential_edge(&patient, &encounter, &ambiguous, false),
            Err(StrataError::ConsistencyViolation(_))
        ));
    }
}
