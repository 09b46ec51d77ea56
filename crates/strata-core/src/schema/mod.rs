//! # Schema
//!
//! The declared shape of every vertex, edge and linking rule.
//!
//! A schema is parsed from a TOML document once per run, validated, and
//! then shared as an immutable `Arc<Schema>` handle. Nothing mutates it
//! afterwards; components that need it receive the handle explicitly.
//!
//! ## Document layout
//!
//! ```toml
//! [[vertex]]
//! object_type = "Patient"
//! id_value_field = "patient_id"
//! identifier_stem = ["id_source"]
//! internal_id_key = ["id_source", "patient_id"]
//! properties.patient_id = { type = "Number" }
//! properties.id_source = { type = "String" }
//!
//! [[edge]]
//! label = "_received_"
//! from = ["Patient"]
//! to = ["Encounter"]
//! internal_id_key = ["from.internal_id", "to.internal_id"]
//!
//! [[rules]]
//! name = "patient_links"
//! source_type = "Patient"
//! ```

mod functions;

pub use functions::{FunctionInput, FunctionRegistry, PropertyFunction};

use crate::primitives::{
    ENDPOINT_WILDCARD, FROM_REF_PREFIX, INTERNAL_ID_FIELD, SOURCE_REF_PREFIX, TO_REF_PREFIX,
};
use crate::types::{PropertyType, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// VERTEX DEFINITIONS
// =============================================================================

/// Declared type and handling of a single property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    /// Sensitive values are moved to the secret store on regulation.
    #[serde(default)]
    pub sensitive: bool,
}

/// A secondary index maintained for a vertex type on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexDefinition {
    /// Pointer from a field value to the vertex's internal id.
    Unique { name: String, field: String },
    /// `(score, internal_id)` pairs ordered by score. The score is either a
    /// numeric property or a constant (an existence-only index).
    Ordered {
        name: String,
        #[serde(default)]
        score_property: Option<String>,
        #[serde(default)]
        score: Option<i64>,
    },
}

impl IndexDefinition {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            IndexDefinition::Unique { name, .. } | IndexDefinition::Ordered { name, .. } => name,
        }
    }
}

/// Declared shape of a vertex type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexDefinition {
    pub object_type: String,
    /// Property holding the source system's id for this object.
    pub id_value_field: String,
    /// Discriminating properties that namespace the identifier stem.
    #[serde(default)]
    pub identifier_stem: Vec<String>,
    /// Identity-defining properties, in hashing order.
    pub internal_id_key: Vec<String>,
    pub properties: BTreeMap<String, PropertyDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl VertexDefinition {
    /// Names of sensitive properties.
    pub fn sensitive_properties(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|(_, def)| def.sensitive)
            .map(|(name, _)| name.as_str())
    }
}

// =============================================================================
// EDGE DEFINITIONS
// =============================================================================

/// Where an edge property value comes from, as written in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PropertySourceDocument {
    /// A field of the vertex the rule was evaluated for.
    Source { field: String },
    /// A field of the vertex on the other end.
    Other { field: String },
    /// A field of a named extraction slice; must hold exactly one distinct
    /// value across all rows.
    Extraction { slice: String, field: String },
    /// A registered property function.
    Function { name: String },
}

#[derive(Debug, Clone, Deserialize)]
struct EdgePropertyDocument {
    #[serde(rename = "type")]
    property_type: PropertyType,
    source: PropertySourceDocument,
}

#[derive(Debug, Clone, Deserialize)]
struct EdgeDocument {
    label: String,
    from: Vec<String>,
    to: Vec<String>,
    internal_id_key: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, EdgePropertyDocument>,
}

/// Where an edge property value comes from, with functions resolved.
#[derive(Debug, Clone)]
pub enum PropertySource {
    SourceField(String),
    OtherField(String),
    Extraction { slice: String, field: String },
    Function {
        name: String,
        function: Arc<dyn PropertyFunction>,
    },
}

/// A resolved edge property.
#[derive(Debug, Clone)]
pub struct EdgePropertyDefinition {
    pub property_type: PropertyType,
    pub source: PropertySource,
}

/// Declared shape of an edge label.
#[derive(Debug, Clone)]
pub struct EdgeDefinition {
    pub label: String,
    /// Allowed `from` endpoint types (`*` allows any).
    pub from: Vec<String>,
    /// Allowed `to` endpoint types (`*` allows any).
    pub to: Vec<String>,
    /// Identity entries: `from.<field>`, `to.<field>` or an own property.
    pub internal_id_key: Vec<String>,
    pub properties: BTreeMap<String, EdgePropertyDefinition>,
}

impl EdgeDefinition {
    #[must_use]
    pub fn allows_from(&self, object_type: &str) -> bool {
        endpoint_allowed(&self.from, object_type)
    }

    #[must_use]
    pub fn allows_to(&self, object_type: &str) -> bool {
        endpoint_allowed(&self.to, object_type)
    }
}

fn endpoint_allowed(allowed: &[String], object_type: &str) -> bool {
    allowed
        .iter()
        .any(|t| t == ENDPOINT_WILDCARD || t == object_type)
}

// =============================================================================
// LINKING RULES
// =============================================================================

/// What to do when a rule's target cannot be fully resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsencePolicy {
    /// Emit a placeholder candidate with the unknown fields missing.
    Stub,
    /// Omit the candidate.
    Drop,
}

/// How to compute target identities from the source and its side data.
///
/// With a `slice`, one candidate is produced per row of that slice. Field
/// expressions are either `source.<field>` or the name of a slice-row field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpecifier {
    #[serde(default)]
    pub slice: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// One declared relationship from a source type to a target type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexLinkRuleEntry {
    pub name: String,
    pub target_type: String,
    pub edge_label: String,
    /// When set, the generated edge points from the target to the source.
    #[serde(default)]
    pub inbound: bool,
    pub absence: AbsencePolicy,
    /// Target fields fixed for every candidate: a literal or `source.<field>`.
    #[serde(default)]
    pub target_constants: BTreeMap<String, String>,
    #[serde(default)]
    pub target_specifiers: Vec<TargetSpecifier>,
}

/// The rule entries evaluated for one source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub source_type: String,
    #[serde(default)]
    pub entries: Vec<VertexLinkRuleEntry>,
}

// =============================================================================
// SCHEMA
// =============================================================================

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    vertex: Vec<VertexDefinition>,
    #[serde(default)]
    edge: Vec<EdgeDocument>,
    #[serde(default)]
    rules: Vec<RuleSet>,
}

/// A validated, immutable schema.
#[derive(Debug)]
pub struct Schema {
    vertices: BTreeMap<String, VertexDefinition>,
    edges: BTreeMap<String, EdgeDefinition>,
    rules: Vec<RuleSet>,
}

impl Schema {
    /// Load and validate a schema file using the built-in functions.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, StrataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StrataError::IoError(format!("read schema {}: {}", path.display(), e)))?;
        let schema = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            vertices = schema.vertices.len(),
            edges = schema.edges.len(),
            rule_sets = schema.rules.len(),
            "schema loaded"
        );
        Ok(Arc::new(schema))
    }

    /// Parse and validate a schema document using the built-in functions.
    pub fn from_toml_str(text: &str) -> Result<Self, StrataError> {
        Self::from_toml_str_with(text, &FunctionRegistry::with_builtins())
    }

    /// Parse and validate a schema document, resolving function references
    /// against `registry`.
    pub fn from_toml_str_with(text: &str, registry: &FunctionRegistry) -> Result<Self, StrataError> {
        let document: SchemaDocument =
            toml::from_str(text).map_err(|e| StrataError::SchemaError(e.to_string()))?;

        let mut vertices = BTreeMap::new();
        for vertex in document.vertex {
            if vertices.contains_key(&vertex.object_type) {
                return Err(StrataError::SchemaError(format!(
                    "duplicate vertex type {:?}",
                    vertex.object_type
                )));
            }
            vertices.insert(vertex.object_type.clone(), vertex);
        }

        let mut edges = BTreeMap::new();
        for edge in document.edge {
            let definition = resolve_edge(edge, registry)?;
            if edges.contains_key(&definition.label) {
                return Err(StrataError::SchemaError(format!(
                    "duplicate edge label {:?}",
                    definition.label
                )));
            }
            edges.insert(definition.label.clone(), definition);
        }

        let schema = Self {
            vertices,
            edges,
            rules: document.rules,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Definition of a vertex type.
    pub fn vertex(&self, object_type: &str) -> Result<&VertexDefinition, StrataError> {
        self.vertices
            .get(object_type)
            .ok_or_else(|| StrataError::SchemaError(format!("unknown vertex type {object_type:?}")))
    }

    /// Definition of an edge label.
    pub fn edge(&self, label: &str) -> Result<&EdgeDefinition, StrataError> {
        self.edges
            .get(label)
            .ok_or_else(|| StrataError::SchemaError(format!("unknown edge label {label:?}")))
    }

    /// Rule sets whose source type is `object_type`.
    pub fn rule_sets_for<'a>(&'a self, object_type: &'a str) -> impl Iterator<Item = &'a RuleSet> {
        self.rules
            .iter()
            .filter(move |set| set.source_type == object_type)
    }

    /// All vertex definitions in type-name order.
    pub fn vertices(&self) -> impl Iterator<Item = &VertexDefinition> {
        self.vertices.values()
    }

    fn validate(&self) -> Result<(), StrataError> {
        for vertex in self.vertices.values() {
            validate_vertex(vertex)?;
        }
        for edge in self.edges.values() {
            self.validate_edge(edge)?;
        }
        for set in &self.rules {
            self.validate_rule_set(set)?;
        }
        Ok(())
    }

    fn validate_edge(&self, edge: &EdgeDefinition) -> Result<(), StrataError> {
        for endpoint in edge.from.iter().chain(&edge.to) {
            if endpoint != ENDPOINT_WILDCARD && !self.vertices.contains_key(endpoint) {
                return Err(StrataError::SchemaError(format!(
                    "edge {:?} allows unknown endpoint type {:?}",
                    edge.label, endpoint
                )));
            }
        }
        for entry in &edge.internal_id_key {
            let own = entry.strip_prefix(FROM_REF_PREFIX).is_none()
                && entry.strip_prefix(TO_REF_PREFIX).is_none();
            if own && !edge.properties.contains_key(entry) {
                return Err(StrataError::SchemaError(format!(
                    "edge {:?} identity key {:?} is not a declared property",
                    edge.label, entry
                )));
            }
        }
        Ok(())
    }

    fn validate_rule_set(&self, set: &RuleSet) -> Result<(), StrataError> {
        let source = self.vertex(&set.source_type)?;
        for entry in &set.entries {
            let context = |detail: String| {
                StrataError::SchemaError(format!("rule {}/{}: {}", set.name, entry.name, detail))
            };
            let target = self.vertex(&entry.target_type)?;
            let edge = self.edge(&entry.edge_label)?;

            let (from, to) = if entry.inbound {
                (&target.object_type, &source.object_type)
            } else {
                (&source.object_type, &target.object_type)
            };
            if !edge.allows_from(from) || !edge.allows_to(to) {
                return Err(context(format!(
                    "edge {:?} does not connect {} -> {}",
                    edge.label, from, to
                )));
            }

            let expressions = entry
                .target_constants
                .iter()
                .chain(entry.target_specifiers.iter().flat_map(|s| s.fields.iter()));
            for (field, expression) in expressions {
                if !target.properties.contains_key(field) {
                    return Err(context(format!("unknown target field {field:?}")));
                }
                if let Some(source_field) = expression.strip_prefix(SOURCE_REF_PREFIX)
                    && !source.properties.contains_key(source_field)
                {
                    return Err(context(format!("unknown source field {source_field:?}")));
                }
            }
        }
        Ok(())
    }
}

fn validate_vertex(vertex: &VertexDefinition) -> Result<(), StrataError> {
    let declared = |field: &str, role: &str| {
        if vertex.properties.contains_key(field) {
            Ok(())
        } else {
            Err(StrataError::SchemaError(format!(
                "vertex {:?} {} field {:?} is not a declared property",
                vertex.object_type, role, field
            )))
        }
    };

    declared(&vertex.id_value_field, "id value")?;
    for field in &vertex.identifier_stem {
        declared(field, "identifier stem")?;
    }
    if vertex.internal_id_key.is_empty() {
        return Err(StrataError::SchemaError(format!(
            "vertex {:?} has an empty internal id key",
            vertex.object_type
        )));
    }
    for field in &vertex.internal_id_key {
        declared(field, "internal id key")?;
    }
    for index in &vertex.indexes {
        match index {
            IndexDefinition::Unique { field, .. } => declared(field, "unique index")?,
            IndexDefinition::Ordered {
                score_property: Some(field),
                ..
            } => declared(field, "ordered index score")?,
            IndexDefinition::Ordered { score: Some(_), .. } => {}
            IndexDefinition::Ordered { name, .. } => {
                return Err(StrataError::SchemaError(format!(
                    "ordered index {name:?} needs a score or score_property"
                )));
            }
        }
    }
    Ok(())
}

fn resolve_edge(
    document: EdgeDocument,
    registry: &FunctionRegistry,
) -> Result<EdgeDefinition, StrataError> {
    let mut properties = BTreeMap::new();
    for (name, property) in document.properties {
        let source = match property.source {
            PropertySourceDocument::Source { field } => PropertySource::SourceField(field),
            PropertySourceDocument::Other { field } => PropertySource::OtherField(field),
            PropertySourceDocument::Extraction { slice, field } => {
                PropertySource::Extraction { slice, field }
            }
            PropertySourceDocument::Function { name } => PropertySource::Function {
                function: registry.resolve(&name)?,
                name,
            },
        };
        properties.insert(
            name,
            EdgePropertyDefinition {
                property_type: property.property_type,
                source,
            },
        );
    }

    for entry in &document.internal_id_key {
        for prefix in [FROM_REF_PREFIX, TO_REF_PREFIX] {
            if entry.strip_prefix(prefix) == Some("") {
                return Err(StrataError::SchemaError(format!(
                    "edge {:?} identity key {:?} names no field (use {}{})",
                    document.label, entry, prefix, INTERNAL_ID_FIELD
                )));
            }
        }
    }

    Ok(EdgeDefinition {
        label: document.label,
        from: document.from,
        to: document.to,
        internal_id_key: document.internal_id_key,
        properties,
    })
}

// =============================================================================
// TESTS
// =============================================================================
