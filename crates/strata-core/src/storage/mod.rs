//! # Graph Storage
//!
//! Destination stores written by the load stage.
//!
//! - [`GraphStore`]: idempotent vertex/edge upserts and the property match
//!   used by assimilation
//! - [`IndexStore`]: unique pointer entries and ordered `(score, internal_id)`
//!   entries, namespaced by identifier stem
//! - [`SecretStore`]: redacted property values keyed by
//!   `(internal_id, property)`
//!
//! [`MemoryGraph`] implements all three in memory; [`RedbGraph`] persists
//! them in a redb database.

mod redb_graph;

pub use redb_graph::RedbGraph;

use crate::graph_object::{PotentialEdge, PotentialVertex};
use crate::identity::InternalId;
use crate::primitives::SECRET_TOKEN_PREFIX;
use crate::schema::{IndexDefinition, VertexDefinition};
use crate::types::{PropertyValue, StrataError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

// =============================================================================
// UPSERT COMMANDS
// =============================================================================

/// An idempotent create-or-update of one graph object.
///
/// Applying a command twice leaves the store in the same state; every
/// present property is rewritten on each application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UpsertCommand {
    Vertex {
        internal_id: InternalId,
        object_type: String,
        properties: BTreeMap<String, PropertyValue>,
    },
    Edge {
        internal_id: InternalId,
        label: String,
        from_id: InternalId,
        to_id: InternalId,
        properties: BTreeMap<String, PropertyValue>,
    },
}

impl UpsertCommand {
    pub fn for_vertex(vertex: &PotentialVertex) -> Result<Self, StrataError> {
        let internal_id = vertex.internal_id.clone().ok_or_else(|| {
            StrataError::ConsistencyViolation(format!(
                "vertex {} has no internal id",
                vertex.identifier_stem
            ))
        })?;
        Ok(UpsertCommand::Vertex {
            internal_id,
            object_type: vertex.object_type.clone(),
            properties: vertex.properties.clone(),
        })
    }

    pub fn for_edge(edge: &PotentialEdge) -> Result<Self, StrataError> {
        let internal_id = edge.internal_id.clone().ok_or_else(|| {
            StrataError::ConsistencyViolation(format!(
                "edge {} has no internal id",
                edge.identifier_stem
            ))
        })?;
        Ok(UpsertCommand::Edge {
            internal_id,
            label: edge.object_type.clone(),
            from_id: edge.from_id.clone(),
            to_id: edge.to_id.clone(),
            properties: edge.properties.clone(),
        })
    }

    #[must_use]
    pub fn internal_id(&self) -> &InternalId {
        match self {
            UpsertCommand::Vertex { internal_id, .. } | UpsertCommand::Edge { internal_id, .. } => {
                internal_id
            }
        }
    }

    /// Traversal text of the command, for logs and remote graph drivers.
    ///
    /// ```text
    /// g.V('<id>').fold().coalesce(unfold(), addV('<type>').property(id, '<id>')).property('k', 'v')
    /// ```
    #[must_use]
    pub fn render(&self) -> String {
        let (mut text, properties) = match self {
            UpsertCommand::Vertex {
                internal_id,
                object_type,
                properties,
            } => (
                format!(
                    "g.V('{id}').fold().coalesce(unfold(), addV('{}').property(id, '{id}'))",
                    quote(object_type),
                    id = quote(internal_id.as_str())
                ),
                properties,
            ),
            UpsertCommand::Edge {
                internal_id,
                label,
                from_id,
                to_id,
                properties,
            } => (
                format!(
                    "g.E('{id}').fold().coalesce(unfold(), addE('{}').from(V('{}')).to(V('{}')).property(id, '{id}'))",
                    quote(label),
                    quote(from_id.as_str()),
                    quote(to_id.as_str()),
                    id = quote(internal_id.as_str())
                ),
                properties,
            ),
        };
        for (name, value) in properties {
            if value.is_missing() {
                continue;
            }
            text.push_str(&format!(
                ".property('{}', '{}')",
                quote(name),
                quote(&value.identity_string())
            ));
        }
        text
    }
}

fn quote(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Overwrite known properties; missing values never erase stored ones.
fn merge_properties(
    stored: &mut BTreeMap<String, PropertyValue>,
    incoming: &BTreeMap<String, PropertyValue>,
) {
    for (name, value) in incoming {
        if !value.is_missing() {
            stored.insert(name.clone(), value.clone());
        }
    }
}

/// A vertex as held by a graph store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVertex {
    pub internal_id: InternalId,
    pub object_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// An edge as held by a graph store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEdge {
    pub internal_id: InternalId,
    pub label: String,
    pub from_id: InternalId,
    pub to_id: InternalId,
    pub properties: BTreeMap<String, PropertyValue>,
}

// =============================================================================
// STORE TRAITS
// =============================================================================

/// A property-graph store accepting idempotent upserts.
pub trait GraphStore: Send + Sync {
    fn apply(&self, command: &UpsertCommand) -> Result<(), StrataError>;

    fn vertex(&self, internal_id: &InternalId) -> Result<Option<StoredVertex>, StrataError>;

    fn edge(&self, internal_id: &InternalId) -> Result<Option<StoredEdge>, StrataError>;

    fn vertices_of_type(&self, object_type: &str) -> Result<Vec<StoredVertex>, StrataError>;

    fn vertex_count(&self) -> Result<usize, StrataError>;

    fn edge_count(&self) -> Result<usize, StrataError>;

    /// Known vertices a candidate resolves to.
    ///
    /// A stored vertex with the candidate's internal id wins outright.
    /// Otherwise every vertex of the type whose properties equal all of
    /// `criteria` matches. Empty criteria match nothing.
    fn find_matches(
        &self,
        object_type: &str,
        internal_id: Option<&InternalId>,
        criteria: &BTreeMap<String, PropertyValue>,
    ) -> Result<Vec<StoredVertex>, StrataError> {
        if let Some(id) = internal_id
            && let Some(vertex) = self.vertex(id)?
            && vertex.object_type == object_type
        {
            return Ok(vec![vertex]);
        }
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .vertices_of_type(object_type)?
            .into_iter()
            .filter(|vertex| {
                criteria
                    .iter()
                    .all(|(name, value)| vertex.properties.get(name) == Some(value))
            })
            .collect())
    }
}

/// One secondary-index write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEntry {
    /// `(namespace, index, key) -> internal_id`
    Unique {
        namespace: String,
        index: String,
        key: String,
        internal_id: InternalId,
    },
    /// `(namespace, index) -> (score, internal_id)`
    Ordered {
        namespace: String,
        index: String,
        score: i64,
        internal_id: InternalId,
    },
}

/// Index entries a vertex contributes under its type's declarations.
///
/// Entries whose key or score is unknown are skipped.
#[must_use]
pub fn index_entries_for(definition: &VertexDefinition, vertex: &PotentialVertex) -> Vec<IndexEntry> {
    let Some(internal_id) = vertex.internal_id.as_ref() else {
        return Vec::new();
    };
    let namespace = vertex.identifier_stem.as_str();
    definition
        .indexes
        .iter()
        .filter_map(|index| match index {
            IndexDefinition::Unique { name, field } => {
                let value = vertex.property(field);
                (!value.is_missing()).then(|| IndexEntry::Unique {
                    namespace: namespace.to_string(),
                    index: name.clone(),
                    key: value.identity_string(),
                    internal_id: internal_id.clone(),
                })
            }
            IndexDefinition::Ordered {
                name,
                score_property,
                score,
            } => {
                let score = match score_property {
                    Some(field) => vertex.property(field).as_i64(),
                    None => *score,
                }?;
                Some(IndexEntry::Ordered {
                    namespace: namespace.to_string(),
                    index: name.clone(),
                    score,
                    internal_id: internal_id.clone(),
                })
            }
        })
        .collect()
}

/// Secondary index over loaded vertices.
pub trait IndexStore: Send + Sync {
    /// Write entries; an ordered entry replaces the same vertex's previous
    /// score in that index.
    fn write_index_entries(&self, entries: &[IndexEntry]) -> Result<(), StrataError>;

    fn lookup_unique(
        &self,
        namespace: &str,
        index: &str,
        key: &str,
    ) -> Result<Option<InternalId>, StrataError>;

    /// `(score, internal_id)` pairs in ascending score order.
    fn ordered_entries(
        &self,
        namespace: &str,
        index: &str,
    ) -> Result<Vec<(i64, InternalId)>, StrataError>;
}

/// Holds redacted property values.
pub trait SecretStore: Send + Sync {
    /// Store a value and return the reference token that replaces it.
    fn put_secret(
        &self,
        internal_id: &InternalId,
        property: &str,
        value: &PropertyValue,
    ) -> Result<String, StrataError>;

    /// Resolve a reference token; `None` when the token is unknown.
    fn get_secret(&self, token: &str) -> Result<Option<PropertyValue>, StrataError>;
}

/// Reference token for a redacted value:
/// `secret::<base64(internal_id:property)>`.
#[must_use]
pub fn secret_token(internal_id: &InternalId, property: &str) -> String {
    format!(
        "{}{}",
        SECRET_TOKEN_PREFIX,
        URL_SAFE_NO_PAD.encode(format!("{internal_id}:{property}"))
    )
}

/// The `(internal_id, property)` pair a token refers to.
pub fn parse_secret_token(token: &str) -> Result<(String, String), StrataError> {
    let invalid = || StrataError::DeserializationError(format!("invalid secret token {token:?}"));
    let encoded = token.strip_prefix(SECRET_TOKEN_PREFIX).ok_or_else(invalid)?;
    let decoded = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
    let text = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (internal_id, property) = text.split_once(':').ok_or_else(invalid)?;
    Ok((internal_id.to_string(), property.to_string()))
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
struct MemoryGraphState {
    vertices: BTreeMap<InternalId, StoredVertex>,
    edges: BTreeMap<InternalId, StoredEdge>,
    unique: BTreeMap<(String, String, String), InternalId>,
    ordered: BTreeSet<(String, String, i64, InternalId)>,
    ordered_scores: BTreeMap<(String, String, InternalId), i64>,
    secrets: BTreeMap<(String, String), PropertyValue>,
}

/// In-memory graph, index and secret store.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<MemoryGraphState>,
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryGraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GraphStore for MemoryGraph {
    fn apply(&self, command: &UpsertCommand) -> Result<(), StrataError> {
        let mut state = self.state();
        match command {
            UpsertCommand::Vertex {
                internal_id,
                object_type,
                properties,
            } => {
                let vertex = state
                    .vertices
                    .entry(internal_id.clone())
                    .or_insert_with(|| StoredVertex {
                        internal_id: internal_id.clone(),
                        object_type: object_type.clone(),
                        properties: BTreeMap::new(),
                    });
                merge_properties(&mut vertex.properties, properties);
            }
            UpsertCommand::Edge {
                internal_id,
                label,
                from_id,
                to_id,
                properties,
            } => {
                let edge = state
                    .edges
                    .entry(internal_id.clone())
                    .or_insert_with(|| StoredEdge {
                        internal_id: internal_id.clone(),
                        label: label.clone(),
                        from_id: from_id.clone(),
                        to_id: to_id.clone(),
                        properties: BTreeMap::new(),
                    });
                merge_properties(&mut edge.properties, properties);
            }
        }
        Ok(())
    }

    fn vertex(&self, internal_id: &InternalId) -> Result<Option<StoredVertex>, StrataError> {
        Ok(self.state().vertices.get(internal_id).cloned())
    }

    fn edge(&self, internal_id: &InternalId) -> Result<Option<StoredEdge>, StrataError> {
        Ok(self.state().edges.get(internal_id).cloned())
    }

    fn vertices_of_type(&self, object_type: &str) -> Result<Vec<StoredVertex>, StrataError> {
        Ok(self
            .state()
            .vertices
            .values()
            .filter(|v| v.object_type == object_type)
            .cloned()
            .collect())
    }

    fn vertex_count(&self) -> Result<usize, StrataError> {
        Ok(self.state().vertices.len())
    }

    fn edge_count(&self) -> Result<usize, StrataError> {
        Ok(self.state().edges.len())
    }
}

impl IndexStore for MemoryGraph {
    fn write_index_entries(&self, entries: &[IndexEntry]) -> Result<(), StrataError> {
        let mut state = self.state();
        for entry in entries {
            match entry {
                IndexEntry::Unique {
                    namespace,
                    index,
                    key,
                    internal_id,
                } => {
                    state.unique.insert(
                        (namespace.clone(), index.clone(), key.clone()),
                        internal_id.clone(),
                    );
                }
                IndexEntry::Ordered {
                    namespace,
                    index,
                    score,
                    internal_id,
                } => {
                    let slot = (namespace.clone(), index.clone(), internal_id.clone());
                    if let Some(previous) = state.ordered_scores.insert(slot, *score) {
                        state.ordered.remove(&(
                            namespace.clone(),
                            index.clone(),
                            previous,
                            internal_id.clone(),
                        ));
                    }
                    state.ordered.insert((
                        namespace.clone(),
                        index.clone(),
                        *score,
                        internal_id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn lookup_unique(
        &self,
        namespace: &str,
        index: &str,
        key: &str,
    ) -> Result<Option<InternalId>, StrataError> {
        Ok(self
            .state()
            .unique
            .get(&(namespace.to_string(), index.to_string(), key.to_string()))
            .cloned())
    }

    fn ordered_entries(
        &self,
        namespace: &str,
        index: &str,
    ) -> Result<Vec<(i64, InternalId)>, StrataError> {
        Ok(self
            .state()
            .ordered
            .iter()
            .filter(|(ns, idx, _, _)| ns == namespace && idx == index)
            .map(|(_, _, score, id)| (*score, id.clone()))
            .collect())
    }
}

impl SecretStore for MemoryGraph {
    fn put_secret(
        &self,
        internal_id: &InternalId,
        property: &str,
        value: &PropertyValue,
    ) -> Result<String, StrataError> {
        self.state().secrets.insert(
            (internal_id.to_string(), property.to_string()),
            value.clone(),
        );
        Ok(secret_token(internal_id, property))
    }

    fn get_secret(&self, token: &str) -> Result<Option<PropertyValue>, StrataError> {
        let key = parse_secret_token(token)?;
        Ok(self.state().secrets.get(&key).cloned())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::schema::tests::clinical;

    fn vertex_command(id: &str, name: PropertyValue) -> UpsertCommand {
        let mut properties = BTreeMap::new();
        properties.insert("id_source".to_string(), PropertyValue::string("Algernon"));
        properties.insert("provider_name".to_string(), name);
        UpsertCommand::Vertex {
            internal_id: InternalId::from_stored(id),
            object_type: "Provider".to_string(),
            properties,
        }
    }

    #[test]
    fn render_escapes_and_skips_missing() {
        let command = vertex_command("abc", PropertyValue::string("O'Hara"));
        assert_eq!(
            command.render(),
            "g.V('abc').fold().coalesce(unfold(), addV('Provider').property(id, 'abc'))\
             .property('id_source', 'Algernon').property('provider_name', 'O\\'Hara')"
        );
        let missing = vertex_command("abc", PropertyValue::Missing);
        assert!(!missing.render().contains("provider_name"));
    }

    #[test]
    fn upsert_is_idempotent_and_never_erases() {
        let graph = MemoryGraph::new();
        let command = vertex_command("p1", PropertyValue::string("Dr. M"));
        graph.apply(&command).expect("apply");
        graph.apply(&command).expect("apply again");
        assert_eq!(graph.vertex_count().expect("count"), 1);

        graph
            .apply(&vertex_command("p1", PropertyValue::Missing))
            .expect("apply missing");
        let stored = graph
            .vertex(&InternalId::from_stored("p1"))
            .expect("lookup")
            .expect("present");
        assert_eq!(stored.properties["provider_name"], PropertyValue::string("Dr. M"));
    }

    #[test]
    fn find_matches_prefers_internal_id() {
        let graph = MemoryGraph::new();
        graph
            .apply(&vertex_command("p1", PropertyValue::string("Dr. M")))
            .expect("apply");
        graph
            .apply(&vertex_command("p2", PropertyValue::string("Dr. L")))
            .expect("apply");

        let by_id = graph
            .find_matches("Provider", Some(&InternalId::from_stored("p2")), &BTreeMap::new())
            .expect("match");
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].internal_id.as_str(), "p2");

        let mut criteria = BTreeMap::new();
        criteria.insert("provider_name".to_string(), PropertyValue::string("Dr. M"));
        let by_property = graph
            .find_matches("Provider", Some(&InternalId::from_stored("nope")), &criteria)
            .expect("match");
        assert_eq!(by_property.len(), 1);
        assert_eq!(by_property[0].internal_id.as_str(), "p1");

        assert!(graph
            .find_matches("Provider", None, &BTreeMap::new())
            .expect("match")
            .is_empty());
    }

    #[test]
    fn index_entries_follow_declarations() {
        let schema = clinical();
        let definition = schema.vertex("Provider").expect("provider");
        let vertex = PotentialVertex {
            object_type: "Provider".to_string(),
            properties: BTreeMap::new(),
            internal_id: Some(InternalId::from_stored("p1")),
            identifier_stem: "#vertex#Provider#{}#".to_string(),
            id_value: PropertyValue::string("77"),
            id_value_field: "provider_id".to_string(),
        };
        let entries = index_entries_for(definition, &vertex);
        assert_eq!(
            entries,
            vec![IndexEntry::Ordered {
                namespace: "#vertex#Provider#{}#".to_string(),
                index: "provider_seen".to_string(),
                score: 1,
                internal_id: InternalId::from_stored("p1"),
            }]
        );
    }

    #[test]
    fn ordered_entries_replace_previous_score() {
        let graph = MemoryGraph::new();
        let entry = |score| IndexEntry::Ordered {
            namespace: "ns".to_string(),
            index: "idx".to_string(),
            score,
            internal_id: InternalId::from_stored("a"),
        };
        graph.write_index_entries(&[entry(5)]).expect("write");
        graph.write_index_entries(&[entry(9)]).expect("write");
        assert_eq!(
            graph.ordered_entries("ns", "idx").expect("read"),
            vec![(9, InternalId::from_stored("a"))]
        );
    }

    #[test]
    fn secret_tokens_round_trip() {
        let id = InternalId::from_stored("abc123");
        let token = secret_token(&id, "ssn");
        assert!(token.starts_with(SECRET_TOKEN_PREFIX));
        assert_eq!(
            parse_secret_token(&token).expect("parse"),
            ("abc123".to_string(), "ssn".to_string())
        );
        assert!(parse_secret_token("secret::!!!").is_err());
        assert!(parse_secret_token("plain").is_err());
    }
}
