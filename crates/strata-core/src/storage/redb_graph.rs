//! # redb-backed Graph Storage
//!
//! Persists the graph, the secondary index and the secret store in one
//! redb database file. Every upsert and index write runs in a single write
//! transaction, so a crash never leaves a half-applied command.
//!
//! Vertex, edge and secret payloads are stored as JSON (property values are
//! self-describing). Unique-index pointers are fixed-shape and use postcard.

use super::{
    GraphStore, IndexEntry, IndexStore, SecretStore, StoredEdge, StoredVertex, UpsertCommand,
    merge_properties, parse_secret_token, secret_token,
};
use crate::identity::InternalId;
use crate::types::{PropertyValue, StrataError, storage_err};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// internal_id -> JSON `StoredVertex`
const VERTICES: TableDefinition<&str, &[u8]> = TableDefinition::new("vertices");

/// internal_id -> JSON `StoredEdge`
const EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");

/// (object_type, internal_id) -> ()
const TYPE_INDEX: TableDefinition<(&str, &str), ()> = TableDefinition::new("type_index");

/// (namespace, index, key) -> postcard `IndexPointer`
const UNIQUE_INDEX: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("unique_index");

/// (namespace, index, score, internal_id) -> ()
const ORDERED_INDEX: TableDefinition<(&str, &str, i64, &str), ()> =
    TableDefinition::new("ordered_index");

/// (namespace, index, internal_id) -> current score
const ORDERED_SCORES: TableDefinition<(&str, &str, &str), i64> =
    TableDefinition::new("ordered_scores");

/// (internal_id, property) -> JSON `PropertyValue`
const SECRETS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("secrets");

/// Unique-index pointer record.
#[derive(Debug, Serialize, Deserialize)]
struct IndexPointer {
    internal_id: String,
}

/// A disk-backed graph, index and secret store.
pub struct RedbGraph {
    db: Database,
}

impl std::fmt::Debug for RedbGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbGraph").finish_non_exhaustive()
    }
}

impl RedbGraph {
    /// Open or create a graph database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let db = Database::create(path.as_ref()).map_err(|e| StrataError::IoError(e.to_string()))?;

        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            write_txn.open_table(VERTICES).map_err(storage_err)?;
            write_txn.open_table(EDGES).map_err(storage_err)?;
            write_txn.open_table(TYPE_INDEX).map_err(storage_err)?;
            write_txn.open_table(UNIQUE_INDEX).map_err(storage_err)?;
            write_txn.open_table(ORDERED_INDEX).map_err(storage_err)?;
            write_txn.open_table(ORDERED_SCORES).map_err(storage_err)?;
            write_txn.open_table(SECRETS).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        Ok(Self { db })
    }

    fn upsert_vertex(
        &self,
        internal_id: &InternalId,
        object_type: &str,
        properties: &BTreeMap<String, PropertyValue>,
    ) -> Result<(), StrataError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut vertices = write_txn.open_table(VERTICES).map_err(storage_err)?;
            let mut types = write_txn.open_table(TYPE_INDEX).map_err(storage_err)?;

            let existing = vertices
                .get(internal_id.as_str())
                .map_err(storage_err)?
                .map(|data| decode::<StoredVertex>(data.value()))
                .transpose()?;
            let mut vertex = existing.unwrap_or_else(|| StoredVertex {
                internal_id: internal_id.clone(),
                object_type: object_type.to_string(),
                properties: BTreeMap::new(),
            });
            merge_properties(&mut vertex.properties, properties);

            let bytes = encode(&vertex)?;
            vertices
                .insert(internal_id.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
            types
                .insert((vertex.object_type.as_str(), internal_id.as_str()), ())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)
    }

    fn upsert_edge(&self, incoming: StoredEdge) -> Result<(), StrataError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut edges = write_txn.open_table(EDGES).map_err(storage_err)?;
            let existing = edges
                .get(incoming.internal_id.as_str())
                .map_err(storage_err)?
                .map(|data| decode::<StoredEdge>(data.value()))
                .transpose()?;
            let edge = match existing {
                Some(mut edge) => {
                    merge_properties(&mut edge.properties, &incoming.properties);
                    edge
                }
                None => incoming,
            };
            let bytes = encode(&edge)?;
            edges
                .insert(edge.internal_id.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StrataError> {
    serde_json::to_vec(value).map_err(|e| StrataError::SerializationError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StrataError> {
    serde_json::from_slice(bytes).map_err(|e| StrataError::DeserializationError(e.to_string()))
}

impl GraphStore for RedbGraph {
    fn apply(&self, command: &UpsertCommand) -> Result<(), StrataError> {
        match command {
            UpsertCommand::Vertex {
                internal_id,
                object_type,
                properties,
            } => self.upsert_vertex(internal_id, object_type, properties),
            UpsertCommand::Edge {
                internal_id,
                label,
                from_id,
                to_id,
                properties,
            } => {
                let mut stored = StoredEdge {
                    internal_id: internal_id.clone(),
                    label: label.clone(),
                    from_id: from_id.clone(),
                    to_id: to_id.clone(),
                    properties: BTreeMap::new(),
                };
                merge_properties(&mut stored.properties, properties);
                self.upsert_edge(stored)
            }
        }
    }

    fn vertex(&self, internal_id: &InternalId) -> Result<Option<StoredVertex>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(VERTICES).map_err(storage_err)?;
        table
            .get(internal_id.as_str())
            .map_err(storage_err)?
            .map(|data| decode(data.value()))
            .transpose()
    }

    fn edge(&self, internal_id: &InternalId) -> Result<Option<StoredEdge>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(EDGES).map_err(storage_err)?;
        table
            .get(internal_id.as_str())
            .map_err(storage_err)?
            .map(|data| decode(data.value()))
            .transpose()
    }

    fn vertices_of_type(&self, object_type: &str) -> Result<Vec<StoredVertex>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let types = read_txn.open_table(TYPE_INDEX).map_err(storage_err)?;
        let vertices = read_txn.open_table(VERTICES).map_err(storage_err)?;

        let mut result = Vec::new();
        for entry in types.range((object_type, "")..).map_err(storage_err)? {
            let (key, _) = entry.map_err(storage_err)?;
            let (entry_type, internal_id) = key.value();
            if entry_type != object_type {
                break;
            }
            if let Some(data) = vertices.get(internal_id).map_err(storage_err)? {
                result.push(decode(data.value())?);
            }
        }
        Ok(result)
    }

    fn vertex_count(&self) -> Result<usize, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(VERTICES).map_err(storage_err)?;
        Ok(table.len().map_err(storage_err)? as usize)
    }

    fn edge_count(&self) -> Result<usize, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(EDGES).map_err(storage_err)?;
        Ok(table.len().map_err(storage_err)? as usize)
    }
}

impl IndexStore for RedbGraph {
    fn write_index_entries(&self, entries: &[IndexEntry]) -> Result<(), StrataError> {
        if entries.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut unique = write_txn.open_table(UNIQUE_INDEX).map_err(storage_err)?;
            let mut ordered = write_txn.open_table(ORDERED_INDEX).map_err(storage_err)?;
            let mut scores = write_txn.open_table(ORDERED_SCORES).map_err(storage_err)?;

            for entry in entries {
                match entry {
                    IndexEntry::Unique {
                        namespace,
                        index,
                        key,
                        internal_id,
                    } => {
                        let pointer = postcard::to_allocvec(&IndexPointer {
                            internal_id: internal_id.to_string(),
                        })
                        .map_err(|e| StrataError::SerializationError(e.to_string()))?;
                        unique
                            .insert(
                                (namespace.as_str(), index.as_str(), key.as_str()),
                                pointer.as_slice(),
                            )
                            .map_err(storage_err)?;
                    }
                    IndexEntry::Ordered {
                        namespace,
                        index,
                        score,
                        internal_id,
                    } => {
                        let slot = (namespace.as_str(), index.as_str(), internal_id.as_str());
                        let previous = scores
                            .insert(slot, *score)
                            .map_err(storage_err)?
                            .map(|old| old.value());
                        if let Some(previous) = previous {
                            ordered
                                .remove((
                                    namespace.as_str(),
                                    index.as_str(),
                                    previous,
                                    internal_id.as_str(),
                                ))
                                .map_err(storage_err)?;
                        }
                        ordered
                            .insert(
                                (namespace.as_str(), index.as_str(), *score, internal_id.as_str()),
                                (),
                            )
                            .map_err(storage_err)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(storage_err)
    }

    fn lookup_unique(
        &self,
        namespace: &str,
        index: &str,
        key: &str,
    ) -> Result<Option<InternalId>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(UNIQUE_INDEX).map_err(storage_err)?;
        let Some(data) = table.get((namespace, index, key)).map_err(storage_err)? else {
            return Ok(None);
        };
        let pointer: IndexPointer = postcard::from_bytes(data.value())
            .map_err(|e| StrataError::DeserializationError(e.to_string()))?;
        Ok(Some(InternalId::from_stored(pointer.internal_id)))
    }

    fn ordered_entries(
        &self,
        namespace: &str,
        index: &str,
    ) -> Result<Vec<(i64, InternalId)>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(ORDERED_INDEX).map_err(storage_err)?;

        let mut result = Vec::new();
        for entry in table
            .range((namespace, index, i64::MIN, "")..)
            .map_err(storage_err)?
        {
            let (key, _) = entry.map_err(storage_err)?;
            let (ns, idx, score, internal_id) = key.value();
            if ns != namespace || idx != index {
                break;
            }
            result.push((score, InternalId::from_stored(internal_id)));
        }
        Ok(result)
    }
}

impl SecretStore for RedbGraph {
    fn put_secret(
        &self,
        internal_id: &InternalId,
        property: &str,
        value: &PropertyValue,
    ) -> Result<String, StrataError> {
        let bytes = encode(value)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(SECRETS).map_err(storage_err)?;
            table
                .insert((internal_id.as_str(), property), bytes.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(secret_token(internal_id, property))
    }

    fn get_secret(&self, token: &str) -> Result<Option<PropertyValue>, StrataError> {
        let (internal_id, property) = parse_secret_token(token)?;
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(SECRETS).map_err(storage_err)?;
        table
            .get((internal_id.as_str(), property.as_str()))
            .map_err(storage_err)?
            .map(|data| decode(data.value()))
            .transpose()
    }
}

// =============================================================================
// TESTS
// =============================================================================
