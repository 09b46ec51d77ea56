//! # strata-core
//!
//! The identity & resolution engine of the strata ingestion pipeline.
//!
//! Raw rows pulled from a system of record flow through this crate on their
//! way into a property graph:
//!
//! ```text
//! raw row --regulator--> PotentialVertex --arbiter--> RuleCandidate*
//!                              |                           |
//!                         StateStore (staged, CAS)    GraphStore / IndexStore
//! ```
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies (pure Rust)
//! - Identity is content-addressed: internal ids are hashes, never random
//! - The schema is loaded once and shared immutably behind `Arc`
//! - Every store write is an idempotent upsert or a conditional write

// =============================================================================
// MODULES
// =============================================================================

pub mod arbiter;
pub mod graph_object;
pub mod identity;
pub mod primitives;
pub mod regulator;
pub mod schema;
pub mod state;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use arbiter::{ExtractedContext, RuleArbiter, RuleCandidate};
pub use graph_object::{GraphObject, PotentialEdge, PotentialVertex};
pub use identity::{IdentifierStem, InternalId};
pub use regulator::{EdgeRegulator, VertexOverrides, VertexRegulator, coerce_value};
pub use schema::{
    AbsencePolicy, EdgeDefinition, FunctionInput, FunctionRegistry, IndexDefinition,
    PropertyFunction, RuleSet, Schema, VertexDefinition, VertexLinkRuleEntry,
};
pub use state::{
    AssimilationOutcome, Disposition, MemoryStateStore, PotentialEntry, RecordKey,
    RedbStateStore, Stage, StagedRecord, StateStore,
};
pub use storage::{
    GraphStore, IndexEntry, IndexStore, MemoryGraph, RedbGraph, SecretStore, StoredEdge,
    StoredVertex, UpsertCommand, index_entries_for,
};
pub use types::{GraphType, PropertyType, PropertyValue, StrataError};
