//! # Orders
//!
//! The messages actors exchange. Every order is self-describing JSON: the
//! arguments carry a `_type` tag naming the actor that consumes them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::{ExtractedContext, PotentialEdge, PotentialVertex, RecordKey};

pub const MONITOR: &str = "monitor";
pub const EXTRACT: &str = "extract";
pub const TRANSFORM: &str = "transform";
pub const ASSIMILATE: &str = "assimilate";
pub const LOAD: &str = "load";

/// Arguments for one actor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum TaskArgs {
    /// Compare local and remote watermarks for one stem.
    Monitor { identifier_stem: String },
    /// Pull the source row and context for a claimed record.
    Extract { key: RecordKey, object_type: String },
    /// Regulate the source row and evaluate linking rules.
    Transform {
        key: RecordKey,
        row: Map<String, Value>,
        context: ExtractedContext,
    },
    /// Resolve one rule candidate.
    Assimilate { key: RecordKey, potential_id: String },
    /// Upsert resolved vertices and edges.
    Load {
        key: RecordKey,
        /// The candidate this load completes; `None` for a source without
        /// candidates.
        potential_id: Option<String>,
        vertices: Vec<PotentialVertex>,
        edges: Vec<PotentialEdge>,
    },
}

impl TaskArgs {
    #[must_use]
    pub fn task_name(&self) -> &'static str {
        match self {
            TaskArgs::Monitor { .. } => MONITOR,
            TaskArgs::Extract { .. } => EXTRACT,
            TaskArgs::Transform { .. } => TRANSFORM,
            TaskArgs::Assimilate { .. } => ASSIMILATE,
            TaskArgs::Load { .. } => LOAD,
        }
    }
}

/// A unit of work addressed to one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub task_name: String,
    pub task_args: TaskArgs,
}

impl Order {
    #[must_use]
    pub fn new(task_args: TaskArgs) -> Self {
        Self {
            task_name: task_args.task_name().to_string(),
            task_args,
        }
    }
}
