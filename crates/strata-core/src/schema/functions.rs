//! # Property Functions
//!
//! Named pure functions that compute edge properties. A schema references
//! them by name; names are resolved against a [`FunctionRegistry`] once, at
//! schema-load time, so an unknown name is a schema error rather than a
//! runtime lookup failure.

use crate::arbiter::ExtractedContext;
use crate::graph_object::PotentialVertex;
use crate::types::{PropertyValue, StrataError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Everything a property function may read.
#[derive(Debug, Clone, Copy)]
pub struct FunctionInput<'a> {
    /// Label of the edge being generated.
    pub edge_label: &'a str,
    /// The vertex the linking rule was evaluated for.
    pub source: &'a PotentialVertex,
    /// The vertex on the other end of the edge.
    pub other: &'a PotentialVertex,
    /// Side data extracted alongside the source vertex.
    pub context: &'a ExtractedContext,
}

/// A pure function computing one edge property.
pub trait PropertyFunction: Send + Sync + fmt::Debug {
    fn compute(&self, input: &FunctionInput<'_>) -> Result<PropertyValue, StrataError>;
}

/// Registry mapping function names to implementations.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<dyn PropertyFunction>>,
}

impl FunctionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in functions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("source_object_type", Arc::new(SourceObjectType));
        registry.register("other_object_type", Arc::new(OtherObjectType));
        registry.register("edge_label", Arc::new(EdgeLabel));
        registry
    }

    /// Register (or replace) a function under `name`.
    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn PropertyFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Resolve a name referenced by a schema document.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PropertyFunction>, StrataError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::SchemaError(format!("unknown property function {name:?}")))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

// =============================================================================
// BUILT-INS
// =============================================================================

#[derive(Debug)]
struct SourceObjectType;

impl PropertyFunction for SourceObjectType {
    fn compute(&self, input: &FunctionInput<'_>) -> Result<PropertyValue, StrataError> {
        Ok(PropertyValue::string(&input.source.object_type))
    }
}

#[derive(Debug)]
struct OtherObjectType;

impl PropertyFunction for OtherObjectType {
    fn compute(&self, input: &FunctionInput<'_>) -> Result<PropertyValue, StrataError> {
        Ok(PropertyValue::string(&input.other.object_type))
    }
}

#[derive(Debug)]
struct EdgeLabel;

impl PropertyFunction for EdgeLabel {
    fn compute(&self, input: &FunctionInput<'_>) -> Result<PropertyValue, StrataError> {
        Ok(PropertyValue::string(input.edge_label.trim_matches('_')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = FunctionRegistry::with_builtins();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["edge_label", "other_object_type", "source_object_type"]);
    }

    #[test]
    fn unknown_name_is_a_schema_error() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(StrataError::SchemaError(_))
        ));
    }
}
