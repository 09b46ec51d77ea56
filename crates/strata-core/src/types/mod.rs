//! # Core Type Definitions
//!
//! Types shared by every layer of the engine:
//! - Graph classification (`GraphType`)
//! - Typed property values (`PropertyType`, `PropertyValue`)
//! - Error types (`StrataError`)
//!
//! ## Determinism Guarantees
//!
//! - Numbers are exact decimals, never floats
//! - Timestamps are normalized to UTC
//! - Every value has a single canonical string form used for hashing

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::primitives::MISSING_TOKEN;

// =============================================================================
// GRAPH TYPE
// =============================================================================

/// Whether an object is stored as a vertex or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphType {
    Vertex,
    Edge,
}

impl GraphType {
    /// The wire form used inside identifier stems.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            GraphType::Vertex => "vertex",
            GraphType::Edge => "edge",
        }
    }

    /// Parse the wire form. Returns `None` for anything else.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vertex" => Some(GraphType::Vertex),
            "edge" => Some(GraphType::Edge),
            _ => None,
        }
    }
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PROPERTY TYPES AND VALUES
// =============================================================================

/// Schema-declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Number,
    String,
    DateTime,
}

/// A typed property value.
///
/// `Missing` means "not yet known" and is distinct from an empty string:
/// an empty string is a legitimate value, a missing one is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Number(Decimal),
    String(String),
    DateTime(DateTime<Utc>),
    Missing,
}

impl PropertyValue {
    /// Shorthand for a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        PropertyValue::String(s.into())
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, PropertyValue::Missing)
    }

    /// Canonical string form used for hashing, stems and index keys.
    ///
    /// Numbers are normalized (`12.50` and `12.5` hash identically),
    /// timestamps are RFC 3339 UTC with second precision, and a missing
    /// value is the literal missing-marker token.
    #[must_use]
    pub fn identity_string(&self) -> String {
        match self {
            PropertyValue::Number(d) => d.normalize().to_string(),
            PropertyValue::String(s) => s.clone(),
            PropertyValue::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
            PropertyValue::Missing => MISSING_TOKEN.to_string(),
        }
    }

    /// JSON form used inside identifier stems and extractor keywords.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Missing => serde_json::Value::Null,
            other => serde_json::Value::String(other.identity_string()),
        }
    }

    /// Numeric view, used for ordered-index scores and watermarks.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;
        match self {
            PropertyValue::Number(d) => d.trunc().to_i64(),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::DateTime(dt) => Some(dt.timestamp()),
            PropertyValue::Missing => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity_string())
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the strata engine.
///
/// Consistency violations are authoring errors (schema or data shape) and
/// are fatal. Contention losses are never errors: conditional writes return
/// `false` instead.
#[derive(Debug, Error)]
pub enum StrataError {
    /// A string is not a well-formed identifier stem.
    #[error("Invalid identifier stem: {0}")]
    StemParse(String),

    /// Data or schema violates a structural guarantee (multiple source rows,
    /// disallowed edge endpoints, ambiguous extraction slices).
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The schema document is malformed or references unknown names.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// A raw value could not be coerced into its declared type.
    #[error("Regulation error: {0}")]
    RegulationError(String),

    /// An ordered index holds no entries for the given stem.
    #[error("Index is empty for stem {0}")]
    EmptyIndex(String),

    /// The requested staged record or graph object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// The embedded database rejected an operation.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),

    /// A remote invocation could not be delivered or decoded.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Fan-out retries were exhausted with items still failing transiently.
    #[error("Fan-out exhausted after {attempts} attempts: {remaining} items still failing")]
    FanOutExhausted { attempts: usize, remaining: usize },

    /// Fan-out items failed through a fault of the caller; none were retried.
    #[error("Fan-out rejected {rejected} items: {message}")]
    FanOutRejected { rejected: usize, message: String },

    /// The configuration cannot run the requested operation.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StrataError {
    /// Whether the failure is caused by the caller's input rather than by
    /// the environment. Caller faults are never retried.
    #[must_use]
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            StrataError::StemParse(_)
                | StrataError::ConsistencyViolation(_)
                | StrataError::SchemaError(_)
                | StrataError::RegulationError(_)
                | StrataError::DeserializationError(_)
                | StrataError::FanOutRejected { .. }
                | StrataError::ConfigError(_)
        )
    }
}

/// Map any storage-layer error into `StrataError::StorageError`.
pub(crate) fn storage_err(e: impl fmt::Display) -> StrataError {
    StrataError::StorageError(e.to_string())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn graph_type_wire_form() {
        assert_eq!(GraphType::Vertex.as_str(), "vertex");
        assert_eq!(GraphType::parse("edge"), Some(GraphType::Edge));
        assert_eq!(GraphType::parse("Vertex"), None);
    }

    #[test]
    fn number_identity_is_normalized() {
        let a = PropertyValue::Number(Decimal::from_str("12.50").expect("decimal"));
        let b = PropertyValue::Number(Decimal::from_str("12.5").expect("decimal"));
        assert_eq!(a.identity_string(), b.identity_string());
    }

    #[test]
    fn missing_is_distinct_from_empty() {
        let empty = PropertyValue::string("");
        assert!(!empty.is_missing());
        assert!(PropertyValue::Missing.is_missing());
        assert_ne!(empty.identity_string(), PropertyValue::Missing.identity_string());
        assert_eq!(PropertyValue::Missing.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn values_are_self_describing_in_json() {
        let value = PropertyValue::string("Algernon");
        let json = serde_json::to_value(&value).expect("serialize");
        assert_eq!(json["type"], "String");
        let back: PropertyValue = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn caller_fault_classification() {
        assert!(StrataError::ConsistencyViolation("x".into()).is_caller_fault());
        assert!(!StrataError::StorageError("x".into()).is_caller_fault());
        assert!(!StrataError::TransportError("x".into()).is_caller_fault());
    }
}
