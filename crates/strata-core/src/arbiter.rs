//! # Rule Arbiter
//!
//! Enumerates the related objects a resolved source vertex implies.
//!
//! For every rule set declared for the source's type, each rule entry
//! produces zero or more target candidates: target constants form the base,
//! and each target specifier expands into one candidate per row of its
//! extraction slice. Candidates that cannot resolve every identity field of
//! their target type are kept as stubs or dropped according to the rule's
//! absence policy; other unknown fields are simply left missing.
//!
//! The arbiter never looks candidates up in the graph. Its one write is the
//! redaction of sensitive target values into an attached secret store.

use crate::graph_object::PotentialVertex;
use crate::primitives::SOURCE_REF_PREFIX;
use crate::regulator::{VertexOverrides, VertexRegulator};
use crate::schema::{AbsencePolicy, Schema, TargetSpecifier, VertexDefinition, VertexLinkRuleEntry};
use crate::storage::SecretStore;
use crate::types::StrataError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// EXTRACTED CONTEXT
// =============================================================================

/// Named side data extracted alongside a source row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedContext {
    #[serde(default)]
    pub slices: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl ExtractedContext {
    #[must_use]
    pub fn new(slices: BTreeMap<String, Vec<Map<String, Value>>>) -> Self {
        Self { slices }
    }

    /// Builder-style slice insertion.
    #[must_use]
    pub fn with_slice(mut self, name: impl Into<String>, rows: Vec<Map<String, Value>>) -> Self {
        self.slices.insert(name.into(), rows);
        self
    }

    /// Rows of a slice; empty when the slice is absent.
    #[must_use]
    pub fn rows(&self, slice: &str) -> &[Map<String, Value>] {
        self.slices.get(slice).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.values().all(Vec::is_empty)
    }

    /// The single distinct non-null value of `field` across a slice.
    ///
    /// Zero or several distinct values are a consistency violation.
    pub fn single_value(&self, slice: &str, field: &str) -> Result<Value, StrataError> {
        let distinct: BTreeSet<String> = self
            .rows(slice)
            .iter()
            .filter_map(|row| row.get(field))
            .filter(|value| !value.is_null())
            .map(Value::to_string)
            .collect();
        let mut values = distinct.into_iter();
        match (values.next(), values.next()) {
            (Some(only), None) => serde_json::from_str(&only)
                .map_err(|e| StrataError::DeserializationError(e.to_string())),
            (None, _) => Err(StrataError::ConsistencyViolation(format!(
                "slice {slice:?} has no value for {field:?}"
            ))),
            (Some(_), Some(_)) => Err(StrataError::ConsistencyViolation(format!(
                "slice {slice:?} has several distinct values for {field:?}"
            ))),
        }
    }
}

// =============================================================================
// ARBITER
// =============================================================================

/// A target candidate together with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCandidate {
    pub vertex: PotentialVertex,
    pub rule_set: String,
    pub rule: VertexLinkRuleEntry,
}

impl RuleCandidate {
    /// Stable key of this candidate within a staged record's potentials.
    #[must_use]
    pub fn potential_id(&self) -> String {
        let identity = self
            .vertex
            .internal_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.vertex.identifier_stem.clone());
        format!("{}/{}", self.rule.name, identity)
    }
}

/// Evaluates linking rules for one schema.
pub struct RuleArbiter<'a> {
    schema: &'a Schema,
    secrets: Option<&'a dyn SecretStore>,
}

impl<'a> RuleArbiter<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            secrets: None,
        }
    }

    /// Redact sensitive target properties into `secrets`.
    #[must_use]
    pub fn with_secrets(mut self, secrets: &'a dyn SecretStore) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Enumerate `(candidate, rule)` pairs for `source`.
    ///
    /// Candidates are unique per rule by internal id; output order follows
    /// rule sets, entries, specifiers and slice rows.
    pub fn process_rules(
        &self,
        source: &PotentialVertex,
        context: &ExtractedContext,
    ) -> Result<Vec<RuleCandidate>, StrataError> {
        let mut candidates = Vec::new();
        let mut seen = BTreeSet::new();

        for rule_set in self.schema.rule_sets_for(&source.object_type) {
            for entry in &rule_set.entries {
                let target = self.schema.vertex(&entry.target_type)?;
                let mut regulator = VertexRegulator::new(self.schema, &entry.target_type)?;
                if let Some(secrets) = self.secrets {
                    regulator = regulator.with_secrets(secrets);
                }
                for raw in expand_entry(entry, target, source, context) {
                    let vertex = regulator.create_potential_vertex(&raw, &VertexOverrides::default())?;
                    let candidate = RuleCandidate {
                        vertex,
                        rule_set: rule_set.name.clone(),
                        rule: entry.clone(),
                    };
                    if seen.insert(candidate.potential_id()) {
                        candidates.push(candidate);
                    }
                }
            }
        }

        tracing::debug!(
            stem = %source.identifier_stem,
            candidates = candidates.len(),
            "rules processed"
        );
        Ok(candidates)
    }
}

/// Raw target rows for one rule entry, absence policy applied.
fn expand_entry(
    entry: &VertexLinkRuleEntry,
    target: &VertexDefinition,
    source: &PotentialVertex,
    context: &ExtractedContext,
) -> Vec<Map<String, Value>> {
    let mut base = Map::new();
    for (field, expression) in &entry.target_constants {
        let value = match expression.strip_prefix(SOURCE_REF_PREFIX) {
            Some(source_field) => source.property(source_field).to_json(),
            None => Value::String(expression.clone()),
        };
        base.insert(field.clone(), value);
    }

    if entry.target_specifiers.is_empty() {
        return admit(entry, target, source, base).into_iter().collect();
    }

    let mut rows = Vec::new();
    for specifier in &entry.target_specifiers {
        for slice_row in specifier_rows(specifier, context) {
            let mut raw = base.clone();
            for (field, expression) in &specifier.fields {
                let value = match expression.strip_prefix(SOURCE_REF_PREFIX) {
                    Some(source_field) => source.property(source_field).to_json(),
                    None => slice_row
                        .and_then(|row| row.get(expression))
                        .cloned()
                        .unwrap_or(Value::Null),
                };
                raw.insert(field.clone(), value);
            }
            rows.extend(admit(entry, target, source, raw));
        }
    }
    rows
}

/// Slice rows a specifier expands over; a single empty attempt when the
/// specifier has no slice or the slice holds no rows.
fn specifier_rows<'c>(
    specifier: &TargetSpecifier,
    context: &'c ExtractedContext,
) -> Vec<Option<&'c Map<String, Value>>> {
    let rows = specifier
        .slice
        .as_deref()
        .map(|slice| context.rows(slice))
        .unwrap_or(&[]);
    if rows.is_empty() {
        vec![None]
    } else {
        rows.iter().map(Some).collect()
    }
}

/// Applies the absence policy when an identity field of the target is
/// unknown.
fn admit(
    entry: &VertexLinkRuleEntry,
    target: &VertexDefinition,
    source: &PotentialVertex,
    raw: Map<String, Value>,
) -> Option<Map<String, Value>> {
    let unresolved: Vec<&String> = target
        .internal_id_key
        .iter()
        .filter(|field| raw.get(field.as_str()).is_none_or(Value::is_null))
        .collect();
    if unresolved.is_empty() {
        return Some(raw);
    }
    match entry.absence {
        AbsencePolicy::Stub => {
            tracing::debug!(
                rule = %entry.name,
                stem = %source.identifier_stem,
                missing = ?unresolved,
                "unresolved target kept as stub"
            );
            Some(raw)
        }
        AbsencePolicy::Drop => {
            tracing::debug!(
                rule = %entry.name,
                stem = %source.identifier_stem,
                missing = ?unresolved,
                "unresolved target dropped"
            );
            None
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
