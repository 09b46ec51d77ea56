//! # Assimilate
//!
//! Resolves one rule candidate against the graph:
//!
//! | known vertices | candidate             | result              |
//! |----------------|-----------------------|---------------------|
//! | exactly one    | any                   | matched, edge only  |
//! | none           | identifiable          | created + edge      |
//! | none           | otherwise, `stub`     | stub vertex + edge  |
//! | none           | otherwise, `drop`     | nothing             |
//!
//! An identifiable candidate is created even with unknown non-identity
//! properties; those stay missing until a later load supplies them.
//! | several        | any                   | consistency error   |

use super::{Order, Pipeline, TaskArgs};
use crate::queue::BatchingSender;
use std::collections::BTreeMap;
use strata_core::{
    AbsencePolicy, AssimilationOutcome, EdgeRegulator, GraphObject, IdentifierStem, InternalId,
    PotentialVertex, PropertyValue, RecordKey, RuleCandidate, Schema, StoredVertex, StrataError,
};

pub(super) fn run(
    pipeline: &Pipeline,
    key: &RecordKey,
    potential_id: &str,
    out: &mut BatchingSender,
) -> Result<(), StrataError> {
    let state = &pipeline.stores.state;
    let record = state
        .get(key)?
        .ok_or_else(|| StrataError::NotFound(format!("staged record {key}")))?;
    let entry = record
        .potentials
        .get(potential_id)
        .ok_or_else(|| StrataError::NotFound(format!("potential {potential_id} of {key}")))?;
    if entry.outcome.is_some() {
        tracing::debug!(record = %key, potential_id, "already assimilated");
        return Ok(());
    }
    let source = record.vertex.clone().ok_or_else(|| {
        StrataError::ConsistencyViolation(format!("{key} assimilated before transform"))
    })?;
    let candidate = &entry.candidate;
    let rule = &candidate.rule;

    let criteria = match_criteria(&pipeline.schema, candidate)?;
    let matches = pipeline.stores.graph.find_matches(
        &rule.target_type,
        candidate.vertex.internal_id.as_ref(),
        &criteria,
    )?;

    let (target, outcome, created) = match matches.as_slice() {
        [found] => {
            let target = matched_target(&candidate.vertex, found);
            let outcome = AssimilationOutcome::Matched {
                internal_id: found.internal_id.clone(),
            };
            (Some(target), outcome, None)
        }
        [] if candidate.vertex.is_identifiable() => {
            let vertex = candidate.vertex.clone();
            let outcome = AssimilationOutcome::Created {
                internal_id: require_id(&vertex)?,
            };
            (Some(vertex.clone()), outcome, Some(vertex))
        }
        [] => match rule.absence {
            AbsencePolicy::Stub => {
                let stub = as_stub(&candidate.vertex)?;
                let outcome = AssimilationOutcome::Stubbed {
                    internal_id: require_id(&stub)?,
                };
                (Some(stub.clone()), outcome, Some(stub))
            }
            AbsencePolicy::Drop => (None, AssimilationOutcome::Dropped, None),
        },
        several => {
            tracing::error!(
                record = %key,
                rule = %rule.name,
                target_type = %rule.target_type,
                matches = several.len(),
                "candidate is ambiguous"
            );
            return Err(StrataError::ConsistencyViolation(format!(
                "{} {} vertices match candidate {potential_id}",
                several.len(),
                rule.target_type
            )));
        }
    };

    let edges = match &target {
        Some(target) => vec![
            EdgeRegulator::new(&pipeline.schema, &rule.edge_label)?.generate_potential_edge(
                &source,
                target,
                &record.context,
                rule.inbound,
            )?,
        ],
        None => Vec::new(),
    };

    if !state.set_assimilation_results(key, potential_id, &outcome)? {
        tracing::debug!(record = %key, potential_id, "assimilation lost to another worker");
        return Ok(());
    }
    tracing::debug!(record = %key, potential_id, outcome = ?outcome, "candidate resolved");

    let mut vertices = vec![source];
    if let Some(vertex) = created {
        state.set_assimilated_vertex(&vertex)?;
        vertices.push(vertex);
    }
    out.send(Order::new(TaskArgs::Load {
        key: key.clone(),
        potential_id: Some(potential_id.to_string()),
        vertices,
        edges,
    }))
}

/// Known properties of the candidate, or nothing when only the stem
/// namespace is known.
fn match_criteria(
    schema: &Schema,
    candidate: &RuleCandidate,
) -> Result<BTreeMap<String, PropertyValue>, StrataError> {
    let definition = schema.vertex(&candidate.rule.target_type)?;
    let known: BTreeMap<String, PropertyValue> = candidate
        .vertex
        .properties
        .iter()
        .filter(|(_, value)| !value.is_missing())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let discriminating = known
        .keys()
        .any(|name| !definition.identifier_stem.contains(name));
    Ok(if discriminating { known } else { BTreeMap::new() })
}

/// The candidate re-pointed at a stored vertex. Stored values fill in
/// whatever the candidate does not know.
fn matched_target(candidate: &PotentialVertex, found: &StoredVertex) -> PotentialVertex {
    let mut target = candidate.clone();
    target.internal_id = Some(found.internal_id.clone());
    for (name, value) in &found.properties {
        let slot = target.properties.entry(name.clone()).or_insert(PropertyValue::Missing);
        if slot.is_missing() {
            *slot = value.clone();
        }
    }
    target
}

fn as_stub(candidate: &PotentialVertex) -> Result<PotentialVertex, StrataError> {
    let mut stub = candidate.clone();
    if !stub.is_stub() {
        stub.identifier_stem = IdentifierStem::from_raw(&stub.identifier_stem)?
            .to_stub()
            .to_string();
    }
    Ok(stub)
}

fn require_id(vertex: &PotentialVertex) -> Result<InternalId, StrataError> {
    vertex.internal_id.clone().ok_or_else(|| {
        StrataError::ConsistencyViolation(format!("{} without internal id", vertex.identifier_stem))
    })
}
