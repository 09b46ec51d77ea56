//! # Transform
//!
//! Regulates the source row into a potential vertex and evaluates the
//! linking rules against the extracted context.

use super::{Order, Pipeline, TaskArgs};
use crate::queue::BatchingSender;
use serde_json::{Map, Value};
use strata_core::{
    ExtractedContext, RecordKey, RuleArbiter, StrataError, VertexOverrides, VertexRegulator,
};

pub(super) fn run(
    pipeline: &Pipeline,
    key: &RecordKey,
    row: &Map<String, Value>,
    context: &ExtractedContext,
    out: &mut BatchingSender,
) -> Result<(), StrataError> {
    let record = pipeline
        .stores
        .state
        .get(key)?
        .ok_or_else(|| StrataError::NotFound(format!("staged record {key}")))?;

    let secrets = pipeline.stores.secrets.as_ref();
    let vertex = VertexRegulator::new(&pipeline.schema, &record.object_type)?
        .with_secrets(secrets)
        .create_potential_vertex(row, &VertexOverrides::default())?;
    let candidates = RuleArbiter::new(&pipeline.schema)
        .with_secrets(secrets)
        .process_rules(&vertex, context)?;

    if !pipeline
        .stores
        .state
        .set_transform_results(key, &vertex, context, &candidates)?
    {
        tracing::debug!(record = %key, "already transformed");
        return Ok(());
    }

    if candidates.is_empty() {
        return out.send(Order::new(TaskArgs::Load {
            key: key.clone(),
            potential_id: None,
            vertices: vec![vertex],
            edges: Vec::new(),
        }));
    }
    for candidate in &candidates {
        out.send(Order::new(TaskArgs::Assimilate {
            key: key.clone(),
            potential_id: candidate.potential_id(),
        }))?;
    }
    Ok(())
}
