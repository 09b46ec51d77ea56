//! # Load
//!
//! Upserts vertices and edges, writes their index entries, then marks the
//! record (and any record created for a target) committed. Every write is
//! an idempotent upsert, so a repeated load order is harmless.

use super::Pipeline;
use strata_core::{
    PotentialEdge, PotentialVertex, RecordKey, Stage, StrataError, UpsertCommand,
    index_entries_for,
};

pub(super) fn run(
    pipeline: &Pipeline,
    key: &RecordKey,
    potential_id: Option<&str>,
    vertices: &[PotentialVertex],
    edges: &[PotentialEdge],
) -> Result<(), StrataError> {
    let stores = &pipeline.stores;

    for vertex in vertices {
        let command = UpsertCommand::for_vertex(vertex)?;
        tracing::trace!(command = %command.render(), "upsert");
        stores.graph.apply(&command)?;

        let definition = pipeline.schema.vertex(&vertex.object_type)?;
        let entries = index_entries_for(definition, vertex);
        if !entries.is_empty() {
            stores.index.write_index_entries(&entries)?;
        }
    }
    for edge in edges {
        let command = UpsertCommand::for_edge(edge)?;
        tracing::trace!(command = %command.render(), "upsert");
        stores.graph.apply(&command)?;
    }

    for vertex in vertices {
        let target = RecordKey::for_vertex(vertex);
        if &target != key && stores.state.get(&target)?.is_some() {
            stores.state.record_stage_clear(&target, Stage::Committed)?;
        }
    }
    match potential_id {
        Some(potential_id) => stores.state.mark_potential_committed(key, potential_id)?,
        None => stores.state.record_stage_clear(key, Stage::Committed)?,
    };

    tracing::debug!(
        record = %key,
        vertices = vertices.len(),
        edges = edges.len(),
        "loaded"
    );
    Ok(())
}
