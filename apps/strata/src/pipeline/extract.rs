//! # Extract
//!
//! Pulls the source row and its side slices for one claimed record.

use super::{Order, Pipeline, TaskArgs};
use crate::adapter::{ID_VALUE_FIELD_KEYWORD, ID_VALUE_KEYWORD};
use crate::queue::BatchingSender;
use serde_json::Value;
use strata_core::{IdentifierStem, RecordKey, Stage, StrataError};

pub(super) fn run(
    pipeline: &Pipeline,
    key: &RecordKey,
    object_type: &str,
    out: &mut BatchingSender,
) -> Result<(), StrataError> {
    let stem = IdentifierStem::from_raw(&key.identifier_stem)?;
    let definition = pipeline.schema.vertex(object_type)?;

    let mut keywords = stem.for_extractor();
    keywords.insert(
        ID_VALUE_FIELD_KEYWORD.to_string(),
        Value::String(definition.id_value_field.clone()),
    );
    keywords.insert(ID_VALUE_KEYWORD.to_string(), Value::String(key.id_value.clone()));

    let mut data = pipeline.adapter.extract(&keywords)?;
    if data.source.len() != 1 {
        tracing::error!(
            stem = %key.identifier_stem,
            id_value = %key.id_value,
            rows = data.source.len(),
            "source must yield exactly one row"
        );
        return Err(StrataError::ConsistencyViolation(format!(
            "{} source rows for {key}",
            data.source.len()
        )));
    }
    let Some(row) = data.source.pop() else {
        return Err(StrataError::NotFound(format!("source row for {key}")));
    };

    if !pipeline.stores.state.record_stage_clear(key, Stage::Extracted)? {
        return Ok(());
    }
    out.send(Order::new(TaskArgs::Transform {
        key: key.clone(),
        row,
        context: data.context,
    }))
}
