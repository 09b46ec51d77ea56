//! # Monitor
//!
//! Compares the source's watermark with the highest id claimed locally and
//! claims the gap through a fan-out. Each won claim becomes an extract
//! order; a lost claim means another monitor got there first.
//!
//! Claims are written to the pipeline's own state store, which later stages
//! read back. A fan-out through a remote worker would write them to the
//! worker's store instead, so the monitor refuses one.

use super::{Order, Pipeline, TaskArgs};
use crate::fanout::{TaskHandler, WorkItem};
use crate::queue::BatchingSender;
use serde_json::{Value, json};
use std::sync::Arc;
use strata_core::{IdentifierStem, RecordKey, StateStore, StrataError};

/// Fan-out task that claims one id.
pub const CLAIM_TASK: &str = "claim";

/// Claims `args.id_value` under `constants.identifier_stem`; the result is
/// `true` iff this invocation won.
pub struct ClaimTask {
    state: Arc<dyn StateStore>,
}

impl ClaimTask {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }
}

fn required_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, StrataError> {
    value[field]
        .as_str()
        .ok_or_else(|| StrataError::ConsistencyViolation(format!("claim without {field}")))
}

impl TaskHandler for ClaimTask {
    fn run(&self, constants: &Value, item: &WorkItem) -> Result<Value, StrataError> {
        let stem = required_str(constants, "identifier_stem")?;
        let object_type = required_str(constants, "object_type")?;
        let id_value = item.args["id_value"]
            .as_i64()
            .ok_or_else(|| StrataError::ConsistencyViolation(format!("claim {} without id_value", item.key)))?;
        let won = self.state.claim(stem, id_value, object_type)?;
        Ok(Value::Bool(won))
    }
}

pub(super) async fn run(
    pipeline: &Pipeline,
    identifier_stem: &str,
    out: &mut BatchingSender,
) -> Result<(), StrataError> {
    let stem = IdentifierStem::from_raw(identifier_stem)?;
    let canonical = stem.to_string();
    if pipeline.fanout.is_remote() {
        tracing::error!(stem = %canonical, "claims cannot fan out to a remote worker");
        return Err(StrataError::ConfigError(
            "fanout.worker_url is set, but claims must be written to this pipeline's state store"
                .to_string(),
        ));
    }

    let remote = pipeline.adapter.remote_max(&stem.for_extractor())?;
    let local = match pipeline.stores.state.query_max(&canonical) {
        Ok(max) => max,
        Err(StrataError::EmptyIndex(_)) => {
            tracing::info!(stem = %canonical, "no local watermark, starting from zero");
            0
        }
        Err(e) => return Err(e),
    };
    if remote <= local {
        tracing::debug!(stem = %canonical, local, remote, "source has nothing new");
        return Ok(());
    }

    let cap = i64::try_from(pipeline.max_claims_per_tick).unwrap_or(i64::MAX);
    let upper = remote.min(local.saturating_add(cap));
    let ids: Vec<i64> = ((local + 1)..=upper).collect();
    tracing::info!(stem = %canonical, local, remote, claims = ids.len(), "claiming new ids");

    let items = ids
        .iter()
        .map(|id| WorkItem::new(id.to_string(), json!({ "id_value": id })))
        .collect();
    let constants = json!({
        "identifier_stem": canonical,
        "object_type": stem.object_type(),
    });
    let results = pipeline.fanout.run(CLAIM_TASK, constants, items).await;

    let mut won = 0usize;
    for id in &ids {
        let key = id.to_string();
        if results.results.get(&key) == Some(&Value::Bool(true)) {
            won += 1;
            out.send(Order::new(TaskArgs::Extract {
                key: RecordKey::new(canonical.clone(), key),
                object_type: stem.object_type().to_string(),
            }))?;
        }
    }
    out.flush()?;
    tracing::info!(stem = %canonical, won, lost = results.results.len() - won, "claims settled");

    match results.failure() {
        Some(error) => {
            tracing::error!(
                stem = %canonical,
                failed = results.failed.len(),
                attempts = results.attempts,
                error = %error,
                "claims left unsettled"
            );
            Err(error)
        }
        None => Ok(()),
    }
}
