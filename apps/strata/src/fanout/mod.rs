//! # Fan-out
//!
//! Distributes a batch of work items across workers via a capped-width
//! tree of invocations, then resubmits the items that failed transiently.
//!
//! ```text
//!            root
//!       /     |     \        <= branching_cap children per branch
//!    branch branch branch
//!     / \     |      / \
//!   leaf leaf leaf leaf leaf <= concurrency leaves, items run in turn
//! ```

pub mod invoker;
pub mod plan;

pub use invoker::{
    FanOutPayload, HttpInvoker, InvocationError, Invoker, LocalInvoker, TaskHandler,
    TaskRegistry, handle_payload,
};
pub use plan::{PlanNode, WorkItem, build_plan, tree_depth};

use crate::config::FanOutConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::StrataError;

// =============================================================================
// RESULTS
// =============================================================================

/// Whether a failure is worth resubmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    Caller,
    Transient,
}

/// An item that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: WorkItem,
    pub fault: Fault,
    pub message: String,
}

/// Outcome of a fan-out or of one sub-tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutResults {
    /// Item key -> task result.
    pub results: BTreeMap<String, Value>,
    #[serde(default)]
    pub failed: Vec<FailedItem>,
    /// Rounds submitted, including the first.
    #[serde(default)]
    pub attempts: usize,
    /// Items resubmitted across all rounds.
    #[serde(default)]
    pub resubmitted: usize,
}

impl FanOutResults {
    pub fn fail(&mut self, item: WorkItem, error: &InvocationError) {
        self.failed.push(FailedItem {
            item,
            fault: error.fault(),
            message: error.error_message.clone(),
        });
    }

    pub fn merge(&mut self, other: FanOutResults) {
        self.results.extend(other.results);
        self.failed.extend(other.failed);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The error to surface when items are still failing.
    ///
    /// Any transient failure left over means the retry ceiling was reached;
    /// caller faults alone are a rejection that was never retried.
    #[must_use]
    pub fn failure(&self) -> Option<StrataError> {
        let transient = self
            .failed
            .iter()
            .filter(|failure| failure.fault == Fault::Transient)
            .count();
        if transient > 0 {
            return Some(StrataError::FanOutExhausted {
                attempts: self.attempts,
                remaining: transient,
            });
        }
        self.failed.first().map(|first| StrataError::FanOutRejected {
            rejected: self.failed.len(),
            message: first.message.clone(),
        })
    }
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Plans, submits and retries one fan-out.
#[derive(Clone)]
pub struct FanOut {
    invoker: Arc<dyn Invoker>,
    config: FanOutConfig,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FanOut {
    pub fn new(invoker: Arc<dyn Invoker>, config: FanOutConfig) -> Self {
        Self { invoker, config }
    }

    /// In-process execution unless `config.worker_url` names a remote
    /// worker.
    pub fn from_config(
        tasks: Arc<TaskRegistry>,
        config: &FanOutConfig,
        api_key: Option<String>,
    ) -> Self {
        let invoker: Arc<dyn Invoker> = match &config.worker_url {
            Some(url) => Arc::new(HttpInvoker::new(url.clone(), api_key)),
            None => Arc::new(LocalInvoker::new(tasks)),
        };
        Self::new(invoker, config.clone())
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.invoker.is_remote()
    }

    /// Run `task_name` over `items`.
    ///
    /// Caller faults are final. Transient failures are resubmitted, as a
    /// freshly planned tree, up to `retry_ceiling` more times; whatever is
    /// still failing after that is returned in `failed`.
    pub async fn run(&self, task_name: &str, constants: Value, items: Vec<WorkItem>) -> FanOutResults {
        let mut outcome = FanOutResults::default();
        let mut pending = items;

        while !pending.is_empty() {
            outcome.attempts += 1;
            let submitted = pending.clone();
            let plan = build_plan(pending, self.config.concurrency, self.config.branching_cap);
            tracing::debug!(
                task = task_name,
                attempt = outcome.attempts,
                items = submitted.len(),
                leaves = plan.leaf_count(),
                depth = plan.depth(),
                "submitting fan-out"
            );
            let payload = FanOutPayload {
                m_plan: Some(plan),
                m_concurrency: self.config.concurrency,
                task_name: task_name.to_string(),
                worker_ref: self.config.worker_ref.clone(),
                task_constants: constants.clone(),
                worker_args: None,
            };

            let round = match self.invoker.invoke(payload).await.and_then(|value| {
                serde_json::from_value::<FanOutResults>(value).map_err(|e| {
                    InvocationError::transient(format!("unreadable fan-out results: {e}"))
                })
            }) {
                Ok(round) => round,
                Err(error) => {
                    tracing::warn!(task = task_name, error = %error, "fan-out root failed");
                    let mut round = FanOutResults::default();
                    for item in submitted {
                        round.fail(item, &error);
                    }
                    round
                }
            };

            outcome.results.extend(round.results);
            let (transient, caller): (Vec<FailedItem>, Vec<FailedItem>) = round
                .failed
                .into_iter()
                .partition(|failure| failure.fault == Fault::Transient);
            for failure in &caller {
                tracing::warn!(task = task_name, key = %failure.item.key, message = %failure.message, "caller fault");
            }
            outcome.failed.extend(caller);

            if transient.is_empty() {
                break;
            }
            if outcome.attempts > self.config.retry_ceiling {
                tracing::error!(
                    task = task_name,
                    attempts = outcome.attempts,
                    remaining = transient.len(),
                    "retry ceiling reached"
                );
                outcome.failed.extend(transient);
                break;
            }
            tracing::info!(
                task = task_name,
                attempt = outcome.attempts,
                items = transient.len(),
                "resubmitting transient failures"
            );
            outcome.resubmitted += transient.len();
            pending = transient.into_iter().map(|failure| failure.item).collect();
        }

        outcome
    }
}
