//! # Pipeline
//!
//! Five actors, each handling one kind of [`Order`] and emitting the next:
//!
//! ```text
//! monitor    claims new ids (fan-out)            -> extract*
//! extract    pulls the source row and slices     -> transform
//! transform  regulates and evaluates rules       -> assimilate* | load
//! assimilate resolves one candidate              -> load
//! load       upserts vertices, edges, indexes
//! ```
//!
//! Every actor is idempotent: a stage that has already been cleared by
//! another invocation makes the actor stop quietly.

pub mod assimilate;
pub mod extract;
pub mod load;
pub mod monitor;
pub mod orders;
pub mod transform;

pub use monitor::{CLAIM_TASK, ClaimTask};
pub use orders::{Order, TaskArgs};

use crate::adapter::SourceAdapter;
use crate::config::StorageConfig;
use crate::fanout::{FanOut, TaskRegistry};
use crate::queue::{BatchingSender, OrderQueue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{
    GraphStore, IndexStore, MemoryGraph, MemoryStateStore, RedbGraph, RedbStateStore, Schema,
    SecretStore, StateStore, StrataError,
};

// =============================================================================
// STORES
// =============================================================================

/// The stores every actor shares.
#[derive(Clone)]
pub struct PipelineStores {
    pub state: Arc<dyn StateStore>,
    pub graph: Arc<dyn GraphStore>,
    pub index: Arc<dyn IndexStore>,
    pub secrets: Arc<dyn SecretStore>,
}

impl PipelineStores {
    /// Volatile stores; graph, indexes and secrets share one [`MemoryGraph`].
    #[must_use]
    pub fn memory() -> Self {
        let graph = Arc::new(MemoryGraph::new());
        Self {
            state: Arc::new(MemoryStateStore::new()),
            graph: graph.clone(),
            index: graph.clone(),
            secrets: graph,
        }
    }

    /// redb stores under `storage.database`, created when absent.
    pub fn open(storage: &StorageConfig) -> Result<Self, StrataError> {
        std::fs::create_dir_all(&storage.database).map_err(|e| {
            StrataError::IoError(format!("{}: {e}", storage.database.display()))
        })?;
        let graph = Arc::new(RedbGraph::open(storage.graph_path())?);
        Ok(Self {
            state: Arc::new(RedbStateStore::open(storage.state_path())?),
            graph: graph.clone(),
            index: graph.clone(),
            secrets: graph,
        })
    }

    /// Fan-out tasks served against these stores.
    #[must_use]
    pub fn tasks(&self) -> TaskRegistry {
        let mut tasks = TaskRegistry::new();
        tasks.register(CLAIM_TASK, ClaimTask::new(self.state.clone()));
        tasks
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Per-task counts from one [`Pipeline::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: BTreeMap<String, usize>,
    pub emitted: usize,
}

impl DrainReport {
    #[must_use]
    pub fn count(&self, task_name: &str) -> usize {
        self.processed.get(task_name).copied().unwrap_or(0)
    }
}

pub struct Pipeline {
    pub(crate) schema: Arc<Schema>,
    pub(crate) stores: PipelineStores,
    pub(crate) adapter: Arc<dyn SourceAdapter>,
    pub(crate) fanout: FanOut,
    pub(crate) max_claims_per_tick: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("fanout", &self.fanout)
            .field("max_claims_per_tick", &self.max_claims_per_tick)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        schema: Arc<Schema>,
        stores: PipelineStores,
        adapter: Arc<dyn SourceAdapter>,
        fanout: FanOut,
        max_claims_per_tick: usize,
    ) -> Self {
        Self {
            schema,
            stores,
            adapter,
            fanout,
            max_claims_per_tick,
        }
    }

    #[must_use]
    pub fn stores(&self) -> &PipelineStores {
        &self.stores
    }

    /// Run the actor addressed by `order`, emitting follow-up orders to `out`.
    pub async fn dispatch(&self, order: &Order, out: &mut BatchingSender) -> Result<(), StrataError> {
        tracing::debug!(task = %order.task_name, "dispatching order");
        match &order.task_args {
            TaskArgs::Monitor { identifier_stem } => monitor::run(self, identifier_stem, out).await,
            TaskArgs::Extract { key, object_type } => extract::run(self, key, object_type, out),
            TaskArgs::Transform { key, row, context } => transform::run(self, key, row, context, out),
            TaskArgs::Assimilate { key, potential_id } => {
                assimilate::run(self, key, potential_id, out)
            }
            TaskArgs::Load {
                key,
                potential_id,
                vertices,
                edges,
            } => load::run(self, key, potential_id.as_deref(), vertices, edges),
        }
    }

    /// Process orders from `queue` until it is empty, feeding emitted orders
    /// back onto the same queue.
    ///
    /// The first failing order stops the drain with its error. The orders
    /// received after it in the same batch go back onto the queue.
    pub async fn drain(
        &self,
        queue: Arc<dyn OrderQueue>,
        batch_size: usize,
    ) -> Result<DrainReport, StrataError> {
        let mut report = DrainReport::default();
        let mut out = BatchingSender::new(queue.clone(), batch_size);
        loop {
            let batch = queue.receive(batch_size.max(1))?;
            if batch.is_empty() {
                break;
            }
            for (index, order) in batch.iter().enumerate() {
                let result = self.dispatch(order, &mut out).await;
                out.flush()?;
                if let Err(e) = result {
                    let rest = &batch[index + 1..];
                    queue.send_batch(rest)?;
                    tracing::error!(
                        task = %order.task_name,
                        order = %serde_json::to_string(order).unwrap_or_default(),
                        requeued = rest.len(),
                        error = %e,
                        "order failed"
                    );
                    return Err(e);
                }
                *report.processed.entry(order.task_name.clone()).or_default() += 1;
            }
        }
        report.emitted = out.sent();
        tracing::info!(processed = ?report.processed, emitted = report.emitted, "queue drained");
        Ok(report)
    }
}
