//! # Invokers
//!
//! Every hop of a fan-out is one invocation of the worker entry point with
//! a [`FanOutPayload`]. A payload carrying a plan fans out further; one
//! carrying worker arguments performs a single item.
//!
//! [`LocalInvoker`] runs sub-trees in-process on the tokio runtime.
//! [`HttpInvoker`] crosses to a remote worker's `/invoke` endpoint.

use super::plan::{PlanNode, WorkItem};
use super::{FanOutResults, Fault};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use strata_core::StrataError;

/// `errorType` reported for failures retrying cannot fix.
pub const CALLER_FAULT: &str = "CallerFault";
/// `errorType` reported for failures worth resubmitting.
pub const TRANSIENT_FAULT: &str = "TransientFault";

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Payload accepted by the worker entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutPayload {
    /// Sub-tree to distribute; absent for single-item invocations.
    #[serde(default)]
    pub m_plan: Option<PlanNode>,
    #[serde(default)]
    pub m_concurrency: usize,
    pub task_name: String,
    #[serde(default)]
    pub worker_ref: String,
    /// Arguments shared by every item of the fan-out.
    #[serde(default)]
    pub task_constants: Value,
    #[serde(default)]
    pub worker_args: Option<WorkItem>,
}

impl FanOutPayload {
    fn for_plan(&self, plan: PlanNode) -> Self {
        Self {
            m_plan: Some(plan),
            worker_args: None,
            ..self.clone()
        }
    }

    fn for_item(&self, item: WorkItem) -> Self {
        Self {
            m_plan: None,
            worker_args: Some(item),
            ..self.clone()
        }
    }
}

/// Failure body returned by an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationError {
    pub error_type: String,
    pub error_message: String,
}

impl InvocationError {
    pub fn caller(message: impl Into<String>) -> Self {
        Self {
            error_type: CALLER_FAULT.to_string(),
            error_message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error_type: TRANSIENT_FAULT.to_string(),
            error_message: message.into(),
        }
    }

    /// Unknown error types are treated as transient.
    #[must_use]
    pub fn fault(&self) -> Fault {
        if self.error_type == CALLER_FAULT {
            Fault::Caller
        } else {
            Fault::Transient
        }
    }
}

impl From<StrataError> for InvocationError {
    fn from(error: StrataError) -> Self {
        if error.is_caller_fault() {
            Self::caller(error.to_string())
        } else {
            Self::transient(error.to_string())
        }
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Work performed for one item at a leaf.
///
/// Handlers are synchronous; they run on tokio's blocking pool.
pub trait TaskHandler: Send + Sync {
    fn run(&self, constants: &Value, item: &WorkItem) -> Result<Value, StrataError>;
}

/// Task handlers by name.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

// =============================================================================
// INVOKERS
// =============================================================================

pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send + 'a>>;

/// Delivers a payload to a worker entry point.
pub trait Invoker: Send + Sync {
    fn invoke(&self, payload: FanOutPayload) -> InvokeFuture<'_>;

    /// Whether tasks run in another process, against that process's stores.
    fn is_remote(&self) -> bool {
        false
    }
}

/// Executes payloads inside this process.
#[derive(Debug, Clone)]
pub struct LocalInvoker {
    tasks: Arc<TaskRegistry>,
}

impl LocalInvoker {
    #[must_use]
    pub fn new(tasks: Arc<TaskRegistry>) -> Self {
        Self { tasks }
    }
}

impl Invoker for LocalInvoker {
    fn invoke(&self, payload: FanOutPayload) -> InvokeFuture<'_> {
        let children: Arc<dyn Invoker> = Arc::new(self.clone());
        Box::pin(async move { handle_payload(&self.tasks, children, payload).await })
    }
}

/// Posts payloads to a remote worker.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpInvoker {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a request with optional Bearer auth.
    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn call(&self, payload: FanOutPayload) -> Result<Value, InvocationError> {
        let resp = self
            .request("/invoke")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                InvocationError::transient(format!("cannot reach worker at {}: {e}", self.base_url))
            })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|e| InvocationError::transient(format!("unreadable worker reply: {e}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(InvocationError::caller("unauthorized: invalid or missing API key"));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(InvocationError::transient("rate limited by worker"));
        }

        let body = resp.text().await.unwrap_or_default();
        if let Ok(error) = serde_json::from_str::<InvocationError>(&body) {
            return Err(error);
        }
        let message = format!("worker returned {}: {body}", status.as_u16());
        if status.is_client_error() {
            Err(InvocationError::caller(message))
        } else {
            Err(InvocationError::transient(message))
        }
    }
}

impl Invoker for HttpInvoker {
    fn invoke(&self, payload: FanOutPayload) -> InvokeFuture<'_> {
        Box::pin(self.call(payload))
    }

    fn is_remote(&self) -> bool {
        true
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

/// Worker entry point.
///
/// A plan is executed with `children` delivering each sub-tree and each
/// item; the reply is the serialized [`FanOutResults`]. Worker arguments
/// run the named task once.
pub async fn handle_payload(
    tasks: &TaskRegistry,
    children: Arc<dyn Invoker>,
    payload: FanOutPayload,
) -> Result<Value, InvocationError> {
    if let Some(plan) = payload.m_plan.clone() {
        tracing::debug!(
            task = %payload.task_name,
            worker = %payload.worker_ref,
            concurrency = payload.m_concurrency,
            leaves = plan.leaf_count(),
            "executing plan"
        );
        let results = execute_node(children, &payload, plan).await;
        return serde_json::to_value(results)
            .map_err(|e| InvocationError::transient(format!("cannot encode results: {e}")));
    }

    let Some(item) = payload.worker_args else {
        return Err(InvocationError::caller(
            "payload carries neither a plan nor worker arguments",
        ));
    };
    let Some(handler) = tasks.get(&payload.task_name) else {
        return Err(InvocationError::caller(format!(
            "unknown task: {}",
            payload.task_name
        )));
    };
    let constants = payload.task_constants;
    tokio::task::spawn_blocking(move || handler.run(&constants, &item))
        .await
        .map_err(|e| InvocationError::transient(format!("task aborted: {e}")))?
        .map_err(InvocationError::from)
}

/// Branches spawn one invocation per child; leaves invoke their items one
/// after another.
async fn execute_node(
    invoker: Arc<dyn Invoker>,
    template: &FanOutPayload,
    node: PlanNode,
) -> FanOutResults {
    let mut results = FanOutResults::default();
    match node {
        PlanNode::Leaf { items } => {
            for item in items {
                match invoker.invoke(template.for_item(item.clone())).await {
                    Ok(value) => {
                        results.results.insert(item.key, value);
                    }
                    Err(error) => results.fail(item, &error),
                }
            }
        }
        PlanNode::Branch { children } => {
            let handles: Vec<_> = children
                .into_iter()
                .map(|child| {
                    let invoker = Arc::clone(&invoker);
                    let payload = template.for_plan(child.clone());
                    let handle = tokio::spawn(async move { invoker.invoke(payload).await });
                    (child, handle)
                })
                .collect();

            for (child, handle) in handles {
                let outcome = handle.await.unwrap_or_else(|e| {
                    Err(InvocationError::transient(format!("branch task failed: {e}")))
                });
                match outcome.and_then(|value| {
                    serde_json::from_value::<FanOutResults>(value).map_err(|e| {
                        InvocationError::transient(format!("unreadable sub-tree results: {e}"))
                    })
                }) {
                    Ok(sub) => results.merge(sub),
                    Err(error) => {
                        tracing::warn!(error = %error, items = child.items().len(), "sub-tree failed");
                        for item in child.items() {
                            results.fail(item.clone(), &error);
                        }
                    }
                }
            }
        }
    }
    results
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::fanout::plan::build_plan;
    use serde_json::json;

    struct Double;

    impl TaskHandler for Double {
        fn run(&self, constants: &Value, item: &WorkItem) -> Result<Value, StrataError> {
            let factor = constants["factor"].as_i64().unwrap_or(2);
            match item.args.as_i64() {
                Some(n) => Ok(json!(n * factor)),
                None => Err(StrataError::RegulationError(format!("not a number: {}", item.args))),
            }
        }
    }

    fn invoker() -> LocalInvoker {
        let mut tasks = TaskRegistry::new();
        tasks.register("double", Double);
        LocalInvoker::new(Arc::new(tasks))
    }

    fn payload(plan: Option<PlanNode>, item: Option<WorkItem>) -> FanOutPayload {
        FanOutPayload {
            m_plan: plan,
            m_concurrency: 4,
            task_name: "double".to_string(),
            worker_ref: "local".to_string(),
            task_constants: json!({ "factor": 3 }),
            worker_args: item,
        }
    }

    #[test]
    fn error_body_uses_camel_case() {
        let body = serde_json::to_value(InvocationError::caller("bad row")).expect("encode");
        assert_eq!(body, json!({ "errorType": "CallerFault", "errorMessage": "bad row" }));
        assert_eq!(InvocationError::transient("x").fault(), Fault::Transient);
    }

    #[test]
    fn strata_errors_map_to_faults() {
        let caller: InvocationError = StrataError::ConsistencyViolation("two rows".into()).into();
        let transient: InvocationError = StrataError::StorageError("locked".into()).into();
        assert_eq!(caller.fault(), Fault::Caller);
        assert_eq!(transient.fault(), Fault::Transient);
    }

    #[tokio::test]
    async fn single_item_runs_task() {
        let value = invoker()
            .invoke(payload(None, Some(WorkItem::new("a", json!(7)))))
            .await
            .expect("invoke");
        assert_eq!(value, json!(21));
    }

    #[tokio::test]
    async fn plan_collects_results_and_failures() {
        let mut items: Vec<WorkItem> = (0..30).map(|i| WorkItem::new(i.to_string(), json!(i))).collect();
        items.push(WorkItem::new("bad", json!("x")));
        let plan = build_plan(items, 8, 3);

        let value = invoker().invoke(payload(Some(plan), None)).await.expect("invoke");
        let results: FanOutResults = serde_json::from_value(value).expect("decode");

        assert_eq!(results.results.len(), 30);
        assert_eq!(results.results["10"], json!(30));
        assert_eq!(results.failed.len(), 1);
        assert_eq!(results.failed[0].item.key, "bad");
        assert_eq!(results.failed[0].fault, Fault::Caller);
    }

    #[tokio::test]
    async fn empty_payload_is_a_caller_fault() {
        let error = invoker().invoke(payload(None, None)).await.expect_err("rejected");
        assert_eq!(error.fault(), Fault::Caller);

        let mut unknown = payload(None, Some(WorkItem::new("a", json!(1))));
        unknown.task_name = "triple".to_string();
        let error = invoker().invoke(unknown).await.expect_err("rejected");
        assert!(error.error_message.contains("unknown task"));
    }
}
