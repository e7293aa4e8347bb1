//! Remote convergence executor
//!
//! Walks an ordered plan, issuing each step's remote call once, polling
//! accepted operations to a terminal status, and folding every confirmed
//! response into the running state snapshot. Disjoint subgraphs of the
//! plan execute concurrently up to a configured limit; a failure aborts
//! the remaining steps without rolling back the converged prefix.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lodestone_common::retry::{retry_with_backoff_if, RetryConfig};
use lodestone_common::{
    Error, Result, DEFAULT_MAX_CONCURRENCY, DEFAULT_OPERATION_DEADLINE_SECS,
    DEFAULT_POLL_INTERVAL_SECS,
};

use crate::doc::{deep_merge, set_path};
use crate::model::registry::StepTarget;
use crate::model::ClusterSpec;
use crate::plan::{OrderedPlan, PlanStep, StepVerb};
use crate::remote::{ControlPlaneClient, OperationStatus, PendingOperation, RemoteCall};
use crate::state::{ResourceState, SnapshotStore};

/// Severity of a diagnostic surfaced to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Informational note
    Info,
    /// Something worth attention that did not fail the apply
    Warning,
    /// A step failed; the plan was aborted at this point
    Error,
}

/// A caller-facing note about an apply
///
/// Formatting for humans belongs to the host; this carries the facts.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Severity of the note
    pub severity: Severity,
    /// Sub-resource target the note concerns, when there is one
    pub target: Option<String>,
    /// What happened
    pub message: String,
}

impl Diagnostic {
    /// An error diagnostic for a specific target
    pub fn error(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            target: Some(target.into()),
            message: message.into(),
        }
    }

    /// A warning diagnostic without target context
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            target: None,
            message: message.into(),
        }
    }

    /// True for error-severity diagnostics
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Tuning for the executor
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Interval between polls of a pending operation
    pub poll_interval: Duration,
    /// Deadline for a pending operation to reach a terminal status
    pub operation_deadline: Duration,
    /// Backoff configuration for transient remote failures
    pub retry: RetryConfig,
    /// Maximum plan steps in flight at once
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            operation_deadline: Duration::from_secs(DEFAULT_OPERATION_DEADLINE_SECS),
            retry: RetryConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// The prepared remote call for one plan step
#[derive(Clone, Debug)]
enum StepCall {
    PutCluster { name: String, body: Value },
    PatchCluster { id: String, patch: Value },
    DeleteCluster { id: String },
    PutPool { cluster_id: String, pool: String, body: Value },
    DeletePool { cluster_id: String, pool: String },
}

impl StepCall {
    fn label(&self) -> &'static str {
        match self {
            Self::PutCluster { .. } => "put_cluster",
            Self::PatchCluster { .. } => "patch_cluster",
            Self::DeleteCluster { .. } => "delete_cluster",
            Self::PutPool { .. } => "put_agent_pool",
            Self::DeletePool { .. } => "delete_agent_pool",
        }
    }
}

/// How a confirmed step response folds into the running state
enum StepEffect {
    MergeRoot(Value),
    MergePool(Value),
    RemoveRoot,
    RemovePool,
}

/// Executes ordered plans against the remote control plane
///
/// The snapshot store is mutated here and only here, after a confirmed
/// remote response — single-writer discipline.
pub struct Executor<C> {
    client: Arc<C>,
    store: Arc<SnapshotStore>,
    config: ExecutorConfig,
}

impl<C: ControlPlaneClient> Executor<C> {
    /// Create an executor over an injected remote client and store
    pub fn new(client: Arc<C>, store: Arc<SnapshotStore>, config: ExecutorConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Apply an ordered plan, returning the best-known state and diagnostics
    ///
    /// Steps whose graph predecessors all reported terminal success are
    /// issued concurrently up to the configured limit; each step is issued
    /// at most once. Cancellation stops issuing new steps but lets
    /// already-dispatched operations resolve, so the returned state
    /// reflects exactly the set of steps confirmed complete.
    pub async fn apply(
        &self,
        plan: &OrderedPlan,
        spec: &ClusterSpec,
        prior: Option<&ResourceState>,
        cancel: &CancellationToken,
    ) -> (Option<ResourceState>, Vec<Diagnostic>) {
        let mut diagnostics: Vec<Diagnostic> = Vec::new();
        let mut working: Value = match prior {
            Some(state) => serde_json::to_value(state).unwrap_or(Value::Null),
            None => Value::Null,
        };

        let mut indegree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        let step_by_id: HashMap<usize, &PlanStep> =
            plan.steps.iter().map(|s| (s.id, s)).collect();
        for step in &plan.steps {
            indegree.insert(step.id, step.depends_on.len());
            for &dep in &step.depends_on {
                dependents.entry(dep).or_default().push(step.id);
            }
        }

        let mut ready: VecDeque<usize> = plan
            .steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;
        let mut completed = 0usize;
        let mut failed = 0usize;

        loop {
            while !halted && !cancel.is_cancelled() {
                let Some(id) = ready.pop_front() else { break };
                let step = step_by_id[&id];
                match prepare_call(step, spec, &working) {
                    Ok(call) => {
                        debug!(step = id, target = %step.target, call = call.label(), "issuing plan step");
                        in_flight.push(self.run_step(id, step.target, call, semaphore.clone()));
                    }
                    Err(e) => {
                        diagnostics.push(Diagnostic::error(step.target.to_string(), e.to_string()));
                        halted = true;
                        failed += 1;
                    }
                }
            }

            let Some((id, target, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(effect) => {
                    apply_effect(&mut working, effect);
                    self.commit(&working, &mut diagnostics);
                    completed += 1;
                    info!(step = id, target = %target, "plan step confirmed");
                    for &dependent in dependents.get(&id).into_iter().flatten() {
                        let deg = indegree.get_mut(&dependent).expect("known step");
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
                Err(e) => {
                    error!(step = id, target = %target, error = %e, "plan step failed");
                    diagnostics.push(Diagnostic::error(target.to_string(), e.to_string()));
                    halted = true;
                    failed += 1;
                }
            }
        }

        let skipped = plan.len().saturating_sub(completed + failed);
        if cancel.is_cancelled() && skipped > 0 {
            warn!(skipped, "apply canceled; remaining steps not issued");
            diagnostics.push(Diagnostic::warning(format!(
                "apply canceled; {skipped} steps not issued"
            )));
        } else if halted && skipped > 0 {
            diagnostics.push(Diagnostic::warning(format!(
                "{skipped} dependent steps aborted after failure"
            )));
        }

        let state = self.final_state(&working, prior, &mut diagnostics);
        (state, diagnostics)
    }

    async fn run_step(
        &self,
        id: usize,
        target: StepTarget,
        call: StepCall,
        semaphore: Arc<Semaphore>,
    ) -> (usize, StepTarget, Result<StepEffect>) {
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        let result = self.execute(target, call).await;
        (id, target, result)
    }

    /// Issue one remote call and resolve it to a confirmed effect
    async fn execute(&self, target: StepTarget, call: StepCall) -> Result<StepEffect> {
        let outcome = self.issue(target, &call).await?;

        let payload = match outcome {
            RemoteCall::Complete(value) => {
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            }
            RemoteCall::Accepted(handle) => {
                let pending = PendingOperation::new(
                    handle,
                    target,
                    self.config.poll_interval,
                    self.config.operation_deadline,
                );
                info!(
                    target = %target,
                    operation = %pending.handle.id,
                    "remote call accepted; polling to terminal status"
                );
                self.wait_for_terminal(&pending).await?
            }
        };

        self.finalize(call, payload).await
    }

    /// Issue the call, retrying transient failures with bounded backoff
    async fn issue(&self, target: StepTarget, call: &StepCall) -> Result<RemoteCall> {
        retry_with_backoff_if(
            &self.config.retry,
            call.label(),
            Error::is_retryable,
            || async {
                match call {
                    StepCall::PutCluster { name, body } => {
                        self.client.put_cluster(name, body).await
                    }
                    StepCall::PatchCluster { id, patch } => {
                        self.client.patch_cluster(id, patch).await
                    }
                    StepCall::DeleteCluster { id } => self.client.delete_cluster(id).await,
                    StepCall::PutPool {
                        cluster_id,
                        pool,
                        body,
                    } => self.client.put_agent_pool(cluster_id, pool, body).await,
                    StepCall::DeletePool { cluster_id, pool } => {
                        self.client.delete_agent_pool(cluster_id, pool).await
                    }
                }
            },
        )
        .await
        .map_err(|e| escalate(target, e))
    }

    /// Poll a pending operation until terminal status or deadline
    async fn wait_for_terminal(&self, pending: &PendingOperation) -> Result<Option<Value>> {
        let started = tokio::time::Instant::now();
        loop {
            let status = retry_with_backoff_if(
                &self.config.retry,
                "poll_operation",
                Error::is_retryable,
                || async { self.client.poll_operation(&pending.handle).await },
            )
            .await
            .map_err(|e| escalate(pending.target, e))?;

            match status {
                OperationStatus::Succeeded(payload) => {
                    debug!(operation = %pending.handle.id, "operation succeeded");
                    return Ok(payload);
                }
                OperationStatus::Failed(message) => {
                    return Err(Error::remote_failed(pending.target.to_string(), message));
                }
                OperationStatus::Canceled => {
                    return Err(Error::remote_failed(
                        pending.target.to_string(),
                        "operation canceled by the control plane",
                    ));
                }
                OperationStatus::Running => {
                    if started.elapsed() >= pending.deadline {
                        return Err(Error::timed_out(
                            pending.target.to_string(),
                            pending.deadline.as_secs(),
                        ));
                    }
                    tokio::time::sleep(pending.poll_interval).await;
                }
            }
        }
    }

    /// Turn a terminal payload into a state effect, re-reading the target
    /// when the operation succeeded without returning a document
    async fn finalize(&self, call: StepCall, payload: Option<Value>) -> Result<StepEffect> {
        match call {
            StepCall::DeleteCluster { .. } => Ok(StepEffect::RemoveRoot),
            StepCall::DeletePool { .. } => Ok(StepEffect::RemovePool),
            StepCall::PutCluster { name, .. } => match payload {
                Some(value) => Ok(StepEffect::MergeRoot(value)),
                None => self.read_cluster(&name).await.map(StepEffect::MergeRoot),
            },
            StepCall::PatchCluster { id, .. } => match payload {
                Some(value) => Ok(StepEffect::MergeRoot(value)),
                None => self.read_cluster(&id).await.map(StepEffect::MergeRoot),
            },
            StepCall::PutPool {
                cluster_id, pool, ..
            } => match payload {
                Some(value) => Ok(StepEffect::MergePool(value)),
                None => self
                    .client
                    .get_agent_pool(&cluster_id, &pool)
                    .await?
                    .map(StepEffect::MergePool)
                    .ok_or_else(|| Error::not_found(format!("{cluster_id}/{pool}"))),
            },
        }
    }

    async fn read_cluster(&self, id: &str) -> Result<Value> {
        self.client
            .get_cluster(id)
            .await?
            .ok_or_else(|| Error::not_found(id))
    }

    /// Commit the working document as the new snapshot
    fn commit(&self, working: &Value, diagnostics: &mut Vec<Diagnostic>) {
        if working.is_null() {
            self.store.clear();
            return;
        }
        match ResourceState::from_value(working.clone()) {
            Ok(state) => self.store.commit(state),
            Err(e) => diagnostics.push(Diagnostic::warning(format!(
                "confirmed response did not map to a snapshot: {e}"
            ))),
        }
    }

    fn final_state(
        &self,
        working: &Value,
        prior: Option<&ResourceState>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<ResourceState> {
        if working.is_null() {
            return None;
        }
        match ResourceState::from_value(working.clone()) {
            Ok(state) => Some(state),
            Err(e) => {
                diagnostics.push(Diagnostic::error(
                    StepTarget::Cluster.to_string(),
                    e.to_string(),
                ));
                prior.cloned()
            }
        }
    }
}

/// After the retry budget, a persisting transient failure is a remote failure
fn escalate(target: StepTarget, e: Error) -> Error {
    match e {
        Error::Transient { message, .. } => Error::remote_failed(
            target.to_string(),
            format!("transient failure persisted after retries: {message}"),
        ),
        other => other,
    }
}

/// Resolve a step to the concrete remote call it performs
fn prepare_call(step: &PlanStep, spec: &ClusterSpec, working: &Value) -> Result<StepCall> {
    let id = resource_identifier(working, spec);
    Ok(match (step.target, step.verb) {
        (StepTarget::Cluster, StepVerb::Create) => StepCall::PutCluster {
            name: spec.name.clone(),
            body: spec.to_remote_body()?,
        },
        (StepTarget::Cluster, StepVerb::Delete) => StepCall::DeleteCluster { id },
        (StepTarget::NodePool, StepVerb::Delete) => StepCall::DeletePool {
            cluster_id: id,
            pool: observed_pool_name(step, working, spec),
        },
        (StepTarget::NodePool, _) => StepCall::PutPool {
            cluster_id: id,
            pool: spec.default_node_pool.name.clone(),
            body: serde_json::to_value(&spec.default_node_pool)?,
        },
        // Identity, key management, and cluster-level field changes all
        // patch the cluster document; deletes render as explicit nulls
        (_, _) => StepCall::PatchCluster {
            id,
            patch: render_patch(&step.changes),
        },
    })
}

/// The remote identifier: the assigned id once known, the name at creation
fn resource_identifier(working: &Value, spec: &ClusterSpec) -> String {
    working
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| spec.name.clone())
}

/// The observed pool name, for deletions (the desired name may differ)
fn observed_pool_name(step: &PlanStep, working: &Value, spec: &ClusterSpec) -> String {
    step.changes
        .iter()
        .find_map(|c| {
            c.old
                .as_ref()
                .and_then(|old| old.get("name"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .or_else(|| {
            working
                .pointer("/defaultNodePool/name")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| spec.default_node_pool.name.clone())
}

/// Render a step's changes as a patch document
fn render_patch(changes: &[crate::diff::Change]) -> Value {
    let mut patch = Value::Object(Map::new());
    for change in changes {
        let value = change.new.clone().unwrap_or(Value::Null);
        if change.path.is_empty() {
            deep_merge(&mut patch, &value);
        } else {
            set_path(&mut patch, &change.path, value);
        }
    }
    patch
}

/// Fold a confirmed step effect into the working document
fn apply_effect(working: &mut Value, effect: StepEffect) {
    match effect {
        StepEffect::MergeRoot(value) => {
            if working.is_null() {
                *working = value;
            } else {
                deep_merge(working, &value);
            }
        }
        StepEffect::MergePool(value) => {
            if working.is_null() {
                *working = Value::Object(Map::new());
            }
            set_path(working, "defaultNodePool", value);
        }
        StepEffect::RemoveRoot => {
            *working = Value::Null;
        }
        StepEffect::RemovePool => {
            if let Some(obj) = working.as_object_mut() {
                obj.remove("defaultNodePool");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::model::fixtures::sample_spec;
    use crate::model::registry::FieldRegistry;
    use crate::plan::{plan, DependencyRules, PlannerConfig};
    use crate::remote::{MockControlPlaneClient, OperationHandle};
    use crate::state::fixtures::sample_state;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// The remote document the control plane would hold after converging
    /// on `spec`
    fn remote_doc(spec: &ClusterSpec) -> Value {
        let mut doc = spec.to_remote_body().unwrap();
        doc["id"] = json!(format!("/clusters/{}", spec.name));
        doc["provisioningState"] = json!("Succeeded");
        doc["fqdn"] = json!(format!("{}.hcp.westeurope.example.io", spec.name));
        doc
    }

    fn plan_for(
        spec: &ClusterSpec,
        state: Option<&ResourceState>,
    ) -> OrderedPlan {
        let set = diff(spec, state, &FieldRegistry::for_cluster()).unwrap();
        plan(&set, &DependencyRules::default(), &PlannerConfig::default()).unwrap()
    }

    fn executor(client: MockControlPlaneClient) -> Executor<MockControlPlaneClient> {
        let config = ExecutorConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        };
        Executor::new(Arc::new(client), Arc::new(SnapshotStore::new()), config)
    }

    fn assert_no_errors(diagnostics: &[Diagnostic]) {
        assert!(
            diagnostics.iter().all(|d| !d.is_error()),
            "unexpected error diagnostics: {diagnostics:?}"
        );
    }

    #[tokio::test]
    async fn test_create_applies_synchronously() {
        let spec = sample_spec("acctestaks1");
        let doc = remote_doc(&spec);

        let mut client = MockControlPlaneClient::new();
        client
            .expect_put_cluster()
            .times(1)
            .returning(move |_, _| Ok(RemoteCall::Complete(doc.clone())));

        let executor = executor(client);
        let plan = plan_for(&spec, None);
        let (state, diagnostics) = executor
            .apply(&plan, &spec, None, &CancellationToken::new())
            .await;

        assert_no_errors(&diagnostics);
        let state = state.expect("state after create");
        assert_eq!(state.id.as_deref(), Some("/clusters/acctestaks1"));
        assert_eq!(state.provisioning_state.as_deref(), Some("Succeeded"));
        // The store saw the confirmed snapshot
        assert_eq!(executor.store.current().unwrap().id, state.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_operation_polls_to_success() {
        let spec = sample_spec("acctestaks1");
        let doc = remote_doc(&spec);

        let mut client = MockControlPlaneClient::new();
        client
            .expect_put_cluster()
            .times(1)
            .returning(|_, _| Ok(RemoteCall::Accepted(OperationHandle::new("op-1"))));
        let polls = Arc::new(AtomicU32::new(0));
        let polls_seen = polls.clone();
        client.expect_poll_operation().returning(move |handle| {
            assert_eq!(handle.id, "op-1");
            if polls_seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(OperationStatus::Running)
            } else {
                Ok(OperationStatus::Succeeded(Some(doc.clone())))
            }
        });

        let executor = executor(client);
        let plan = plan_for(&spec, None);
        let (state, diagnostics) = executor
            .apply(&plan, &spec, None, &CancellationToken::new())
            .await;

        assert_no_errors(&diagnostics);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(
            state.unwrap().fqdn.as_deref(),
            Some("acctestaks1.hcp.westeurope.example.io")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_deadline_preserves_last_confirmed_snapshot() {
        let mut spec = sample_spec("acctestaks1");
        spec.default_node_pool.node_count = 3;
        let prior = sample_state("acctestaks1");

        let mut client = MockControlPlaneClient::new();
        client
            .expect_put_agent_pool()
            .times(1)
            .returning(|_, _, _| Ok(RemoteCall::Accepted(OperationHandle::new("op-pool"))));
        // Never reaches a terminal status
        client
            .expect_poll_operation()
            .returning(|_| Ok(OperationStatus::Running));

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        let timeout = diagnostics
            .iter()
            .find(|d| d.is_error())
            .expect("timeout diagnostic");
        assert!(timeout.message.contains("timed out"));
        // No fabricated success: the state equals the last confirmed snapshot
        let state = state.expect("prior state preserved");
        assert_eq!(state.default_node_pool.unwrap().node_count, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let mut spec = sample_spec("acctestaks1");
        spec.run_command_enabled = false;
        let prior = sample_state("acctestaks1");
        let updated = {
            let mut doc = remote_doc(&spec);
            doc["runCommandEnabled"] = json!(false);
            doc
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let mut client = MockControlPlaneClient::new();
        client.expect_patch_cluster().returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("429 too many requests"))
            } else {
                Ok(RemoteCall::Complete(updated.clone()))
            }
        });

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        assert_no_errors(&diagnostics);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!state.unwrap().run_command_enabled);
    }

    #[tokio::test]
    async fn test_transient_failures_escalate_after_budget() {
        let mut spec = sample_spec("acctestaks1");
        spec.run_command_enabled = false;
        let prior = sample_state("acctestaks1");

        let mut client = MockControlPlaneClient::new();
        client
            .expect_patch_cluster()
            .times(3)
            .returning(|_, _| Err(Error::transient("connection reset")));

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        let failure = diagnostics
            .iter()
            .find(|d| d.is_error())
            .expect("escalated diagnostic");
        assert!(failure.message.contains("transient failure persisted"));
        // The cluster state is unchanged
        assert!(state.unwrap().run_command_enabled);
    }

    #[tokio::test]
    async fn test_failure_aborts_dependent_steps() {
        let mut spec = sample_spec("acctestaks1");
        spec.identity = crate::model::fixtures::user_assigned_identity();
        spec.key_management_service = Some(crate::model::KeyManagementSpec {
            key_vault_key_id: "/vaults/kv/keys/etcd-encryption".to_string(),
            key_vault_network_access: crate::model::KeyVaultNetworkAccess::Public,
        });
        let prior = sample_state("acctestaks1");

        let mut client = MockControlPlaneClient::new();
        // The identity patch fails; the dependent key-management patch
        // must never be issued
        client
            .expect_patch_cluster()
            .times(1)
            .withf(|_, patch| patch.get("identity").is_some())
            .returning(|_, _| {
                Err(Error::remote_failed("identity", "principal propagation failed"))
            });

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        assert!(diagnostics.iter().any(|d| d.is_error()));
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("aborted after failure")));
        // Partial convergence is observable: state equals the prior snapshot
        assert_eq!(state.unwrap().identity.tag(), "systemAssigned");
    }

    #[tokio::test]
    async fn test_independent_steps_both_apply() {
        let mut spec = sample_spec("acctestaks1");
        spec.run_command_enabled = false;
        spec.default_node_pool.node_count = 3;
        let prior = sample_state("acctestaks1");

        let cluster_doc = {
            let mut doc = remote_doc(&spec);
            doc["runCommandEnabled"] = json!(false);
            doc
        };
        let pool_doc = serde_json::to_value(&spec.default_node_pool).unwrap();

        let mut client = MockControlPlaneClient::new();
        client
            .expect_patch_cluster()
            .times(1)
            .returning(move |_, _| Ok(RemoteCall::Complete(cluster_doc.clone())));
        client
            .expect_put_agent_pool()
            .times(1)
            .withf(|id, pool, _| id == "/clusters/acctestaks1" && pool == "default")
            .returning(move |_, _, _| Ok(RemoteCall::Complete(pool_doc.clone())));

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        assert_no_errors(&diagnostics);
        let state = state.unwrap();
        assert!(!state.run_command_enabled);
        assert_eq!(state.default_node_pool.unwrap().node_count, 3);
    }

    #[tokio::test]
    async fn test_cancellation_issues_no_new_steps() {
        let mut spec = sample_spec("acctestaks1");
        spec.default_node_pool.node_count = 3;
        let prior = sample_state("acctestaks1");

        // A strict mock with no expectations: any remote call would panic
        let client = MockControlPlaneClient::new();
        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (state, diagnostics) = executor.apply(&plan, &spec, Some(&prior), &cancel).await;

        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("canceled")));
        // The state reflects exactly the confirmed steps: none
        assert_eq!(state.unwrap(), prior);
    }

    #[tokio::test]
    async fn test_confirmed_steps_are_not_reissued_after_later_failure() {
        let mut spec = sample_spec("acctestaks1");
        spec.default_node_pool.vm_size = "Standard_D2s_v3".to_string();
        let prior = sample_state("acctestaks1");

        let mut client = MockControlPlaneClient::new();
        // Replace expansion: delete succeeds exactly once, create fails
        client
            .expect_delete_agent_pool()
            .times(1)
            .returning(|_, _| Ok(RemoteCall::Complete(Value::Null)));
        client
            .expect_put_agent_pool()
            .times(1)
            .returning(|_, _, _| Err(Error::remote_failed("defaultNodePool", "capacity")));

        let executor = executor(client);
        let plan = plan_for(&spec, Some(&prior));
        let (state, diagnostics) = executor
            .apply(&plan, &spec, Some(&prior), &CancellationToken::new())
            .await;

        assert!(diagnostics.iter().any(|d| d.is_error()));
        // The confirmed delete is reflected, not rolled back
        assert!(state.unwrap().default_node_pool.is_none());
    }

    #[tokio::test]
    async fn test_succeeded_without_payload_rereads_target() {
        let spec = sample_spec("acctestaks1");
        let doc = remote_doc(&spec);

        let mut client = MockControlPlaneClient::new();
        client
            .expect_put_cluster()
            .returning(|_, _| Ok(RemoteCall::Accepted(OperationHandle::new("op-1"))));
        client
            .expect_poll_operation()
            .returning(|_| Ok(OperationStatus::Succeeded(None)));
        client
            .expect_get_cluster()
            .times(1)
            .returning(move |_| Ok(Some(doc.clone())));

        let executor = executor(client);
        let plan = plan_for(&spec, None);
        let (state, diagnostics) = executor
            .apply(&plan, &spec, None, &CancellationToken::new())
            .await;

        assert_no_errors(&diagnostics);
        assert_eq!(state.unwrap().id.as_deref(), Some("/clusters/acctestaks1"));
    }

    #[tokio::test]
    async fn test_remote_operation_failed_surfaces_remote_diagnostic() {
        let spec = sample_spec("acctestaks1");

        let mut client = MockControlPlaneClient::new();
        client
            .expect_put_cluster()
            .returning(|_, _| Ok(RemoteCall::Accepted(OperationHandle::new("op-1"))));
        client
            .expect_poll_operation()
            .returning(|_| Ok(OperationStatus::Failed("quota exceeded".to_string())));

        let executor = executor(client);
        let plan = plan_for(&spec, None);
        let (state, diagnostics) = executor
            .apply(&plan, &spec, None, &CancellationToken::new())
            .await;

        assert!(state.is_none());
        let failure = diagnostics.iter().find(|d| d.is_error()).unwrap();
        assert!(failure.message.contains("quota exceeded"));
    }
}
