//! Engine facade: validate, apply, refresh
//!
//! The engine is a library invoked by a host that owns configuration
//! parsing and diagnostics rendering. The remote client capability is
//! injected at construction time — no hidden singletons — so apply and
//! refresh calls are independently testable and parallelizable.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lodestone_common::retry::RetryConfig;
use lodestone_common::{
    Result, DEFAULT_MAX_CONCURRENCY, DEFAULT_OPERATION_DEADLINE_SECS, DEFAULT_POLL_INTERVAL_SECS,
};

use crate::diff::diff;
use crate::executor::{Diagnostic, Executor, ExecutorConfig};
use crate::model::registry::FieldRegistry;
use crate::model::{ClusterSpec, ValidationResult};
use crate::plan::{plan, DependencyRules, PlannerConfig};
use crate::refresh::DriftDetector;
use crate::remote::ControlPlaneClient;
use crate::state::{ResourceState, SnapshotStore};

/// Engine tuning and policy
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interval between polls of a pending operation
    pub poll_interval: Duration,
    /// Deadline for a pending operation to reach a terminal status
    pub operation_deadline: Duration,
    /// Backoff configuration for transient remote failures
    pub retry: RetryConfig,
    /// Maximum plan steps in flight at once
    pub max_concurrency: usize,
    /// Ordering constraints between sub-resource targets
    pub dependency_rules: DependencyRules,
    /// Per-target planner policies (replace ordering)
    pub planner: PlannerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            operation_deadline: Duration::from_secs(DEFAULT_OPERATION_DEADLINE_SECS),
            retry: RetryConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dependency_rules: DependencyRules::default(),
            planner: PlannerConfig::default(),
        }
    }
}

/// Result of an apply invocation
///
/// The caller always receives the best-known state alongside any
/// diagnostics, so partial convergence is observable and resumable by
/// re-invoking apply with the same desired spec.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    /// Best-known remote state after the apply; `None` when nothing exists
    pub state: Option<ResourceState>,
    /// What happened, step by step, when anything went off the happy path
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyOutcome {
    /// True when every planned step reached terminal success
    pub fn converged(&self) -> bool {
        !self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// Declarative convergence engine for one managed cluster resource
pub struct Engine<C> {
    client: Arc<C>,
    store: Arc<SnapshotStore>,
    registry: FieldRegistry,
    config: EngineConfig,
}

impl<C: ControlPlaneClient> Engine<C> {
    /// Create an engine with default configuration
    pub fn new(client: Arc<C>) -> Self {
        Self::with_config(client, EngineConfig::default())
    }

    /// Create an engine with explicit configuration
    pub fn with_config(client: Arc<C>, config: EngineConfig) -> Self {
        Self {
            client,
            store: Arc::new(SnapshotStore::new()),
            registry: FieldRegistry::for_cluster(),
            config,
        }
    }

    /// Validate a desired-state document, collecting every violation
    pub fn validate(&self, spec: &ClusterSpec) -> ValidationResult {
        spec.validate()
    }

    /// Converge the remote resource toward `spec`
    ///
    /// Validation and planning failures return `Err` before any remote
    /// call is issued (no side effects). Execution failures abort only the
    /// remaining plan and surface as diagnostics on the outcome, alongside
    /// the state converged so far.
    pub async fn apply(
        &self,
        spec: &ClusterSpec,
        prior: Option<ResourceState>,
    ) -> Result<ApplyOutcome> {
        self.apply_with_cancel(spec, prior, CancellationToken::new())
            .await
    }

    /// [`apply`](Engine::apply) with caller-controlled cancellation
    ///
    /// Cancellation stops issuing new steps; already-dispatched operations
    /// resolve first so the remote resource is never left mid-mutation.
    pub async fn apply_with_cancel(
        &self,
        spec: &ClusterSpec,
        prior: Option<ResourceState>,
        cancel: CancellationToken,
    ) -> Result<ApplyOutcome> {
        self.validate(spec).ok()?;

        let change_set = diff(spec, prior.as_ref(), &self.registry)?;
        if change_set.is_empty() {
            debug!(cluster = %spec.name, "already converged; no remote calls");
            return Ok(ApplyOutcome {
                state: prior,
                diagnostics: Vec::new(),
            });
        }

        let ordered = plan(
            &change_set,
            &self.config.dependency_rules,
            &self.config.planner,
        )?;
        info!(
            cluster = %spec.name,
            changes = change_set.len(),
            steps = ordered.len(),
            "applying ordered plan"
        );

        let executor = Executor::new(
            self.client.clone(),
            self.store.clone(),
            ExecutorConfig {
                poll_interval: self.config.poll_interval,
                operation_deadline: self.config.operation_deadline,
                retry: self.config.retry.clone(),
                max_concurrency: self.config.max_concurrency,
            },
        );
        let (state, diagnostics) = executor
            .apply(&ordered, spec, prior.as_ref(), &cancel)
            .await;

        Ok(ApplyOutcome { state, diagnostics })
    }

    /// Re-read remote state for drift detection
    ///
    /// `prior` supplies fields the remote API does not round-trip. Fails
    /// with `ResourceNotFound` when the identifier no longer resolves.
    pub async fn refresh(
        &self,
        resource_id: &str,
        prior: Option<&ResourceState>,
    ) -> Result<ResourceState> {
        DriftDetector::new(self.client.clone())
            .refresh(resource_id, prior)
            .await
    }

    /// The last committed snapshot (readers never see in-flight state)
    pub fn snapshot(&self) -> Option<ResourceState> {
        self.store.current()
    }
}
