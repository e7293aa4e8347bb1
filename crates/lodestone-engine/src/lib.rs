//! Lodestone: declarative convergence engine for managed Kubernetes
//! cluster resources
//!
//! Turns a structured desired-state document — a managed cluster and its
//! nested sub-resources (node pool, identity, autoscaler profile, storage
//! profile, key management, run-command toggle, edge-zone placement) —
//! into a sequence of idempotent remote API calls, with long-running
//! operation polling, bounded retry of transient failures, partial-failure
//! preservation, and drift detection on refresh.
//!
//! Control flow: desired configuration → schema model → diff engine
//! (against the last snapshot) → operation planner → remote convergence
//! executor → updated snapshot → drift detector on the next refresh.

#![deny(missing_docs)]

mod doc;

/// Diff engine: minimal typed changes between desired and observed state
pub mod diff;
/// Engine facade: validate, apply, refresh
pub mod engine;
/// Remote convergence executor
pub mod executor;
/// Schema model and field registry
pub mod model;
/// Operation planner
pub mod plan;
/// Drift detector
pub mod refresh;
/// Remote control-plane boundary
pub mod remote;
/// State snapshots and the snapshot store
pub mod state;

pub use engine::{ApplyOutcome, Engine, EngineConfig};
pub use executor::{Diagnostic, Severity};
pub use lodestone_common::{Error, Result};
pub use model::{ClusterSpec, ValidationResult};
pub use state::ResourceState;
