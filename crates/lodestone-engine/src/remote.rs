//! Remote control-plane boundary
//!
//! Provides a trait-based abstraction over the managed-cluster API,
//! allowing tests to mock remote interactions while production code uses a
//! real transport. Every mutating call either completes synchronously or
//! hands back an operation handle to poll.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use lodestone_common::Error;

use crate::model::registry::StepTarget;

/// Handle to an asynchronous remote mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationHandle {
    /// Remote operation identifier
    pub id: String,
}

impl OperationHandle {
    /// Create a handle from a remote operation identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Outcome of a mutating remote call
#[derive(Clone, Debug)]
pub enum RemoteCall {
    /// The call completed synchronously; the payload is the committed
    /// remote document for the target (null for deletions)
    Complete(Value),
    /// The call was accepted; poll the handle until a terminal status
    Accepted(OperationHandle),
}

/// Status of a polled remote operation
#[derive(Clone, Debug)]
pub enum OperationStatus {
    /// Still in flight
    Running,
    /// Terminal success, with the resulting document when the API returns one
    Succeeded(Option<Value>),
    /// Terminal failure, with the remote diagnostic
    Failed(String),
    /// Terminal cancellation on the remote side
    Canceled,
}

/// An in-flight asynchronous remote operation
///
/// Created when the executor issues a mutating call the remote API accepts
/// but has not yet completed; destroyed on reaching a terminal status or
/// on deadline expiry.
#[derive(Clone, Debug)]
pub struct PendingOperation {
    /// Handle to poll
    pub handle: OperationHandle,
    /// Sub-resource target the operation mutates
    pub target: StepTarget,
    /// Interval between polls
    pub poll_interval: Duration,
    /// Total time the operation may stay non-terminal
    pub deadline: Duration,
}

impl PendingOperation {
    /// Register a pending operation for a just-accepted call
    pub fn new(
        handle: OperationHandle,
        target: StepTarget,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            handle,
            target,
            poll_interval,
            deadline,
        }
    }
}

/// Trait abstracting the remote managed-cluster API
///
/// This is the engine's only outbound surface. Transport, authentication,
/// and request signing belong to the implementation; the engine receives
/// the capability by injection at construction time, so apply/refresh
/// calls stay independently testable and parallelizable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Create or fully update the managed cluster resource
    async fn put_cluster(&self, name: &str, body: &Value) -> Result<RemoteCall, Error>;

    /// Patch a subset of mutable cluster properties
    async fn patch_cluster(&self, id: &str, patch: &Value) -> Result<RemoteCall, Error>;

    /// Fetch the cluster document; `Ok(None)` when the identifier no
    /// longer resolves
    async fn get_cluster(&self, id: &str) -> Result<Option<Value>, Error>;

    /// Delete the managed cluster resource
    async fn delete_cluster(&self, id: &str) -> Result<RemoteCall, Error>;

    /// Create or fully update an agent pool under the cluster
    async fn put_agent_pool(
        &self,
        cluster_id: &str,
        pool_name: &str,
        body: &Value,
    ) -> Result<RemoteCall, Error>;

    /// Fetch an agent pool document; `Ok(None)` when it does not exist
    async fn get_agent_pool(
        &self,
        cluster_id: &str,
        pool_name: &str,
    ) -> Result<Option<Value>, Error>;

    /// Delete an agent pool under the cluster
    async fn delete_agent_pool(&self, cluster_id: &str, pool_name: &str)
        -> Result<RemoteCall, Error>;

    /// Poll an operation previously returned by a mutating call
    async fn poll_operation(&self, handle: &OperationHandle) -> Result<OperationStatus, Error>;
}
