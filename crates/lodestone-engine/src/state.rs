//! Last-observed remote state and the snapshot store
//!
//! [`ResourceState`] is structurally isomorphic to the desired-state
//! document plus read-only computed fields assigned by the control plane.
//! It is created on first successful apply and mutated only by the
//! executor after a confirmed remote response, never speculatively.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lodestone_common::{Error, Result};

use crate::model::{
    IdentitySpec, KeyManagementSpec, NodePoolSpec, StorageProfileSpec,
    WorkloadAutoscalerProfileSpec,
};

/// Version tag of the persisted state document layout
pub const STATE_DOCUMENT_VERSION: u32 = 1;

fn default_true() -> bool {
    true
}

/// Last-observed remote state of a managed cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    /// Remote identifier assigned on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Cluster name
    pub name: String,

    /// Region hosting the control plane
    pub location: String,

    /// Resource group owning the cluster resource
    pub resource_group: String,

    /// DNS prefix for the API server endpoint
    pub dns_prefix: String,

    /// Observed control-plane Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Resource group for cluster infrastructure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resource_group: Option<String>,

    /// Edge zone hosting the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_zone: Option<String>,

    /// Whether the remote run-command facility is allowed
    #[serde(default = "default_true")]
    pub run_command_enabled: bool,

    /// Whether periodic image cleanup is enabled
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub image_cleaner_enabled: bool,

    /// Image cleaner run interval in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_cleaner_interval_hours: Option<u32>,

    /// Observed resource tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Observed control-plane identity
    #[serde(default)]
    pub identity: IdentitySpec,

    /// Observed default node pool. Transiently absent while a pool
    /// replacement is between destroy and recreate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_node_pool: Option<NodePoolSpec>,

    /// Observed key-management settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_management_service: Option<KeyManagementSpec>,

    /// Observed workload autoscaler toggles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_autoscaler_profile: Option<WorkloadAutoscalerProfileSpec>,

    /// Observed storage driver toggles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<StorageProfileSpec>,

    // -- computed, read-only fields assigned by the control plane --
    /// Generated API server endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,

    /// Remote provisioning status (e.g., "Succeeded")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,

    /// Generated cluster access credentials. Write-only on the remote API:
    /// a refresh that does not round-trip it preserves the last known value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,

    /// When this snapshot was last confirmed against the remote API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Persisted envelope for [`ResourceState`]
#[derive(Debug, Deserialize, Serialize)]
struct StateDocument {
    version: u32,
    state: ResourceState,
}

impl ResourceState {
    /// Build a state snapshot from a remote resource document
    pub fn from_value(payload: Value) -> Result<Self> {
        serde_json::from_value(payload).map_err(|e| {
            Error::serialization(format!("remote document does not map to resource state: {e}"))
        })
    }

    /// Carry write-only fields forward from the prior snapshot
    ///
    /// The remote API does not round-trip generated credential material;
    /// clearing it on refresh would lose data the caller cannot recover.
    pub fn preserve_write_only(&mut self, prior: Option<&ResourceState>) {
        if self.kube_config.is_none() {
            if let Some(prior) = prior {
                self.kube_config = prior.kube_config.clone();
            }
        }
    }

    /// Serialize to the stable, versioned persistence layout
    pub fn to_document(&self) -> Result<String> {
        let doc = StateDocument {
            version: STATE_DOCUMENT_VERSION,
            state: self.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Reload from the versioned persistence layout
    ///
    /// Rejects unknown layout versions rather than reinterpreting them,
    /// so drift-detection fidelity survives process restarts.
    pub fn from_document(doc: &str) -> Result<Self> {
        let doc: StateDocument = serde_json::from_str(doc)?;
        if doc.version != STATE_DOCUMENT_VERSION {
            return Err(Error::serialization(format!(
                "unsupported state document version {} (expected {})",
                doc.version, STATE_DOCUMENT_VERSION
            )));
        }
        Ok(doc.state)
    }
}

/// In-memory store of the last committed state snapshot
///
/// Single-writer discipline: only the executor commits, and only after a
/// confirmed remote response. Concurrent readers observe committed
/// snapshots only, never in-flight partial state.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: RwLock<Option<ResourceState>>,
}

impl SnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a confirmed snapshot, replacing the previous one
    pub fn commit(&self, state: ResourceState) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(state);
    }

    /// Drop the committed snapshot (resource deleted remotely)
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// The last committed snapshot, if any
    pub fn current(&self) -> Option<ResourceState> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
