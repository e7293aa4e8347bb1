//! Supporting types for the managed cluster specification

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Control-plane identity for the managed cluster
///
/// Modeled as a tagged union: each variant carries only the fields valid
/// for that tag. Transitions between tags are in-place-convertible for this
/// block (the control plane migrates identities without recreating the
/// cluster); tagged unions elsewhere default to replace-class transitions.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IdentitySpec {
    /// Identity created and owned by the platform
    SystemAssigned,
    /// Caller-supplied identities attached to the control plane
    #[serde(rename_all = "camelCase")]
    UserAssigned {
        /// Resource identifiers of the user-assigned identities
        identity_ids: Vec<String>,
    },
}

impl Default for IdentitySpec {
    fn default() -> Self {
        Self::SystemAssigned
    }
}

impl IdentitySpec {
    /// Returns true for a user-assigned identity
    pub fn is_user_assigned(&self) -> bool {
        matches!(self, Self::UserAssigned { .. })
    }

    /// The serialized tag value for this variant
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SystemAssigned => "systemAssigned",
            Self::UserAssigned { .. } => "userAssigned",
        }
    }
}

/// The default node pool backing the cluster's system workloads
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Pool name: 1-12 lowercase alphanumeric characters, starting with a letter
    pub name: String,

    /// Desired node count
    pub node_count: u32,

    /// VM size for the pool's nodes (e.g., "Standard_DS2_v2")
    pub vm_size: String,

    /// Encrypt node disks and temp storage on the host
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_host_encryption: bool,

    /// Dedicated host group to place the pool's nodes on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group_id: Option<String>,

    /// Settings applied during pool upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_settings: Option<UpgradeSettingsSpec>,
}

/// Upgrade behavior for a node pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSettingsSpec {
    /// Extra nodes allowed during an upgrade, as a count or percentage (e.g., "10%")
    pub max_surge: String,
}

/// Key-management settings encrypting control-plane secrets with a
/// caller-owned key vault key
///
/// Requires a user-assigned identity so the control plane can reach the key.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyManagementSpec {
    /// Identifier of the key vault key used for encryption
    pub key_vault_key_id: String,

    /// Network reachability of the key vault
    #[serde(default)]
    pub key_vault_network_access: KeyVaultNetworkAccess,
}

/// Network reachability of the key vault backing key management
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum KeyVaultNetworkAccess {
    /// Key vault reachable over public endpoints
    #[default]
    Public,
    /// Key vault reachable only over a private endpoint
    Private,
}

/// Workload autoscaler components toggled on the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAutoscalerProfileSpec {
    /// Enable the KEDA event-driven autoscaler
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keda_enabled: bool,

    /// Enable the vertical pod autoscaler
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub vertical_pod_autoscaler_enabled: bool,
}

/// Storage drivers and controllers provisioned on the cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfileSpec {
    /// Enable the blob CSI driver
    #[serde(default)]
    pub blob_driver_enabled: bool,

    /// Enable the disk CSI driver
    #[serde(default = "default_true")]
    pub disk_driver_enabled: bool,

    /// Disk CSI driver version: "v1" or "v2"
    #[serde(default = "default_disk_driver_version")]
    pub disk_driver_version: String,

    /// Enable the file CSI driver
    #[serde(default = "default_true")]
    pub file_driver_enabled: bool,

    /// Enable the volume snapshot controller
    #[serde(default = "default_true")]
    pub snapshot_controller_enabled: bool,
}

impl Default for StorageProfileSpec {
    fn default() -> Self {
        Self {
            blob_driver_enabled: false,
            disk_driver_enabled: true,
            disk_driver_version: default_disk_driver_version(),
            file_driver_enabled: true,
            snapshot_controller_enabled: true,
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}

fn default_disk_driver_version() -> String {
    "v1".to_string()
}
