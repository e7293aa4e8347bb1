//! Desired-state document for a managed Kubernetes cluster

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lodestone_common::Result;

use super::types::{
    default_true, IdentitySpec, KeyManagementSpec, NodePoolSpec, StorageProfileSpec,
    WorkloadAutoscalerProfileSpec,
};
use super::ValidationResult;

/// Allowed range for the image cleaner interval, in hours
const IMAGE_CLEANER_INTERVAL_RANGE: std::ops::RangeInclusive<u32> = 24..=2160;

/// Desired state of one managed Kubernetes cluster
///
/// Owned exclusively by the caller supplying configuration; the engine
/// never mutates it. Cross-field invariants are checked by [`validate`],
/// before any remote call is issued.
///
/// [`validate`]: ClusterSpec::validate
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name (also the creation-time remote identifier)
    pub name: String,

    /// Region hosting the control plane
    pub location: String,

    /// Resource group owning the cluster resource
    pub resource_group: String,

    /// DNS prefix for the API server endpoint
    pub dns_prefix: String,

    /// Control-plane Kubernetes version; the platform default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Resource group for cluster infrastructure (nodes, disks, IPs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_resource_group: Option<String>,

    /// Edge zone hosting the cluster instead of the main region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_zone: Option<String>,

    /// Allow the remote run-command facility on this cluster
    #[serde(default = "default_true")]
    pub run_command_enabled: bool,

    /// Enable periodic cleanup of unused images on nodes
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub image_cleaner_enabled: bool,

    /// Image cleaner run interval in hours; only valid with the cleaner enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_cleaner_interval_hours: Option<u32>,

    /// Free-form resource tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Control-plane identity
    #[serde(default)]
    pub identity: IdentitySpec,

    /// The default node pool
    pub default_node_pool: NodePoolSpec,

    /// Key-management settings; requires a user-assigned identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_management_service: Option<KeyManagementSpec>,

    /// Workload autoscaler toggles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_autoscaler_profile: Option<WorkloadAutoscalerProfileSpec>,

    /// Storage driver toggles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<StorageProfileSpec>,
}

impl ClusterSpec {
    /// Validate the document, collecting every violation with its field path
    ///
    /// Checks field-level constraints (ranges, formats), mutual exclusivity,
    /// and cross-field dependencies. Side-effect-free; callers must not
    /// apply a document that fails validation.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.name.is_empty() {
            result.push("name", "cannot be empty");
        }
        if self.location.is_empty() {
            result.push("location", "cannot be empty");
        }
        if self.resource_group.is_empty() {
            result.push("resourceGroup", "cannot be empty");
        }
        if self.dns_prefix.is_empty() {
            result.push("dnsPrefix", "cannot be empty");
        }

        if let Some(hours) = self.image_cleaner_interval_hours {
            if !self.image_cleaner_enabled {
                result.push(
                    "imageCleanerIntervalHours",
                    "cannot be set while the image cleaner is disabled",
                );
            }
            if !IMAGE_CLEANER_INTERVAL_RANGE.contains(&hours) {
                result.push(
                    "imageCleanerIntervalHours",
                    format!(
                        "must be between {} and {}",
                        IMAGE_CLEANER_INTERVAL_RANGE.start(),
                        IMAGE_CLEANER_INTERVAL_RANGE.end()
                    ),
                );
            }
        }

        if let IdentitySpec::UserAssigned { identity_ids } = &self.identity {
            if identity_ids.is_empty() {
                result.push(
                    "identity.identityIds",
                    "a user-assigned identity requires at least one identity id",
                );
            }
        }

        if self.key_management_service.is_some() && !self.identity.is_user_assigned() {
            result.push(
                "keyManagementService",
                "requires a user-assigned identity with access to the key vault key",
            );
        }

        self.validate_node_pool(&mut result);

        if let Some(storage) = &self.storage_profile {
            if storage.disk_driver_version != "v1" && storage.disk_driver_version != "v2" {
                result.push(
                    "storageProfile.diskDriverVersion",
                    format!(
                        "invalid disk driver version: {}, expected one of: v1, v2",
                        storage.disk_driver_version
                    ),
                );
            }
        }

        result
    }

    fn validate_node_pool(&self, result: &mut ValidationResult) {
        let pool = &self.default_node_pool;

        if !valid_pool_name(&pool.name) {
            result.push(
                "defaultNodePool.name",
                "must be 1-12 lowercase alphanumeric characters starting with a letter",
            );
        }
        if pool.node_count < 1 {
            result.push("defaultNodePool.nodeCount", "must be at least 1");
        }
        if pool.vm_size.is_empty() {
            result.push("defaultNodePool.vmSize", "cannot be empty");
        }
        // Dedicated-host placement needs an identity the caller can grant
        // host-group access to
        if pool.host_group_id.is_some() && !self.identity.is_user_assigned() {
            result.push(
                "defaultNodePool.hostGroupId",
                "dedicated host placement requires a user-assigned identity",
            );
        }
    }

    /// Serialize the full desired state as the remote creation body
    pub fn to_remote_body(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn valid_pool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 12
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}
