//! Field registry: diff metadata for the configurable surface
//!
//! The registry is what makes the diff engine schema-generic. Every
//! diffable leaf declares its mutability class (in-place vs replace), the
//! remote sub-resource that owns it, and the default it reverts to when
//! removed from the desired state. Optional sub-resource blocks declare
//! themselves separately so removal classifies as a delete rather than a
//! field revert.

use serde_json::{json, Value};

/// Remote sub-resource that owns a field and receives its changes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepTarget {
    /// The managed cluster resource itself
    Cluster,
    /// The control-plane identity block
    Identity,
    /// The key-management block
    KeyManagement,
    /// The default node pool (a separately addressable agent pool remotely)
    NodePool,
}

impl StepTarget {
    /// The document subtree owned by this target; `None` for the root
    pub fn block_path(&self) -> Option<&'static str> {
        match self {
            Self::Cluster => None,
            Self::Identity => Some("identity"),
            Self::KeyManagement => Some("keyManagementService"),
            Self::NodePool => Some("defaultNodePool"),
        }
    }
}

impl std::fmt::Display for StepTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Identity => write!(f, "identity"),
            Self::KeyManagement => write!(f, "keyManagementService"),
            Self::NodePool => write!(f, "defaultNodePool"),
        }
    }
}

/// How a field change can be applied remotely
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutability {
    /// Mutable through an update call on the live resource
    InPlace,
    /// Immutable remotely; changing it requires destroy-recreate
    RequiresReplace,
}

/// Distinguishes plain leaves from tagged-union discriminators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafKind {
    /// An ordinary value field
    Plain,
    /// The tag of a tagged-union block; a tag change swaps the whole block
    Tag {
        /// Whether the transition is applicable in place. Non-convertible
        /// tag transitions classify as replace.
        convertible: bool,
    },
}

/// Diff metadata for one leaf field
#[derive(Clone, Debug)]
pub struct FieldMeta {
    /// Dotted path of the leaf in the serialized document
    pub path: &'static str,
    /// Mutability class of the field
    pub mutability: Mutability,
    /// Sub-resource target owning the field
    pub target: StepTarget,
    /// Value the field reverts to when removed from the desired state;
    /// `None` means the field is simply unset remotely
    pub default: Option<Value>,
    /// Plain leaf or tagged-union discriminator
    pub kind: LeafKind,
}

/// Diff metadata for an optional sub-resource block
///
/// Removing the whole block from the desired state is a delete-class
/// change on the block's target, not a per-field revert.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    /// Dotted path of the block in the serialized document
    pub path: &'static str,
    /// Sub-resource target owning the block
    pub target: StepTarget,
}

/// The full diff metadata for one resource schema
#[derive(Clone, Debug)]
pub struct FieldRegistry {
    /// Every diffable leaf
    pub leaves: Vec<FieldMeta>,
    /// Optional sub-resource blocks (delete-class on removal)
    pub blocks: Vec<BlockMeta>,
}

impl FieldRegistry {
    /// Registry for the managed cluster schema
    pub fn for_cluster() -> Self {
        use LeafKind::{Plain, Tag};
        use Mutability::{InPlace, RequiresReplace};
        use StepTarget::{Cluster, Identity, KeyManagement, NodePool};

        let leaf = |path, mutability, target, default: Option<Value>| FieldMeta {
            path,
            mutability,
            target,
            default,
            kind: Plain,
        };

        let leaves = vec![
            leaf("name", RequiresReplace, Cluster, None),
            leaf("location", RequiresReplace, Cluster, None),
            leaf("resourceGroup", RequiresReplace, Cluster, None),
            leaf("dnsPrefix", RequiresReplace, Cluster, None),
            leaf("nodeResourceGroup", RequiresReplace, Cluster, None),
            leaf("edgeZone", RequiresReplace, Cluster, None),
            leaf("kubernetesVersion", InPlace, Cluster, None),
            leaf("runCommandEnabled", InPlace, Cluster, Some(json!(true))),
            leaf("imageCleanerEnabled", InPlace, Cluster, Some(json!(false))),
            leaf(
                "imageCleanerIntervalHours",
                InPlace,
                Cluster,
                Some(json!(48)),
            ),
            leaf("tags", InPlace, Cluster, Some(json!({}))),
            FieldMeta {
                path: "identity.type",
                mutability: InPlace,
                target: Identity,
                default: None,
                // The control plane migrates identities without recreate
                kind: Tag { convertible: true },
            },
            leaf("identity.identityIds", InPlace, Identity, Some(json!([]))),
            leaf("defaultNodePool.name", RequiresReplace, NodePool, None),
            leaf("defaultNodePool.nodeCount", InPlace, NodePool, None),
            leaf("defaultNodePool.vmSize", RequiresReplace, NodePool, None),
            leaf(
                "defaultNodePool.enableHostEncryption",
                RequiresReplace,
                NodePool,
                Some(json!(false)),
            ),
            leaf(
                "defaultNodePool.hostGroupId",
                RequiresReplace,
                NodePool,
                None,
            ),
            leaf(
                "defaultNodePool.upgradeSettings.maxSurge",
                InPlace,
                NodePool,
                None,
            ),
            leaf(
                "keyManagementService.keyVaultKeyId",
                InPlace,
                KeyManagement,
                None,
            ),
            leaf(
                "keyManagementService.keyVaultNetworkAccess",
                InPlace,
                KeyManagement,
                Some(json!("Public")),
            ),
            leaf(
                "workloadAutoscalerProfile.kedaEnabled",
                InPlace,
                Cluster,
                Some(json!(false)),
            ),
            leaf(
                "workloadAutoscalerProfile.verticalPodAutoscalerEnabled",
                InPlace,
                Cluster,
                Some(json!(false)),
            ),
            leaf(
                "storageProfile.blobDriverEnabled",
                InPlace,
                Cluster,
                Some(json!(false)),
            ),
            leaf(
                "storageProfile.diskDriverEnabled",
                InPlace,
                Cluster,
                Some(json!(true)),
            ),
            leaf(
                "storageProfile.diskDriverVersion",
                InPlace,
                Cluster,
                Some(json!("v1")),
            ),
            leaf(
                "storageProfile.fileDriverEnabled",
                InPlace,
                Cluster,
                Some(json!(true)),
            ),
            leaf(
                "storageProfile.snapshotControllerEnabled",
                InPlace,
                Cluster,
                Some(json!(true)),
            ),
        ];

        let blocks = vec![
            BlockMeta {
                path: "keyManagementService",
                target: KeyManagement,
            },
            // Required in the spec, but a pool replacement leaves the
            // observed state without it between destroy and recreate; the
            // whole block then diffs as a single create
            BlockMeta {
                path: "defaultNodePool",
                target: NodePool,
            },
        ];

        Self { leaves, blocks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_registry_paths_are_unique() {
        let registry = FieldRegistry::for_cluster();
        let mut paths: Vec<_> = registry.leaves.iter().map(|l| l.path).collect();
        let before = paths.len();
        paths.sort_unstable();
        paths.dedup();
        assert_eq!(paths.len(), before);
    }

    #[test]
    fn test_identity_tag_is_convertible() {
        let registry = FieldRegistry::for_cluster();
        let tag = registry
            .leaves
            .iter()
            .find(|l| l.path == "identity.type")
            .expect("identity tag registered");
        assert_eq!(tag.kind, LeafKind::Tag { convertible: true });
        assert_eq!(tag.target, StepTarget::Identity);
    }

    #[test]
    fn test_replace_class_fields() {
        let registry = FieldRegistry::for_cluster();
        for path in ["dnsPrefix", "edgeZone", "defaultNodePool.hostGroupId"] {
            let meta = registry
                .leaves
                .iter()
                .find(|l| l.path == path)
                .unwrap_or_else(|| panic!("{path} registered"));
            assert_eq!(meta.mutability, Mutability::RequiresReplace, "{path}");
        }
    }

    #[test]
    fn test_target_block_paths() {
        assert_eq!(StepTarget::Cluster.block_path(), None);
        assert_eq!(StepTarget::Identity.block_path(), Some("identity"));
        assert_eq!(
            StepTarget::KeyManagement.block_path(),
            Some("keyManagementService")
        );
        assert_eq!(StepTarget::NodePool.block_path(), Some("defaultNodePool"));
    }
}
