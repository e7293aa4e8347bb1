//! Diff engine: minimal typed changes between desired and observed state
//!
//! The diff walks the schema's field registry rather than concrete struct
//! fields, classifying each difference by the registered mutability. The
//! output is minimal: converged fields produce nothing, and a snapshot pair
//! differing in one leaf yields exactly one change.

use serde_json::Value;
use tracing::debug;

use lodestone_common::Result;

use crate::doc::get_path;
use crate::model::registry::{FieldRegistry, LeafKind, Mutability, StepTarget};
use crate::model::ClusterSpec;
use crate::state::ResourceState;

/// Classification of a single change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The target does not exist remotely and will be created
    Create,
    /// The field is mutable on the live resource
    UpdateInPlace,
    /// The change requires destroying and recreating the target
    Replace,
    /// The optional sub-resource was removed from the desired state
    Delete,
    /// The field is unchanged. Never materialized in a [`ChangeSet`];
    /// retained so callers can label full field classifications.
    NoOp,
}

/// One typed difference between desired and observed state
#[derive(Clone, Debug)]
pub struct Change {
    /// Dotted path of the changed field or block; empty for the whole resource
    pub path: String,
    /// Classification of the change
    pub kind: ChangeKind,
    /// Sub-resource target that receives the change
    pub target: StepTarget,
    /// Observed value being changed away from
    pub old: Option<Value>,
    /// Desired value; `None` unsets the field remotely
    pub new: Option<Value>,
}

/// Ordered sequence of typed changes between one spec and one snapshot
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    /// The changes, in registry declaration order
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// True when desired and observed state are already converged
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterate the changes in order
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }
}

/// Compute the minimal change set driving `state` toward `spec`
///
/// With no prior state the whole resource is one create-class change.
/// Otherwise each registered leaf is classified independently; a
/// replace-class change absorbs every other change on the same target
/// (and a cluster-level replace absorbs the entire set), so dependent
/// fields are re-evaluated against the recreated parent rather than
/// applied against a stale one.
pub fn diff(
    spec: &ClusterSpec,
    state: Option<&ResourceState>,
    registry: &FieldRegistry,
) -> Result<ChangeSet> {
    let Some(state) = state else {
        return Ok(ChangeSet {
            changes: vec![Change {
                path: String::new(),
                kind: ChangeKind::Create,
                target: StepTarget::Cluster,
                old: None,
                new: Some(spec.to_remote_body()?),
            }],
        });
    };

    let spec_v = spec.to_remote_body()?;
    let state_v = serde_json::to_value(state)?;

    let mut changes = Vec::new();
    // Subtrees already covered by a whole-block change; their leaves are skipped
    let mut handled: Vec<String> = Vec::new();

    // Optional sub-resource blocks: removal deletes, introduction creates
    for block in &registry.blocks {
        let desired = get_path(&spec_v, block.path);
        let observed = get_path(&state_v, block.path);
        match (desired, observed) {
            (None, Some(observed)) => {
                changes.push(Change {
                    path: block.path.to_string(),
                    kind: ChangeKind::Delete,
                    target: block.target,
                    old: Some(observed.clone()),
                    new: None,
                });
                handled.push(block.path.to_string());
            }
            (Some(desired), None) => {
                changes.push(Change {
                    path: block.path.to_string(),
                    kind: ChangeKind::Create,
                    target: block.target,
                    old: None,
                    new: Some(desired.clone()),
                });
                handled.push(block.path.to_string());
            }
            _ => {}
        }
    }

    // Tagged-union discriminators: a tag change swaps the whole block
    for leaf in &registry.leaves {
        let LeafKind::Tag { convertible } = leaf.kind else {
            continue;
        };
        let Some((block_path, _)) = leaf.path.rsplit_once('.') else {
            continue;
        };
        if is_handled(&handled, leaf.path) {
            continue;
        }
        let desired_tag = get_path(&spec_v, leaf.path);
        let observed_tag = get_path(&state_v, leaf.path);
        if desired_tag == observed_tag {
            continue;
        }
        changes.push(Change {
            path: block_path.to_string(),
            kind: if convertible {
                ChangeKind::UpdateInPlace
            } else {
                ChangeKind::Replace
            },
            target: leaf.target,
            old: get_path(&state_v, block_path).cloned(),
            new: get_path(&spec_v, block_path).cloned(),
        });
        handled.push(block_path.to_string());
    }

    // Plain leaves
    for leaf in &registry.leaves {
        if leaf.kind != LeafKind::Plain || is_handled(&handled, leaf.path) {
            continue;
        }
        let desired = get_path(&spec_v, leaf.path);
        let observed = get_path(&state_v, leaf.path);
        let kind = match leaf.mutability {
            Mutability::InPlace => ChangeKind::UpdateInPlace,
            Mutability::RequiresReplace => ChangeKind::Replace,
        };
        match (desired, observed) {
            (None, None) => {}
            (Some(d), o) if Some(d) != o => {
                changes.push(Change {
                    path: leaf.path.to_string(),
                    kind,
                    target: leaf.target,
                    old: o.cloned(),
                    new: Some(d.clone()),
                });
            }
            (None, Some(o)) => {
                // Removed from the desired state: revert to the declared
                // default, or unset when the field has none
                if leaf.default.as_ref() != Some(o) {
                    changes.push(Change {
                        path: leaf.path.to_string(),
                        kind,
                        target: leaf.target,
                        old: Some(o.clone()),
                        new: leaf.default.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    let changes = absorb_replaces(changes, spec, &spec_v, &state_v)?;

    debug!(changes = changes.len(), "computed change set");
    Ok(ChangeSet { changes })
}

fn is_handled(handled: &[String], path: &str) -> bool {
    handled
        .iter()
        .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}.")))
}

/// Fold sibling changes into replace-class changes
///
/// A replaced target is recreated from the full desired subtree, so any
/// other change on it is implied; a replaced cluster recreates everything.
fn absorb_replaces(
    changes: Vec<Change>,
    spec: &ClusterSpec,
    spec_v: &Value,
    state_v: &Value,
) -> Result<Vec<Change>> {
    if changes
        .iter()
        .any(|c| c.kind == ChangeKind::Replace && c.target == StepTarget::Cluster)
    {
        return Ok(vec![Change {
            path: String::new(),
            kind: ChangeKind::Replace,
            target: StepTarget::Cluster,
            old: Some(state_v.clone()),
            new: Some(spec.to_remote_body()?),
        }]);
    }

    let replaced: Vec<StepTarget> = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Replace)
        .map(|c| c.target)
        .collect();
    if replaced.is_empty() {
        return Ok(changes);
    }

    let mut absorbed = Vec::new();
    let mut emitted: Vec<StepTarget> = Vec::new();
    for change in changes {
        if !replaced.contains(&change.target) {
            absorbed.push(change);
            continue;
        }
        if emitted.contains(&change.target) {
            continue;
        }
        let block_path = change
            .target
            .block_path()
            .expect("non-cluster targets own a block subtree");
        absorbed.push(Change {
            path: block_path.to_string(),
            kind: ChangeKind::Replace,
            target: change.target,
            old: get_path(state_v, block_path).cloned(),
            new: get_path(spec_v, block_path).cloned(),
        });
        emitted.push(change.target);
    }
    Ok(absorbed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{sample_spec, user_assigned_identity};
    use crate::model::registry::FieldRegistry;
    use crate::model::{KeyManagementSpec, KeyVaultNetworkAccess, WorkloadAutoscalerProfileSpec};
    use crate::state::fixtures::sample_state;
    use serde_json::json;

    fn registry() -> FieldRegistry {
        FieldRegistry::for_cluster()
    }

    #[test]
    fn test_no_prior_state_is_one_create() {
        let spec = sample_spec("acctestaks1");
        let set = diff(&spec, None, &registry()).unwrap();

        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.kind, ChangeKind::Create);
        assert_eq!(change.target, StepTarget::Cluster);
        assert_eq!(change.new.as_ref().unwrap()["name"], "acctestaks1");
    }

    #[test]
    fn test_converged_state_is_empty() {
        let spec = sample_spec("acctestaks1");
        let state = sample_state("acctestaks1");
        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_single_leaf_yields_single_change() {
        let mut spec = sample_spec("acctestaks1");
        spec.default_node_pool.node_count = 3;
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.path, "defaultNodePool.nodeCount");
        assert_eq!(change.kind, ChangeKind::UpdateInPlace);
        assert_eq!(change.target, StepTarget::NodePool);
        assert_eq!(change.new, Some(json!(3)));
    }

    #[test]
    fn test_keda_toggle_is_one_update_in_place() {
        let mut spec = sample_spec("acctestaks1");
        spec.workload_autoscaler_profile = Some(WorkloadAutoscalerProfileSpec {
            keda_enabled: true,
            vertical_pod_autoscaler_enabled: false,
        });
        let mut state = sample_state("acctestaks1");
        state.workload_autoscaler_profile = Some(WorkloadAutoscalerProfileSpec::default());

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.path, "workloadAutoscalerProfile.kedaEnabled");
        assert_eq!(change.kind, ChangeKind::UpdateInPlace);
        assert_eq!(change.new, Some(json!(true)));
    }

    #[test]
    fn test_removed_image_cleaner_interval_reverts_to_default() {
        // The desired state disables the cleaner and drops the interval;
        // the interval reverts to its default rather than erroring
        let spec = sample_spec("acctestaks1");
        let mut state = sample_state("acctestaks1");
        state.image_cleaner_enabled = true;
        state.image_cleaner_interval_hours = Some(96);

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 2);

        let toggle = set
            .iter()
            .find(|c| c.path == "imageCleanerEnabled")
            .expect("toggle change");
        assert_eq!(toggle.kind, ChangeKind::UpdateInPlace);
        assert_eq!(toggle.new, Some(json!(false)));

        let interval = set
            .iter()
            .find(|c| c.path == "imageCleanerIntervalHours")
            .expect("interval change");
        assert_eq!(interval.kind, ChangeKind::UpdateInPlace);
        assert_eq!(interval.new, Some(json!(48)));
    }

    #[test]
    fn test_key_management_removal_is_delete() {
        let spec = sample_spec("acctestaks1");
        let mut state = sample_state("acctestaks1");
        state.identity = user_assigned_identity();
        state.key_management_service = Some(KeyManagementSpec {
            key_vault_key_id: "/vaults/kv/keys/etcd-encryption".to_string(),
            key_vault_network_access: KeyVaultNetworkAccess::Public,
        });

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        // KMS block removal plus the identity reverting to system-assigned
        let delete = set
            .iter()
            .find(|c| c.kind == ChangeKind::Delete)
            .expect("delete change");
        assert_eq!(delete.path, "keyManagementService");
        assert_eq!(delete.target, StepTarget::KeyManagement);
        // No stray per-field changes under the deleted block
        assert!(!set
            .iter()
            .any(|c| c.path.starts_with("keyManagementService.")));
    }

    #[test]
    fn test_key_management_introduction_is_create() {
        let mut spec = sample_spec("acctestaks1");
        spec.identity = user_assigned_identity();
        spec.key_management_service = Some(KeyManagementSpec {
            key_vault_key_id: "/vaults/kv/keys/etcd-encryption".to_string(),
            key_vault_network_access: KeyVaultNetworkAccess::Public,
        });
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        let create = set
            .iter()
            .find(|c| c.kind == ChangeKind::Create)
            .expect("create change");
        assert_eq!(create.path, "keyManagementService");
        assert_eq!(
            create.new.as_ref().unwrap()["keyVaultKeyId"],
            "/vaults/kv/keys/etcd-encryption"
        );
    }

    #[test]
    fn test_identity_transition_is_in_place_block_swap() {
        let mut spec = sample_spec("acctestaks1");
        spec.identity = user_assigned_identity();
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.path, "identity");
        assert_eq!(change.kind, ChangeKind::UpdateInPlace);
        assert_eq!(change.target, StepTarget::Identity);
        assert_eq!(change.new.as_ref().unwrap()["type"], "userAssigned");
        // The identityIds leaf is covered by the block swap
        assert!(!set.iter().any(|c| c.path == "identity.identityIds"));
    }

    #[test]
    fn test_pool_replace_absorbs_sibling_pool_changes() {
        let mut spec = sample_spec("acctestaks1");
        spec.default_node_pool.vm_size = "Standard_D2s_v3".to_string();
        spec.default_node_pool.node_count = 4;
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.path, "defaultNodePool");
        assert_eq!(change.kind, ChangeKind::Replace);
        assert_eq!(change.new.as_ref().unwrap()["vmSize"], "Standard_D2s_v3");
        assert_eq!(change.new.as_ref().unwrap()["nodeCount"], 4);
    }

    #[test]
    fn test_cluster_replace_absorbs_everything() {
        let mut spec = sample_spec("acctestaks1");
        spec.edge_zone = Some("attnewyork1".to_string());
        spec.default_node_pool.node_count = 4;
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        let change = &set.changes[0];
        assert_eq!(change.path, "");
        assert_eq!(change.kind, ChangeKind::Replace);
        assert_eq!(change.target, StepTarget::Cluster);
        assert_eq!(change.new.as_ref().unwrap()["edgeZone"], "attnewyork1");
    }

    #[test]
    fn test_unsetting_replace_class_field_is_replace() {
        let spec = sample_spec("acctestaks1");
        let mut state = sample_state("acctestaks1");
        state.edge_zone = Some("attnewyork1".to_string());

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.changes[0].kind, ChangeKind::Replace);
        assert_eq!(set.changes[0].target, StepTarget::Cluster);
    }

    #[test]
    fn test_run_command_toggle() {
        let mut spec = sample_spec("acctestaks1");
        spec.run_command_enabled = false;
        let state = sample_state("acctestaks1");

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.changes[0].path, "runCommandEnabled");
        assert_eq!(set.changes[0].new, Some(json!(false)));
    }

    #[test]
    fn test_tag_update_is_single_change() {
        let mut spec = sample_spec("acctestaks1");
        spec.tags.insert("ENV".to_string(), "Test2".to_string());
        let mut state = sample_state("acctestaks1");
        state.tags.insert("ENV".to_string(), "Test1".to_string());

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.changes[0].path, "tags");
        assert_eq!(set.changes[0].kind, ChangeKind::UpdateInPlace);
        assert_eq!(set.changes[0].new, Some(json!({"ENV": "Test2"})));
    }

    #[test]
    fn test_computed_fields_never_diff() {
        // fqdn/provisioningState/kubeConfig live only in the snapshot; a
        // spec can never drift against them
        let spec = sample_spec("acctestaks1");
        let mut state = sample_state("acctestaks1");
        state.fqdn = Some("changed.example.io".to_string());
        state.provisioning_state = Some("Updating".to_string());

        let set = diff(&spec, Some(&state), &registry()).unwrap();
        assert!(set.is_empty());
    }
}
