//! Operation planner: orders changes into a dependency-respecting plan
//!
//! Changes coalesce into one step per sub-resource target, a dependency
//! graph is built from an explicit edge table, and the steps are
//! topologically ordered. Cycles are rejected at plan time with
//! `UnsatisfiableDependency` — before any remote call is issued — rather
//! than resolved by runtime reordering tricks.

use std::collections::BTreeMap;

use tracing::debug;

use lodestone_common::{Error, Result};

use crate::diff::{Change, ChangeKind, ChangeSet};
use crate::model::registry::StepTarget;

/// Remote verb a plan step performs against its target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepVerb {
    /// Create the target (or the whole resource)
    Create,
    /// Mutate the live target in place
    Update,
    /// Delete the target
    Delete,
}

/// One schedulable unit of remote work
#[derive(Clone, Debug)]
pub struct PlanStep {
    /// Stable step identifier within the plan
    pub id: usize,
    /// Sub-resource target the step addresses
    pub target: StepTarget,
    /// Remote verb to perform
    pub verb: StepVerb,
    /// The changes this step applies
    pub changes: Vec<Change>,
    /// Steps that must reach terminal success before this one is issued
    pub depends_on: Vec<usize>,
}

/// Topologically ordered execution plan
///
/// Steps appear in a valid execution order; disjoint subgraphs may run
/// concurrently as long as `depends_on` edges are honored.
#[derive(Clone, Debug, Default)]
pub struct OrderedPlan {
    /// The steps, topologically ordered
    pub steps: Vec<PlanStep>,
}

impl OrderedPlan {
    /// Number of steps in the plan
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when there is nothing to execute
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Recreate order for replace-class steps on a target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplacePolicy {
    /// Delete the old target, then create the new one. The safe default
    /// when the remote name stays occupied until deletion completes.
    #[default]
    DestroyThenCreate,
    /// Create the replacement first, then delete the old target. Only
    /// valid for targets whose remote naming allows coexistence.
    CreateBeforeDestroy,
}

/// Per-target planner policies
#[derive(Clone, Debug, Default)]
pub struct PlannerConfig {
    policies: BTreeMap<StepTarget, ReplacePolicy>,
}

impl PlannerConfig {
    /// Set the replace policy for a target
    pub fn with_replace_policy(mut self, target: StepTarget, policy: ReplacePolicy) -> Self {
        self.policies.insert(target, policy);
        self
    }

    /// The replace policy for a target (the default unless overridden)
    pub fn replace_policy(&self, target: StepTarget) -> ReplacePolicy {
        self.policies.get(&target).copied().unwrap_or_default()
    }
}

/// Ordering constraints between sub-resource targets
///
/// An edge `(a, b)` means a's remote call must reach terminal success
/// before b's is issued. The defaults come from the managed-cluster
/// domain: the identity must exist before anything granting it access is
/// referenced.
#[derive(Clone, Debug)]
pub struct DependencyRules {
    edges: Vec<(StepTarget, StepTarget)>,
}

impl Default for DependencyRules {
    fn default() -> Self {
        Self {
            edges: vec![
                // Key references are resolved with the cluster identity
                (StepTarget::Identity, StepTarget::KeyManagement),
                // Pool placement (dedicated hosts) relies on identity grants
                (StepTarget::Identity, StepTarget::NodePool),
            ],
        }
    }
}

impl DependencyRules {
    /// Rules with no edges
    pub fn empty() -> Self {
        Self { edges: Vec::new() }
    }

    /// Add an ordering edge: `before`'s call completes before `after`'s
    pub fn with_edge(mut self, before: StepTarget, after: StepTarget) -> Self {
        self.edges.push((before, after));
        self
    }
}

/// Build an ordered plan from a change set
///
/// Fails with `UnsatisfiableDependency` when the rules imply a cycle.
pub fn plan(
    change_set: &ChangeSet,
    rules: &DependencyRules,
    config: &PlannerConfig,
) -> Result<OrderedPlan> {
    // Coalesce changes into one raw step per target, in target order
    let mut grouped: BTreeMap<StepTarget, Vec<Change>> = BTreeMap::new();
    for change in change_set.iter() {
        grouped.entry(change.target).or_default().push(change.clone());
    }

    let mut steps: Vec<PlanStep> = Vec::new();
    for (target, changes) in grouped {
        let verb = dominant_verb(&changes);
        if verb == StepVerb::Update && changes.iter().any(|c| c.kind == ChangeKind::Replace) {
            // Replace expands into delete + create ordered per policy
            let delete_id = steps.len();
            let create_id = delete_id + 1;
            let (first_dep, second_dep) = match config.replace_policy(target) {
                ReplacePolicy::DestroyThenCreate => (vec![], vec![delete_id]),
                ReplacePolicy::CreateBeforeDestroy => (vec![create_id], vec![]),
            };
            steps.push(PlanStep {
                id: delete_id,
                target,
                verb: StepVerb::Delete,
                changes: changes.clone(),
                depends_on: first_dep,
            });
            steps.push(PlanStep {
                id: create_id,
                target,
                verb: StepVerb::Create,
                changes,
                depends_on: second_dep,
            });
        } else {
            steps.push(PlanStep {
                id: steps.len(),
                target,
                verb,
                changes,
                depends_on: vec![],
            });
        }
    }

    // Apply the target-level ordering rules
    for (before, after) in &rules.edges {
        let before_ids: Vec<usize> = steps
            .iter()
            .filter(|s| s.target == *before)
            .map(|s| s.id)
            .collect();
        for step in steps.iter_mut().filter(|s| s.target == *after) {
            for &dep in &before_ids {
                if !step.depends_on.contains(&dep) {
                    step.depends_on.push(dep);
                }
            }
        }
    }

    let ordered = topo_sort(steps)?;
    debug!(steps = ordered.len(), "built ordered plan");
    Ok(OrderedPlan { steps: ordered })
}

/// The verb implied by a step's changes; replace handling happens above
fn dominant_verb(changes: &[Change]) -> StepVerb {
    if changes
        .iter()
        .any(|c| c.kind == ChangeKind::Create && c.path.is_empty())
    {
        // Whole-resource creation
        return StepVerb::Create;
    }
    if changes.iter().all(|c| c.kind == ChangeKind::Delete) {
        return StepVerb::Delete;
    }
    StepVerb::Update
}

/// Kahn's algorithm; rejects cycles naming the stuck targets
fn topo_sort(steps: Vec<PlanStep>) -> Result<Vec<PlanStep>> {
    let mut indegree: BTreeMap<usize, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for step in &steps {
        indegree.entry(step.id).or_insert(0);
        for &dep in &step.depends_on {
            *indegree.entry(step.id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(step.id);
        }
    }

    let mut ready: Vec<usize> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order: Vec<usize> = Vec::with_capacity(steps.len());

    while let Some(id) = ready.pop() {
        order.push(id);
        for &dependent in dependents.get(&id).into_iter().flatten() {
            let deg = indegree.get_mut(&dependent).expect("known step");
            *deg -= 1;
            if *deg == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<String> = steps
            .iter()
            .filter(|s| !order.contains(&s.id))
            .map(|s| s.target.to_string())
            .collect();
        return Err(Error::unsatisfiable(format!(
            "dependency cycle between: {}",
            stuck.join(", ")
        )));
    }

    let mut by_id: BTreeMap<usize, PlanStep> = steps.into_iter().map(|s| (s.id, s)).collect();
    Ok(order
        .into_iter()
        .map(|id| by_id.remove(&id).expect("each id ordered once"))
        .collect())
}
