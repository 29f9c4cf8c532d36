//! Node removal simulation.
//!
//! For each candidate node, decide whether its pods could be moved
//! elsewhere if the node disappeared:
//!
//! ```text
//! candidate ─▶ drainability rules ─▶ PDB budget ─▶ fork ─▶ remove node
//!                   │                    │                    │
//!                   ▼                    ▼                    ▼
//!              BlockedByPod         BlockedByPod     relocate every pod
//!                                                    ├─ all fit ─▶ commit (removable)
//!                                                    └─ any fails ─▶ revert (NoPlaceToMovePods)
//! ```
//!
//! Accepted candidates stay removed from the snapshot and their pods stay
//! on their new nodes, so later candidates are judged against the cluster
//! as it would look after the earlier removals.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use fleet_core::{Node, NodeInfo, Pod, PodDisruptionBudget};

use crate::predicates::PredicateChecker;
use crate::snapshot::{ClusterSnapshot, SnapshotResult};

/// Why a node cannot be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnremovableReason {
    RecentlyUnremovable,
    CurrentlyBeingDeleted,
    ScaleDownDisabledAnnotation,
    NotAutoscaled,
    NotUnderutilized,
    NotUnneededLongEnough,
    NotUnreadyLongEnough,
    NodeGroupMinSizeReached,
    MinimalResourceLimitExceeded,
    BlockedByPod,
    NoPlaceToMovePods,
    /// Needs a drain while the single drain slot is taken.
    NonEmptyDeletionInProgress,
    UnexpectedError,
}

/// Why a specific pod prevents its node from being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingPodReason {
    /// No owning controller would recreate it.
    NotReplicated,
    NotSafeToEvict,
    LocalStorageRequested,
    NotEnoughPdb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingPod {
    /// `namespace/name`.
    pub pod: String,
    pub reason: BlockingPodReason,
}

#[derive(Debug, Clone)]
pub struct NodeToBeRemoved {
    pub node: Node,
    /// Pods that must be evicted and rescheduled elsewhere.
    pub pods_to_reschedule: Vec<Pod>,
    pub daemonset_pods: Vec<Pod>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnremovableNode {
    pub node: String,
    pub reason: UnremovableReason,
    pub blocking_pod: Option<BlockingPod>,
}

impl UnremovableNode {
    /// Record `node` as unremovable for `reason`.
    pub fn new(node: &str, reason: UnremovableReason) -> Self {
        Self {
            node: node.to_string(),
            reason,
            blocking_pod: None,
        }
    }
}

/// Pods on a node split by how a drain treats them.
#[derive(Debug, Clone, Default)]
pub struct DrainablePods {
    pub movable: Vec<Pod>,
    pub daemonset: Vec<Pod>,
}

/// Apply the drainability rules to every pod of a node.
///
/// Mirror and terminal pods are ignored, daemonset pods are returned
/// separately. An explicit `safe-to-evict: "true"` overrides the
/// replication and local-storage rules.
pub fn drainable_pods(
    info: &NodeInfo,
    skip_nodes_with_local_storage: bool,
) -> Result<DrainablePods, BlockingPod> {
    let mut pods = DrainablePods::default();
    for pod in &info.pods {
        if pod.is_mirror_pod() || pod.is_terminal() {
            continue;
        }
        if pod.is_daemonset_pod() {
            pods.daemonset.push(pod.clone());
            continue;
        }
        let blocked = |reason| BlockingPod {
            pod: pod.key(),
            reason,
        };
        match pod.safe_to_evict() {
            Some(false) => return Err(blocked(BlockingPodReason::NotSafeToEvict)),
            Some(true) => {}
            None => {
                if pod.owner.is_none() {
                    return Err(blocked(BlockingPodReason::NotReplicated));
                }
                if skip_nodes_with_local_storage && pod.spec.local_storage {
                    return Err(blocked(BlockingPodReason::LocalStorageRequested));
                }
            }
        }
        pods.movable.push(pod.clone());
    }
    Ok(pods)
}

/// Remaining disruptions per budget, consumed as nodes are accepted.
#[derive(Debug, Clone, Default)]
pub struct PdbTracker {
    budgets: Vec<(PodDisruptionBudget, i32)>,
}

impl PdbTracker {
    /// Track the disruptions each budget still allows.
    pub fn new(pdbs: &[PodDisruptionBudget]) -> Self {
        Self {
            budgets: pdbs
                .iter()
                .map(|p| (p.clone(), p.disruptions_allowed))
                .collect(),
        }
    }

    /// First pod whose budgets cannot absorb evicting all of `pods`.
    pub fn check(&self, pods: &[Pod]) -> Result<(), BlockingPod> {
        for (pdb, remaining) in &self.budgets {
            let mut left = *remaining;
            for pod in pods.iter().filter(|p| pdb.matches(p)) {
                left -= 1;
                if left < 0 {
                    return Err(BlockingPod {
                        pod: pod.key(),
                        reason: BlockingPodReason::NotEnoughPdb,
                    });
                }
            }
        }
        Ok(())
    }

    /// Charge the evictions of `pods` against their budgets.
    pub fn consume(&mut self, pods: &[Pod]) {
        for (pdb, remaining) in &mut self.budgets {
            let used = pods.iter().filter(|p| pdb.matches(p)).count() as i32;
            *remaining -= used;
        }
    }
}

pub struct RemovalSimulator {
    checker: Arc<dyn PredicateChecker>,
    skip_nodes_with_local_storage: bool,
}

impl RemovalSimulator {
    /// Create a simulator placing pods with `checker`.
    pub fn new(checker: Arc<dyn PredicateChecker>, skip_nodes_with_local_storage: bool) -> Self {
        Self {
            checker,
            skip_nodes_with_local_storage,
        }
    }

    /// Judge each candidate in order. Accepted nodes are removed from the
    /// snapshot, with their pods relocated; rejected ones leave it as it was.
    pub fn find_nodes_to_remove(
        &self,
        snapshot: &mut ClusterSnapshot,
        candidates: &[String],
        pdbs: &mut PdbTracker,
    ) -> SnapshotResult<(Vec<NodeToBeRemoved>, Vec<UnremovableNode>)> {
        let mut removable = Vec::new();
        let mut unremovable = Vec::new();

        for name in candidates {
            match self.simulate_removal(snapshot, name, pdbs)? {
                Ok(node) => {
                    pdbs.consume(&node.pods_to_reschedule);
                    removable.push(node);
                }
                Err(rejected) => {
                    debug!(node = %name, reason = ?rejected.reason, "node cannot be removed");
                    unremovable.push(rejected);
                }
            }
        }
        Ok((removable, unremovable))
    }

    /// Outer error: snapshot corruption. Inner error: node not removable.
    fn simulate_removal(
        &self,
        snapshot: &mut ClusterSnapshot,
        name: &str,
        pdbs: &PdbTracker,
    ) -> SnapshotResult<Result<NodeToBeRemoved, UnremovableNode>> {
        let Some(info) = snapshot.get(name) else {
            return Ok(Err(UnremovableNode::new(name, UnremovableReason::UnexpectedError)));
        };

        let pods = match drainable_pods(info, self.skip_nodes_with_local_storage)
            .and_then(|pods| pdbs.check(&pods.movable).map(|_| pods))
        {
            Ok(pods) => pods,
            Err(blocking) => {
                return Ok(Err(UnremovableNode {
                    node: name.to_string(),
                    reason: UnremovableReason::BlockedByPod,
                    blocking_pod: Some(blocking),
                }));
            }
        };

        snapshot.fork();
        let removed = snapshot.remove_node(name);
        let node = match removed {
            Ok(info) => info.node,
            Err(e) => {
                snapshot.revert()?;
                return Err(e);
            }
        };

        for pod in &pods.movable {
            let target = self
                .checker
                .fits_any_node(snapshot, pod, &|info: &NodeInfo| info.name() != name);
            let Some(target) = target else {
                debug!(node = %name, pod = %pod.key(), "no place to move pod");
                snapshot.revert()?;
                return Ok(Err(UnremovableNode::new(
                    name,
                    UnremovableReason::NoPlaceToMovePods,
                )));
            };
            if let Err(e) = snapshot.add_pod(pod.clone(), &target) {
                snapshot.revert()?;
                return Err(e);
            }
        }
        snapshot.commit()?;

        Ok(Ok(NodeToBeRemoved {
            node,
            pods_to_reschedule: pods.movable,
            daemonset_pods: pods.daemonset,
        }))
    }
}
