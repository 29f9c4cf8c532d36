//! Scale-down planning.
//!
//! Each tick the planner re-evaluates every node:
//!
//! ```text
//! node ─▶ recently unremovable? ─▶ being deleted? ─▶ scale-down disabled?
//!      ─▶ no node group? ─▶ utilization ≥ threshold? ─▶ candidate
//!
//! candidates (bounded pool, known ones first)
//!      ─▶ fork ─▶ removal simulation with PDBs ─▶ revert
//!      ─▶ unneeded (timestamps kept across ticks) / unremovable (cached)
//! ```
//!
//! `select_for_deletion` then turns the unneeded set into deletion
//! requests: a bulk of empty nodes, or failing that a single node that
//! needs a drain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_core::{AutoscalerError, AutoscalerResult, Node, Pod, PodDisruptionBudget, Timestamp};
use fleetscale_cloud::NodeGroup;
use fleetscale_simulator::{
    ClusterSnapshot, DrainablePods, PdbTracker, RemovalSimulator, UnremovableNode, UnremovableReason,
    UtilizationInfo, calculate_utilization, drainable_pods,
};

use crate::context::AutoscalingContext;
use crate::deletion_tracker::NodeDeletionTracker;
use crate::resource_limits::{ResourceLimitAccountant, node_resource_delta};

/// A node whose pods could all be moved elsewhere.
#[derive(Debug, Clone)]
pub struct UnneededNode {
    pub node: Node,
    pub group_id: String,
    /// First tick the node was seen unneeded.
    pub since: Timestamp,
    pub utilization: UtilizationInfo,
    pub pods_to_reschedule: Vec<Pod>,
    pub daemonset_pods: Vec<Pod>,
}

impl UnneededNode {
    /// No pods other than daemonset and mirror pods.
    pub fn is_empty(&self) -> bool {
        self.pods_to_reschedule.is_empty()
    }
}

/// One accepted node deletion, ready for the actuator.
#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub node: Node,
    pub group: Arc<dyn NodeGroup>,
    pub pods_to_evict: Vec<Pod>,
    pub daemonset_pods: Vec<Pod>,
}

impl DeletionRequest {
    /// The group the node belongs to.
    pub fn group_id(&self) -> &str {
        self.group.id()
    }

    /// No pods need evicting.
    pub fn is_empty(&self) -> bool {
        self.pods_to_evict.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ScaleDownSelection {
    /// Empty nodes, deleted together without a drain.
    pub empty: Vec<DeletionRequest>,
    /// Set only when `empty` is.
    pub drain: Option<DeletionRequest>,
    /// Unneeded nodes rejected at selection time.
    pub rejected: Vec<UnremovableNode>,
}

impl ScaleDownSelection {
    /// Nothing to delete this tick.
    pub fn is_empty(&self) -> bool {
        self.empty.is_empty() && self.drain.is_none()
    }
}

/// Nodes recently found unremovable, skipped until their entry expires.
#[derive(Debug, Default)]
struct UnremovableCache {
    until: HashMap<String, Timestamp>,
}

impl UnremovableCache {
    fn expire(&mut self, now: Timestamp) {
        self.until.retain(|_, until| *until > now);
    }

    fn contains(&self, node: &str, now: Timestamp) -> bool {
        self.until.get(node).is_some_and(|until| *until > now)
    }

    fn insert(&mut self, node: &str, until: Timestamp) {
        self.until.insert(node.to_string(), until);
    }
}

pub struct ScaleDownPlanner {
    ctx: Arc<AutoscalingContext>,
    simulator: RemovalSimulator,
    unneeded: BTreeMap<String, UnneededNode>,
    unremovable_cache: UnremovableCache,
    last_unremovable: Vec<UnremovableNode>,
}

impl ScaleDownPlanner {
    /// Create a planner with no unneeded or unremovable nodes.
    pub fn new(ctx: Arc<AutoscalingContext>) -> Self {
        let simulator = RemovalSimulator::new(
            ctx.predicates.clone(),
            ctx.options.scale_down.skip_nodes_with_local_storage,
        );
        Self {
            ctx,
            simulator,
            unneeded: BTreeMap::new(),
            unremovable_cache: UnremovableCache::default(),
            last_unremovable: Vec::new(),
        }
    }

    // ── Unneeded detection ────────────────────────────────────────

    /// Recompute the unneeded set. Snapshot corruption clears it and is
    /// returned as an internal error; the snapshot is left as it was.
    pub fn update(
        &mut self,
        nodes: &[Node],
        snapshot: &mut ClusterSnapshot,
        pdbs: &[PodDisruptionBudget],
        now: Timestamp,
    ) -> AutoscalerResult<()> {
        let recheck = self.ctx.options.scale_down.unremovable_recheck_timeout.as_secs();
        self.unremovable_cache.expire(now);

        let mut unremovable = Vec::new();
        let mut candidates: Vec<(String, String, UtilizationInfo, bool)> = Vec::new();
        for node in nodes {
            match self.check_eligibility(node, snapshot, now) {
                Ok((group_id, utilization, empty)) => {
                    candidates.push((node.name.clone(), group_id, utilization, empty));
                }
                Err(reason) => {
                    if reason != UnremovableReason::RecentlyUnremovable {
                        self.unremovable_cache.insert(&node.name, now + recheck);
                    }
                    unremovable.push(UnremovableNode::new(&node.name, reason));
                }
            }
        }

        // Known candidates first, then empty nodes, then least utilized.
        candidates.sort_by(|a, b| {
            let unknown = |c: &(String, String, UtilizationInfo, bool)| !self.unneeded.contains_key(&c.0);
            unknown(a)
                .cmp(&unknown(b))
                .then_with(|| b.3.cmp(&a.3))
                .then_with(|| a.2.utilization.total_cmp(&b.2.utilization))
                .then_with(|| a.0.cmp(&b.0))
        });
        let pool = self.pool_size(nodes.len());
        if candidates.len() > pool {
            debug!(candidates = candidates.len(), pool, "truncating scale-down candidate pool");
            candidates.truncate(pool);
        }

        let names: Vec<String> = candidates.iter().map(|c| c.0.clone()).collect();
        let mut pdb_tracker = PdbTracker::new(pdbs);
        snapshot.fork();
        let simulated = self
            .simulator
            .find_nodes_to_remove(snapshot, &names, &mut pdb_tracker);
        let reverted = snapshot.revert();
        let (removable, rejected) = match simulated.and_then(|r| reverted.map(|_| r)) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "removal simulation failed, resetting unneeded nodes");
                self.clear_unneeded();
                return Err(AutoscalerError::from(e));
            }
        };

        for node in &rejected {
            self.unremovable_cache.insert(&node.node, now + recheck);
        }
        unremovable.extend(rejected);

        // Pods are read from the reverted snapshot: inside the simulation a
        // node also carries pods relocated from earlier candidates.
        let skip_local = self.ctx.options.scale_down.skip_nodes_with_local_storage;
        let meta: HashMap<&str, (&String, &UtilizationInfo)> = candidates
            .iter()
            .map(|(name, group, util, _)| (name.as_str(), (group, util)))
            .collect();
        let removable: Vec<(Node, DrainablePods)> = removable
            .into_iter()
            .filter_map(|removal| {
                let info = snapshot.get(&removal.node.name)?;
                let pods = drainable_pods(info, skip_local).ok()?;
                Some((removal.node, pods))
            })
            .collect();
        let any_empty = removable.iter().any(|(_, pods)| pods.movable.is_empty());
        let mut next = BTreeMap::new();
        for (node, pods) in removable {
            let Some((group_id, utilization)) = meta.get(node.name.as_str()) else {
                continue;
            };
            let empty = pods.movable.is_empty();
            // An empty node anywhere restarts the clock for non-empty ones.
            let since = match self.unneeded.get(&node.name) {
                Some(prev) if empty || !any_empty => prev.since,
                _ => now,
            };
            next.insert(
                node.name.clone(),
                UnneededNode {
                    node,
                    group_id: group_id.to_string(),
                    since,
                    utilization: **utilization,
                    pods_to_reschedule: pods.movable,
                    daemonset_pods: pods.daemonset,
                },
            );
        }

        info!(
            unneeded = next.len(),
            unremovable = unremovable.len(),
            "scale-down candidates updated"
        );
        self.unneeded = next;
        self.last_unremovable = unremovable;
        Ok(())
    }

    /// Ok: (node group id, utilization, empty).
    fn check_eligibility(
        &self,
        node: &Node,
        snapshot: &ClusterSnapshot,
        now: Timestamp,
    ) -> Result<(String, UtilizationInfo, bool), UnremovableReason> {
        let options = &self.ctx.options.scale_down;
        if self.unremovable_cache.contains(&node.name, now) {
            return Err(UnremovableReason::RecentlyUnremovable);
        }
        if node.is_being_deleted() {
            return Err(UnremovableReason::CurrentlyBeingDeleted);
        }
        if node.scale_down_disabled() {
            return Err(UnremovableReason::ScaleDownDisabledAnnotation);
        }
        let group = match self.ctx.cloud.node_group_for_node(node) {
            Ok(Some(group)) => group,
            Ok(None) => return Err(UnremovableReason::NotAutoscaled),
            Err(e) => {
                warn!(node = %node.name, error = %e, "cannot resolve node group");
                return Err(UnremovableReason::NotAutoscaled);
            }
        };
        let Some(info) = snapshot.get(&node.name) else {
            return Err(UnremovableReason::UnexpectedError);
        };

        let gpu_label = self.ctx.cloud.gpu_label();
        let utilization = calculate_utilization(info, options.ignore_daemonsets_utilization, gpu_label);
        let threshold = if node.has_gpu(gpu_label) {
            options.gpu_utilization_threshold
        } else {
            options.utilization_threshold
        };
        if utilization.utilization >= threshold {
            return Err(UnremovableReason::NotUnderutilized);
        }
        let empty = info.reschedulable_pods().next().is_none();
        Ok((group.id().to_string(), utilization, empty))
    }

    fn pool_size(&self, total_nodes: usize) -> usize {
        let options = &self.ctx.options.scale_down;
        let by_ratio = (options.candidates_pool_ratio * total_nodes as f64).ceil() as usize;
        options
            .non_empty_candidates_count
            .max(by_ratio.max(options.candidates_pool_min_count))
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Current removal candidates.
    pub fn unneeded_nodes(&self) -> impl Iterator<Item = &UnneededNode> {
        self.unneeded.values()
    }

    /// Names of the current removal candidates, sorted.
    pub fn unneeded_names(&self) -> Vec<String> {
        self.unneeded.keys().cloned().collect()
    }

    /// Whether `node` is a current removal candidate.
    pub fn is_unneeded(&self, node: &str) -> bool {
        self.unneeded.contains_key(node)
    }

    /// When `node` was first found unneeded.
    pub fn unneeded_since(&self, node: &str) -> Option<Timestamp> {
        self.unneeded.get(node).map(|u| u.since)
    }

    /// Nodes rejected by the last `update`, with reasons.
    pub fn unremovable_nodes(&self) -> &[UnremovableNode] {
        &self.last_unremovable
    }

    /// Forget every unneeded node.
    pub fn clear_unneeded(&mut self) {
        self.unneeded.clear();
    }

    // ── Selection ─────────────────────────────────────────────────

    /// Turn unneeded nodes into deletion requests. Accepted nodes are
    /// charged against `accountant`; rejected ones leave it untouched.
    pub fn select_for_deletion(
        &self,
        tracker: &NodeDeletionTracker,
        accountant: &mut ResourceLimitAccountant,
        now: Timestamp,
    ) -> ScaleDownSelection {
        let options = &self.ctx.options.scale_down;
        let mut selection = ScaleDownSelection::default();
        let mut accepted: HashMap<String, usize> = HashMap::new();

        for unneeded in self.unneeded.values().filter(|u| u.is_empty()) {
            if selection.empty.len() >= options.max_empty_bulk_delete {
                break;
            }
            if !unneeded.node.is_marked_for_removal() {
                debug!(node = %unneeded.node.name, "empty node not tainted yet");
                continue;
            }
            match self.accept(unneeded, tracker, &accepted, now) {
                Ok((group, delta)) => {
                    if let Err(exceeded) = accountant.try_decrement(&delta) {
                        debug!(node = %unneeded.node.name, resources = ?exceeded, "resource floor reached");
                        selection.rejected.push(UnremovableNode::new(
                            &unneeded.node.name,
                            UnremovableReason::MinimalResourceLimitExceeded,
                        ));
                        continue;
                    }
                    *accepted.entry(group.id().to_string()).or_insert(0) += 1;
                    selection.empty.push(DeletionRequest {
                        node: unneeded.node.clone(),
                        group,
                        pods_to_evict: Vec::new(),
                        daemonset_pods: unneeded.daemonset_pods.clone(),
                    });
                }
                Err(rejected) => selection.rejected.push(rejected),
            }
        }

        if !selection.empty.is_empty() || tracker.is_non_empty_in_progress() {
            return selection;
        }

        let mut eligible = Vec::new();
        for unneeded in self.unneeded.values().filter(|u| !u.is_empty()) {
            match self.accept(unneeded, tracker, &accepted, now) {
                Ok((group, delta)) if accountant.check(&delta).is_empty() => {
                    eligible.push((unneeded, group, delta));
                }
                Ok(_) => selection.rejected.push(UnremovableNode::new(
                    &unneeded.node.name,
                    UnremovableReason::MinimalResourceLimitExceeded,
                )),
                Err(rejected) => selection.rejected.push(rejected),
            }
        }
        eligible.sort_by(|a, b| {
            a.0.node
                .deletion_cost()
                .cmp(&b.0.node.deletion_cost())
                .then_with(|| a.0.node.name.cmp(&b.0.node.name))
        });
        if let Some((unneeded, group, delta)) = eligible.into_iter().next() {
            accountant.commit(&delta);
            selection.drain = Some(DeletionRequest {
                node: unneeded.node.clone(),
                group,
                pods_to_evict: unneeded.pods_to_reschedule.clone(),
                daemonset_pods: unneeded.daemonset_pods.clone(),
            });
        }
        selection
    }

    /// Duration and node group size gates shared by both paths.
    fn accept(
        &self,
        unneeded: &UnneededNode,
        tracker: &NodeDeletionTracker,
        accepted: &HashMap<String, usize>,
        now: Timestamp,
    ) -> Result<(Arc<dyn NodeGroup>, fleet_core::ResourceList), UnremovableNode> {
        let options = &self.ctx.options.scale_down;
        let node = &unneeded.node;
        let reject = |reason| Err(UnremovableNode::new(&node.name, reason));

        let unneeded_for = now.saturating_sub(unneeded.since);
        if node.ready && unneeded_for < options.unneeded_time.as_secs() {
            return reject(UnremovableReason::NotUnneededLongEnough);
        }
        if !node.ready && unneeded_for < options.unready_time.as_secs() {
            return reject(UnremovableReason::NotUnreadyLongEnough);
        }

        let group = match self.ctx.cloud.node_group_for_node(node) {
            Ok(Some(group)) => group,
            _ => return reject(UnremovableReason::NotAutoscaled),
        };
        let Ok(target) = group.target_size() else {
            return reject(UnremovableReason::UnexpectedError);
        };
        let in_flight = tracker.deletions_in_progress(group.id())
            + accepted.get(group.id()).copied().unwrap_or(0);
        if target.saturating_sub(group.min_size()) <= in_flight {
            return reject(UnremovableReason::NodeGroupMinSizeReached);
        }

        let template = group.template_node_info().ok();
        let delta = node_resource_delta(node, template.as_ref(), self.ctx.cloud.gpu_label());
        Ok((group, delta))
    }
}
