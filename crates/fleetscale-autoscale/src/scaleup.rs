//! Scale-up planning and execution.
//!
//! ```text
//! pending pods
//!   │ drop pods younger than the scale-up delay
//!   │ group into equivalence classes
//!   ▼
//! for each node group (not backed off, healthy, below max, within limits):
//!   fork snapshot ─▶ add template node ─▶ try each representative ─▶ revert
//!   fitting pods ─▶ estimator ─▶ ExpansionOption
//!   ▼
//! expander picks one ─▶ cap (max nodes total, resource ceiling, bulk)
//!   ─▶ balance across similar groups ─▶ increase_size per group
//! ```
//!
//! A failed resize backs off only the group that failed; resizes already
//! applied in the same batch stand.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_core::config::ScaleUpOptions;
use fleet_core::{AutoscalerError, AutoscalerResult, Node, NodeInfo, Pod, RESOURCE_CPU, RESOURCE_MEMORY, ResourceList, Timestamp};
use fleetscale_cloud::NodeGroup;
use fleetscale_simulator::{ClusterSnapshot, PredicateChecker, SnapshotResult};

use crate::clusterstate::ClusterStateRegistry;
use crate::context::AutoscalingContext;
use crate::equivalence::{PodEquivalenceGroup, build_pod_equivalence_groups};
use crate::expander::ExpansionOption;
use crate::resource_limits::{ResourceLimitAccountant, ResourceTotals, node_resource_delta};
use crate::status::{RejectedPods, ScaleUpInfo, ScaleUpResult, ScaleUpStatus};

// ── Pod filtering ─────────────────────────────────────────────────

/// Split pending pods into (too young, old enough). GPU pods wait for the
/// longer GPU delay.
pub fn split_too_young(pods: &[Pod], options: &ScaleUpOptions, now: Timestamp) -> (Vec<Pod>, Vec<Pod>) {
    pods.iter().cloned().partition(|pod| {
        let delay = if pod.requests_gpu() {
            options.gpu_pod_scale_up_delay.max(options.new_pod_scale_up_delay)
        } else {
            options.new_pod_scale_up_delay
        };
        pod.created_at + delay.as_secs() > now
    })
}

/// Place pending pods that already fit an existing node into the snapshot
/// and return the ones that do not. Higher priority pods go first.
pub fn filter_out_schedulable(
    checker: &dyn PredicateChecker,
    snapshot: &mut ClusterSnapshot,
    pods: &[Pod],
) -> SnapshotResult<Vec<Pod>> {
    let mut ordered: Vec<&Pod> = pods.iter().collect();
    ordered.sort_by(|a, b| b.spec.priority.cmp(&a.spec.priority));

    let mut unschedulable = Vec::new();
    for pod in ordered {
        match checker.fits_any_node(snapshot, pod, &|_: &NodeInfo| true) {
            Some(node) => {
                debug!(pod = %pod.key(), node = %node, "pending pod fits existing node");
                snapshot.add_pod(pod.clone(), &node)?;
            }
            None => unschedulable.push(pod.clone()),
        }
    }
    Ok(unschedulable)
}

/// Whether free cpu or memory across schedulable nodes is below `ratio`
/// of allocatable. An empty cluster always is.
pub fn buffer_insufficient(snapshot: &ClusterSnapshot, ratio: f64) -> bool {
    let mut allocatable = ResourceList::new();
    let mut requested = ResourceList::new();
    for info in snapshot.node_infos() {
        if info.node.is_being_deleted() || info.node.unschedulable {
            continue;
        }
        allocatable.add(&info.node.allocatable);
        requested.add(&info.requested());
    }
    [RESOURCE_CPU, RESOURCE_MEMORY].iter().any(|resource| {
        let total = allocatable.get(resource);
        total <= 0 || ((total - requested.get(resource)) as f64 / total as f64) < ratio
    })
}

// ── Balancing and execution ──────────────────────────────────────

/// Spread `total` new nodes across `infos` in proportion to each group's
/// remaining room (`max − new_size`). Returns how many were placed, which
/// is less than `total` only when every group is full.
pub fn balance_scale_up(infos: &mut [ScaleUpInfo], total: usize) -> usize {
    let room: Vec<usize> = infos
        .iter()
        .map(|i| i.max_size.saturating_sub(i.new_size))
        .collect();
    let capacity: usize = room.iter().sum();
    let to_add = total.min(capacity);
    if to_add == 0 {
        return 0;
    }

    let mut given: Vec<usize> = room.iter().map(|r| to_add * r / capacity).collect();
    let mut fraction: Vec<usize> = room.iter().map(|r| to_add * r % capacity).collect();
    let mut left = to_add - given.iter().sum::<usize>();
    // Largest remainder first, then most room left, then group id.
    while left > 0 {
        let next = (0..infos.len())
            .filter(|&i| given[i] < room[i])
            .max_by(|&a, &b| {
                fraction[a]
                    .cmp(&fraction[b])
                    .then_with(|| (room[a] - given[a]).cmp(&(room[b] - given[b])))
                    .then_with(|| infos[b].group_id().cmp(infos[a].group_id()))
            });
        let Some(i) = next else { break };
        given[i] += 1;
        fraction[i] = 0;
        left -= 1;
    }

    for (info, extra) in infos.iter_mut().zip(given) {
        info.new_size += extra;
    }
    to_add
}

#[derive(Debug, Default)]
pub struct ScaleUpExecution {
    pub succeeded: Vec<ScaleUpInfo>,
    /// Node group id → error.
    pub failed: Vec<(String, AutoscalerError)>,
}

/// Apply each resize. Failures back off their group and are reported per
/// pair; successful resizes are registered as upcoming nodes.
pub fn execute_scale_ups(
    infos: &[ScaleUpInfo],
    registry: &mut ClusterStateRegistry,
    now: Timestamp,
) -> ScaleUpExecution {
    let mut execution = ScaleUpExecution::default();
    for info in infos {
        let delta = info.delta();
        if delta == 0 {
            continue;
        }
        let id = info.group_id().to_string();
        match info.group.increase_size(delta) {
            Ok(()) => {
                info!(group = %id, from = info.current_size, to = info.new_size, "scaled up node group");
                registry.register_scale_up(&id, delta, now);
                execution.succeeded.push(info.clone());
            }
            Err(e) => {
                let err = AutoscalerError::from(e);
                warn!(group = %id, delta, error = %err, "failed to increase node group size");
                registry.register_failed_scale_up(&id, &err.to_string(), now);
                execution.failed.push((id, err));
            }
        }
    }
    execution
}

// ── Planner ───────────────────────────────────────────────────────

enum GroupVerdict {
    Option(ExpansionOption),
    NoFit,
    Skipped(String),
}

pub struct ScaleUpPlanner {
    ctx: Arc<AutoscalingContext>,
}

impl ScaleUpPlanner {
    /// Create a planner using the strategies in `ctx`.
    pub fn new(ctx: Arc<AutoscalingContext>) -> Self {
        Self { ctx }
    }

    /// Plan and execute one scale-up. Only snapshot corruption is returned
    /// as an error; everything else is reported in the status.
    pub fn scale_up(
        &self,
        registry: &mut ClusterStateRegistry,
        snapshot: &mut ClusterSnapshot,
        pending: &[Pod],
        nodes: &[Node],
        now: Timestamp,
    ) -> AutoscalerResult<ScaleUpStatus> {
        let options = &self.ctx.options.scale_up;
        let cloud = self.ctx.cloud.as_ref();

        let (young, pods) = split_too_young(pending, options, now);
        let young_keys: Vec<String> = young.iter().map(Pod::key).collect();
        let buffer_low = options.buffer_ratio > 0.0 && buffer_insufficient(snapshot, options.buffer_ratio);

        if pods.is_empty() && !buffer_low {
            let result = if young.is_empty() {
                ScaleUpResult::NotNeeded
            } else {
                ScaleUpResult::InCooldown
            };
            debug!(?result, young = young.len(), "no scale-up needed");
            let mut status = ScaleUpStatus::new(result);
            status.pods_awaiting_evaluation = young_keys;
            return Ok(status);
        }

        let limits = match cloud.resource_limits() {
            Ok(limits) => limits,
            Err(e) => return Ok(ScaleUpStatus::from_error(e.into())),
        };
        let mut totals = ResourceTotals::compute(nodes, cloud);
        for group in cloud.node_groups() {
            let upcoming = registry.upcoming_for(group.id());
            if upcoming > 0
                && let Ok(template) = group.template_node_info()
            {
                let per_node = node_resource_delta(&template.node, Some(&template), cloud.gpu_label());
                totals.add_upcoming(&per_node, upcoming);
            }
        }
        let accountant = ResourceLimitAccountant::for_scale_up(&limits, &totals);

        let mut eq_groups = build_pod_equivalence_groups(&pods);
        let mut candidates = cloud.node_groups();
        candidates.extend(cloud.autoprovisioning_candidates());

        let mut status = ScaleUpStatus::new(ScaleUpResult::NotTried);
        status.pods_awaiting_evaluation = young_keys;

        let mut expansion_options = Vec::new();
        for group in &candidates {
            match self.compute_option(group, registry, &accountant, snapshot, &mut eq_groups, buffer_low, now)? {
                GroupVerdict::Option(option) => {
                    debug!(group = %group.id(), nodes = option.node_count, pods = option.pods.len(), "expansion option");
                    expansion_options.push(option);
                }
                GroupVerdict::NoFit => {}
                GroupVerdict::Skipped(reason) => {
                    debug!(group = %group.id(), reason = %reason, "node group skipped for scale-up");
                    status.skipped_groups.insert(group.id().to_string(), reason);
                }
            }
        }
        status.pods_remain_unschedulable = eq_groups
            .iter()
            .filter(|g| !g.schedulable)
            .map(|g| RejectedPods {
                pods: g.pod_keys(),
                reasons: g.scheduling_errors.clone(),
            })
            .collect();

        let Some(best) = self.ctx.expander.best_option(&expansion_options) else {
            info!(pending = pods.len(), "no expansion options available");
            status.result = ScaleUpResult::NoOptionsAvailable;
            return Ok(status);
        };

        let new_nodes = match self.cap_new_nodes(&best, nodes.len(), registry, &accountant) {
            Ok(n) => n,
            Err(e) => {
                warn!(group = %best.group_id(), error = %e, "scale-up capped to zero");
                status.result = ScaleUpResult::Error;
                status.error = Some(e);
                return Ok(status);
            }
        };

        if !best.group.exist() {
            if let Err(e) = best.group.create() {
                let err = AutoscalerError::from(e);
                registry.register_failed_scale_up(best.group_id(), &err.to_string(), now);
                status.result = ScaleUpResult::Error;
                status.error = Some(err);
                return Ok(status);
            }
            info!(group = %best.group_id(), "created auto-provisioned node group");
        }

        let infos = self.plan_resizes(&best, &expansion_options, new_nodes);
        let execution = execute_scale_ups(&infos, registry, now);

        status.pods_triggered = best.pods.iter().map(Pod::key).collect();
        status.failed = execution.failed;
        status.scale_up_infos = execution.succeeded;
        if status.scale_up_infos.is_empty() {
            status.result = ScaleUpResult::Error;
            status.error = status.failed.first().map(|(_, e)| e.clone());
        } else {
            status.result = ScaleUpResult::Successful;
        }
        Ok(status)
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_option(
        &self,
        group: &Arc<dyn NodeGroup>,
        registry: &ClusterStateRegistry,
        accountant: &ResourceLimitAccountant,
        snapshot: &mut ClusterSnapshot,
        eq_groups: &mut [PodEquivalenceGroup],
        buffer_low: bool,
        now: Timestamp,
    ) -> AutoscalerResult<GroupVerdict> {
        let id = group.id();
        if let Some(reason) = registry.backoff_reason(id, now) {
            return Ok(GroupVerdict::Skipped(format!("backed off: {reason}")));
        }
        if !registry.is_node_group_healthy(id) {
            return Ok(GroupVerdict::Skipped("node group unhealthy".to_string()));
        }
        let target = match group.target_size() {
            Ok(t) => t,
            Err(e) => return Ok(GroupVerdict::Skipped(format!("cannot read target size: {e}"))),
        };
        if target >= group.max_size() {
            return Ok(GroupVerdict::Skipped("max node group size reached".to_string()));
        }
        let template = match group.template_node_info() {
            Ok(t) => t,
            Err(e) => return Ok(GroupVerdict::Skipped(format!("no template: {e}"))),
        };
        let per_node = node_resource_delta(&template.node, Some(&template), self.ctx.cloud.gpu_label());
        let exceeded = accountant.check(&per_node);
        if !exceeded.is_empty() {
            return Ok(GroupVerdict::Skipped(format!(
                "max cluster resource limit reached: {}",
                exceeded.join(", ")
            )));
        }

        snapshot.fork();
        let fitting = self.fitting_pods(snapshot, id, &template, eq_groups);
        snapshot.revert()?;
        let pods = fitting?;

        let estimated = if !pods.is_empty() {
            self.ctx.estimator.estimate(&pods, &template, snapshot)?
        } else if buffer_low {
            1
        } else {
            0
        };
        let node_count = estimated.min(group.max_size() - target);
        if node_count == 0 {
            return Ok(GroupVerdict::NoFit);
        }
        Ok(GroupVerdict::Option(ExpansionOption {
            group: group.clone(),
            node_count,
            pods,
            template,
        }))
    }

    /// Try every representative against one template node. Must run inside
    /// a fork.
    fn fitting_pods(
        &self,
        snapshot: &mut ClusterSnapshot,
        group_id: &str,
        template: &NodeInfo,
        eq_groups: &mut [PodEquivalenceGroup],
    ) -> SnapshotResult<Vec<Pod>> {
        let base = format!("template-node-for-{group_id}");
        let mut name = base.clone();
        let mut suffix = 1;
        while snapshot.contains(&name) {
            name = format!("{base}-{suffix}");
            suffix += 1;
        }
        let mut info = template.clone();
        info.node.name = name.clone();
        info.node.provider_id = name.clone();
        snapshot.add_node_info(info)?;

        let mut pods = Vec::new();
        for eq in eq_groups.iter_mut() {
            match self
                .ctx
                .predicates
                .check_predicates(snapshot, eq.representative(), &name)
            {
                Ok(()) => {
                    eq.schedulable = true;
                    eq.schedulable_groups.push(group_id.to_string());
                    pods.extend(eq.pods.iter().cloned());
                }
                Err(e) => {
                    eq.scheduling_errors.insert(group_id.to_string(), e.to_string());
                }
            }
        }
        Ok(pods)
    }

    /// Every cap only ever lowers the count.
    fn cap_new_nodes(
        &self,
        best: &ExpansionOption,
        existing_nodes: usize,
        registry: &ClusterStateRegistry,
        accountant: &ResourceLimitAccountant,
    ) -> AutoscalerResult<usize> {
        let mut count = best.node_count;

        let max_total = self.ctx.options.max_nodes_total as usize;
        if max_total > 0 {
            let allowed = max_total.saturating_sub(existing_nodes + registry.total_upcoming());
            if allowed < 1 {
                return Err(AutoscalerError::Transient(format!(
                    "max total nodes in cluster reached: {max_total}"
                )));
            }
            if allowed < count {
                info!(requested = count, allowed, "capping scale-up at max total nodes");
                count = allowed;
            }
        }

        let per_node = node_resource_delta(&best.template.node, Some(&best.template), self.ctx.cloud.gpu_label());
        if let Some(allowed) = accountant.max_nodes(&per_node) {
            if allowed < 1 {
                return Err(AutoscalerError::Transient(format!(
                    "max cluster resource limit reached for {}",
                    accountant.check(&per_node).join(", ")
                )));
            }
            if allowed < count {
                info!(requested = count, allowed, "capping scale-up at cluster resource limits");
                count = allowed;
            }
        }

        let bulk = self.ctx.options.scale_up.max_bulk_scale_up_count as usize;
        if bulk > 0 && bulk < count {
            info!(requested = count, allowed = bulk, "capping scale-up at max bulk count");
            count = bulk;
        }
        Ok(count)
    }

    fn plan_resizes(
        &self,
        best: &ExpansionOption,
        options: &[ExpansionOption],
        new_nodes: usize,
    ) -> Vec<ScaleUpInfo> {
        let mut groups = vec![best.group.clone()];
        if self.ctx.options.scale_up.balance_similar_node_groups {
            let others: Vec<Arc<dyn NodeGroup>> = options
                .iter()
                .filter(|o| o.group_id() != best.group_id())
                .filter(|o| !o.pods.is_empty() || best.pods.is_empty())
                .map(|o| o.group.clone())
                .collect();
            let similar = self.ctx.similarity.find_similar(&best.group, &others);
            if !similar.is_empty() {
                debug!(
                    group = %best.group_id(),
                    similar = similar.len(),
                    "balancing scale-up across similar node groups"
                );
            }
            groups.extend(similar);
        }

        let mut infos: Vec<ScaleUpInfo> = groups
            .into_iter()
            .filter_map(|group| {
                let current = group.target_size().ok()?;
                let max_size = group.max_size();
                Some(ScaleUpInfo {
                    group,
                    current_size: current,
                    new_size: current,
                    max_size,
                })
            })
            .collect();
        balance_scale_up(&mut infos, new_nodes);
        infos.retain(|i| i.delta() > 0);
        infos
    }
}
