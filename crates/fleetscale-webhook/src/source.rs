//! The webhook as a decision source.
//!
//! ```text
//! tick ─▶ describe node groups ─▶ sink.exchange ─▶ uid check
//!   ├─ scaleUps   ─▶ plan_scale_up ─▶ resource ceiling ─▶ execute_scale_ups
//!   └─ scaleDowns ─▶ plan_scale_down ─▶ drainability + resource floor
//!                      ─▶ actuator (empty nodes together, at most one drain)
//! ```
//!
//! A rejected policy is reported in the status and does not stop the
//! others. A failed exchange fails the tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use fleet_core::config::{WebhookMode, WebhookOptions};
use fleet_core::{AutoscalerError, AutoscalerResult, Node, NodeInfo, Pod};
use fleetscale_autoscale::resource_limits::node_resource_delta;
use fleetscale_autoscale::{
    DecisionOutcome, DecisionSource, DeletionRequest, ResourceLimitAccountant, ScaleDownResult, ScaleDownStatus,
    ScaleUpInfo, ScaleUpResult, ScaleUpStatus, Tick, execute_scale_ups,
};
use fleetscale_cloud::NodeGroup;
use fleetscale_simulator::{UnremovableNode, UnremovableReason, drainable_pods};

use crate::error::{WebhookError, WebhookResult};
use crate::sink::{DecisionSink, FileMailbox, HttpSink, MailboxSink};
use crate::types::{NodeGroupState, NodeTemplate, ScaleDownPolicy, WebhookRequest, WebhookResponse};
use crate::validate::{eligible_nodes, plan_scale_down, plan_scale_up};

pub struct WebhookDecisionSource {
    options: WebhookOptions,
    sink: Arc<dyn DecisionSink>,
}

/// A node group as the request described it, plus what execution needs.
struct GroupEntry {
    group: Arc<dyn NodeGroup>,
    template: Option<NodeInfo>,
    members: Vec<Node>,
}

impl WebhookDecisionSource {
    /// Create a source exchanging through `sink`.
    pub fn new(options: WebhookOptions, sink: Arc<dyn DecisionSink>) -> Self {
        Self { options, sink }
    }

    /// Build the sink named by `options.mode`.
    pub fn from_options(options: WebhookOptions) -> WebhookResult<Self> {
        let sink: Arc<dyn DecisionSink> = match options.mode {
            WebhookMode::Http => {
                let url = options
                    .url
                    .as_deref()
                    .ok_or_else(|| WebhookError::Config("http webhook needs a url".into()))?;
                Arc::new(HttpSink::new(url, options.timeout)?)
            }
            WebhookMode::Mailbox => {
                let path = options
                    .mailbox_path
                    .clone()
                    .ok_or_else(|| WebhookError::Config("mailbox webhook needs a mailbox_path".into()))?;
                Arc::new(MailboxSink::new(Arc::new(FileMailbox::new(path)), options.timeout))
            }
        };
        Ok(Self::new(options, sink))
    }

    fn priority(&self, group: &str) -> i32 {
        self.options.priorities.get(group).copied().unwrap_or(0)
    }

    // ── Request ───────────────────────────────────────────────────

    fn describe(&self, tick: &Tick<'_>) -> (WebhookRequest, BTreeMap<String, GroupEntry>) {
        let cloud = tick.ctx.cloud.as_ref();

        let mut members: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in tick.nodes {
            match cloud.node_group_for_node(node) {
                Ok(Some(group)) => members.entry(group.id().to_string()).or_default().push(node.clone()),
                Ok(None) => {}
                Err(e) => warn!(node = %node.name, error = %e, "cannot resolve node group"),
            }
        }

        let mut states = BTreeMap::new();
        let mut entries = BTreeMap::new();
        for group in cloud.node_groups() {
            let id = group.id().to_string();
            let desired = match group.target_size() {
                Ok(size) => size,
                Err(e) => {
                    warn!(group = %id, error = %e, "cannot read target size, leaving group out");
                    continue;
                }
            };
            let template = match group.template_node_info() {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(group = %id, error = %e, "no template for node group");
                    None
                }
            };
            let node_template = template
                .as_ref()
                .map(|t| NodeTemplate::from_capacity(&t.node.capacity, t.node.labels.clone(), t.node.taints.clone()))
                .unwrap_or_default();
            let group_members = members.remove(&id).unwrap_or_default();
            let node_ips = group_members
                .iter()
                .filter(|n| !n.is_being_deleted())
                .filter_map(|n| n.address.clone())
                .collect();

            states.insert(
                id.clone(),
                NodeGroupState {
                    node_group_id: id.clone(),
                    max_size: group.max_size(),
                    min_size: group.min_size(),
                    desired_size: desired,
                    upcoming_size: tick.registry.upcoming_for(&id),
                    deleting_size: tick.tracker().deletions_in_progress(&id),
                    node_template,
                    node_ips,
                    priority: self.priority(&id),
                },
            );
            entries.insert(
                id,
                GroupEntry {
                    group,
                    template,
                    members: group_members,
                },
            );
        }
        (WebhookRequest::new(states), entries)
    }

    // ── Scale-up ──────────────────────────────────────────────────

    fn scale_up(
        &self,
        tick: &mut Tick<'_>,
        request: &WebhookRequest,
        entries: &BTreeMap<String, GroupEntry>,
        response: &WebhookResponse,
    ) -> AutoscalerResult<ScaleUpStatus> {
        let mut status = ScaleUpStatus::new(ScaleUpResult::NotNeeded);
        if response.scale_ups.is_empty() {
            return Ok(status);
        }

        let cloud = tick.ctx.cloud.as_ref();
        let gpu_label = cloud.gpu_label();
        let limits = cloud.resource_limits()?;
        let mut totals = tick.totals.clone();
        for (id, entry) in entries {
            if let Some(template) = &entry.template {
                let per_node = node_resource_delta(&template.node, Some(template), gpu_label);
                totals.add_upcoming(&per_node, tick.registry.upcoming_for(id));
            }
        }
        let mut accountant = ResourceLimitAccountant::for_scale_up(&limits, &totals);
        let max_total = tick.ctx.options.max_nodes_total;
        let mut node_count = tick.nodes.len() + tick.registry.total_upcoming();

        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut infos: Vec<ScaleUpInfo> = Vec::new();
        for policy in &response.scale_ups {
            let target = policy.node_group_id.as_str();
            let sizes = match plan_scale_up(request, policy) {
                Ok(sizes) => sizes,
                Err(e) => {
                    warn!(target, error = %e, "webhook scale-up rejected");
                    status.failed.push((target.to_string(), e.into()));
                    continue;
                }
            };
            if sizes.is_empty() {
                debug!(target, "webhook scale-up asks for the current size");
                continue;
            }
            match self.admit_scale_up(request, entries, &sizes, &touched, &mut accountant, gpu_label) {
                Ok(planned) => {
                    let added: usize = planned.iter().map(ScaleUpInfo::delta).sum();
                    if max_total > 0 && node_count + added > max_total as usize {
                        let e = WebhookError::rejected(target, format!("max total nodes {max_total} reached"));
                        warn!(target, error = %e, "webhook scale-up rejected");
                        status.failed.push((target.to_string(), e.into()));
                        continue;
                    }
                    node_count += added;
                    touched.extend(sizes.keys().cloned());
                    infos.extend(planned);
                }
                Err(e) => {
                    warn!(target, error = %e, "webhook scale-up rejected");
                    status.failed.push((target.to_string(), e.into()));
                }
            }
        }

        if !infos.is_empty() {
            let execution = execute_scale_ups(&infos, tick.registry, tick.now);
            status.scale_up_infos = execution.succeeded;
            status.failed.extend(execution.failed);
        }
        status.result = if !status.scale_up_infos.is_empty() {
            ScaleUpResult::Successful
        } else if !status.failed.is_empty() {
            ScaleUpResult::Error
        } else {
            ScaleUpResult::NotNeeded
        };
        Ok(status)
    }

    /// Resizes for one policy, charged against the ceiling only if every
    /// member fits.
    fn admit_scale_up(
        &self,
        request: &WebhookRequest,
        entries: &BTreeMap<String, GroupEntry>,
        sizes: &BTreeMap<String, usize>,
        touched: &BTreeSet<String>,
        accountant: &mut ResourceLimitAccountant,
        gpu_label: &str,
    ) -> WebhookResult<Vec<ScaleUpInfo>> {
        let mut planned = Vec::new();
        let mut trial = accountant.clone();
        for (id, &new_size) in sizes {
            if touched.contains(id) {
                return Err(WebhookError::rejected(id, "node group already resized this tick"));
            }
            let (Some(entry), Some(state)) = (entries.get(id), request.node_groups.get(id)) else {
                return Err(WebhookError::rejected(id, "node group disappeared"));
            };
            let delta = new_size - state.desired_size;
            if let Some(template) = &entry.template {
                let per_node = node_resource_delta(&template.node, Some(template), gpu_label);
                let exceeded = trial.check(&per_node.scaled(delta as i64));
                if !exceeded.is_empty() {
                    return Err(WebhookError::rejected(
                        id,
                        format!("max resource limit reached: {}", exceeded.join(", ")),
                    ));
                }
                trial.commit(&per_node.scaled(delta as i64));
            }
            planned.push(ScaleUpInfo {
                group: entry.group.clone(),
                current_size: state.desired_size,
                new_size,
                max_size: state.max_size,
            });
        }
        *accountant = trial;
        Ok(planned)
    }

    // ── Scale-down ────────────────────────────────────────────────

    async fn scale_down(
        &self,
        tick: &mut Tick<'_>,
        request: &WebhookRequest,
        entries: &BTreeMap<String, GroupEntry>,
        response: &WebhookResponse,
    ) -> AutoscalerResult<ScaleDownStatus> {
        let mut status = ScaleDownStatus::new(ScaleDownResult::NoUnneeded);
        if response.scale_downs.is_empty() {
            return Ok(status);
        }
        status.result = ScaleDownResult::NoNodeDeleted;

        let cloud = tick.ctx.cloud.as_ref();
        let gpu_label = cloud.gpu_label();
        let limits = cloud.resource_limits()?;
        let mut accountant = ResourceLimitAccountant::for_scale_down(&limits, tick.totals);
        let skip_local_storage = tick.ctx.options.scale_down.skip_nodes_with_local_storage;

        let mut empty: Vec<DeletionRequest> = Vec::new();
        let mut drain: Option<DeletionRequest> = None;
        let drain_slot_taken = tick.tracker().is_non_empty_in_progress();
        // Accepted picks per group and by name, shared by every policy.
        let mut picked_per_group: BTreeMap<String, usize> = BTreeMap::new();
        let mut picked_names: BTreeSet<String> = BTreeSet::new();
        for policy in &response.scale_downs {
            let already = picked_per_group.get(&policy.node_group_id).copied().unwrap_or(0);
            let picked = match self.pick_nodes(tick, request, entries, policy, already, &picked_names) {
                Ok(picked) => picked,
                Err(e) => {
                    warn!(group = %policy.node_group_id, error = %e, "webhook scale-down rejected");
                    status.error.get_or_insert_with(|| AutoscalerError::from(e));
                    continue;
                }
            };
            let Some(entry) = entries.get(&policy.node_group_id) else {
                continue;
            };
            for node in picked {
                let pods: Vec<Pod> = tick
                    .pods
                    .iter()
                    .filter(|p| p.node_name.as_deref() == Some(node.name.as_str()))
                    .cloned()
                    .collect();
                let info = NodeInfo::with_pods(node.clone(), pods);
                let drainable = match drainable_pods(&info, skip_local_storage) {
                    Ok(d) => d,
                    Err(blocking) => {
                        debug!(node = %node.name, pod = %blocking.pod, "webhook pick blocked by pod");
                        status.unremovable.push(UnremovableNode {
                            node: node.name.clone(),
                            reason: UnremovableReason::BlockedByPod,
                            blocking_pod: Some(blocking),
                        });
                        continue;
                    }
                };
                let needs_drain = !drainable.movable.is_empty();
                if needs_drain && (drain_slot_taken || drain.is_some()) {
                    debug!(node = %node.name, "drain slot taken, webhook pick waits for a later tick");
                    status.unremovable.push(UnremovableNode::new(
                        &node.name,
                        UnremovableReason::NonEmptyDeletionInProgress,
                    ));
                    continue;
                }
                let delta = node_resource_delta(&node, entry.template.as_ref(), gpu_label);
                if let Err(exceeded) = accountant.try_decrement(&delta) {
                    debug!(node = %node.name, resources = ?exceeded, "webhook pick breaches resource floor");
                    status.unremovable.push(UnremovableNode::new(
                        &node.name,
                        UnremovableReason::MinimalResourceLimitExceeded,
                    ));
                    continue;
                }
                *picked_per_group.entry(policy.node_group_id.clone()).or_default() += 1;
                picked_names.insert(node.name.clone());
                let request = DeletionRequest {
                    node,
                    group: entry.group.clone(),
                    pods_to_evict: drainable.movable,
                    daemonset_pods: drainable.daemonset,
                };
                if needs_drain {
                    drain = Some(request);
                } else {
                    empty.push(request);
                }
            }
        }

        if !empty.is_empty() {
            status.scaled_down = tick.actuator.delete_empty(empty, tick.now).await;
        }
        if let Some(request) = drain {
            match tick.actuator.delete_with_drain(request, tick.now).await {
                Ok(node) => status.scaled_down.push(node),
                Err(e) => {
                    warn!(error = %e, "webhook drain not started");
                    status.error.get_or_insert(e);
                }
            }
        }

        if !status.scaled_down.is_empty() {
            status.result = ScaleDownResult::NodeDeleteStarted;
        }
        Ok(status)
    }

    fn pick_nodes(
        &self,
        tick: &Tick<'_>,
        request: &WebhookRequest,
        entries: &BTreeMap<String, GroupEntry>,
        policy: &ScaleDownPolicy,
        already_picked: usize,
        picked_names: &BTreeSet<String>,
    ) -> WebhookResult<Vec<Node>> {
        let id = policy.node_group_id.as_str();
        let (Some(state), Some(entry)) = (request.node_groups.get(id), entries.get(id)) else {
            return Err(WebhookError::rejected(id, "unknown node group"));
        };
        let mut eligible = eligible_nodes(&entry.members, self.options.initializing_grace, tick.now);
        eligible.retain(|n| !picked_names.contains(&n.name));
        let picked = plan_scale_down(state, policy, &eligible, already_picked)?;
        let names: BTreeSet<&str> = picked.iter().map(|n| n.name.as_str()).collect();
        Ok(entry
            .members
            .iter()
            .filter(|n| names.contains(n.name.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DecisionSource for WebhookDecisionSource {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn decide(&self, tick: &mut Tick<'_>) -> AutoscalerResult<DecisionOutcome> {
        let (request, entries) = self.describe(tick);
        debug!(uid = %request.uid, groups = request.node_groups.len(), sink = self.sink.name(), "webhook exchange");

        let response = self.sink.exchange(&request).await?;
        if response.uid != request.uid {
            return Err(WebhookError::UidMismatch {
                expected: request.uid,
                got: response.uid,
            }
            .into());
        }
        info!(
            uid = %request.uid,
            scale_ups = response.scale_ups.len(),
            scale_downs = response.scale_downs.len(),
            "webhook decisions received"
        );

        let scale_up = self.scale_up(tick, &request, &entries, &response)?;
        let scale_down = self.scale_down(tick, &request, &entries, &response).await?;
        Ok(DecisionOutcome {
            scale_up: Some(scale_up),
            scale_down: Some(scale_down),
        })
    }
}
