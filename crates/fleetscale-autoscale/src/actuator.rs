//! Scale-down actuation.
//!
//! Accepted deletions are tainted to-be-deleted on the calling task, then
//! run to completion on detached tokio tasks:
//!
//! ```text
//! empty node:     [evict daemonset pods] ─▶ wait delay-deletion ─▶ delete_nodes
//! non-empty node: drain ─▶ wait delay-deletion ─▶ delete_nodes
//!                   │ any failure
//!                   ▼
//!                 remove to-be-deleted taint, uncordon
//! ```
//!
//! Every unit calls `start_deletion` before it is spawned and exactly one
//! `end_deletion` when it finishes. Only one non-empty deletion runs at a
//! time cluster-wide.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use fleet_core::config::ScaleDownOptions;
use fleet_core::{AutoscalerError, AutoscalerResult, Pod, TO_BE_DELETED_TAINT, Taint, TaintEffect, Timestamp};
use fleetscale_cloud::ClusterApi;

use crate::context::AutoscalingContext;
use crate::deletion_tracker::NodeDeletionTracker;
use crate::drain::{drain_node, evict_daemonset_pods};
use crate::scaledown::{DeletionRequest, ScaleDownSelection};
use crate::status::{
    NodeDeletionResult, NodeDeletionResultKind, PodEvictionResult, ScaleDownNode, ScaleDownResult, ScaleDownStatus,
};

/// The hard taint that keeps new pods off a node being deleted.
pub fn to_be_deleted_taint(now: Timestamp) -> Taint {
    Taint::new(TO_BE_DELETED_TAINT, &now.to_string(), TaintEffect::NoSchedule)
}

/// Wait until the node carries no delay-deletion annotation. A node that
/// is already gone counts as released.
async fn wait_for_delay_deletion(
    api: &Arc<dyn ClusterApi>,
    node: &str,
    max_wait: Duration,
    poll: Duration,
) -> Result<(), String> {
    let deadline = Instant::now() + max_wait;
    loop {
        match api.get_node(node).await {
            Ok(n) => {
                let pending = n.delay_deletion_annotations();
                if pending.is_empty() {
                    return Ok(());
                }
                debug!(node, annotations = ?pending, "waiting for delay-deletion annotations");
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => warn!(node, error = %e, "cannot read node while waiting to delete"),
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "delay-deletion annotations still present on {node} after {}s",
                max_wait.as_secs()
            ));
        }
        sleep(poll).await;
    }
}

async fn roll_back(api: &Arc<dyn ClusterApi>, node: &str, uncordon: bool) {
    if let Err(e) = api.remove_taint(node, TO_BE_DELETED_TAINT).await {
        warn!(node, error = %e, "failed to remove to-be-deleted taint");
    }
    if uncordon && let Err(e) = api.set_unschedulable(node, false).await {
        warn!(node, error = %e, "failed to uncordon node");
    }
}

/// One node deletion, owned by its background task.
struct DeletionUnit {
    api: Arc<dyn ClusterApi>,
    options: ScaleDownOptions,
    tracker: Arc<NodeDeletionTracker>,
    request: DeletionRequest,
    drain: bool,
}

impl DeletionUnit {
    async fn run(self) {
        let node = self.request.node.name.clone();
        let group = self.request.group_id().to_string();
        let result = self.execute().await;

        if result.is_success() {
            info!(node = %node, group = %group, "node deleted");
        } else {
            warn!(node = %node, group = %group, kind = ?result.kind, error = ?result.error, "node deletion failed");
            roll_back(&self.api, &node, self.drain).await;
        }
        self.tracker.end_deletion(&group, &node, result);
        if self.drain {
            self.tracker.set_non_empty_in_progress(false);
        }
    }

    async fn execute(&self) -> NodeDeletionResult {
        let node = &self.request.node.name;
        let mut evictions: BTreeMap<String, PodEvictionResult> = BTreeMap::new();

        if self.drain {
            let drained = drain_node(
                &self.api,
                &self.options,
                node,
                &self.request.pods_to_evict,
                &self.request.daemonset_pods,
            )
            .await;
            evictions = drained.evictions;
            if let Some(e) = drained.error {
                return NodeDeletionResult::failed(NodeDeletionResultKind::DrainFailed, e).with_evictions(evictions);
            }
        } else if self.options.daemonset_eviction_for_empty_nodes {
            evict_daemonset_pods(&self.api, &self.options, node, &self.request.daemonset_pods).await;
        }

        if let Err(e) = wait_for_delay_deletion(
            &self.api,
            node,
            self.options.max_delay_deletion_wait,
            self.options.drain_poll_interval,
        )
        .await
        {
            return NodeDeletionResult::failed(NodeDeletionResultKind::DelayDeletionTimeout, e)
                .with_evictions(evictions);
        }

        if let Err(e) = self.request.group.delete_nodes(std::slice::from_ref(&self.request.node)) {
            return NodeDeletionResult::failed(NodeDeletionResultKind::DeleteFailed, e).with_evictions(evictions);
        }
        NodeDeletionResult::success().with_evictions(evictions)
    }
}

pub struct ScaleDownActuator {
    ctx: Arc<AutoscalingContext>,
    tracker: Arc<NodeDeletionTracker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ScaleDownActuator {
    /// Create an actuator reporting into `tracker`.
    pub fn new(ctx: Arc<AutoscalingContext>, tracker: Arc<NodeDeletionTracker>) -> Self {
        Self {
            ctx,
            tracker,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The tracker background deletions report into.
    pub fn tracker(&self) -> &Arc<NodeDeletionTracker> {
        &self.tracker
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatch a planner selection.
    pub async fn start_deletion(&self, selection: ScaleDownSelection, now: Timestamp) -> ScaleDownStatus {
        let mut status = ScaleDownStatus::new(ScaleDownResult::NoNodeDeleted);
        status.unremovable = selection.rejected;

        if !selection.empty.is_empty() {
            status.scaled_down = self.delete_empty(selection.empty, now).await;
        } else if let Some(request) = selection.drain {
            match self.delete_with_drain(request, now).await {
                Ok(node) => status.scaled_down.push(node),
                Err(e) => status.error = Some(e),
            }
        }

        if !status.scaled_down.is_empty() {
            status.result = ScaleDownResult::NodeDeleteStarted;
        }
        status
    }

    /// Taint and dispatch empty nodes. Nodes whose taint fails are
    /// recorded as failed deletions and skipped.
    pub async fn delete_empty(&self, requests: Vec<DeletionRequest>, now: Timestamp) -> Vec<ScaleDownNode> {
        let mut started = Vec::new();
        for request in requests {
            if let Some(node) = self.dispatch(request, false, now).await {
                started.push(node);
            }
        }
        started
    }

    /// Taint and dispatch a single drain. Fails if another non-empty
    /// deletion is still running.
    pub async fn delete_with_drain(&self, request: DeletionRequest, now: Timestamp) -> AutoscalerResult<ScaleDownNode> {
        if !self.tracker.try_start_non_empty() {
            return Err(AutoscalerError::Transient(
                "a non-empty node deletion is already in progress".to_string(),
            ));
        }
        let name = request.node.name.clone();
        match self.dispatch(request, true, now).await {
            Some(node) => Ok(node),
            None => {
                self.tracker.set_non_empty_in_progress(false);
                Err(AutoscalerError::ApiCall(format!("failed to taint node {name}")))
            }
        }
    }

    async fn dispatch(&self, request: DeletionRequest, drain: bool, now: Timestamp) -> Option<ScaleDownNode> {
        let api = self.ctx.api.clone();
        let node = request.node.name.clone();
        let group = request.group_id().to_string();

        self.tracker.start_deletion(&group);
        if let Err(e) = api.add_taint(&node, to_be_deleted_taint(now)).await {
            warn!(node = %node, error = %e, "failed to taint node for deletion");
            self.tracker.end_deletion(
                &group,
                &node,
                NodeDeletionResult::failed(NodeDeletionResultKind::TaintFailed, e),
            );
            return None;
        }

        let started = ScaleDownNode {
            node: node.clone(),
            group: group.clone(),
            empty: !drain,
            evicted_pods: request.pods_to_evict.iter().map(Pod::key).collect(),
        };
        info!(node = %node, group = %group, drain, "node deletion dispatched");

        let unit = DeletionUnit {
            api,
            options: self.ctx.options.scale_down.clone(),
            tracker: self.tracker.clone(),
            request,
            drain,
        };
        let handle = tokio::spawn(unit.run());
        let mut handles = self.handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Some(started)
    }

    /// Await every dispatched deletion. The control loop never calls this;
    /// it exists for shutdown and tests.
    pub async fn wait_for_deletions(&self) {
        let handles = std::mem::take(&mut *self.handles());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "deletion task failed");
            }
        }
    }
}
