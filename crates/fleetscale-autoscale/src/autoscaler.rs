//! The control loop.
//!
//! One tick:
//!
//! ```text
//! refresh cloud ─▶ list nodes, pods, PDBs ─▶ recalculate cluster state
//!   ─▶ drain deletion results ─▶ snapshot + resource totals
//!   ─▶ decision source?  yes ─▶ source decides, done
//!                        no  ─▶ scale-up ─▶ (nothing started) ─▶ scale-down
//! ```
//!
//! Cloud and listing failures abort the tick. Deletions dispatched by
//! scale-down keep running after the tick returns; the next tick reads
//! their outcome from the deletion tracker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use fleet_core::{AutoscalerResult, ErrorKind, Node, Pod, Timestamp, epoch_secs};
use fleetscale_simulator::ClusterSnapshot;

use crate::actuator::ScaleDownActuator;
use crate::clusterstate::ClusterStateRegistry;
use crate::context::AutoscalingContext;
use crate::deletion_tracker::NodeDeletionTracker;
use crate::resource_limits::{ResourceLimitAccountant, ResourceTotals};
use crate::scaledown::ScaleDownPlanner;
use crate::scaleup::{ScaleUpPlanner, filter_out_schedulable};
use crate::soft_taint::update_soft_taints;
use crate::status::{NodeDeletionResult, ScaleDownResult, ScaleDownStatus, ScaleUpResult, ScaleUpStatus};

// ── Decision sources ──────────────────────────────────────────────

/// What a decision source sees and may act through during one tick.
pub struct Tick<'a> {
    pub ctx: &'a Arc<AutoscalingContext>,
    pub registry: &'a mut ClusterStateRegistry,
    pub actuator: &'a ScaleDownActuator,
    pub nodes: &'a [Node],
    pub pods: &'a [Pod],
    pub totals: &'a ResourceTotals,
    pub now: Timestamp,
}

impl Tick<'_> {
    /// Deletion bookkeeping shared with the actuator.
    pub fn tracker(&self) -> &Arc<NodeDeletionTracker> {
        self.actuator.tracker()
    }
}

#[derive(Debug, Default)]
pub struct DecisionOutcome {
    pub scale_up: Option<ScaleUpStatus>,
    pub scale_down: Option<ScaleDownStatus>,
}

/// An external authority that replaces the built-in planners for a tick.
/// Decisions still execute through the same resize and deletion
/// primitives.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, tick: &mut Tick<'_>) -> AutoscalerResult<DecisionOutcome>;
}

// ── Autoscaler ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TickStatus {
    pub scale_up: Option<ScaleUpStatus>,
    pub scale_down: Option<ScaleDownStatus>,
    /// Deletions that finished since the previous tick.
    pub deletion_results: BTreeMap<String, NodeDeletionResult>,
    /// Name of the decision source that ran, if any.
    pub source: Option<String>,
}

pub struct StaticAutoscaler {
    ctx: Arc<AutoscalingContext>,
    registry: ClusterStateRegistry,
    scale_up: ScaleUpPlanner,
    scale_down: ScaleDownPlanner,
    actuator: ScaleDownActuator,
    decision_source: Option<Box<dyn DecisionSource>>,
    last_scale_down_fail: Option<Timestamp>,
}

impl StaticAutoscaler {
    /// Create an autoscaler with the built-in planners.
    pub fn new(ctx: Arc<AutoscalingContext>) -> Self {
        let tracker = Arc::new(NodeDeletionTracker::new());
        Self {
            registry: ClusterStateRegistry::new(ctx.options.scale_up.clone()),
            scale_up: ScaleUpPlanner::new(ctx.clone()),
            scale_down: ScaleDownPlanner::new(ctx.clone()),
            actuator: ScaleDownActuator::new(ctx.clone(), tracker),
            decision_source: None,
            last_scale_down_fail: None,
            ctx,
        }
    }

    /// Hand every decision to `source` instead of the built-in planners.
    pub fn with_decision_source(mut self, source: Box<dyn DecisionSource>) -> Self {
        self.decision_source = Some(source);
        self
    }

    /// Cluster health and backoff state.
    pub fn registry(&self) -> &ClusterStateRegistry {
        &self.registry
    }

    /// Scale-down state carried across ticks.
    pub fn scale_down_planner(&self) -> &ScaleDownPlanner {
        &self.scale_down
    }

    /// The actuator running background deletions.
    pub fn actuator(&self) -> &ScaleDownActuator {
        &self.actuator
    }

    /// The deletion tracker shared with background deletions.
    pub fn tracker(&self) -> &Arc<NodeDeletionTracker> {
        self.actuator.tracker()
    }

    /// Run one full decision pass.
    pub async fn run_once(&mut self, now: Timestamp) -> AutoscalerResult<TickStatus> {
        let cloud = self.ctx.cloud.clone();
        let api = self.ctx.api.clone();

        cloud.refresh()?;
        let nodes = api.list_nodes().await?;
        let pods = api.list_pods().await?;
        let pdbs = api.list_pdbs().await?;
        self.registry.recalculate(cloud.as_ref(), &nodes, now);

        let mut status = TickStatus {
            deletion_results: self.actuator.tracker().take_results(),
            ..TickStatus::default()
        };
        if status.deletion_results.values().any(|r| !r.is_success()) {
            self.last_scale_down_fail = Some(now);
        }

        let mut snapshot = ClusterSnapshot::build(&nodes, &pods);
        let totals = ResourceTotals::compute(&nodes, cloud.as_ref());
        debug!(nodes = nodes.len(), pods = pods.len(), "tick started");

        if let Some(source) = &self.decision_source {
            let mut tick = Tick {
                ctx: &self.ctx,
                registry: &mut self.registry,
                actuator: &self.actuator,
                nodes: &nodes,
                pods: &pods,
                totals: &totals,
                now,
            };
            let outcome = source.decide(&mut tick).await?;
            status.source = Some(source.name().to_string());
            status.scale_up = outcome.scale_up;
            status.scale_down = outcome.scale_down;
            return Ok(status);
        }

        if self.ctx.options.scale_up.enabled {
            let up = match self.run_scale_up(&mut snapshot, &nodes, &pods, now) {
                Ok(up) => up,
                Err(e) => {
                    if e.kind() == ErrorKind::Internal {
                        warn!(error = %e, "scale-up simulation failed, resetting unneeded nodes");
                        self.scale_down.clear_unneeded();
                    }
                    return Err(e);
                }
            };
            let started = up.was_successful();
            status.scale_up = Some(up);
            if started {
                debug!("scale-up started, skipping scale-down this tick");
                return Ok(status);
            }
        }

        if self.ctx.options.scale_down.enabled {
            self.scale_down.update(&nodes, &mut snapshot, &pdbs, now)?;
            let unneeded: BTreeSet<String> = self.scale_down.unneeded_names().into_iter().collect();
            let report = update_soft_taints(
                api.as_ref(),
                &nodes,
                &unneeded,
                self.ctx.options.scale_down.max_soft_taint_count,
                now,
            )
            .await;
            if !report.tainted.is_empty() || !report.untainted.is_empty() {
                debug!(tainted = report.tainted.len(), untainted = report.untainted.len(), "soft taints updated");
            }
            status.scale_down = Some(self.run_scale_down(&totals, now).await);
        }

        Ok(status)
    }

    fn run_scale_up(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        nodes: &[Node],
        pods: &[Pod],
        now: Timestamp,
    ) -> AutoscalerResult<ScaleUpStatus> {
        if !self.registry.is_cluster_healthy() {
            let readiness = self.registry.total_readiness();
            warn!(
                ready = readiness.ready,
                unready = readiness.unready,
                "cluster unhealthy, skipping scale-up"
            );
            return Ok(ScaleUpStatus::new(ScaleUpResult::NotTried));
        }

        let unschedulable: Vec<Pod> = pods
            .iter()
            .filter(|p| p.node_name.is_none() && p.nominated_node_name.is_none() && !p.is_terminal())
            .cloned()
            .collect();
        let pending = filter_out_schedulable(self.ctx.predicates.as_ref(), snapshot, &unschedulable)?;
        let status = self
            .scale_up
            .scale_up(&mut self.registry, snapshot, &pending, nodes, now)?;
        info!(result = ?status.result, pending = pending.len(), "scale-up evaluated");
        Ok(status)
    }

    async fn run_scale_down(&mut self, totals: &ResourceTotals, now: Timestamp) -> ScaleDownStatus {
        let options = &self.ctx.options.scale_down;
        let unremovable = self.scale_down.unremovable_nodes().to_vec();
        let with_unremovable = |mut status: ScaleDownStatus| {
            let mut all = unremovable.clone();
            all.append(&mut status.unremovable);
            status.unremovable = all;
            status
        };

        let after_add = self
            .registry
            .last_scale_up_time()
            .is_some_and(|t| t + options.delay_after_add.as_secs() > now);
        let after_failure = self
            .last_scale_down_fail
            .is_some_and(|t| t + options.delay_after_failure.as_secs() > now);
        if after_add || after_failure {
            debug!(after_add, after_failure, "scale-down in cooldown");
            return with_unremovable(ScaleDownStatus::new(ScaleDownResult::InCooldown));
        }
        if self.actuator.tracker().is_non_empty_in_progress() {
            return with_unremovable(ScaleDownStatus::new(ScaleDownResult::InProgress));
        }
        if self.scale_down.unneeded_nodes().next().is_none() {
            return with_unremovable(ScaleDownStatus::new(ScaleDownResult::NoUnneeded));
        }

        let limits = match self.ctx.cloud.resource_limits() {
            Ok(limits) => limits,
            Err(e) => return with_unremovable(ScaleDownStatus::from_error(e.into())),
        };
        let mut accountant = ResourceLimitAccountant::for_scale_down(&limits, totals);
        let selection = self
            .scale_down
            .select_for_deletion(self.actuator.tracker(), &mut accountant, now);
        let status = self.actuator.start_deletion(selection, now).await;
        info!(
            result = ?status.result,
            started = status.scaled_down.len(),
            "scale-down evaluated"
        );
        with_unremovable(status)
    }

    /// Tick every `scan_interval` until `shutdown` flips. Deletions still
    /// running at shutdown are left to finish on their own.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.ctx.options.scan_interval;
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once(epoch_secs()).await {
                        error!(error = %e, kind = %e.kind(), "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
