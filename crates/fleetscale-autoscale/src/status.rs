//! Structured outcomes of a tick.
//!
//! Planners return these instead of bare errors so a status reporter can
//! show why a scale-up did not happen or why a node is kept.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use fleet_core::AutoscalerError;
use fleetscale_cloud::NodeGroup;
use fleetscale_simulator::UnremovableNode;

// ── Scale-up ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleUpResult {
    Successful,
    /// No pending pods and enough buffer capacity.
    NotNeeded,
    NotTried,
    /// Pending pods exist but no group can host them.
    NoOptionsAvailable,
    /// Every pending pod is still too young to act on.
    InCooldown,
    Error,
}

/// One node group resize.
#[derive(Debug, Clone)]
pub struct ScaleUpInfo {
    pub group: Arc<dyn NodeGroup>,
    pub current_size: usize,
    pub new_size: usize,
    pub max_size: usize,
}

impl ScaleUpInfo {
    /// The resized group.
    pub fn group_id(&self) -> &str {
        self.group.id()
    }

    /// Nodes added by this resize.
    pub fn delta(&self) -> usize {
        self.new_size.saturating_sub(self.current_size)
    }
}

/// Pods of one equivalence group that no node group could host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectedPods {
    pub pods: Vec<String>,
    /// Node group id → scheduling error against its template.
    pub reasons: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ScaleUpStatus {
    pub result: ScaleUpResult,
    pub error: Option<AutoscalerError>,
    /// Resizes that were applied.
    pub scale_up_infos: Vec<ScaleUpInfo>,
    /// Resizes that failed, by node group id.
    pub failed: Vec<(String, AutoscalerError)>,
    pub pods_triggered: Vec<String>,
    pub pods_remain_unschedulable: Vec<RejectedPods>,
    /// Pods skipped because they were created too recently.
    pub pods_awaiting_evaluation: Vec<String>,
    /// Node group id → why it was not considered at all.
    pub skipped_groups: BTreeMap<String, String>,
}

impl ScaleUpStatus {
    /// A status with no resizes.
    pub fn new(result: ScaleUpResult) -> Self {
        Self {
            result,
            error: None,
            scale_up_infos: Vec::new(),
            failed: Vec::new(),
            pods_triggered: Vec::new(),
            pods_remain_unschedulable: Vec::new(),
            pods_awaiting_evaluation: Vec::new(),
            skipped_groups: BTreeMap::new(),
        }
    }

    /// A failed scale-up.
    pub fn from_error(error: AutoscalerError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(ScaleUpResult::Error)
        }
    }

    /// At least one resize went through.
    pub fn was_successful(&self) -> bool {
        self.result == ScaleUpResult::Successful
    }

    /// Target sizes after the applied resizes, by node group id.
    pub fn new_sizes(&self) -> BTreeMap<String, usize> {
        self.scale_up_infos
            .iter()
            .map(|info| (info.group_id().to_string(), info.new_size))
            .collect()
    }
}

// ── Scale-down ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDownResult {
    Error,
    NoUnneeded,
    NoNodeDeleted,
    NodeDeleteStarted,
    NotTried,
    InCooldown,
    /// A non-empty node deletion from an earlier tick is still running.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleDownNode {
    pub node: String,
    pub group: String,
    pub empty: bool,
    pub evicted_pods: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScaleDownStatus {
    pub result: ScaleDownResult,
    pub error: Option<AutoscalerError>,
    pub scaled_down: Vec<ScaleDownNode>,
    pub unremovable: Vec<UnremovableNode>,
}

impl ScaleDownStatus {
    /// A status with no started deletions.
    pub fn new(result: ScaleDownResult) -> Self {
        Self {
            result,
            error: None,
            scaled_down: Vec::new(),
            unremovable: Vec::new(),
        }
    }

    /// A failed scale-down.
    pub fn from_error(error: AutoscalerError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(ScaleDownResult::Error)
        }
    }
}

// ── Node deletion results ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeletionResultKind {
    Success,
    TaintFailed,
    DrainFailed,
    DelayDeletionTimeout,
    DeleteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodEvictionResult {
    pub pod: String,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl PodEvictionResult {
    /// A pod evicted without error.
    pub fn ok(pod: &str) -> Self {
        Self {
            pod: pod.to_string(),
            timed_out: false,
            error: None,
        }
    }

    /// Evicted in time and without error.
    pub fn was_successful(&self) -> bool {
        !self.timed_out && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDeletionResult {
    pub kind: NodeDeletionResultKind,
    pub error: Option<String>,
    /// Pod key → eviction outcome.
    pub pod_eviction_results: BTreeMap<String, PodEvictionResult>,
}

impl NodeDeletionResult {
    /// A deletion that went through.
    pub fn success() -> Self {
        Self {
            kind: NodeDeletionResultKind::Success,
            error: None,
            pod_eviction_results: BTreeMap::new(),
        }
    }

    /// A deletion that failed at step `kind`.
    pub fn failed(kind: NodeDeletionResultKind, error: impl ToString) -> Self {
        Self {
            kind,
            error: Some(error.to_string()),
            pod_eviction_results: BTreeMap::new(),
        }
    }

    /// Attach per-pod eviction outcomes.
    pub fn with_evictions(mut self, results: BTreeMap<String, PodEvictionResult>) -> Self {
        self.pod_eviction_results = results;
        self
    }

    /// Whether the node was deleted.
    pub fn is_success(&self) -> bool {
        self.kind == NodeDeletionResultKind::Success
    }
}
