//! Domain types shared across Fleetscale crates.
//!
//! These mirror the subset of the cluster API the autoscaler reasons about:
//! nodes, pods, taints, tolerations, disruption budgets and resource lists.
//! They are read from the cluster once per tick and are treated as
//! immutable snapshots by the decision engine.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// ── Well-known names ──────────────────────────────────────────────

/// CPU, in millicores.
pub const RESOURCE_CPU: &str = "cpu";
/// Memory, in bytes.
pub const RESOURCE_MEMORY: &str = "memory";
/// Default GPU extended resource.
pub const RESOURCE_GPU: &str = "nvidia.com/gpu";

/// Taint placed on a node that is about to be removed.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";
/// Soft taint placed on nodes that are currently unneeded.
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";

/// Node annotation that excludes a node from scale-down when set to "true".
pub const SCALE_DOWN_DISABLED_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";
/// Node annotation carrying an integer deletion cost. Cheaper nodes go first.
pub const DELETION_COST_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/node-deletion-cost";
/// Node annotation prefix that holds back the final cloud deletion.
pub const DELAY_DELETION_ANNOTATION_PREFIX: &str =
    "delay-deletion.cluster-autoscaler.kubernetes.io/";
/// Pod annotation overriding drainability ("true" / "false").
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
/// Pod annotation present on mirror (static) pods.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Owner kind of daemonset-managed pods.
pub const DAEMONSET_KIND: &str = "DaemonSet";

// ── Resources ─────────────────────────────────────────────────────

/// A named set of resource quantities.
///
/// CPU is in millicores, memory in bytes, extended resources in units.
/// Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for the two resources every node and pod carries.
    pub fn cpu_memory(cpu_millis: i64, memory_bytes: i64) -> Self {
        let mut list = Self::new();
        list.set(RESOURCE_CPU, cpu_millis);
        list.set(RESOURCE_MEMORY, memory_bytes);
        list
    }

    /// Builder form of `set`.
    pub fn with(mut self, name: &str, value: i64) -> Self {
        self.set(name, value);
        self
    }

    /// Quantity of `name`; absent reads as 0.
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Set `name` to `value`.
    pub fn set(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), value);
    }

    /// Add every quantity of `other`.
    pub fn add(&mut self, other: &ResourceList) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// Subtract every quantity of `other`.
    pub fn sub(&mut self, other: &ResourceList) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) -= value;
        }
    }

    /// Every quantity multiplied by `factor`.
    pub fn scaled(&self, factor: i64) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), value.saturating_mul(factor)))
                .collect(),
        )
    }

    /// Names of resources in `self` that exceed what `available` offers.
    pub fn exceeding(&self, available: &ResourceList) -> Vec<String> {
        self.0
            .iter()
            .filter(|(name, value)| **value > 0 && **value > available.get(name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resources in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }
}

impl<S: Into<String>> FromIterator<(S, i64)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (S, i64)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ── Taints and tolerations ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    /// A taint with the given key, value and effect.
    pub fn new(key: &str, value: &str, effect: TaintEffect) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            effect,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` matches all effects.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Whether this toleration matches `taint` (key, value and effect).
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// A worker node as seen by the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Cloud-provider identity, used to map the node to its node group.
    #[serde(default)]
    pub provider_id: String,
    /// Internal IP address.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default = "default_true")]
    pub ready: bool,
    /// Cordoned: the scheduler will not place new pods here.
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub created_at: Timestamp,
    /// When the ready condition last changed.
    #[serde(default)]
    pub ready_transition_at: Timestamp,
}

impl Node {
    /// A ready node with the given allocatable resources (capacity mirrors it).
    pub fn new(name: &str, allocatable: ResourceList) -> Self {
        Self {
            name: name.to_string(),
            provider_id: name.to_string(),
            address: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            taints: Vec::new(),
            capacity: allocatable.clone(),
            allocatable,
            ready: true,
            unschedulable: false,
            created_at: 0,
            ready_transition_at: 0,
        }
    }

    /// Whether any taint has `key`.
    pub fn has_taint(&self, key: &str) -> bool {
        self.taints.iter().any(|t| t.key == key)
    }

    /// Carries the to-be-deleted taint: a deletion is already under way.
    pub fn is_being_deleted(&self) -> bool {
        self.has_taint(TO_BE_DELETED_TAINT)
    }

    /// Carries either the soft candidate taint or the to-be-deleted taint.
    pub fn is_marked_for_removal(&self) -> bool {
        self.has_taint(DELETION_CANDIDATE_TAINT) || self.has_taint(TO_BE_DELETED_TAINT)
    }

    /// Scale-down of this node is disabled by annotation.
    pub fn scale_down_disabled(&self) -> bool {
        self.annotations
            .get(SCALE_DOWN_DISABLED_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Deletion cost annotation; unparsable or missing values read as 0.
    pub fn deletion_cost(&self) -> i64 {
        self.annotations
            .get(DELETION_COST_ANNOTATION)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Annotations asking to delay deletion until they are removed.
    pub fn delay_deletion_annotations(&self) -> Vec<&str> {
        self.annotations
            .keys()
            .filter(|k| k.starts_with(DELAY_DELETION_ANNOTATION_PREFIX))
            .map(String::as_str)
            .collect()
    }

    /// Whether the node advertises (or is labelled to carry) GPUs.
    pub fn has_gpu(&self, gpu_label: &str) -> bool {
        self.labels.contains_key(gpu_label) || self.capacity.get(RESOURCE_GPU) > 0
    }
}

// ── Pod ───────────────────────────────────────────────────────────

/// The controller owning a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Summed container requests.
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub termination_grace_period_secs: Option<u64>,
    /// Uses node-local volumes (emptyDir / hostPath).
    #[serde(default)]
    pub local_storage: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Owning controller, if any.
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub spec: PodSpec,
    /// Node the pod is bound to; `None` while pending.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub nominated_node_name: Option<String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub created_at: Timestamp,
}

impl Pod {
    /// A pending pod with no owner.
    pub fn new(namespace: &str, name: &str, requests: ResourceList) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("{namespace}/{name}"),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
            spec: PodSpec {
                requests,
                ..PodSpec::default()
            },
            node_name: None,
            nominated_node_name: None,
            phase: PodPhase::Pending,
            created_at: 0,
        }
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Summed container requests.
    pub fn requests(&self) -> &ResourceList {
        &self.spec.requests
    }

    /// Whether the pod asks for a GPU.
    pub fn requests_gpu(&self) -> bool {
        self.spec.requests.get(RESOURCE_GPU) > 0
    }

    /// Owned by a DaemonSet.
    pub fn is_daemonset_pod(&self) -> bool {
        self.owner.as_ref().is_some_and(|o| o.kind == DAEMONSET_KIND)
    }

    /// Static pod mirrored by the kubelet.
    pub fn is_mirror_pod(&self) -> bool {
        self.annotations.contains_key(MIRROR_POD_ANNOTATION)
    }

    /// Explicit safe-to-evict override, if annotated.
    pub fn safe_to_evict(&self) -> Option<bool> {
        self.annotations
            .get(SAFE_TO_EVICT_ANNOTATION)
            .map(|v| v == "true")
    }

    /// Succeeded or failed; the pod will not run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }
}

// ── Disruption budgets ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    pub namespace: String,
    pub name: String,
    /// Label selector; all entries must match.
    pub selector: BTreeMap<String, String>,
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    /// Same namespace and every selector label present on the pod.
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.namespace == self.namespace
            && !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| pod.labels.get(k).is_some_and(|pv| pv == v))
    }
}

// ── NodeInfo ─────────────────────────────────────────────────────

/// A node together with the pods scheduled on it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub node: Node,
    pub pods: Vec<Pod>,
}

impl NodeInfo {
    /// A node with no pods.
    pub fn new(node: Node) -> Self {
        Self {
            node,
            pods: Vec::new(),
        }
    }

    /// A node with the given pods.
    pub fn with_pods(node: Node, pods: Vec<Pod>) -> Self {
        Self { node, pods }
    }

    /// The node name.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Summed requests of every pod on the node.
    pub fn requested(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for pod in &self.pods {
            total.add(&pod.spec.requests);
        }
        total
    }

    /// Allocatable minus requested.
    pub fn free(&self) -> ResourceList {
        let mut free = self.node.allocatable.clone();
        free.sub(&self.requested());
        free
    }

    /// Pods that would have to be rescheduled if the node went away.
    pub fn reschedulable_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods
            .iter()
            .filter(|p| !p.is_daemonset_pod() && !p.is_mirror_pod() && !p.is_terminal())
    }

    /// No pods besides daemonset and mirror pods.
    pub fn is_empty(&self) -> bool {
        self.reschedulable_pods().next().is_none()
    }
}

/// Current wall-clock time as a unix timestamp.
pub fn epoch_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
