//! In-memory cluster API.
//!
//! Nodes, pods and disruption budgets live in mutex-guarded maps. Eviction
//! behaviour is configurable per pod so drain paths (retries, refusals,
//! pods that never terminate) can be exercised without a real cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fleet_core::{Node, Pod, PodDisruptionBudget, Taint};

use crate::api::{ApiError, ApiResult, ClusterApi};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How the fake reacts to an eviction request for a given pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionBehavior {
    /// Accepted and the pod disappears immediately.
    Remove,
    /// Accepted but the pod keeps running (stuck terminating).
    Linger,
    /// Refused `n` times with `TooManyRequests`, then removed.
    RefuseTimes(u32),
    /// Always refused.
    Refuse,
    /// Hard error.
    Fail,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    /// `namespace/name` → pod.
    pods: BTreeMap<String, Pod>,
    pdbs: Vec<PodDisruptionBudget>,
    behaviors: HashMap<String, EvictionBehavior>,
    eviction_attempts: HashMap<String, u32>,
    evicted: Vec<String>,
    failing_taint_nodes: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeClusterApi {
    state: Mutex<ClusterState>,
    fail_listing: AtomicBool,
}

impl FakeClusterApi {
    /// An empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn upsert_node(&self, node: Node) {
        lock(&self.state).nodes.insert(node.name.clone(), node);
    }

    /// Remove a node together with the pods bound to it.
    pub fn remove_node(&self, name: &str) -> Option<Node> {
        let mut state = lock(&self.state);
        state.pods.retain(|_, p| p.node_name.as_deref() != Some(name));
        state.nodes.remove(name)
    }

    /// Insert or replace a pod, keyed by `namespace/name`.
    pub fn upsert_pod(&self, pod: Pod) {
        lock(&self.state).pods.insert(pod.key(), pod);
    }

    /// Remove a pod by key.
    pub fn remove_pod(&self, key: &str) -> Option<Pod> {
        lock(&self.state).pods.remove(key)
    }

    /// Add a disruption budget.
    pub fn add_pdb(&self, pdb: PodDisruptionBudget) {
        lock(&self.state).pdbs.push(pdb);
    }

    /// How evictions of `pod_key` are answered.
    pub fn set_eviction_behavior(&self, pod_key: &str, behavior: EvictionBehavior) {
        lock(&self.state)
            .behaviors
            .insert(pod_key.to_string(), behavior);
    }

    /// Make taint mutations against this node fail.
    pub fn fail_taints_on(&self, node: &str) {
        lock(&self.state).failing_taint_nodes.insert(node.to_string());
    }

    /// Make every list call fail.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Current state of a node.
    pub fn node(&self, name: &str) -> Option<Node> {
        lock(&self.state).nodes.get(name).cloned()
    }

    /// Current state of a pod.
    pub fn pod(&self, key: &str) -> Option<Pod> {
        lock(&self.state).pods.get(key).cloned()
    }

    /// Keys of pods whose eviction was accepted.
    pub fn evicted(&self) -> Vec<String> {
        lock(&self.state).evicted.clone()
    }

    /// How many evictions of `pod_key` were requested.
    pub fn eviction_attempts(&self, pod_key: &str) -> u32 {
        lock(&self.state)
            .eviction_attempts
            .get(pod_key)
            .copied()
            .unwrap_or(0)
    }

    fn check_listing(&self) -> ApiResult<()> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ApiError::Other("listing unavailable".to_string()));
        }
        Ok(())
    }

    fn with_node<T>(&self, name: &str, f: impl FnOnce(&mut Node) -> T) -> ApiResult<T> {
        let mut state = lock(&self.state);
        if state.failing_taint_nodes.contains(name) {
            return Err(ApiError::Conflict(format!("node {name} update rejected")));
        }
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| ApiError::NotFound(format!("node {name}")))?;
        Ok(f(node))
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_nodes(&self) -> ApiResult<Vec<Node>> {
        self.check_listing()?;
        Ok(lock(&self.state).nodes.values().cloned().collect())
    }

    async fn list_pods(&self) -> ApiResult<Vec<Pod>> {
        self.check_listing()?;
        Ok(lock(&self.state).pods.values().cloned().collect())
    }

    async fn list_pdbs(&self) -> ApiResult<Vec<PodDisruptionBudget>> {
        self.check_listing()?;
        Ok(lock(&self.state).pdbs.clone())
    }

    async fn get_node(&self, name: &str) -> ApiResult<Node> {
        self.node(name)
            .ok_or_else(|| ApiError::NotFound(format!("node {name}")))
    }

    async fn pods_on_node(&self, node: &str) -> ApiResult<Vec<Pod>> {
        Ok(lock(&self.state)
            .pods
            .values()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .cloned()
            .collect())
    }

    async fn add_taint(&self, node: &str, taint: Taint) -> ApiResult<()> {
        self.with_node(node, |n| {
            if !n.has_taint(&taint.key) {
                n.taints.push(taint);
            }
        })
    }

    async fn remove_taint(&self, node: &str, key: &str) -> ApiResult<bool> {
        self.with_node(node, |n| {
            let before = n.taints.len();
            n.taints.retain(|t| t.key != key);
            n.taints.len() != before
        })
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> ApiResult<()> {
        self.with_node(node, |n| n.unschedulable = unschedulable)
    }

    async fn evict_pod(&self, pod: &Pod, grace_period: Duration) -> ApiResult<()> {
        let key = pod.key();
        let mut state = lock(&self.state);
        if !state.pods.contains_key(&key) {
            return Err(ApiError::NotFound(format!("pod {key}")));
        }
        let attempt = {
            let counter = state.eviction_attempts.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let behavior = state
            .behaviors
            .get(&key)
            .copied()
            .unwrap_or(EvictionBehavior::Remove);
        debug!(pod = %key, attempt, grace_secs = grace_period.as_secs(), ?behavior, "fake eviction");

        match behavior {
            EvictionBehavior::Remove => {
                state.pods.remove(&key);
                state.evicted.push(key);
                Ok(())
            }
            EvictionBehavior::Linger => {
                state.evicted.push(key);
                Ok(())
            }
            EvictionBehavior::RefuseTimes(n) if attempt > n => {
                state.pods.remove(&key);
                state.evicted.push(key);
                Ok(())
            }
            EvictionBehavior::RefuseTimes(_) | EvictionBehavior::Refuse => {
                Err(ApiError::TooManyRequests(format!("disruption budget blocks {key}")))
            }
            EvictionBehavior::Fail => Err(ApiError::Other(format!("eviction of {key} failed"))),
        }
    }
}
