//! Forkable in-memory model of cluster scheduling state.
//!
//! Simulations (scale-up options, bin-packing estimates, removal checks)
//! mutate a `ClusterSnapshot` freely between `fork()` and `revert()`.
//! Forks nest: each `fork()` saves the current state on a stack, `revert()`
//! restores the most recent save and `commit()` drops it, keeping the
//! changes made since.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use fleet_core::{AutoscalerError, Node, NodeInfo, Pod};

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("node not found in snapshot: {0}")]
    NodeNotFound(String),

    #[error("node already in snapshot: {0}")]
    NodeAlreadyExists(String),

    #[error("pod {pod} not found on node {node}")]
    PodNotFound { pod: String, node: String },

    #[error("revert or commit without a matching fork")]
    NotForked,
}

impl From<SnapshotError> for AutoscalerError {
    fn from(e: SnapshotError) -> Self {
        AutoscalerError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    nodes: HashMap<String, NodeInfo>,
    saved: Vec<HashMap<String, NodeInfo>>,
}

impl ClusterSnapshot {
    /// An empty, unforked snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from listed nodes and pods. Pods that are not bound
    /// to a listed node are skipped.
    pub fn build(nodes: &[Node], pods: &[Pod]) -> Self {
        let mut snapshot = Self::new();
        for node in nodes {
            snapshot
                .nodes
                .insert(node.name.clone(), NodeInfo::new(node.clone()));
        }
        for pod in pods {
            if let Some(node_name) = &pod.node_name
                && let Some(info) = snapshot.nodes.get_mut(node_name)
            {
                info.pods.push(pod.clone());
            }
        }
        snapshot
    }

    /// Add `node` with no pods. Fails if the name is taken.
    pub fn add_node(&mut self, node: Node) -> SnapshotResult<()> {
        self.add_node_info(NodeInfo::new(node))
    }

    /// Add a node together with its pods; pods are rebound to the node.
    pub fn add_node_info(&mut self, mut info: NodeInfo) -> SnapshotResult<()> {
        let name = info.node.name.clone();
        if self.nodes.contains_key(&name) {
            return Err(SnapshotError::NodeAlreadyExists(name));
        }
        for pod in &mut info.pods {
            pod.node_name = Some(name.clone());
        }
        self.nodes.insert(name, info);
        Ok(())
    }

    /// Remove a node and return it with its pods.
    pub fn remove_node(&mut self, name: &str) -> SnapshotResult<NodeInfo> {
        self.nodes
            .remove(name)
            .ok_or_else(|| SnapshotError::NodeNotFound(name.to_string()))
    }

    /// Bind a pod to a node.
    pub fn add_pod(&mut self, mut pod: Pod, node_name: &str) -> SnapshotResult<()> {
        let info = self
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        pod.node_name = Some(node_name.to_string());
        info.pods.push(pod);
        Ok(())
    }

    /// Unschedule a pod from `node_name` and return it.
    pub fn remove_pod(&mut self, pod_key: &str, node_name: &str) -> SnapshotResult<Pod> {
        let info = self
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        let pos = info
            .pods
            .iter()
            .position(|p| p.key() == pod_key)
            .ok_or_else(|| SnapshotError::PodNotFound {
                pod: pod_key.to_string(),
                node: node_name.to_string(),
            })?;
        Ok(info.pods.remove(pos))
    }

    /// A node and its pods.
    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.get(name)
    }

    /// Whether a node named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All node infos, ordered by node name.
    pub fn node_infos(&self) -> Vec<&NodeInfo> {
        let mut infos: Vec<&NodeInfo> = self.nodes.values().collect();
        infos.sort_by(|a, b| a.name().cmp(b.name()));
        infos
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of open forks.
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    /// Start a layer that `revert` discards and `commit` keeps.
    pub fn fork(&mut self) {
        self.saved.push(self.nodes.clone());
        debug!(depth = self.saved.len(), "snapshot forked");
    }

    /// Discard every change since the matching `fork()`.
    pub fn revert(&mut self) -> SnapshotResult<()> {
        self.nodes = self.saved.pop().ok_or(SnapshotError::NotForked)?;
        Ok(())
    }

    /// Keep every change since the matching `fork()`.
    pub fn commit(&mut self) -> SnapshotResult<()> {
        self.saved.pop().ok_or(SnapshotError::NotForked)?;
        Ok(())
    }

    /// Drop all state, including open forks.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.saved.clear();
    }
}
