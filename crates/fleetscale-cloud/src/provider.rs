//! Cloud-provider contracts.
//!
//! A `NodeGroup` is a set of interchangeable nodes with a min/max/target
//! size. Its size only changes through `increase_size`, `delete_nodes`
//! and `decrease_target_size`. The `CloudProvider` maps nodes to their
//! group and exposes cluster-wide resource limits.

use std::sync::Arc;

use thiserror::Error;

use fleet_core::{AutoscalerError, Node, NodeInfo, ResourceLimits};

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("node group not found: {0}")]
    NodeGroupNotFound(String),

    #[error("node group {group}: size {requested} outside [{min}, {max}]")]
    SizeOutOfBounds {
        group: String,
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("node {node} does not belong to node group {group}")]
    ForeignNode { node: String, group: String },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("provider error: {0}")]
    Provider(String),
}

impl From<CloudError> for AutoscalerError {
    fn from(e: CloudError) -> Self {
        AutoscalerError::CloudProvider(e.to_string())
    }
}

/// Lifecycle of a cloud instance backing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider id, matching `Node::provider_id`.
    pub id: String,
    pub state: InstanceState,
}

pub trait NodeGroup: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    /// Desired size, including nodes that have not registered yet.
    fn target_size(&self) -> CloudResult<usize>;

    fn increase_size(&self, delta: usize) -> CloudResult<()>;

    /// Delete the given nodes and shrink the target accordingly.
    fn delete_nodes(&self, nodes: &[Node]) -> CloudResult<()>;

    /// Shrink the target without deleting registered nodes.
    fn decrease_target_size(&self, delta: usize) -> CloudResult<()>;

    fn nodes(&self) -> CloudResult<Vec<Instance>>;

    /// A representative node (plus daemonset pods) for new members.
    fn template_node_info(&self) -> CloudResult<NodeInfo>;

    /// `false` for groups proposed by auto-provisioning that do not exist yet.
    fn exist(&self) -> bool {
        true
    }

    fn create(&self) -> CloudResult<()> {
        Err(CloudError::NotImplemented("create"))
    }

    fn autoprovisioned(&self) -> bool {
        false
    }
}

pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// All existing node groups.
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;

    /// Groups that could be created on demand.
    fn autoprovisioning_candidates(&self) -> Vec<Arc<dyn NodeGroup>> {
        Vec::new()
    }

    /// `Ok(None)` for nodes that are not managed by the autoscaler.
    fn node_group_for_node(&self, node: &Node) -> CloudResult<Option<Arc<dyn NodeGroup>>>;

    fn resource_limits(&self) -> CloudResult<ResourceLimits>;

    /// Node label identifying GPU nodes before their capacity is published.
    fn gpu_label(&self) -> &str;

    /// Called once per tick before any other call.
    fn refresh(&self) -> CloudResult<()> {
        Ok(())
    }
}
