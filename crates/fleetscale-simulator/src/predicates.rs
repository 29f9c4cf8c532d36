//! Scheduling predicates.
//!
//! A deliberately small scheduler model: a pod fits a node when the node is
//! schedulable, every hard taint is tolerated, the node selector matches and
//! the pod's requests fit in the node's free resources.

use thiserror::Error;

use fleet_core::{NodeInfo, Pod, TaintEffect};

use crate::snapshot::ClusterSnapshot;

/// Why a pod does not fit a node. A scheduling reason, never a tick error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {0} is unschedulable")]
    Unschedulable(String),

    #[error("node {node} has untolerated taint {taint}")]
    TaintNotTolerated { node: String, taint: String },

    #[error("node {node} does not match selector {key}")]
    NodeSelectorMismatch { node: String, key: String },

    #[error("node {node} has insufficient {}", .resources.join(", "))]
    InsufficientResources { node: String, resources: Vec<String> },
}

pub trait PredicateChecker: Send + Sync {
    fn check_predicates(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateError>;

    /// First node (by name) accepted by `filter` that the pod fits on.
    fn fits_any_node(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        filter: &dyn Fn(&NodeInfo) -> bool,
    ) -> Option<String> {
        snapshot
            .node_infos()
            .into_iter()
            .filter(|info| filter(info))
            .find(|info| self.check_predicates(snapshot, pod, info.name()).is_ok())
            .map(|info| info.name().to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceFitChecker;

impl ResourceFitChecker {
    /// Create the resource-fit checker.
    pub fn new() -> Self {
        Self
    }
}

impl PredicateChecker for ResourceFitChecker {
    fn check_predicates(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateError> {
        let info = snapshot
            .get(node_name)
            .ok_or_else(|| PredicateError::NodeNotFound(node_name.to_string()))?;
        let node = &info.node;

        if node.unschedulable {
            return Err(PredicateError::Unschedulable(node.name.clone()));
        }

        for taint in &node.taints {
            if taint.effect == TaintEffect::PreferNoSchedule {
                continue;
            }
            if !pod.spec.tolerations.iter().any(|t| t.tolerates(taint)) {
                return Err(PredicateError::TaintNotTolerated {
                    node: node.name.clone(),
                    taint: taint.key.clone(),
                });
            }
        }

        for (key, value) in &pod.spec.node_selector {
            if node.labels.get(key) != Some(value) {
                return Err(PredicateError::NodeSelectorMismatch {
                    node: node.name.clone(),
                    key: key.clone(),
                });
            }
        }

        let exceeded = pod.requests().exceeding(&info.free());
        if !exceeded.is_empty() {
            return Err(PredicateError::InsufficientResources {
                node: node.name.clone(),
                resources: exceeded,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Node, ResourceList, Taint, Toleration, TolerationOperator};

    fn snapshot_with(node: Node) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();
        snapshot.add_node(node).unwrap();
        snapshot
    }

    fn pod(cpu: i64) -> Pod {
        Pod::new("default", "p", ResourceList::cpu_memory(cpu, 64))
    }

    #[test]
    fn resources_must_fit_free_capacity() {
        let mut snapshot = snapshot_with(Node::new("n1", ResourceList::cpu_memory(1000, 1024)));
        snapshot.add_pod(pod(700), "n1").unwrap();

        let checker = ResourceFitChecker::new();
        assert!(checker.check_predicates(&snapshot, &pod(300), "n1").is_ok());
        assert!(matches!(
            checker.check_predicates(&snapshot, &pod(400), "n1"),
            Err(PredicateError::InsufficientResources { .. })
        ));
    }

    #[test]
    fn hard_taints_need_tolerations() {
        let mut node = Node::new("n1", ResourceList::cpu_memory(1000, 1024));
        node.taints.push(Taint::new("dedicated", "gpu", TaintEffect::NoSchedule));
        node.taints.push(Taint::new("soft", "", TaintEffect::PreferNoSchedule));
        let snapshot = snapshot_with(node);
        let checker = ResourceFitChecker::new();

        let mut p = pod(100);
        assert!(matches!(
            checker.check_predicates(&snapshot, &p, "n1"),
            Err(PredicateError::TaintNotTolerated { .. })
        ));

        p.spec.tolerations.push(Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        });
        assert!(checker.check_predicates(&snapshot, &p, "n1").is_ok());
    }

    #[test]
    fn selector_and_cordon() {
        let mut node = Node::new("n1", ResourceList::cpu_memory(1000, 1024));
        node.labels.insert("zone".into(), "a".into());
        let mut snapshot = snapshot_with(node.clone());
        let checker = ResourceFitChecker::new();

        let mut p = pod(100);
        p.spec.node_selector.insert("zone".into(), "b".into());
        assert!(matches!(
            checker.check_predicates(&snapshot, &p, "n1"),
            Err(PredicateError::NodeSelectorMismatch { .. })
        ));

        node.unschedulable = true;
        node.name = "n2".into();
        snapshot.add_node(node).unwrap();
        assert_eq!(
            checker.check_predicates(&snapshot, &pod(1), "n2"),
            Err(PredicateError::Unschedulable("n2".into()))
        );
        assert_eq!(
            checker.fits_any_node(&snapshot, &pod(1), &|_: &NodeInfo| true),
            Some("n1".to_string())
        );
    }
}
