//! Bin-packing node-count estimation.
//!
//! Given the pods a node group could host and the group's template node,
//! estimate how many new nodes are needed:
//!
//! 1. Sort pods by their footprint on the template (largest first)
//! 2. Place each pod on an already-added template node if it fits
//! 3. Otherwise add another template node, up to the node limit
//!
//! The snapshot is forked for the duration of the estimate and always
//! reverted before returning.

use std::sync::Arc;

use tracing::debug;

use fleet_core::{NodeInfo, Pod, RESOURCE_CPU, RESOURCE_MEMORY};

use crate::predicates::PredicateChecker;
use crate::snapshot::{ClusterSnapshot, SnapshotResult};

pub trait Estimator: Send + Sync {
    /// Number of template nodes needed to host `pods`.
    fn estimate(
        &self,
        pods: &[Pod],
        template: &NodeInfo,
        snapshot: &mut ClusterSnapshot,
    ) -> SnapshotResult<usize>;
}

pub struct BinpackingEstimator {
    checker: Arc<dyn PredicateChecker>,
    /// Upper bound on nodes added per estimate. Zero means unbounded.
    max_nodes: usize,
}

impl BinpackingEstimator {
    /// Create an estimator that never proposes more than `max_nodes`.
    pub fn new(checker: Arc<dyn PredicateChecker>, max_nodes: usize) -> Self {
        Self { checker, max_nodes }
    }

    fn footprint(pod: &Pod, template: &NodeInfo) -> f64 {
        let alloc = &template.node.allocatable;
        let share = |resource: &str| {
            let total = alloc.get(resource);
            if total <= 0 {
                0.0
            } else {
                pod.requests().get(resource) as f64 / total as f64
            }
        };
        share(RESOURCE_CPU) + share(RESOURCE_MEMORY)
    }

    fn pack(
        &self,
        pods: &[Pod],
        template: &NodeInfo,
        snapshot: &mut ClusterSnapshot,
    ) -> SnapshotResult<usize> {
        let mut ordered: Vec<&Pod> = pods.iter().collect();
        ordered.sort_by(|a, b| {
            Self::footprint(b, template).total_cmp(&Self::footprint(a, template))
        });

        let mut added: Vec<String> = Vec::new();
        for pod in ordered {
            let placed = added
                .iter()
                .find(|name| self.checker.check_predicates(snapshot, pod, name).is_ok())
                .cloned();
            if let Some(name) = placed {
                snapshot.add_pod(pod.clone(), &name)?;
                continue;
            }

            if self.max_nodes > 0 && added.len() >= self.max_nodes {
                debug!(pod = %pod.key(), max_nodes = self.max_nodes, "estimate hit node limit");
                continue;
            }

            let name = format!("{}-estimate-{}", template.name(), added.len());
            let mut info = template.clone();
            info.node.name = name.clone();
            info.node.provider_id = name.clone();
            snapshot.add_node_info(info)?;

            if self.checker.check_predicates(snapshot, pod, &name).is_ok() {
                snapshot.add_pod(pod.clone(), &name)?;
                added.push(name);
            } else {
                // Does not fit even an empty template node.
                snapshot.remove_node(&name)?;
            }
        }
        Ok(added.len())
    }
}

impl Estimator for BinpackingEstimator {
    fn estimate(
        &self,
        pods: &[Pod],
        template: &NodeInfo,
        snapshot: &mut ClusterSnapshot,
    ) -> SnapshotResult<usize> {
        snapshot.fork();
        let packed = self.pack(pods, template, snapshot);
        snapshot.revert()?;
        let count = packed?;
        debug!(template = %template.name(), pods = pods.len(), nodes = count, "estimated node count");
        Ok(count)
    }
}
