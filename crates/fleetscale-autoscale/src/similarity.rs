//! Node group similarity, used to balance a scale-up across groups that
//! are interchangeable apart from placement (typically one per zone).

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_core::{NodeInfo, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY};
use fleetscale_cloud::NodeGroup;

/// Labels that legitimately differ between otherwise identical groups.
pub const IGNORED_LABELS: &[&str] = &[
    "topology.kubernetes.io/zone",
    "topology.kubernetes.io/region",
    "kubernetes.io/hostname",
    "fleetscale.io/node-group",
];

/// Relative memory difference tolerated between templates.
const MAX_MEMORY_DIFFERENCE_RATIO: f64 = 0.015;

pub trait NodeGroupSimilarity: Send + Sync {
    fn find_similar(
        &self,
        group: &Arc<dyn NodeGroup>,
        candidates: &[Arc<dyn NodeGroup>],
    ) -> Vec<Arc<dyn NodeGroup>>;
}

#[derive(Debug, Clone)]
pub struct TemplateSimilarity {
    ignored_labels: BTreeSet<String>,
}

impl Default for TemplateSimilarity {
    fn default() -> Self {
        Self {
            ignored_labels: IGNORED_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TemplateSimilarity {
    /// Similarity ignoring the standard zone, hostname and group labels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also ignore `label` when comparing templates.
    pub fn ignore_label(mut self, label: &str) -> Self {
        self.ignored_labels.insert(label.to_string());
        self
    }

    /// Same cpu and gpu, memory within tolerance, and matching labels.
    pub fn templates_similar(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        let (ca, cb) = (&a.node.capacity, &b.node.capacity);
        if ca.get(RESOURCE_CPU) != cb.get(RESOURCE_CPU) || ca.get(RESOURCE_GPU) != cb.get(RESOURCE_GPU) {
            return false;
        }

        let (ma, mb) = (ca.get(RESOURCE_MEMORY), cb.get(RESOURCE_MEMORY));
        let larger = ma.max(mb);
        if larger > 0 && (ma - mb).abs() as f64 / larger as f64 > MAX_MEMORY_DIFFERENCE_RATIO {
            return false;
        }

        let relevant = |info: &NodeInfo| -> Vec<(String, String)> {
            info.node
                .labels
                .iter()
                .filter(|(k, _)| !self.ignored_labels.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        relevant(a) == relevant(b)
    }
}

impl NodeGroupSimilarity for TemplateSimilarity {
    fn find_similar(
        &self,
        group: &Arc<dyn NodeGroup>,
        candidates: &[Arc<dyn NodeGroup>],
    ) -> Vec<Arc<dyn NodeGroup>> {
        let Ok(template) = group.template_node_info() else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|c| c.id() != group.id())
            .filter(|c| {
                c.template_node_info()
                    .is_ok_and(|t| self.templates_similar(&template, &t))
            })
            .cloned()
            .collect()
    }
}
