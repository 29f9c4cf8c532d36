//! Expansion options and the strategies that choose between them.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::config::ExpanderKind;
use fleet_core::{NodeInfo, Pod, RESOURCE_CPU, RESOURCE_MEMORY};
use fleetscale_cloud::NodeGroup;

/// Growing one node group by `node_count` nodes would host `pods`.
#[derive(Debug, Clone)]
pub struct ExpansionOption {
    pub group: Arc<dyn NodeGroup>,
    pub node_count: usize,
    pub pods: Vec<Pod>,
    pub template: NodeInfo,
}

impl ExpansionOption {
    /// The group this option would grow.
    pub fn group_id(&self) -> &str {
        self.group.id()
    }

    /// Unrequested share of the new capacity, summed over cpu and memory.
    /// Lower is better.
    pub fn wasted_fraction(&self) -> f64 {
        let count = self.node_count.max(1) as f64;
        let mut requested = fleet_core::ResourceList::new();
        for pod in &self.pods {
            requested.add(pod.requests());
        }
        [RESOURCE_CPU, RESOURCE_MEMORY]
            .iter()
            .map(|resource| {
                let available = self.template.free().get(resource) as f64 * count;
                if available <= 0.0 {
                    return 0.0;
                }
                ((available - requested.get(resource) as f64) / available).max(0.0)
            })
            .sum()
    }
}

pub trait Expander: Send + Sync {
    fn best_option(&self, options: &[ExpansionOption]) -> Option<ExpansionOption>;
}

fn viable(options: &[ExpansionOption]) -> impl Iterator<Item = &ExpansionOption> {
    options.iter().filter(|o| o.node_count > 0)
}

/// Ties go to the lexicographically smaller group id.
fn least_waste<'a>(options: impl Iterator<Item = &'a ExpansionOption>) -> Option<ExpansionOption> {
    options
        .min_by(|a, b| {
            a.wasted_fraction()
                .total_cmp(&b.wasted_fraction())
                .then_with(|| a.group_id().cmp(b.group_id()))
        })
        .cloned()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeastWasteExpander;

impl Expander for LeastWasteExpander {
    fn best_option(&self, options: &[ExpansionOption]) -> Option<ExpansionOption> {
        least_waste(viable(options))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MostPodsExpander;

impl Expander for MostPodsExpander {
    fn best_option(&self, options: &[ExpansionOption]) -> Option<ExpansionOption> {
        viable(options)
            .max_by(|a, b| {
                a.pods
                    .len()
                    .cmp(&b.pods.len())
                    .then_with(|| b.group_id().cmp(a.group_id()))
            })
            .cloned()
    }
}

/// Highest configured priority wins; unlisted groups rank 0. Ties fall back
/// to least waste.
#[derive(Debug, Clone, Default)]
pub struct PriorityExpander {
    priorities: BTreeMap<String, i32>,
}

impl PriorityExpander {
    /// Create a priority expander; unlisted groups get priority 0.
    pub fn new(priorities: BTreeMap<String, i32>) -> Self {
        Self { priorities }
    }

    fn priority(&self, group: &str) -> i32 {
        self.priorities.get(group).copied().unwrap_or(0)
    }
}

impl Expander for PriorityExpander {
    fn best_option(&self, options: &[ExpansionOption]) -> Option<ExpansionOption> {
        let top = viable(options).map(|o| self.priority(o.group_id())).max()?;
        least_waste(viable(options).filter(|o| self.priority(o.group_id()) == top))
    }
}

/// The expander configured by `kind`.
pub fn expander_for(kind: ExpanderKind, priorities: &BTreeMap<String, i32>) -> Arc<dyn Expander> {
    match kind {
        ExpanderKind::LeastWaste => Arc::new(LeastWasteExpander),
        ExpanderKind::MostPods => Arc::new(MostPodsExpander),
        ExpanderKind::Priority => Arc::new(PriorityExpander::new(priorities.clone())),
    }
}
