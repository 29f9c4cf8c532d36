//! Cluster-wide resource limit accounting.
//!
//! Totals are taken from the capacity of every node that is not already
//! being deleted. From them the accountant derives, per bounded resource,
//! how much may still be added (`max − total`) or removed (`total − min`).
//!
//! Candidates are checked with `check` (no mutation) and then charged with
//! `commit`; `try_decrement` does both. Rejected candidates consume nothing.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use fleet_core::{Node, NodeInfo, RESOURCE_GPU, ResourceLimits, ResourceList};
use fleetscale_cloud::CloudProvider;

/// Room left for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headroom {
    Unlimited,
    Bounded(i64),
    /// The resource is bounded but its current total could not be
    /// determined. No positive delta is accepted against it.
    Unknown,
}

impl Headroom {
    fn admits(&self, delta: i64) -> bool {
        match self {
            Headroom::Unlimited => true,
            Headroom::Bounded(left) => delta <= *left,
            Headroom::Unknown => delta <= 0,
        }
    }
}

/// Resource delta of adding or removing `node`. GPU nodes whose device
/// plugin has not published capacity yet take the GPU count from their
/// group's template.
pub fn node_resource_delta(node: &Node, template: Option<&NodeInfo>, gpu_label: &str) -> ResourceList {
    let mut delta = node.capacity.clone();
    if node.labels.contains_key(gpu_label)
        && delta.get(RESOURCE_GPU) == 0
        && let Some(template) = template
    {
        delta.set(RESOURCE_GPU, template.node.capacity.get(RESOURCE_GPU));
    }
    delta
}

/// Current per-resource totals over the non-deleting nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTotals {
    pub totals: ResourceList,
    /// Resources whose total could not be computed.
    pub unknown: BTreeSet<String>,
}

impl ResourceTotals {
    /// Sum the capacity of nodes not being deleted.
    pub fn compute(nodes: &[Node], cloud: &dyn CloudProvider) -> Self {
        let gpu_label = cloud.gpu_label();
        let mut result = Self::default();
        for node in nodes.iter().filter(|n| !n.is_being_deleted()) {
            let mut delta = node.capacity.clone();
            if node.labels.contains_key(gpu_label) && delta.get(RESOURCE_GPU) == 0 {
                let template = cloud
                    .node_group_for_node(node)
                    .ok()
                    .flatten()
                    .and_then(|g| g.template_node_info().ok());
                match template {
                    Some(t) => delta = node_resource_delta(node, Some(&t), gpu_label),
                    None => {
                        warn!(node = %node.name, "cannot determine gpu count for labelled node");
                        result.unknown.insert(RESOURCE_GPU.to_string());
                    }
                }
            }
            result.totals.add(&delta);
        }
        result
    }

    /// Add nodes that were requested but have not registered yet.
    pub fn add_upcoming(&mut self, per_node: &ResourceList, count: usize) {
        self.totals.add(&per_node.scaled(count as i64));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct ResourceLimitAccountant {
    direction: Direction,
    remaining: BTreeMap<String, Headroom>,
}

impl ResourceLimitAccountant {
    /// Headroom is `max − total` per resource with a ceiling.
    pub fn for_scale_up(limits: &ResourceLimits, totals: &ResourceTotals) -> Self {
        Self::build(Direction::Up, limits, totals)
    }

    /// Headroom is `total − min` per resource with a floor.
    pub fn for_scale_down(limits: &ResourceLimits, totals: &ResourceTotals) -> Self {
        Self::build(Direction::Down, limits, totals)
    }

    fn build(direction: Direction, limits: &ResourceLimits, totals: &ResourceTotals) -> Self {
        let mut remaining = BTreeMap::new();
        for resource in limits.resources() {
            let bound = match direction {
                Direction::Up => limits.max(&resource),
                Direction::Down => Some(limits.min(&resource)).filter(|m| *m > 0),
            };
            let headroom = match bound {
                None => Headroom::Unlimited,
                Some(_) if totals.unknown.contains(&resource) => Headroom::Unknown,
                Some(bound) => {
                    let total = totals.totals.get(&resource);
                    match direction {
                        Direction::Up => Headroom::Bounded(bound - total),
                        Direction::Down => Headroom::Bounded(total - bound),
                    }
                }
            };
            remaining.insert(resource, headroom);
        }
        Self {
            direction,
            remaining,
        }
    }

    /// Room left for `resource` in the accountant's direction.
    pub fn headroom(&self, resource: &str) -> Headroom {
        self.remaining
            .get(resource)
            .copied()
            .unwrap_or(Headroom::Unlimited)
    }

    /// Resources that `delta` would push past their bound. Does not mutate.
    pub fn check(&self, delta: &ResourceList) -> Vec<String> {
        delta
            .iter()
            .filter(|(resource, value)| !self.headroom(resource).admits(*value))
            .map(|(resource, _)| resource.to_string())
            .collect()
    }

    /// Charge `delta` against the remaining headroom.
    pub fn commit(&mut self, delta: &ResourceList) {
        for (resource, value) in delta.iter() {
            if let Some(Headroom::Bounded(left)) = self.remaining.get_mut(resource) {
                *left -= value;
            }
        }
    }

    /// `check` followed by `commit` when nothing is exceeded.
    pub fn try_decrement(&mut self, delta: &ResourceList) -> Result<(), Vec<String>> {
        let exceeded = self.check(delta);
        if !exceeded.is_empty() {
            return Err(exceeded);
        }
        self.commit(delta);
        Ok(())
    }

    /// How many nodes of shape `per_node` fit in the remaining headroom.
    /// `None` when no bounded resource limits it.
    pub fn max_nodes(&self, per_node: &ResourceList) -> Option<usize> {
        let mut cap: Option<usize> = None;
        for (resource, value) in per_node.iter() {
            if value <= 0 {
                continue;
            }
            let fits = match self.headroom(resource) {
                Headroom::Unlimited => continue,
                Headroom::Unknown => 0,
                Headroom::Bounded(left) => (left.max(0) / value) as usize,
            };
            cap = Some(cap.map_or(fits, |c| c.min(fits)));
        }
        cap
    }

    /// Whether this accountant guards the max limits.
    pub fn is_scale_up(&self) -> bool {
        self.direction == Direction::Up
    }
}
