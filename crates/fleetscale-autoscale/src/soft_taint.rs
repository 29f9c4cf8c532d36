//! Soft deletion-candidate taints.
//!
//! Unneeded nodes get a `PreferNoSchedule` taint so the scheduler stops
//! favouring them while they wait out their unneeded time. Nodes that are
//! needed again lose it. Both directions share one per-tick budget.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use fleet_core::{DELETION_CANDIDATE_TAINT, Node, Taint, TaintEffect, Timestamp};
use fleetscale_cloud::ClusterApi;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SoftTaintReport {
    pub tainted: Vec<String>,
    pub untainted: Vec<String>,
    pub failed: Vec<String>,
}

/// The soft taint, stamped with `now`.
pub fn deletion_candidate_taint(now: Timestamp) -> Taint {
    Taint::new(DELETION_CANDIDATE_TAINT, &now.to_string(), TaintEffect::PreferNoSchedule)
}

/// Reconcile candidate taints against the unneeded set, touching at most
/// `budget` nodes. Per-node failures are logged and skipped.
pub async fn update_soft_taints(
    api: &dyn ClusterApi,
    nodes: &[Node],
    unneeded: &BTreeSet<String>,
    budget: usize,
    now: Timestamp,
) -> SoftTaintReport {
    let mut report = SoftTaintReport::default();
    let mut left = budget;

    for node in nodes {
        if left == 0 {
            debug!("soft taint budget exhausted");
            break;
        }
        let wanted = unneeded.contains(&node.name) && !node.is_being_deleted();
        let present = node.has_taint(DELETION_CANDIDATE_TAINT);
        if wanted == present {
            continue;
        }
        left -= 1;

        if wanted {
            match api.add_taint(&node.name, deletion_candidate_taint(now)).await {
                Ok(()) => report.tainted.push(node.name.clone()),
                Err(e) => {
                    warn!(node = %node.name, error = %e, "failed to add soft taint");
                    report.failed.push(node.name.clone());
                }
            }
        } else {
            match api.remove_taint(&node.name, DELETION_CANDIDATE_TAINT).await {
                Ok(_) => report.untainted.push(node.name.clone()),
                Err(e) => {
                    warn!(node = %node.name, error = %e, "failed to remove soft taint");
                    report.failed.push(node.name.clone());
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ResourceList;
    use fleetscale_cloud::FakeClusterApi;

    fn api_with(nodes: &[Node]) -> FakeClusterApi {
        let api = FakeClusterApi::new();
        for n in nodes {
            api.upsert_node(n.clone());
        }
        api
    }

    fn node(name: &str, tainted: bool) -> Node {
        let mut n = Node::new(name, ResourceList::cpu_memory(1000, 1000));
        if tainted {
            n.taints.push(deletion_candidate_taint(1));
        }
        n
    }

    #[tokio::test]
    async fn taints_unneeded_and_clears_needed() {
        let nodes = vec![node("n1", false), node("n2", true), node("n3", true)];
        let api = api_with(&nodes);
        let unneeded = BTreeSet::from(["n1".to_string(), "n3".to_string()]);

        let report = update_soft_taints(&api, &nodes, &unneeded, 10, 100).await;
        assert_eq!(report.tainted, vec!["n1".to_string()]);
        assert_eq!(report.untainted, vec!["n2".to_string()]);
        assert!(api.node("n1").unwrap().has_taint(DELETION_CANDIDATE_TAINT));
        assert!(!api.node("n2").unwrap().has_taint(DELETION_CANDIDATE_TAINT));
    }

    #[tokio::test]
    async fn budget_limits_changes() {
        let nodes: Vec<Node> = (1..=5).map(|i| node(&format!("n{i}"), false)).collect();
        let api = api_with(&nodes);
        let unneeded: BTreeSet<String> = nodes.iter().map(|n| n.name.clone()).collect();

        let report = update_soft_taints(&api, &nodes, &unneeded, 2, 100).await;
        assert_eq!(report.tainted.len(), 2);
    }

    #[tokio::test]
    async fn failures_are_reported_per_node() {
        let nodes = vec![node("n1", false), node("n2", false)];
        let api = api_with(&nodes);
        api.fail_taints_on("n1");
        let unneeded = BTreeSet::from(["n1".to_string(), "n2".to_string()]);

        let report = update_soft_taints(&api, &nodes, &unneeded, 10, 100).await;
        assert_eq!(report.failed, vec!["n1".to_string()]);
        assert_eq!(report.tainted, vec!["n2".to_string()]);
    }
}
