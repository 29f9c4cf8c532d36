//! Turning response policies into concrete resizes and node picks.
//!
//! Everything here works on the request that was sent, so a policy is
//! judged against the same state the webhook saw.
//!
//! # Scale-up
//!
//! ```text
//! "ng1,ng2" → combined min / max / desired
//!   desired < min or > max     → rejected
//!   desired < current          → rejected (shrinking goes through scale-down)
//!   desired == current         → nothing to do
//!   otherwise                  → delta filled by descending priority, each group up to its max
//! ```
//!
//! # Scale-down
//!
//! `NodeNum` keeps `nodeNum` nodes: nodes already being deleted count as
//! gone, and the remainder is taken from the highest deletion cost down.
//! `NodeIPs` removes the requested addresses that are eligible. Either way
//! the group must stay at or above its min size. Initializing nodes are
//! never eligible.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use fleet_core::{Node, Timestamp};

use crate::error::{WebhookError, WebhookResult};
use crate::types::{NodeGroupState, ScaleDownPolicy, ScaleDownType, ScaleUpPolicy, WebhookRequest};

// ── Scale-up ──────────────────────────────────────────────────────

/// New target size per member group. An empty map means the policy asks
/// for the current size.
pub fn plan_scale_up(request: &WebhookRequest, policy: &ScaleUpPolicy) -> WebhookResult<BTreeMap<String, usize>> {
    let target = policy.node_group_id.as_str();
    let mut members: Vec<&NodeGroupState> = Vec::new();
    for id in target.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match request.node_groups.get(id) {
            Some(state) => members.push(state),
            None => return Err(WebhookError::rejected(target, format!("unknown node group {id}"))),
        }
    }
    if members.is_empty() {
        return Err(WebhookError::rejected(target, "no node group named"));
    }

    let min: usize = members.iter().map(|g| g.min_size).sum();
    let max: usize = members.iter().map(|g| g.max_size).sum();
    let current: usize = members.iter().map(|g| g.desired_size).sum();
    let desired = policy.desired_size;

    if desired < min || desired > max {
        return Err(WebhookError::rejected(
            target,
            format!("desired size {desired} outside [{min}, {max}]"),
        ));
    }
    if desired < current {
        return Err(WebhookError::rejected(
            target,
            format!("desired size {desired} below current {current}"),
        ));
    }

    let mut sizes = BTreeMap::new();
    let mut left = desired - current;
    members.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.node_group_id.cmp(&b.node_group_id)));
    for group in members {
        if left == 0 {
            break;
        }
        let room = group.max_size.saturating_sub(group.desired_size);
        let take = room.min(left);
        if take > 0 {
            sizes.insert(group.node_group_id.clone(), group.desired_size + take);
            left -= take;
        }
    }
    Ok(sizes)
}

// ── Scale-down ────────────────────────────────────────────────────

/// A member that may be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleNode {
    pub name: String,
    pub ip: String,
    pub deletion_cost: i64,
}

/// Still joining: cordoned and created within the grace window.
pub fn is_initializing(node: &Node, grace: Duration, now: Timestamp) -> bool {
    node.unschedulable && now.saturating_sub(node.created_at) < grace.as_secs()
}

/// Members with an address that are neither being deleted nor initializing.
pub fn eligible_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    grace: Duration,
    now: Timestamp,
) -> Vec<EligibleNode> {
    nodes
        .into_iter()
        .filter(|n| !n.is_being_deleted() && !is_initializing(n, grace, now))
        .filter_map(|n| {
            n.address.as_ref().map(|ip| EligibleNode {
                name: n.name.clone(),
                ip: ip.clone(),
                deletion_cost: n.deletion_cost(),
            })
        })
        .collect()
}

/// Nodes to remove for one policy, in removal order.
///
/// `already_picked` counts members of the same group that earlier policies
/// of this response already selected; they no longer count as retained.
pub fn plan_scale_down(
    state: &NodeGroupState,
    policy: &ScaleDownPolicy,
    eligible: &[EligibleNode],
    already_picked: usize,
) -> WebhookResult<Vec<EligibleNode>> {
    let target = policy.node_group_id.as_str();
    let remaining = state
        .desired_size
        .saturating_sub(state.deleting_size)
        .saturating_sub(already_picked);

    let picked = match policy.kind {
        ScaleDownType::NodeNum => {
            // TODO: drop the address-count guard once member addresses are
            // known to always match the desired size.
            if policy.node_num >= remaining || policy.node_num == state.node_ips.len() {
                return Ok(Vec::new());
            }
            let count = remaining - policy.node_num;
            let mut sorted = eligible.to_vec();
            sorted.sort_by(|a, b| a.deletion_cost.cmp(&b.deletion_cost).then_with(|| a.ip.cmp(&b.ip)));
            let skip = sorted.len().saturating_sub(count);
            sorted.split_off(skip)
        }
        ScaleDownType::NodeIps => {
            let requested: BTreeSet<&str> = policy.node_ips.iter().map(String::as_str).collect();
            eligible
                .iter()
                .filter(|n| requested.contains(n.ip.as_str()))
                .cloned()
                .collect()
        }
    };

    if remaining.saturating_sub(picked.len()) < state.min_size {
        return Err(WebhookError::rejected(
            target,
            format!(
                "removing {} of {remaining} nodes breaches min size {}",
                picked.len(),
                state.min_size
            ),
        ));
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeTemplate;
    use fleet_core::{DELETION_COST_ANNOTATION, ResourceList, TO_BE_DELETED_TAINT, Taint, TaintEffect};

    fn group(id: &str, min: usize, max: usize, desired: usize, priority: i32) -> NodeGroupState {
        NodeGroupState {
            node_group_id: id.into(),
            max_size: max,
            min_size: min,
            desired_size: desired,
            upcoming_size: 0,
            deleting_size: 0,
            node_template: NodeTemplate::default(),
            node_ips: Vec::new(),
            priority,
        }
    }

    fn request(groups: Vec<NodeGroupState>) -> WebhookRequest {
        WebhookRequest::new(groups.into_iter().map(|g| (g.node_group_id.clone(), g)).collect())
    }

    fn up(id: &str, desired: usize) -> ScaleUpPolicy {
        ScaleUpPolicy {
            node_group_id: id.into(),
            desired_size: desired,
        }
    }

    fn eligible(ip: &str, cost: i64) -> EligibleNode {
        EligibleNode {
            name: format!("node-{ip}"),
            ip: ip.into(),
            deletion_cost: cost,
        }
    }

    #[test]
    fn combined_target_fills_higher_priority_first() {
        let req = request(vec![group("ng1", 1, 10, 1, 2), group("ng2", 0, 10, 4, 1)]);
        let sizes = plan_scale_up(&req, &up("ng1,ng2", 15)).unwrap();
        assert_eq!(sizes, BTreeMap::from([("ng1".to_string(), 10), ("ng2".to_string(), 5)]));
    }

    #[test]
    fn below_combined_min_is_rejected() {
        let req = request(vec![group("ng1", 1, 10, 1, 2), group("ng2", 0, 10, 4, 1)]);
        let err = plan_scale_up(&req, &up("ng1,ng2", 0)).unwrap_err();
        assert!(matches!(err, WebhookError::Rejected { .. }));
    }

    #[test]
    fn current_size_is_a_no_op() {
        let req = request(vec![group("ng1", 1, 10, 1, 2), group("ng2", 0, 10, 4, 1)]);
        assert!(plan_scale_up(&req, &up("ng1,ng2", 5)).unwrap().is_empty());
    }

    #[test]
    fn above_combined_max_is_rejected() {
        let req = request(vec![group("ng1", 1, 10, 1, 2), group("ng2", 0, 10, 4, 1)]);
        assert!(plan_scale_up(&req, &up("ng1,ng2", 21)).is_err());
    }

    #[test]
    fn shrinking_through_scale_up_is_rejected() {
        let req = request(vec![group("ng1", 0, 10, 6, 0)]);
        let err = plan_scale_up(&req, &up("ng1", 4)).unwrap_err();
        assert!(err.to_string().contains("below current"));
    }

    #[test]
    fn unknown_group_is_rejected() {
        let req = request(vec![group("ng1", 0, 10, 1, 0)]);
        let err = plan_scale_up(&req, &up("ng1,ng9", 3)).unwrap_err();
        assert!(err.to_string().contains("ng9"));
    }

    #[test]
    fn node_num_removes_highest_cost_nodes() {
        let mut ng2 = group("ng2", 0, 10, 4, 1);
        ng2.deleting_size = 1;
        ng2.node_ips = vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()];
        let candidates = vec![eligible("10.0.0.1", 5), eligible("10.0.0.2", 1), eligible("10.0.0.3", 9)];
        let policy = ScaleDownPolicy {
            node_group_id: "ng2".into(),
            kind: ScaleDownType::NodeNum,
            node_num: 1,
            node_ips: Vec::new(),
        };

        let picked = plan_scale_down(&ng2, &policy, &candidates, 0).unwrap();
        let ips: Vec<&str> = picked.iter().map(|n| n.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn node_num_at_or_above_current_is_a_no_op() {
        let mut ng = group("ng", 0, 10, 3, 0);
        ng.node_ips = vec!["a".into(), "b".into(), "c".into()];
        let policy = ScaleDownPolicy {
            node_group_id: "ng".into(),
            kind: ScaleDownType::NodeNum,
            node_num: 3,
            node_ips: Vec::new(),
        };
        assert!(plan_scale_down(&ng, &policy, &[eligible("a", 0)], 0).unwrap().is_empty());
    }

    #[test]
    fn node_num_below_min_is_rejected() {
        let mut ng = group("ng", 2, 10, 4, 0);
        ng.node_ips = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let candidates: Vec<EligibleNode> = ["a", "b", "c", "d"].iter().map(|ip| eligible(ip, 0)).collect();
        let policy = ScaleDownPolicy {
            node_group_id: "ng".into(),
            kind: ScaleDownType::NodeNum,
            node_num: 1,
            node_ips: Vec::new(),
        };
        assert!(plan_scale_down(&ng, &policy, &candidates, 0).is_err());
    }

    #[test]
    fn node_ips_intersect_with_eligible() {
        let ng = group("ng", 0, 10, 3, 0);
        let candidates = vec![eligible("10.0.0.1", 0), eligible("10.0.0.2", 0)];
        let policy = ScaleDownPolicy {
            node_group_id: "ng".into(),
            kind: ScaleDownType::NodeIps,
            node_num: 0,
            node_ips: vec!["10.0.0.2".into(), "10.0.0.7".into()],
        };
        let picked = plan_scale_down(&ng, &policy, &candidates, 0).unwrap();
        assert_eq!(picked, vec![eligible("10.0.0.2", 0)]);
    }

    #[test]
    fn node_ips_breaching_min_are_rejected() {
        let ng = group("ng", 2, 10, 3, 0);
        let candidates = vec![eligible("10.0.0.1", 0), eligible("10.0.0.2", 0)];
        let policy = ScaleDownPolicy {
            node_group_id: "ng".into(),
            kind: ScaleDownType::NodeIps,
            node_num: 0,
            node_ips: vec!["10.0.0.1".into(), "10.0.0.2".into()],
        };
        assert!(plan_scale_down(&ng, &policy, &candidates, 0).is_err());
    }

    #[test]
    fn earlier_picks_count_against_min() {
        let ng = group("ng", 2, 10, 4, 0);
        let candidates = vec![eligible("10.0.0.3", 0)];
        let policy = ScaleDownPolicy {
            node_group_id: "ng".into(),
            kind: ScaleDownType::NodeIps,
            node_num: 0,
            node_ips: vec!["10.0.0.3".into()],
        };
        assert_eq!(plan_scale_down(&ng, &policy, &candidates, 1).unwrap().len(), 1);
        assert!(plan_scale_down(&ng, &policy, &candidates, 2).is_err());
    }

    #[test]
    fn eligibility_skips_deleting_and_initializing_nodes() {
        let mut ready = Node::new("n1", ResourceList::cpu_memory(1000, 1 << 30));
        ready.address = Some("10.0.0.1".into());
        ready.annotations.insert(DELETION_COST_ANNOTATION.into(), "7".into());

        let mut joining = Node::new("n2", ResourceList::cpu_memory(1000, 1 << 30));
        joining.address = Some("10.0.0.2".into());
        joining.unschedulable = true;
        joining.created_at = 990;

        let mut deleting = Node::new("n3", ResourceList::cpu_memory(1000, 1 << 30));
        deleting.address = Some("10.0.0.3".into());
        deleting
            .taints
            .push(Taint::new(TO_BE_DELETED_TAINT, "", TaintEffect::NoSchedule));

        let nodes = [ready, joining, deleting];
        let found = eligible_nodes(&nodes, Duration::from_secs(60), 1000);
        assert_eq!(
            found,
            vec![EligibleNode {
                name: "n1".into(),
                ip: "10.0.0.1".into(),
                deletion_cost: 7,
            }]
        );
    }
}
