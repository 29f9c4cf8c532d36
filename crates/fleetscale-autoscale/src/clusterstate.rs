//! Cluster state registry.
//!
//! Tracks, across ticks, what the planners cannot read off a single
//! listing: scale-up requests still being provisioned, per-group backoff
//! after failed scale-ups, and how many registered nodes are unready.
//!
//! # Backoff
//!
//! ```text
//! first failure            → initial_backoff
//! failure within reset     → previous × 2, capped at max_backoff
//! no failure for reset     → entry dropped
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_core::config::ScaleUpOptions;
use fleet_core::{Node, Timestamp};
use fleetscale_cloud::CloudProvider;

/// Registered node counts for a group, or for the whole cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ready: usize,
    pub unready: usize,
}

impl Readiness {
    /// Ready plus unready nodes.
    pub fn registered(&self) -> usize {
        self.ready + self.unready
    }
}

#[derive(Debug, Clone)]
struct Backoff {
    duration: Duration,
    until: Timestamp,
    last_failure: Timestamp,
    reason: String,
}

#[derive(Debug, Clone)]
struct ScaleUpRequest {
    increase: usize,
    expected_by: Timestamp,
}

pub struct ClusterStateRegistry {
    options: ScaleUpOptions,
    backoffs: HashMap<String, Backoff>,
    requests: HashMap<String, ScaleUpRequest>,
    readiness: BTreeMap<String, Readiness>,
    total: Readiness,
    /// Group id → target minus registered nodes.
    upcoming: BTreeMap<String, usize>,
    last_scale_up: Option<Timestamp>,
}

fn secs(d: Duration) -> Timestamp {
    d.as_secs()
}

impl ClusterStateRegistry {
    /// Create an empty registry; state builds up over `recalculate` calls.
    pub fn new(options: ScaleUpOptions) -> Self {
        Self {
            options,
            backoffs: HashMap::new(),
            requests: HashMap::new(),
            readiness: BTreeMap::new(),
            total: Readiness::default(),
            upcoming: BTreeMap::new(),
            last_scale_up: None,
        }
    }

    // ── Scale-up requests ─────────────────────────────────────────

    /// Remember `delta` requested nodes so they count as upcoming until they register.
    pub fn register_scale_up(&mut self, group: &str, delta: usize, now: Timestamp) {
        let expected_by = now + secs(self.options.max_node_provision_time);
        let request = self
            .requests
            .entry(group.to_string())
            .or_insert(ScaleUpRequest {
                increase: 0,
                expected_by,
            });
        request.increase += delta;
        request.expected_by = expected_by;
        *self.upcoming.entry(group.to_string()).or_insert(0) += delta;
        self.last_scale_up = Some(now);
        info!(group, delta, "scale-up registered");
    }

    /// Put the group in backoff after a failed resize or a scale-up that
    /// never materialised.
    pub fn register_failed_scale_up(&mut self, group: &str, reason: &str, now: Timestamp) {
        let initial = self.options.initial_backoff;
        let max = self.options.max_backoff;
        let reset = secs(self.options.backoff_reset_timeout);

        let duration = match self.backoffs.get(group) {
            Some(prev) if now < prev.last_failure + reset => (prev.duration * 2).min(max),
            _ => initial,
        };
        self.backoffs.insert(
            group.to_string(),
            Backoff {
                duration,
                until: now + secs(duration),
                last_failure: now,
                reason: reason.to_string(),
            },
        );
        self.requests.remove(group);
        warn!(group, reason, backoff_secs = duration.as_secs(), "node group backed off");
    }

    /// Whether scale-up of `group` is suppressed at `now`.
    pub fn is_backed_off(&self, group: &str, now: Timestamp) -> bool {
        self.backoffs.get(group).is_some_and(|b| b.until > now)
    }

    /// Why `group` is backed off, while the backoff lasts.
    pub fn backoff_reason(&self, group: &str, now: Timestamp) -> Option<&str> {
        self.backoffs
            .get(group)
            .filter(|b| b.until > now)
            .map(|b| b.reason.as_str())
    }

    /// Length of the last backoff of `group`, kept after it expires.
    pub fn backoff_duration(&self, group: &str) -> Option<Duration> {
        self.backoffs.get(group).map(|b| b.duration)
    }

    /// When the last scale-up was registered.
    pub fn last_scale_up_time(&self) -> Option<Timestamp> {
        self.last_scale_up
    }

    // ── Recalculation ─────────────────────────────────────────────

    /// Rebuild readiness and upcoming counts from the current listing and
    /// expire stale requests and backoffs.
    pub fn recalculate(&mut self, cloud: &dyn CloudProvider, nodes: &[Node], now: Timestamp) {
        let mut readiness: BTreeMap<String, Readiness> = BTreeMap::new();
        let mut total = Readiness::default();
        for node in nodes {
            let slot = match cloud.node_group_for_node(node) {
                Ok(Some(group)) => Some(readiness.entry(group.id().to_string()).or_default()),
                Ok(None) => None,
                Err(e) => {
                    warn!(node = %node.name, error = %e, "cannot resolve node group");
                    None
                }
            };
            for r in [Some(&mut total), slot].into_iter().flatten() {
                if node.ready {
                    r.ready += 1;
                } else {
                    r.unready += 1;
                }
            }
        }

        let mut upcoming = BTreeMap::new();
        let mut timed_out = Vec::new();
        for group in cloud.node_groups() {
            let id = group.id().to_string();
            let target = match group.target_size() {
                Ok(t) => t,
                Err(e) => {
                    warn!(group = %id, error = %e, "cannot read target size");
                    continue;
                }
            };
            let registered = readiness.get(&id).map_or(0, Readiness::registered);
            let pending = target.saturating_sub(registered);
            upcoming.insert(id.clone(), pending);

            if let Some(request) = self.requests.get(&id) {
                if pending == 0 {
                    debug!(group = %id, increase = request.increase, "scale-up fulfilled");
                    self.requests.remove(&id);
                } else if now > request.expected_by {
                    timed_out.push(id);
                }
            }
        }
        for id in timed_out {
            self.register_failed_scale_up(&id, "node provisioning timed out", now);
        }

        let reset = secs(self.options.backoff_reset_timeout);
        self.backoffs.retain(|_, b| now < b.last_failure + reset);

        self.readiness = readiness;
        self.total = total;
        self.upcoming = upcoming;
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Requested but unregistered nodes per group.
    pub fn upcoming_nodes(&self) -> &BTreeMap<String, usize> {
        &self.upcoming
    }

    /// Requested nodes of `group` not registered yet.
    pub fn upcoming_for(&self, group: &str) -> usize {
        self.upcoming.get(group).copied().unwrap_or(0)
    }

    /// Requested but unregistered nodes across all groups.
    pub fn total_upcoming(&self) -> usize {
        self.upcoming.values().sum()
    }

    /// Readiness counts of `group` as of the last `recalculate`.
    pub fn readiness(&self, group: &str) -> Option<Readiness> {
        self.readiness.get(group).copied()
    }

    /// Readiness counts across all nodes.
    pub fn total_readiness(&self) -> Readiness {
        self.total
    }

    fn healthy(&self, r: &Readiness) -> bool {
        r.unready <= self.options.ok_total_unready_count as usize
            || (r.unready as f64) * 100.0
                <= self.options.max_total_unready_percentage * r.registered() as f64
    }

    /// Unready nodes stay within the configured count or percentage.
    pub fn is_cluster_healthy(&self) -> bool {
        self.healthy(&self.total)
    }

    /// Unready nodes of `group` stay within the configured thresholds.
    pub fn is_node_group_healthy(&self, group: &str) -> bool {
        self.readiness.get(group).is_none_or(|r| self.healthy(r))
    }

    /// Healthy and not backed off.
    pub fn is_node_group_safe_to_scale_up(&self, group: &str, now: Timestamp) -> bool {
        self.is_node_group_healthy(group) && !self.is_backed_off(group, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{NodeInfo, ResourceLimits, ResourceList};
    use fleetscale_cloud::{TestCloudProvider, TestNodeGroup};

    fn options() -> ScaleUpOptions {
        ScaleUpOptions {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            backoff_reset_timeout: Duration::from_secs(3600),
            max_node_provision_time: Duration::from_secs(600),
            ok_total_unready_count: 1,
            max_total_unready_percentage: 40.0,
            ..ScaleUpOptions::default()
        }
    }

    fn provider(target: usize, registered: &[(&str, bool)]) -> (TestCloudProvider, Vec<Node>) {
        let cloud = TestCloudProvider::new(ResourceLimits::new());
        let template = NodeInfo::new(Node::new("t", ResourceList::cpu_memory(1000, 1000)));
        cloud.add_node_group(TestNodeGroup::new("ng1", 0, 10, target, template));
        let nodes: Vec<Node> = registered
            .iter()
            .map(|(name, ready)| {
                let mut n = Node::new(name, ResourceList::cpu_memory(1000, 1000));
                n.ready = *ready;
                n
            })
            .collect();
        for n in &nodes {
            cloud.add_node("ng1", n).unwrap();
        }
        (cloud, nodes)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut reg = ClusterStateRegistry::new(options());
        reg.register_failed_scale_up("ng1", "quota", 1000);
        assert!(reg.is_backed_off("ng1", 1059));
        assert!(!reg.is_backed_off("ng1", 1060));

        for i in 1..=5 {
            reg.register_failed_scale_up("ng1", "quota", 1000 + i);
        }
        assert_eq!(reg.backoff_duration("ng1"), Some(Duration::from_secs(300)));
        assert_eq!(reg.backoff_reason("ng1", 1010), Some("quota"));
    }

    #[test]
    fn backoff_resets_after_quiet_period() {
        let mut reg = ClusterStateRegistry::new(options());
        reg.register_failed_scale_up("ng1", "quota", 1000);
        reg.register_failed_scale_up("ng1", "quota", 1001);
        assert_eq!(reg.backoff_duration("ng1"), Some(Duration::from_secs(120)));

        reg.register_failed_scale_up("ng1", "quota", 1001 + 3600);
        assert_eq!(reg.backoff_duration("ng1"), Some(Duration::from_secs(60)));
    }

    #[test]
    fn upcoming_is_target_minus_registered() {
        let (cloud, nodes) = provider(3, &[("n1", true)]);
        let mut reg = ClusterStateRegistry::new(options());
        reg.recalculate(&cloud, &nodes, 1000);
        assert_eq!(reg.upcoming_for("ng1"), 2);
        assert_eq!(reg.total_upcoming(), 2);
    }

    #[test]
    fn unfulfilled_scale_up_backs_off_after_provision_time() {
        let (cloud, nodes) = provider(3, &[("n1", true)]);
        let mut reg = ClusterStateRegistry::new(options());
        reg.register_scale_up("ng1", 2, 1000);
        assert_eq!(reg.last_scale_up_time(), Some(1000));

        reg.recalculate(&cloud, &nodes, 1500);
        assert!(!reg.is_backed_off("ng1", 1500));

        reg.recalculate(&cloud, &nodes, 1601);
        assert!(reg.is_backed_off("ng1", 1601));
        assert!(!reg.is_node_group_safe_to_scale_up("ng1", 1601));
    }

    #[test]
    fn health_from_unready_ratio() {
        let (cloud, nodes) = provider(
            4,
            &[("n1", true), ("n2", false), ("n3", false), ("n4", true)],
        );
        let mut reg = ClusterStateRegistry::new(options());
        reg.recalculate(&cloud, &nodes, 1000);
        // 2 of 4 unready: above the ok count and above 40%.
        assert!(!reg.is_node_group_healthy("ng1"));
        assert!(!reg.is_cluster_healthy());
        assert!(reg.is_node_group_healthy("unknown"));
        assert_eq!(reg.readiness("ng1").unwrap().registered(), 4);
    }
}
