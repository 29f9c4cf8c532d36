//! Node drain.
//!
//! ```text
//! cordon ─▶ evict every pod concurrently (retry until accepted,
//!           not found, or max_pod_eviction_time)
//!        ─▶ evict daemonset pods (best effort, short timeout)
//!        ─▶ poll until evicted pods are gone (max grace + headroom)
//! ```
//!
//! The caller owns rollback: a failed drain leaves the node cordoned and
//! tainted, and the actuator undoes both.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

use fleet_core::Pod;
use fleet_core::config::ScaleDownOptions;
use fleetscale_cloud::ClusterApi;

use crate::status::PodEvictionResult;

/// Grace period applied when a pod does not set one.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DrainError {
    #[error("failed to cordon node {node}: {reason}")]
    Cordon { node: String, reason: String },

    #[error("failed to evict {} pod(s) from node {node}", .failed.len())]
    Eviction { node: String, failed: Vec<String> },

    #[error("pods still on node {node} after eviction: {}", .pods.join(", "))]
    PodsNotGone { node: String, pods: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct DrainResult {
    /// Pod key → eviction outcome.
    pub evictions: BTreeMap<String, PodEvictionResult>,
    pub error: Option<DrainError>,
}

impl DrainResult {
    /// Every movable pod was evicted and is gone.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// `min(pod grace period, cap)`.
pub fn grace_period(pod: &Pod, cap: Duration) -> Duration {
    pod.spec
        .termination_grace_period_secs
        .map_or(DEFAULT_GRACE_PERIOD, Duration::from_secs)
        .min(cap)
}

async fn evict_with_retry(
    api: Arc<dyn ClusterApi>,
    pod: Pod,
    grace: Duration,
    retry_interval: Duration,
    deadline: Instant,
) -> PodEvictionResult {
    let key = pod.key();
    let mut last_error = None;
    loop {
        match api.evict_pod(&pod, grace).await {
            Ok(()) => return PodEvictionResult::ok(&key),
            Err(e) if e.is_not_found() => return PodEvictionResult::ok(&key),
            Err(e) => {
                debug!(pod = %key, error = %e, "eviction refused, retrying");
                last_error = Some(e.to_string());
            }
        }
        if Instant::now() + retry_interval >= deadline {
            return PodEvictionResult {
                pod: key,
                timed_out: true,
                error: last_error,
            };
        }
        sleep(retry_interval).await;
    }
}

/// Evict `pods` concurrently, one task per pod, under a shared deadline.
pub async fn evict_pods(
    api: &Arc<dyn ClusterApi>,
    options: &ScaleDownOptions,
    pods: &[Pod],
) -> BTreeMap<String, PodEvictionResult> {
    let deadline = Instant::now() + options.max_pod_eviction_time;
    let mut tasks = JoinSet::new();
    for pod in pods {
        let api = api.clone();
        let pod = pod.clone();
        let grace = grace_period(&pod, options.max_graceful_termination);
        let retry = options.eviction_retry_interval;
        tasks.spawn(async move {
            let key = pod.key();
            match timeout_at(deadline, evict_with_retry(api, pod, grace, retry, deadline)).await {
                Ok(result) => result,
                Err(_) => PodEvictionResult {
                    pod: key,
                    timed_out: true,
                    error: Some("eviction deadline exceeded".to_string()),
                },
            }
        });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                results.insert(result.pod.clone(), result);
            }
            Err(e) => warn!(error = %e, "eviction task panicked"),
        }
    }
    // A panicked task leaves its pod without an entry.
    for pod in pods {
        results.entry(pod.key()).or_insert_with(|| PodEvictionResult {
            pod: pod.key(),
            timed_out: false,
            error: Some("eviction task aborted".to_string()),
        });
    }
    results
}

/// One eviction attempt per daemonset pod, bounded by the daemonset
/// eviction timeout. Failures are only logged.
pub async fn evict_daemonset_pods(api: &Arc<dyn ClusterApi>, options: &ScaleDownOptions, node: &str, pods: &[Pod]) {
    if pods.is_empty() {
        return;
    }
    let mut tasks = JoinSet::new();
    for pod in pods {
        let api = api.clone();
        let pod = pod.clone();
        let grace = grace_period(&pod, options.max_graceful_termination);
        let limit = options.daemonset_eviction_timeout;
        tasks.spawn(async move {
            let outcome = timeout(limit, api.evict_pod(&pod, grace)).await;
            (pod.key(), outcome)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Ok(())))) => {}
            Ok((key, Ok(Err(e)))) if !e.is_not_found() => {
                warn!(node, pod = %key, error = %e, "daemonset pod eviction failed");
            }
            Ok((key, Err(_))) => warn!(node, pod = %key, "daemonset pod eviction timed out"),
            Ok(_) => {}
            Err(e) => warn!(node, error = %e, "daemonset eviction task panicked"),
        }
    }
}

async fn wait_for_pods_gone(
    api: &Arc<dyn ClusterApi>,
    options: &ScaleDownOptions,
    node: &str,
    pods: &[Pod],
) -> Result<(), DrainError> {
    let keys: BTreeSet<String> = pods.iter().map(Pod::key).collect();
    let max_grace = pods
        .iter()
        .map(|p| grace_period(p, options.max_graceful_termination))
        .max()
        .unwrap_or_default();
    let deadline = Instant::now() + max_grace + options.pod_eviction_headroom;

    loop {
        let remaining = match api.pods_on_node(node).await {
            Ok(current) => current
                .iter()
                .map(Pod::key)
                .filter(|k| keys.contains(k))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(node, error = %e, "cannot list pods while waiting for drain");
                keys.iter().cloned().collect()
            }
        };
        if remaining.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DrainError::PodsNotGone {
                node: node.to_string(),
                pods: remaining,
            });
        }
        sleep(options.drain_poll_interval).await;
    }
}

/// Cordon `node`, evict `pods`, then `daemonset_pods`, and wait for the
/// evicted pods to disappear.
pub async fn drain_node(
    api: &Arc<dyn ClusterApi>,
    options: &ScaleDownOptions,
    node: &str,
    pods: &[Pod],
    daemonset_pods: &[Pod],
) -> DrainResult {
    if let Err(e) = api.set_unschedulable(node, true).await {
        return DrainResult {
            evictions: BTreeMap::new(),
            error: Some(DrainError::Cordon {
                node: node.to_string(),
                reason: e.to_string(),
            }),
        };
    }

    let evictions = evict_pods(api, options, pods).await;
    let failed: Vec<String> = evictions
        .values()
        .filter(|r| !r.was_successful())
        .map(|r| r.pod.clone())
        .collect();
    if !failed.is_empty() {
        warn!(node, failed = failed.len(), "pod evictions failed");
        return DrainResult {
            evictions,
            error: Some(DrainError::Eviction {
                node: node.to_string(),
                failed,
            }),
        };
    }

    evict_daemonset_pods(api, options, node, daemonset_pods).await;

    let error = wait_for_pods_gone(api, options, node, pods).await.err();
    if error.is_none() {
        info!(node, pods = pods.len(), "node drained");
    }
    DrainResult { evictions, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Node, OwnerReference, ResourceList};
    use fleetscale_cloud::{EvictionBehavior, FakeClusterApi};

    fn options() -> ScaleDownOptions {
        ScaleDownOptions {
            max_graceful_termination: Duration::ZERO,
            max_pod_eviction_time: Duration::from_millis(200),
            eviction_retry_interval: Duration::from_millis(10),
            pod_eviction_headroom: Duration::from_millis(100),
            drain_poll_interval: Duration::from_millis(10),
            daemonset_eviction_timeout: Duration::from_millis(50),
            ..ScaleDownOptions::default()
        }
    }

    fn setup(pods: &[&str]) -> (Arc<FakeClusterApi>, Vec<Pod>) {
        let api = Arc::new(FakeClusterApi::new());
        api.upsert_node(Node::new("n1", ResourceList::cpu_memory(1000, 1000)));
        let pods: Vec<Pod> = pods
            .iter()
            .map(|name| {
                let mut pod = Pod::new("default", name, ResourceList::cpu_memory(100, 100));
                pod.node_name = Some("n1".into());
                pod.owner = Some(OwnerReference {
                    kind: "ReplicaSet".into(),
                    name: "rs".into(),
                    uid: "rs-1".into(),
                });
                api.upsert_pod(pod.clone());
                pod
            })
            .collect();
        (api, pods)
    }

    #[test]
    fn grace_is_capped() {
        let mut pod = Pod::new("default", "p", ResourceList::new());
        assert_eq!(grace_period(&pod, Duration::from_secs(600)), DEFAULT_GRACE_PERIOD);
        pod.spec.termination_grace_period_secs = Some(120);
        assert_eq!(grace_period(&pod, Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(grace_period(&pod, Duration::from_secs(600)), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn drains_and_cordons() {
        let (api, pods) = setup(&["a", "b"]);
        api.set_eviction_behavior("default/b", EvictionBehavior::RefuseTimes(2));
        let dyn_api: Arc<dyn ClusterApi> = api.clone();

        let result = drain_node(&dyn_api, &options(), "n1", &pods, &[]).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(api.node("n1").unwrap().unschedulable);
        assert_eq!(api.eviction_attempts("default/b"), 3);
        assert!(result.evictions.values().all(PodEvictionResult::was_successful));
    }

    #[tokio::test]
    async fn missing_pod_counts_as_evicted() {
        let (api, pods) = setup(&["a"]);
        api.remove_pod("default/a");
        let dyn_api: Arc<dyn ClusterApi> = api.clone();
        let result = drain_node(&dyn_api, &options(), "n1", &pods, &[]).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn refused_eviction_times_out() {
        let (api, pods) = setup(&["a", "b"]);
        api.set_eviction_behavior("default/a", EvictionBehavior::Refuse);
        let dyn_api: Arc<dyn ClusterApi> = api.clone();

        let result = drain_node(&dyn_api, &options(), "n1", &pods, &[]).await;
        match result.error {
            Some(DrainError::Eviction { failed, .. }) => assert_eq!(failed, vec!["default/a".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(result.evictions["default/a"].timed_out);
        assert!(result.evictions["default/b"].was_successful());
    }

    #[tokio::test]
    async fn lingering_pod_fails_wait() {
        let (api, pods) = setup(&["a"]);
        api.set_eviction_behavior("default/a", EvictionBehavior::Linger);
        let dyn_api: Arc<dyn ClusterApi> = api.clone();

        let result = drain_node(&dyn_api, &options(), "n1", &pods, &[]).await;
        assert!(matches!(result.error, Some(DrainError::PodsNotGone { .. })));
    }

    #[tokio::test]
    async fn daemonset_failures_do_not_fail_drain() {
        let (api, pods) = setup(&["a", "ds"]);
        api.set_eviction_behavior("default/ds", EvictionBehavior::Fail);
        let dyn_api: Arc<dyn ClusterApi> = api.clone();

        let result = drain_node(&dyn_api, &options(), "n1", &pods[..1], &pods[1..]).await;
        assert!(result.is_success());
        assert_eq!(api.eviction_attempts("default/ds"), 1);
    }

    #[tokio::test]
    async fn cordon_failure_stops_drain() {
        let (api, pods) = setup(&["a"]);
        api.fail_taints_on("n1");
        let dyn_api: Arc<dyn ClusterApi> = api.clone();

        let result = drain_node(&dyn_api, &options(), "n1", &pods, &[]).await;
        assert!(matches!(result.error, Some(DrainError::Cordon { .. })));
        assert_eq!(api.eviction_attempts("default/a"), 0);
    }
}
