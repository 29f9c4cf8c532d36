//! Full ticks against the fake cluster API and the in-memory provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use fleet_core::{
    AutoscalerResult, AutoscalingOptions, DELETION_CANDIDATE_TAINT, ErrorKind, Node, NodeInfo, OwnerReference, Pod,
    ResourceList, Timestamp,
};
use fleetscale_autoscale::{
    AutoscalingContext, DecisionOutcome, DecisionSource, ScaleDownResult, ScaleUpResult, StaticAutoscaler, Tick,
};
use fleetscale_cloud::{FakeClusterApi, TestCloudProvider, TestNodeGroup};
use fleetscale_simulator::{ClusterSnapshot, Estimator, SnapshotError, SnapshotResult};

const NOW: Timestamp = 50_000;

fn node(name: &str) -> Node {
    Node::new(name, ResourceList::cpu_memory(1000, 4 << 30))
}

fn pod(name: &str, cpu: i64, node: Option<&str>) -> Pod {
    let mut pod = Pod::new("default", name, ResourceList::cpu_memory(cpu, 1 << 20));
    pod.owner = Some(OwnerReference {
        kind: "ReplicaSet".into(),
        name: "web".into(),
        uid: "rs-web".into(),
    });
    pod.node_name = node.map(str::to_string);
    pod
}

struct Cluster {
    api: Arc<FakeClusterApi>,
    cloud: Arc<TestCloudProvider>,
    group: Arc<TestNodeGroup>,
}

fn cluster(options: &AutoscalingOptions, min: usize, nodes: &[Node], pods: &[Pod]) -> Cluster {
    let api = Arc::new(FakeClusterApi::new());
    let cloud = Arc::new(TestCloudProvider::new(options.resource_limits()));
    let group = cloud.add_node_group(TestNodeGroup::new(
        "ng1",
        min,
        5,
        nodes.len(),
        NodeInfo::new(node("template")),
    ));
    for n in nodes {
        cloud.add_node("ng1", n).unwrap();
        api.upsert_node(n.clone());
    }
    for p in pods {
        api.upsert_pod(p.clone());
    }
    Cluster { api, cloud, group }
}

fn autoscaler(options: AutoscalingOptions, c: &Cluster) -> StaticAutoscaler {
    let ctx = AutoscalingContext::new(options, c.cloud.clone(), c.api.clone());
    StaticAutoscaler::new(Arc::new(ctx))
}

#[tokio::test]
async fn pending_pod_scales_up_and_skips_scale_down() {
    let options = AutoscalingOptions::default();
    let c = cluster(
        &options,
        0,
        &[node("n1")],
        &[pod("busy", 900, Some("n1")), pod("pending", 500, None)],
    );
    let mut autoscaler = autoscaler(options, &c);

    let status = autoscaler.run_once(NOW).await.unwrap();
    let up = status.scale_up.unwrap();
    assert_eq!(up.result, ScaleUpResult::Successful);
    assert!(status.scale_down.is_none());
    assert_eq!(c.group.increases(), vec![1]);
}

#[tokio::test]
async fn scale_down_waits_out_delay_after_add() {
    let options = AutoscalingOptions::default();
    let c = cluster(
        &options,
        0,
        &[node("n1")],
        &[pod("busy", 900, Some("n1")), pod("pending", 500, None)],
    );
    let mut autoscaler = autoscaler(options, &c);
    autoscaler.run_once(NOW).await.unwrap();

    c.api.remove_pod("default/pending");
    let status = autoscaler.run_once(NOW + 10).await.unwrap();
    assert_eq!(status.scale_up.unwrap().result, ScaleUpResult::NotNeeded);
    assert_eq!(status.scale_down.unwrap().result, ScaleDownResult::InCooldown);
}

#[tokio::test]
async fn empty_node_is_removed_once_unneeded_long_enough() {
    let mut options = AutoscalingOptions::default();
    options.scale_down.unneeded_time = Duration::from_secs(60);
    let c = cluster(
        &options,
        1,
        &[node("n1"), node("n2")],
        &[pod("busy", 600, Some("n1"))],
    );
    let mut autoscaler = autoscaler(options, &c);

    let first = autoscaler.run_once(NOW).await.unwrap();
    assert_eq!(first.scale_down.unwrap().result, ScaleDownResult::NoNodeDeleted);
    assert!(autoscaler.scale_down_planner().is_unneeded("n2"));
    assert!(c.api.node("n2").unwrap().has_taint(DELETION_CANDIDATE_TAINT));

    let second = autoscaler.run_once(NOW + 61).await.unwrap();
    let down = second.scale_down.unwrap();
    assert_eq!(down.result, ScaleDownResult::NodeDeleteStarted);
    assert_eq!(down.scaled_down.len(), 1);
    assert!(down.scaled_down[0].empty);

    autoscaler.actuator().wait_for_deletions().await;
    assert_eq!(c.group.deleted(), vec!["n2".to_string()]);

    let third = autoscaler.run_once(NOW + 70).await.unwrap();
    assert!(third.deletion_results["n2"].is_success());
}

#[tokio::test]
async fn listing_failure_aborts_tick() {
    let options = AutoscalingOptions::default();
    let c = cluster(&options, 0, &[node("n1")], &[]);
    c.api.set_fail_listing(true);
    let mut autoscaler = autoscaler(options, &c);

    let err = autoscaler.run_once(NOW).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ApiCall);
}

#[tokio::test]
async fn real_node_named_like_the_template_does_not_block_scale_up() {
    let options = AutoscalingOptions::default();
    let c = cluster(
        &options,
        0,
        &[node("template-node-for-ng1")],
        &[pod("busy", 900, Some("template-node-for-ng1")), pod("pending", 500, None)],
    );
    let mut autoscaler = autoscaler(options, &c);

    let up = autoscaler.run_once(NOW).await.unwrap().scale_up.unwrap();
    assert_eq!(up.result, ScaleUpResult::Successful);
    assert_eq!(c.group.increases(), vec![1]);
}

struct BrokenEstimator;

impl Estimator for BrokenEstimator {
    fn estimate(&self, _pods: &[Pod], _template: &NodeInfo, _snapshot: &mut ClusterSnapshot) -> SnapshotResult<usize> {
        Err(SnapshotError::NotForked)
    }
}

#[tokio::test]
async fn internal_scale_up_error_resets_unneeded_nodes() {
    let mut options = AutoscalingOptions::default();
    options.scale_down.unneeded_time = Duration::from_secs(60);
    let api = Arc::new(FakeClusterApi::new());
    let cloud = Arc::new(TestCloudProvider::new(options.resource_limits()));
    let mut template = node("template");
    template.labels.insert("pool".into(), "big".into());
    cloud.add_node_group(TestNodeGroup::new("ng1", 1, 5, 2, NodeInfo::new(template)));
    for n in [node("n1"), node("n2")] {
        cloud.add_node("ng1", &n).unwrap();
        api.upsert_node(n);
    }
    api.upsert_pod(pod("busy", 600, Some("n1")));

    let ctx = AutoscalingContext::new(options, cloud.clone(), api.clone()).with_estimator(Arc::new(BrokenEstimator));
    let mut autoscaler = StaticAutoscaler::new(Arc::new(ctx));

    autoscaler.run_once(NOW).await.unwrap();
    assert!(autoscaler.scale_down_planner().is_unneeded("n2"));

    let mut pinned = pod("pinned", 500, None);
    pinned.spec.node_selector.insert("pool".into(), "big".into());
    api.upsert_pod(pinned);

    let err = autoscaler.run_once(NOW + 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(autoscaler.scale_down_planner().unneeded_nodes().next().is_none());
}

struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl DecisionSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn decide(&self, tick: &mut Tick<'_>) -> AutoscalerResult<DecisionOutcome> {
        assert_eq!(tick.nodes.len(), 1);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DecisionOutcome::default())
    }
}

#[tokio::test]
async fn decision_source_replaces_planners() {
    let options = AutoscalingOptions::default();
    let c = cluster(
        &options,
        0,
        &[node("n1")],
        &[pod("busy", 900, Some("n1")), pod("pending", 500, None)],
    );
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
    });
    let mut autoscaler = autoscaler(options, &c).with_decision_source(Box::new(ForwardingSource(source.clone())));

    let status = autoscaler.run_once(NOW).await.unwrap();
    assert_eq!(status.source.as_deref(), Some("counting"));
    assert!(status.scale_up.is_none());
    assert!(c.group.increases().is_empty());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

struct ForwardingSource(Arc<CountingSource>);

#[async_trait]
impl DecisionSource for ForwardingSource {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn decide(&self, tick: &mut Tick<'_>) -> AutoscalerResult<DecisionOutcome> {
        self.0.decide(tick).await
    }
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let mut options = AutoscalingOptions::default();
    options.scan_interval = Duration::from_millis(10);
    let c = cluster(&options, 0, &[node("n1")], &[]);
    let mut autoscaler = autoscaler(options, &c);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { autoscaler.run(rx).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
