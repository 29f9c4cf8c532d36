//! Full ticks with the webhook as the decision source.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use fleet_core::config::WebhookOptions;
use fleet_core::{
    AutoscalingOptions, DELETION_COST_ANNOTATION, ErrorKind, Node, NodeInfo, OwnerReference, Pod, PodPhase,
    ResourceList, TO_BE_DELETED_TAINT, Taint, TaintEffect, Timestamp,
};
use fleetscale_autoscale::{AutoscalingContext, ScaleDownResult, ScaleUpResult, StaticAutoscaler};
use fleetscale_cloud::{FakeClusterApi, TestCloudProvider, TestNodeGroup};
use fleetscale_simulator::UnremovableReason;
use fleetscale_webhook::{
    DecisionSink, ScaleDownPolicy, ScaleDownType, ScaleUpPolicy, WebhookDecisionSource, WebhookRequest,
    WebhookResponse, WebhookResult,
};

const NOW: Timestamp = 80_000;

type Responder = Box<dyn Fn(&WebhookRequest) -> WebhookResponse + Send + Sync>;

/// Answers every exchange with `respond` and keeps the requests.
struct ScriptedSink {
    respond: Responder,
    seen: Mutex<Vec<WebhookRequest>>,
}

impl ScriptedSink {
    fn new(respond: impl Fn(&WebhookRequest) -> WebhookResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn last_request(&self) -> WebhookRequest {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl DecisionSink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn exchange(&self, request: &WebhookRequest) -> WebhookResult<WebhookResponse> {
        self.seen.lock().unwrap().push(request.clone());
        Ok((self.respond)(request))
    }
}

fn node(name: &str, ip: &str) -> Node {
    let mut n = Node::new(name, ResourceList::cpu_memory(1000, 4 << 30));
    n.address = Some(ip.to_string());
    n
}

struct Cluster {
    api: Arc<FakeClusterApi>,
    cloud: Arc<TestCloudProvider>,
}

impl Cluster {
    fn new(options: &AutoscalingOptions) -> Self {
        Self {
            api: Arc::new(FakeClusterApi::new()),
            cloud: Arc::new(TestCloudProvider::new(options.resource_limits())),
        }
    }

    fn group(&self, id: &str, min: usize, max: usize, nodes: &[Node]) -> Arc<TestNodeGroup> {
        let group = self.cloud.add_node_group(TestNodeGroup::new(
            id,
            min,
            max,
            nodes.len(),
            NodeInfo::new(node("template", "")),
        ));
        for n in nodes {
            self.cloud.add_node(id, n).unwrap();
            self.api.upsert_node(n.clone());
        }
        group
    }
}

fn options(priorities: &[(&str, i32)]) -> AutoscalingOptions {
    let mut options = AutoscalingOptions::default();
    options.webhook = Some(WebhookOptions {
        priorities: priorities.iter().map(|(id, p)| (id.to_string(), *p)).collect(),
        ..WebhookOptions::default()
    });
    options
}

fn autoscaler(options: AutoscalingOptions, cluster: &Cluster, sink: Arc<ScriptedSink>) -> StaticAutoscaler {
    let webhook = options.webhook.clone().unwrap_or_default();
    let ctx = AutoscalingContext::new(options, cluster.cloud.clone(), cluster.api.clone());
    StaticAutoscaler::new(Arc::new(ctx)).with_decision_source(Box::new(WebhookDecisionSource::new(webhook, sink)))
}

fn node_ips(ips: &[&str]) -> ScaleDownPolicy {
    ScaleDownPolicy {
        node_group_id: "ng1".into(),
        kind: ScaleDownType::NodeIps,
        node_num: 0,
        node_ips: ips.iter().map(|ip| ip.to_string()).collect(),
    }
}

fn replicated_pod(name: &str, node: &str) -> Pod {
    let mut pod = Pod::new("default", name, ResourceList::cpu_memory(100, 1 << 20));
    pod.owner = Some(OwnerReference {
        kind: "ReplicaSet".into(),
        name: "web".into(),
        uid: "rs-web".into(),
    });
    pod.node_name = Some(node.to_string());
    pod.phase = PodPhase::Running;
    pod
}

fn members(prefix: &str, count: usize) -> Vec<Node> {
    (1..=count)
        .map(|i| node(&format!("{prefix}-{i}"), &format!("10.{}.0.{i}", prefix.len())))
        .collect()
}

#[tokio::test]
async fn combined_scale_up_fills_by_priority() {
    let options = options(&[("ng1", 2), ("ng2", 1)]);
    let cluster = Cluster::new(&options);
    let ng1 = cluster.group("ng1", 1, 10, &members("a", 1));
    let ng2 = cluster.group("ng2", 0, 10, &members("bb", 4));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: vec![ScaleUpPolicy {
            node_group_id: "ng1,ng2".into(),
            desired_size: 15,
        }],
        scale_downs: Vec::new(),
    });
    let mut autoscaler = autoscaler(options, &cluster, sink.clone());

    let status = autoscaler.run_once(NOW).await.unwrap();
    assert_eq!(status.source.as_deref(), Some("webhook"));
    assert_eq!(status.scale_up.unwrap().result, ScaleUpResult::Successful);
    assert_eq!(ng1.increases(), vec![9]);
    assert_eq!(ng2.increases(), vec![1]);

    let sent = sink.last_request();
    let state = &sent.node_groups["ng2"];
    assert_eq!(state.desired_size, 4);
    assert_eq!(state.node_ips.len(), 4);
    assert_eq!(state.priority, 1);
    assert_eq!(state.node_template.cpu, 1000);
}

#[tokio::test]
async fn rejected_scale_up_is_reported_and_not_executed() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    let ng1 = cluster.group("ng1", 1, 10, &members("a", 2));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: vec![ScaleUpPolicy {
            node_group_id: "ng1".into(),
            desired_size: 0,
        }],
        scale_downs: Vec::new(),
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let up = autoscaler.run_once(NOW).await.unwrap().scale_up.unwrap();
    assert_eq!(up.result, ScaleUpResult::Error);
    assert_eq!(up.failed.len(), 1);
    assert_eq!(up.failed[0].0, "ng1");
    assert!(ng1.increases().is_empty());
}

#[tokio::test]
async fn node_num_removes_highest_cost_members() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    let mut nodes = members("bb", 4);
    for (node, cost) in nodes.iter_mut().zip(["5", "1", "9", "0"]) {
        node.annotations.insert(DELETION_COST_ANNOTATION.into(), cost.into());
    }
    nodes[3]
        .taints
        .push(Taint::new(TO_BE_DELETED_TAINT, "", TaintEffect::NoSchedule));
    let ng2 = cluster.group("ng2", 0, 10, &nodes);

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: Vec::new(),
        scale_downs: vec![ScaleDownPolicy {
            node_group_id: "ng2".into(),
            kind: ScaleDownType::NodeNum,
            node_num: 1,
            node_ips: Vec::new(),
        }],
    });
    let mut autoscaler = autoscaler(options, &cluster, sink.clone());
    autoscaler.tracker().start_deletion("ng2");

    let down = autoscaler.run_once(NOW).await.unwrap().scale_down.unwrap();
    assert_eq!(down.result, ScaleDownResult::NodeDeleteStarted);
    assert_eq!(sink.last_request().node_groups["ng2"].deleting_size, 1);

    autoscaler.actuator().wait_for_deletions().await;
    let mut deleted = ng2.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["bb-1".to_string(), "bb-3".to_string()]);
}

#[tokio::test]
async fn node_ips_skip_initializing_nodes() {
    let mut options = options(&[]);
    if let Some(webhook) = options.webhook.as_mut() {
        webhook.initializing_grace = std::time::Duration::from_secs(300);
    }
    let cluster = Cluster::new(&options);
    let mut nodes = members("a", 3);
    nodes[0].unschedulable = true;
    nodes[0].created_at = NOW - 30;
    let ng1 = cluster.group("ng1", 0, 10, &nodes);
    let ips: Vec<String> = nodes.iter().take(2).filter_map(|n| n.address.clone()).collect();

    let sink = ScriptedSink::new(move |req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: Vec::new(),
        scale_downs: vec![ScaleDownPolicy {
            node_group_id: "ng1".into(),
            kind: ScaleDownType::NodeIps,
            node_num: 0,
            node_ips: ips.clone(),
        }],
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let down = autoscaler.run_once(NOW).await.unwrap().scale_down.unwrap();
    assert_eq!(down.scaled_down.len(), 1);
    assert_eq!(down.scaled_down[0].node, "a-2");

    autoscaler.actuator().wait_for_deletions().await;
    assert_eq!(ng1.deleted(), vec!["a-2".to_string()]);
}

#[tokio::test]
async fn mismatched_uid_fails_the_tick() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    let ng1 = cluster.group("ng1", 0, 10, &members("a", 1));

    let sink = ScriptedSink::new(|_| WebhookResponse {
        uid: "someone-else".into(),
        scale_ups: vec![ScaleUpPolicy {
            node_group_id: "ng1".into(),
            desired_size: 3,
        }],
        scale_downs: Vec::new(),
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let err = autoscaler.run_once(NOW).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ApiCall);
    assert!(ng1.increases().is_empty());
}

#[tokio::test]
async fn empty_response_changes_nothing() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    cluster.group("ng1", 0, 10, &members("a", 2));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        ..WebhookResponse::default()
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let status = autoscaler.run_once(NOW).await.unwrap();
    assert_eq!(status.scale_up.unwrap().result, ScaleUpResult::NotNeeded);
    assert_eq!(status.scale_down.unwrap().result, ScaleDownResult::NoUnneeded);
}

#[tokio::test]
async fn policies_for_one_group_share_the_min_size() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    let ng1 = cluster.group("ng1", 2, 10, &members("a", 4));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: Vec::new(),
        scale_downs: vec![node_ips(&["10.1.0.1"]), node_ips(&["10.1.0.2"]), node_ips(&["10.1.0.3"])],
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let down = autoscaler.run_once(NOW).await.unwrap().scale_down.unwrap();
    assert_eq!(down.scaled_down.len(), 2);
    assert_eq!(down.error.unwrap().kind(), ErrorKind::Transient);

    autoscaler.actuator().wait_for_deletions().await;
    let mut deleted = ng1.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["a-1".to_string(), "a-2".to_string()]);
}

#[tokio::test]
async fn overlapping_policies_never_pick_a_node_twice() {
    let options = options(&[]);
    let cluster = Cluster::new(&options);
    let ng1 = cluster.group("ng1", 0, 10, &members("a", 4));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: Vec::new(),
        scale_downs: vec![
            node_ips(&["10.1.0.1"]),
            ScaleDownPolicy {
                node_group_id: "ng1".into(),
                kind: ScaleDownType::NodeNum,
                node_num: 2,
                node_ips: Vec::new(),
            },
        ],
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let down = autoscaler.run_once(NOW).await.unwrap().scale_down.unwrap();
    let mut names: Vec<&str> = down.scaled_down.iter().map(|n| n.node.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["a-1", "a-4"]);
    assert!(down.error.is_none());

    autoscaler.actuator().wait_for_deletions().await;
    assert_eq!(ng1.deleted().len(), 2);
}

#[tokio::test]
async fn deferred_drains_are_reported_and_keep_their_floor() {
    let mut options = options(&[]);
    options.cores_total.min = 1;
    let cluster = Cluster::new(&options);
    let nodes = members("a", 3);
    cluster.group("ng1", 0, 10, &nodes);
    cluster.api.upsert_pod(replicated_pod("web-1", "a-1"));
    cluster.api.upsert_pod(replicated_pod("web-2", "a-2"));

    let sink = ScriptedSink::new(|req| WebhookResponse {
        uid: req.uid.clone(),
        scale_ups: Vec::new(),
        scale_downs: vec![node_ips(&["10.1.0.1", "10.1.0.2", "10.1.0.3"])],
    });
    let mut autoscaler = autoscaler(options, &cluster, sink);

    let down = autoscaler.run_once(NOW).await.unwrap().scale_down.unwrap();
    assert_eq!(down.result, ScaleDownResult::NodeDeleteStarted);
    let mut started: Vec<&str> = down.scaled_down.iter().map(|n| n.node.as_str()).collect();
    started.sort();
    assert_eq!(started, vec!["a-1", "a-3"]);

    assert_eq!(down.unremovable.len(), 1);
    assert_eq!(down.unremovable[0].node, "a-2");
    assert_eq!(down.unremovable[0].reason, UnremovableReason::NonEmptyDeletionInProgress);
}
