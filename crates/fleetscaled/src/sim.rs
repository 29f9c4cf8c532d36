//! Simulated clusters loaded from a fixture file.
//!
//! The fixture seeds the in-memory cloud provider and cluster API, so the
//! full tick loop can run without a real cluster:
//!
//! ```json
//! {
//!   "node_groups": [
//!     { "id": "ng1", "min": 1, "max": 10,
//!       "template": { "cpu": 4000, "memory_mib": 16384 },
//!       "nodes": [ { "name": "ng1-a", "address": "10.0.0.1", "allocatable": { "cpu": 4000, "memory": 17179869184 } } ] }
//!   ],
//!   "pods": [ { "namespace": "default", "name": "web-1", "spec": { "requests": { "cpu": 500 } } } ],
//!   "pdbs": []
//! }
//! ```
//!
//! Files ending in `.toml` are read as TOML, anything else as JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::info;

use fleet_core::{
    Node, NodeInfo, Pod, PodDisruptionBudget, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY, ResourceLimits, ResourceList,
    Taint,
};
use fleetscale_cloud::{CloudProvider, FakeClusterApi, TestCloudProvider, TestNodeGroup};

const MIB: i64 = 1 << 20;

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterFixture {
    #[serde(default)]
    pub node_groups: Vec<GroupFixture>,
    /// Nodes outside any autoscaled group.
    #[serde(default)]
    pub unmanaged_nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub pdbs: Vec<PodDisruptionBudget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupFixture {
    pub id: String,
    pub min: usize,
    pub max: usize,
    /// Defaults to the number of listed nodes.
    #[serde(default)]
    pub target: Option<usize>,
    pub template: TemplateFixture,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub autoprovisioned: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateFixture {
    /// Millicores.
    pub cpu: i64,
    pub memory_mib: i64,
    #[serde(default)]
    pub gpu: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl TemplateFixture {
    fn node_info(&self, group: &str) -> NodeInfo {
        let mut resources = ResourceList::new()
            .with(RESOURCE_CPU, self.cpu)
            .with(RESOURCE_MEMORY, self.memory_mib * MIB);
        if self.gpu > 0 {
            resources = resources.with(RESOURCE_GPU, self.gpu);
        }
        let mut node = Node::new(&format!("template-{group}"), resources);
        node.labels = self.labels.clone();
        node.taints = self.taints.clone();
        NodeInfo::new(node)
    }
}

/// Read a cluster fixture, choosing the format by extension.
pub fn load_fixture(path: &Path) -> anyhow::Result<ClusterFixture> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read cluster fixture {}", path.display()))?;
    let fixture = if path.extension().is_some_and(|e| e == "toml") {
        toml::from_str(&content).with_context(|| format!("invalid TOML fixture {}", path.display()))?
    } else {
        serde_json::from_str(&content).with_context(|| format!("invalid JSON fixture {}", path.display()))?
    };
    Ok(fixture)
}

/// The in-memory collaborators a fixture was loaded into.
pub struct SimCluster {
    pub api: Arc<FakeClusterApi>,
    pub cloud: Arc<TestCloudProvider>,
}

impl SimCluster {
    /// Seed the in-memory provider and API from `fixture`.
    pub fn from_fixture(fixture: ClusterFixture, limits: ResourceLimits, gpu_label: &str) -> anyhow::Result<Self> {
        let api = Arc::new(FakeClusterApi::new());
        let cloud = Arc::new(TestCloudProvider::new(limits).with_gpu_label(gpu_label));

        for group in fixture.node_groups {
            let target = group.target.unwrap_or(group.nodes.len());
            if group.min > group.max || target < group.min || target > group.max {
                bail!(
                    "node group {}: target {target} outside [{}, {}]",
                    group.id,
                    group.min,
                    group.max
                );
            }
            let template = group.template.node_info(&group.id);
            let mut test_group = TestNodeGroup::new(&group.id, group.min, group.max, target, template);
            if group.autoprovisioned {
                test_group = test_group.autoprovisioned();
            }
            cloud.add_node_group(test_group);
            for node in group.nodes {
                let node = with_capacity(node);
                cloud
                    .add_node(&group.id, &node)
                    .with_context(|| format!("failed to add node {} to {}", node.name, group.id))?;
                api.upsert_node(node);
            }
        }
        for node in fixture.unmanaged_nodes {
            api.upsert_node(with_capacity(node));
        }
        for mut pod in fixture.pods {
            if pod.uid.is_empty() {
                pod.uid = pod.key();
            }
            api.upsert_pod(pod);
        }
        for pdb in fixture.pdbs {
            api.add_pdb(pdb);
        }

        info!(groups = cloud.node_groups().len(), "simulated cluster loaded");
        Ok(Self { api, cloud })
    }
}

/// Fixtures usually list allocatable only; capacity mirrors it then.
fn with_capacity(mut node: Node) -> Node {
    if node.capacity.is_empty() {
        node.capacity = node.allocatable.clone();
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetscale_cloud::ClusterApi;

    const FIXTURE: &str = r#"{
        "node_groups": [
            {
                "id": "ng1", "min": 1, "max": 5,
                "template": { "cpu": 2000, "memory_mib": 4096 },
                "nodes": [
                    { "name": "ng1-a", "address": "10.0.0.1", "allocatable": { "cpu": 2000, "memory": 4294967296 } }
                ]
            }
        ],
        "pods": [
            { "namespace": "default", "name": "web-1", "spec": { "requests": { "cpu": 500 } }, "node_name": "ng1-a" },
            { "namespace": "default", "name": "web-2", "spec": { "requests": { "cpu": 500 } } }
        ]
    }"#;

    #[tokio::test]
    async fn json_fixture_seeds_provider_and_api() {
        let fixture: ClusterFixture = serde_json::from_str(FIXTURE).unwrap();
        let sim = SimCluster::from_fixture(fixture, ResourceLimits::new(), "gpu").unwrap();

        let groups = sim.cloud.node_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].target_size().unwrap(), 1);

        let nodes = sim.api.list_nodes().await.unwrap();
        assert_eq!(nodes[0].capacity.get(RESOURCE_CPU), 2000);
        assert_eq!(sim.api.list_pods().await.unwrap().len(), 2);

        let template = groups[0].template_node_info().unwrap();
        assert_eq!(template.node.capacity.get(RESOURCE_MEMORY), 4096 * MIB);
    }

    #[test]
    fn target_outside_bounds_is_rejected() {
        let fixture = ClusterFixture {
            node_groups: vec![GroupFixture {
                id: "ng1".into(),
                min: 2,
                max: 5,
                target: Some(1),
                template: TemplateFixture::default(),
                nodes: Vec::new(),
                autoprovisioned: false,
            }],
            unmanaged_nodes: Vec::new(),
            pods: Vec::new(),
            pdbs: Vec::new(),
        };
        assert!(SimCluster::from_fixture(fixture, ResourceLimits::new(), "gpu").is_err());
    }

    #[test]
    fn toml_fixture_is_read_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            "[[node_groups]]\nid = \"ng1\"\nmin = 0\nmax = 3\n[node_groups.template]\ncpu = 1000\nmemory_mib = 2048\n",
        )
        .unwrap();
        let fixture = load_fixture(&path).unwrap();
        assert_eq!(fixture.node_groups[0].max, 3);
        assert_eq!(fixture.node_groups[0].template.memory_mib, 2048);
    }
}
