//! In-memory cloud provider.
//!
//! Backs the unit and integration tests and the daemon's simulation mode.
//! Node groups keep their target size and member instances behind a mutex
//! and record every size change so tests can assert on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use fleet_core::{Node, NodeInfo, ResourceLimits};

use crate::provider::{CloudError, CloudProvider, CloudResult, Instance, InstanceState, NodeGroup};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct GroupState {
    target: usize,
    instances: Vec<String>,
    increases: Vec<usize>,
    deleted: Vec<String>,
}

#[derive(Debug)]
pub struct TestNodeGroup {
    id: String,
    min: usize,
    max: usize,
    template: NodeInfo,
    exists: AtomicBool,
    autoprovisioned: bool,
    fail_increase: AtomicBool,
    fail_delete: AtomicBool,
    state: Mutex<GroupState>,
}

impl TestNodeGroup {
    /// An existing group with no member instances yet.
    pub fn new(id: &str, min: usize, max: usize, target: usize, template: NodeInfo) -> Self {
        Self {
            id: id.to_string(),
            min,
            max,
            template,
            exists: AtomicBool::new(true),
            autoprovisioned: false,
            fail_increase: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            state: Mutex::new(GroupState {
                target,
                ..GroupState::default()
            }),
        }
    }

    /// A group that only exists once `create` is called.
    pub fn autoprovisioned(mut self) -> Self {
        self.autoprovisioned = true;
        self.exists = AtomicBool::new(false);
        self
    }

    /// Make `increase_size` fail.
    pub fn set_fail_increase(&self, fail: bool) {
        self.fail_increase.store(fail, Ordering::SeqCst);
    }

    /// Make `delete_nodes` fail.
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the target size without recording an increase.
    pub fn set_target(&self, target: usize) {
        lock(&self.state).target = target;
    }

    /// Every successful `increase_size` delta, in call order.
    pub fn increases(&self) -> Vec<usize> {
        lock(&self.state).increases.clone()
    }

    /// Provider ids of every node deleted through this group.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    fn add_instance(&self, provider_id: &str) {
        lock(&self.state).instances.push(provider_id.to_string());
    }
}

impl NodeGroup for TestNodeGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn min_size(&self) -> usize {
        self.min
    }

    fn max_size(&self) -> usize {
        self.max
    }

    fn target_size(&self) -> CloudResult<usize> {
        Ok(lock(&self.state).target)
    }

    fn increase_size(&self, delta: usize) -> CloudResult<()> {
        if self.fail_increase.load(Ordering::SeqCst) {
            return Err(CloudError::Provider(format!("{}: quota exceeded", self.id)));
        }
        let mut state = lock(&self.state);
        let requested = state.target + delta;
        if delta == 0 || requested > self.max {
            return Err(CloudError::SizeOutOfBounds {
                group: self.id.clone(),
                requested,
                min: self.min,
                max: self.max,
            });
        }
        state.target = requested;
        state.increases.push(delta);
        debug!(group = %self.id, delta, target = requested, "test node group increased");
        Ok(())
    }

    fn delete_nodes(&self, nodes: &[Node]) -> CloudResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(CloudError::Provider(format!("{}: delete failed", self.id)));
        }
        let mut state = lock(&self.state);
        let requested = state.target.saturating_sub(nodes.len());
        if requested < self.min {
            return Err(CloudError::SizeOutOfBounds {
                group: self.id.clone(),
                requested,
                min: self.min,
                max: self.max,
            });
        }
        for node in nodes {
            let Some(pos) = state.instances.iter().position(|i| *i == node.provider_id) else {
                return Err(CloudError::ForeignNode {
                    node: node.name.clone(),
                    group: self.id.clone(),
                });
            };
            state.instances.remove(pos);
            state.deleted.push(node.provider_id.clone());
        }
        state.target = requested;
        Ok(())
    }

    fn decrease_target_size(&self, delta: usize) -> CloudResult<()> {
        let mut state = lock(&self.state);
        let requested = state.target.saturating_sub(delta);
        if requested < state.instances.len() || requested < self.min {
            return Err(CloudError::SizeOutOfBounds {
                group: self.id.clone(),
                requested,
                min: self.min.max(state.instances.len()),
                max: self.max,
            });
        }
        state.target = requested;
        Ok(())
    }

    fn nodes(&self) -> CloudResult<Vec<Instance>> {
        Ok(lock(&self.state)
            .instances
            .iter()
            .map(|id| Instance {
                id: id.clone(),
                state: InstanceState::Running,
            })
            .collect())
    }

    fn template_node_info(&self) -> CloudResult<NodeInfo> {
        Ok(self.template.clone())
    }

    fn exist(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    fn create(&self) -> CloudResult<()> {
        if !self.autoprovisioned {
            return Err(CloudError::NotImplemented("create"));
        }
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn autoprovisioned(&self) -> bool {
        self.autoprovisioned
    }
}

/// In-memory `CloudProvider` holding `TestNodeGroup`s.
pub struct TestCloudProvider {
    groups: Mutex<BTreeMap<String, Arc<TestNodeGroup>>>,
    /// Node provider id → group id.
    membership: Mutex<HashMap<String, String>>,
    limits: Mutex<ResourceLimits>,
    gpu_label: String,
}

impl TestCloudProvider {
    /// An empty provider reporting `limits`.
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            groups: Mutex::new(BTreeMap::new()),
            membership: Mutex::new(HashMap::new()),
            limits: Mutex::new(limits),
            gpu_label: "fleetscale.io/accelerator".to_string(),
        }
    }

    /// Label that marks GPU nodes.
    pub fn with_gpu_label(mut self, label: &str) -> Self {
        self.gpu_label = label.to_string();
        self
    }

    /// Register `group` and return a handle for assertions.
    pub fn add_node_group(&self, group: TestNodeGroup) -> Arc<TestNodeGroup> {
        let group = Arc::new(group);
        lock(&self.groups).insert(group.id.clone(), group.clone());
        group
    }

    /// Register a node as a member of a group.
    pub fn add_node(&self, group_id: &str, node: &Node) -> CloudResult<()> {
        let group = self
            .group(group_id)
            .ok_or_else(|| CloudError::NodeGroupNotFound(group_id.to_string()))?;
        group.add_instance(&node.provider_id);
        lock(&self.membership).insert(node.provider_id.clone(), group_id.to_string());
        Ok(())
    }

    /// Handle to a registered group.
    pub fn group(&self, id: &str) -> Option<Arc<TestNodeGroup>> {
        lock(&self.groups).get(id).cloned()
    }

    /// Replace the reported resource limits.
    pub fn set_limits(&self, limits: ResourceLimits) {
        *lock(&self.limits) = limits;
    }
}

impl CloudProvider for TestCloudProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        lock(&self.groups)
            .values()
            .filter(|g| g.exist())
            .map(|g| g.clone() as Arc<dyn NodeGroup>)
            .collect()
    }

    fn autoprovisioning_candidates(&self) -> Vec<Arc<dyn NodeGroup>> {
        lock(&self.groups)
            .values()
            .filter(|g| !g.exist())
            .map(|g| g.clone() as Arc<dyn NodeGroup>)
            .collect()
    }

    fn node_group_for_node(&self, node: &Node) -> CloudResult<Option<Arc<dyn NodeGroup>>> {
        let Some(group_id) = lock(&self.membership).get(&node.provider_id).cloned() else {
            return Ok(None);
        };
        let group = self
            .group(&group_id)
            .ok_or(CloudError::NodeGroupNotFound(group_id))?;
        let still_member = lock(&group.state)
            .instances
            .contains(&node.provider_id);
        Ok(still_member.then(|| group as Arc<dyn NodeGroup>))
    }

    fn resource_limits(&self) -> CloudResult<ResourceLimits> {
        Ok(lock(&self.limits).clone())
    }

    fn gpu_label(&self) -> &str {
        &self.gpu_label
    }
}
