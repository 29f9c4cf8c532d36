//! Pod equivalence groups.
//!
//! Pods created by the same controller with identical labels and spec
//! schedule identically, so scale-up only simulates one representative per
//! group. Pods without a controller each get a group of their own.

use std::collections::{BTreeMap, HashMap};

use fleet_core::Pod;

#[derive(Debug, Clone)]
pub struct PodEquivalenceGroup {
    pub id: usize,
    pub pods: Vec<Pod>,
    /// Node group id → why the representative did not fit its template.
    pub scheduling_errors: BTreeMap<String, String>,
    /// Node groups whose template can host the representative.
    pub schedulable_groups: Vec<String>,
    pub schedulable: bool,
}

impl PodEquivalenceGroup {
    fn new(id: usize, pod: Pod) -> Self {
        Self {
            id,
            pods: vec![pod],
            scheduling_errors: BTreeMap::new(),
            schedulable_groups: Vec::new(),
            schedulable: false,
        }
    }

    /// First pod of the group; every member schedules the same way.
    pub fn representative(&self) -> &Pod {
        &self.pods[0]
    }

    fn accepts(&self, pod: &Pod) -> bool {
        let rep = self.representative();
        rep.labels == pod.labels && rep.spec == pod.spec
    }

    /// Keys of every pod in the group.
    pub fn pod_keys(&self) -> Vec<String> {
        self.pods.iter().map(Pod::key).collect()
    }
}

/// Group `pods` into scheduling-equivalent sets, in first-seen order.
pub fn build_pod_equivalence_groups(pods: &[Pod]) -> Vec<PodEquivalenceGroup> {
    let mut groups: Vec<PodEquivalenceGroup> = Vec::new();
    // Controller uid → indices into `groups`.
    let mut by_controller: HashMap<&str, Vec<usize>> = HashMap::new();

    for pod in pods {
        let Some(owner) = &pod.owner else {
            groups.push(PodEquivalenceGroup::new(groups.len(), pod.clone()));
            continue;
        };
        let candidates = by_controller.entry(owner.uid.as_str()).or_default();
        match candidates.iter().find(|&&i| groups[i].accepts(pod)) {
            Some(&i) => groups[i].pods.push(pod.clone()),
            None => {
                candidates.push(groups.len());
                groups.push(PodEquivalenceGroup::new(groups.len(), pod.clone()));
            }
        }
    }
    groups
}
