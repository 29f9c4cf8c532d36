//! Node utilization as seen by scale-down.

use serde::Serialize;

use fleet_core::{NodeInfo, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationInfo {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
    /// Resource the headline `utilization` was taken from.
    pub resource: &'static str,
    pub utilization: f64,
}

fn ratio(requested: i64, allocatable: i64) -> f64 {
    if allocatable <= 0 {
        return 0.0;
    }
    requested as f64 / allocatable as f64
}

/// Requested / allocatable per resource. GPU nodes are judged on GPU alone,
/// everything else on the larger of cpu and memory.
pub fn calculate_utilization(
    info: &NodeInfo,
    skip_daemonset_pods: bool,
    gpu_label: &str,
) -> UtilizationInfo {
    let allocatable = &info.node.allocatable;
    let mut requested = fleet_core::ResourceList::new();
    for pod in &info.pods {
        if pod.is_terminal() || (skip_daemonset_pods && pod.is_daemonset_pod()) {
            continue;
        }
        requested.add(pod.requests());
    }

    let cpu = ratio(requested.get(RESOURCE_CPU), allocatable.get(RESOURCE_CPU));
    let memory = ratio(requested.get(RESOURCE_MEMORY), allocatable.get(RESOURCE_MEMORY));
    let gpu = ratio(requested.get(RESOURCE_GPU), allocatable.get(RESOURCE_GPU));

    if info.node.has_gpu(gpu_label) {
        return UtilizationInfo {
            cpu,
            memory,
            gpu,
            resource: RESOURCE_GPU,
            utilization: gpu,
        };
    }
    let (resource, utilization) = if cpu >= memory {
        (RESOURCE_CPU, cpu)
    } else {
        (RESOURCE_MEMORY, memory)
    };
    UtilizationInfo {
        cpu,
        memory,
        gpu,
        resource,
        utilization,
    }
}
