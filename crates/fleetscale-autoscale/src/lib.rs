//! fleetscale-autoscale, the decision engine.
//!
//! Each tick reads the cluster through [`fleetscale_cloud::ClusterApi`] and
//! the node groups through [`fleetscale_cloud::CloudProvider`], then decides
//! whether to grow groups for pending pods or to remove unneeded nodes.
//!
//! # Layout
//!
//! ```text
//! StaticAutoscaler (autoscaler.rs)
//!   ├─ ClusterStateRegistry    upcoming nodes, backoff, readiness
//!   ├─ ScaleUpPlanner          equivalence groups → options → expander → resize
//!   ├─ ScaleDownPlanner        eligibility → removal simulation → selection
//!   ├─ ScaleDownActuator       taint → drain → delete, one task per node
//!   │    └─ NodeDeletionTracker  in-flight counts + results
//!   └─ DecisionSource?         external authority replacing both planners
//! ```
//!
//! Both planners enforce cluster-wide resource limits through
//! [`ResourceLimitAccountant`].

pub mod actuator;
pub mod autoscaler;
pub mod clusterstate;
pub mod context;
pub mod deletion_tracker;
pub mod drain;
pub mod equivalence;
pub mod expander;
pub mod resource_limits;
pub mod scaledown;
pub mod scaleup;
pub mod similarity;
pub mod soft_taint;
pub mod status;

pub use actuator::ScaleDownActuator;
pub use autoscaler::{DecisionOutcome, DecisionSource, StaticAutoscaler, Tick, TickStatus};
pub use clusterstate::{ClusterStateRegistry, Readiness};
pub use context::AutoscalingContext;
pub use deletion_tracker::NodeDeletionTracker;
pub use equivalence::{PodEquivalenceGroup, build_pod_equivalence_groups};
pub use resource_limits::{Headroom, ResourceLimitAccountant, ResourceTotals};
pub use scaledown::{DeletionRequest, ScaleDownPlanner, ScaleDownSelection, UnneededNode};
pub use scaleup::{ScaleUpPlanner, execute_scale_ups};
pub use status::{
    NodeDeletionResult, NodeDeletionResultKind, ScaleDownNode, ScaleDownResult, ScaleDownStatus, ScaleUpInfo,
    ScaleUpResult, ScaleUpStatus,
};
