//! Fleetscale scheduling simulation.
//!
//! Answers "what would the scheduler do if…" questions against an
//! in-memory copy of the cluster. Nothing here talks to a cloud or the
//! cluster API; the autoscaler feeds listed nodes and pods in and reads
//! decisions out.
//!
//! # Components
//!
//! - **`snapshot`**: Forkable cluster state (fork / revert / commit)
//! - **`predicates`**: Can this pod run on that node
//! - **`estimator`**: How many template nodes a pod set needs
//! - **`removal`**: Can a node's pods be moved elsewhere
//! - **`utilization`**: Requested / allocatable per node

pub mod estimator;
pub mod predicates;
pub mod removal;
pub mod snapshot;
pub mod utilization;

pub use estimator::{BinpackingEstimator, Estimator};
pub use predicates::{PredicateChecker, PredicateError, ResourceFitChecker};
pub use removal::{
    BlockingPod, BlockingPodReason, DrainablePods, NodeToBeRemoved, PdbTracker, RemovalSimulator,
    UnremovableNode, UnremovableReason, drainable_pods,
};
pub use snapshot::{ClusterSnapshot, SnapshotError, SnapshotResult};
pub use utilization::{UtilizationInfo, calculate_utilization};
