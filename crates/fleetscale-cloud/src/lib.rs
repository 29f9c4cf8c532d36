//! fleetscale-cloud, the contracts the autoscaler consumes.
//!
//! The decision engine never talks to a cloud or a cluster directly. It
//! goes through these traits, which are passed in at construction:
//!
//! - **`provider`**: `NodeGroup` / `CloudProvider` (resize, delete, templates, limits)
//! - **`api`**: `ClusterApi` (list nodes/pods/PDBs, taint, cordon, evict)
//! - **`test_provider`**, **`fake_api`**: in-memory implementations

pub mod api;
pub mod fake_api;
pub mod provider;
pub mod test_provider;

pub use api::{ApiError, ApiResult, ClusterApi};
pub use fake_api::{EvictionBehavior, FakeClusterApi};
pub use provider::{CloudError, CloudProvider, CloudResult, Instance, InstanceState, NodeGroup};
pub use test_provider::{TestCloudProvider, TestNodeGroup};
