//! Cluster API contract.
//!
//! Listing plus the handful of mutations the scale-down path performs:
//! tainting, cordoning and evicting.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use fleet_core::{AutoscalerError, Node, Pod, PodDisruptionBudget, Taint};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Eviction refused, typically by a disruption budget. Retryable.
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("api error: {0}")]
    Other(String),
}

impl ApiError {
    /// The object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

impl From<ApiError> for AutoscalerError {
    fn from(e: ApiError) -> Self {
        AutoscalerError::ApiCall(e.to_string())
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> ApiResult<Vec<Node>>;

    async fn list_pods(&self) -> ApiResult<Vec<Pod>>;

    async fn list_pdbs(&self) -> ApiResult<Vec<PodDisruptionBudget>>;

    async fn get_node(&self, name: &str) -> ApiResult<Node>;

    /// Pods currently bound to the node.
    async fn pods_on_node(&self, node: &str) -> ApiResult<Vec<Pod>>;

    /// Idempotent: an existing taint with the same key is left untouched.
    async fn add_taint(&self, node: &str, taint: Taint) -> ApiResult<()>;

    /// Returns whether a taint was removed.
    async fn remove_taint(&self, node: &str, key: &str) -> ApiResult<bool>;

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> ApiResult<()>;

    /// Request-with-grace-period deletion of a pod.
    async fn evict_pod(&self, pod: &Pod, grace_period: Duration) -> ApiResult<()>;
}
