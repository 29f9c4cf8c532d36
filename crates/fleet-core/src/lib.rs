//! fleet-core, the shared vocabulary of the Fleetscale autoscaler.
//!
//! - **`types`**: nodes, pods, taints, disruption budgets, resource lists
//! - **`config`**: `AutoscalingOptions` parsed from `autoscaler.toml`
//! - **`error`**: the tick-level error taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use config::{AutoscalingOptions, ResourceLimits};
pub use error::{AutoscalerError, AutoscalerResult, ErrorKind};
pub use types::*;
