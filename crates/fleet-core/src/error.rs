//! Error taxonomy shared by the autoscaling crates.
//!
//! Every tick-level operation returns either a typed `AutoscalerError` or a
//! structured status. Per-node failures (simulation, drain) are recorded in
//! the status instead and never abort a tick.

use thiserror::Error;

/// Result type alias for autoscaler operations.
pub type AutoscalerResult<T> = Result<T, AutoscalerError>;

/// Coarse classification used by status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CloudProvider,
    ApiCall,
    Internal,
    Transient,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::CloudProvider => "cloudProviderError",
            ErrorKind::ApiCall => "apiCallError",
            ErrorKind::Internal => "internalError",
            ErrorKind::Transient => "transientError",
            ErrorKind::Configuration => "configurationError",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error)]
pub enum AutoscalerError {
    /// Node-group API failure. Reported, triggers backoff, retried next tick.
    #[error("cloud provider error: {0}")]
    CloudProvider(String),

    /// Listing or mutation against the cluster API failed. Aborts the tick.
    #[error("api call error: {0}")]
    ApiCall(String),

    /// Snapshot or bookkeeping corruption. Fatal to the tick.
    #[error("internal error: {0}")]
    Internal(String),

    /// Resource-limit exhaustion during sizing. Retried next tick.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AutoscalerError {
    /// The taxonomy bucket, for status reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutoscalerError::CloudProvider(_) => ErrorKind::CloudProvider,
            AutoscalerError::ApiCall(_) => ErrorKind::ApiCall,
            AutoscalerError::Internal(_) => ErrorKind::Internal,
            AutoscalerError::Transient(_) => ErrorKind::Transient,
            AutoscalerError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Same kind, message prefixed with context.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            AutoscalerError::CloudProvider(m) => AutoscalerError::CloudProvider(format!("{prefix}: {m}")),
            AutoscalerError::ApiCall(m) => AutoscalerError::ApiCall(format!("{prefix}: {m}")),
            AutoscalerError::Internal(m) => AutoscalerError::Internal(format!("{prefix}: {m}")),
            AutoscalerError::Transient(m) => AutoscalerError::Transient(format!("{prefix}: {m}")),
            AutoscalerError::Configuration(m) => AutoscalerError::Configuration(format!("{prefix}: {m}")),
        }
    }
}
