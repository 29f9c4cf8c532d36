use std::time::Duration;

use fleet_core::AutoscalerError;
use thiserror::Error;

pub type WebhookResult<T> = Result<T, WebhookError>;

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("response uid {got} does not match request uid {expected}")]
    UidMismatch { expected: String, got: String },

    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// A single policy in the response was rejected.
    #[error("policy for {target} rejected: {reason}")]
    Rejected { target: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl WebhookError {
    /// A policy for `target` that failed validation.
    pub fn rejected(target: &str, reason: impl Into<String>) -> Self {
        WebhookError::Rejected {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<WebhookError> for AutoscalerError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::Config(m) => AutoscalerError::Configuration(m),
            // The next exchange may carry a valid policy.
            WebhookError::Rejected { .. } => AutoscalerError::Transient(e.to_string()),
            other => AutoscalerError::ApiCall(format!("webhook: {other}")),
        }
    }
}
