//! fleetscale-webhook, an external scaling authority.
//!
//! When `[webhook]` is configured the autoscaler stops planning on its
//! own. Each tick it describes every node group to the webhook and carries
//! out the answer through the same resize, drain and delete paths the
//! built-in planners use, under the same resource limits.
//!
//! - **`types`**: request/response wire format
//! - **`sink`**: HTTP and mailbox transports
//! - **`validate`**: policy checks and node selection
//! - **`source`**: `WebhookDecisionSource`, the tick integration

pub mod error;
pub mod sink;
pub mod source;
pub mod types;
pub mod validate;

pub use error::{WebhookError, WebhookResult};
pub use sink::{DecisionSink, FileMailbox, HttpSink, InMemoryMailbox, Mailbox, MailboxRecord, MailboxSink};
pub use source::WebhookDecisionSource;
pub use types::{
    NodeGroupState, NodeTemplate, ScaleDownPolicy, ScaleDownType, ScaleUpPolicy, WebhookRequest, WebhookResponse,
};
