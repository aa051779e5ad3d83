use thiserror::Error;

use crate::domain::conversation::ConversationStatus;
use crate::domain::request::{ChannelKind, TenantId};

/// Failure taxonomy driving requeue-vs-dead-letter routing.
///
/// `Transient` errors lean on the transport's redelivery; `Configuration`
/// errors can never succeed on retry and are routed to the dead-letter path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Configuration,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Configuration => "configuration",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid conversation transition from {from:?} to {to:?}")]
    InvalidTransition { from: ConversationStatus, to: ConversationStatus },
    #[error("workflow reference already set to `{existing}`, refusing `{attempted}`")]
    WorkflowRefImmutable { existing: String, attempted: String },
    #[error("required envelope field `{0}` is missing or blank")]
    MissingField(&'static str),
    #[error("channel {channel:?} is not configured for tenant {tenant:?}")]
    ChannelNotConfigured { tenant: TenantId, channel: ChannelKind },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    /// Domain failures are malformed input or setup, never infrastructure.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}
