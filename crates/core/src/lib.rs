pub mod config;
pub mod domain;
pub mod errors;

pub use chrono;

pub use domain::conversation::{
    ConversationId, ConversationKey, ConversationRecord, ConversationStatus, MessageEntry,
    UsageMetrics,
};
pub use domain::envelope::{ChannelSlice, ProcessingEnvelope, ENVELOPE_VERSION};
pub use domain::request::{ChannelKind, OutreachRequest, ProjectId, Recipient, RequestId, TenantId};
pub use domain::tenant::{ChannelSettings, TenantConfig};
pub use errors::{DomainError, ErrorClass};
