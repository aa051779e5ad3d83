use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::{ChannelKind, OutreachRequest, ProjectId, Recipient, RequestId, TenantId};
use crate::domain::tenant::TenantConfig;
use crate::errors::DomainError;

pub const ENVELOPE_VERSION: u32 = 1;

/// The slice of tenant configuration an envelope carries for its selected
/// channel. Credential *reference* only; secrets are resolved at processing
/// time, never serialized onto the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlice {
    pub channel: ChannelKind,
    pub credential_ref: String,
    pub sender_id: String,
    pub workflow_id: String,
    pub rate_limit_per_minute: Option<u32>,
}

/// The queued unit of work: request plus enrichment plus routing metadata.
/// Immutable after creation. The same envelope content may be redelivered
/// (at-least-once transport), so everything downstream must be idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingEnvelope {
    pub version: u32,
    pub correlation_id: String,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub request_id: RequestId,
    pub recipient: Recipient,
    pub channel: ChannelSlice,
    pub created_at: DateTime<Utc>,
}

impl ProcessingEnvelope {
    /// Enrich a validated request with its tenant's channel provisioning.
    pub fn enrich(request: OutreachRequest, tenant: &TenantConfig) -> Result<Self, DomainError> {
        let settings = tenant.channel_settings(request.channel).ok_or_else(|| {
            DomainError::ChannelNotConfigured {
                tenant: tenant.tenant_id.clone(),
                channel: request.channel,
            }
        })?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            correlation_id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            project_id: request.project_id,
            request_id: request.request_id,
            recipient: request.recipient,
            channel: ChannelSlice {
                channel: request.channel,
                credential_ref: settings.credential_ref.clone(),
                sender_id: settings.sender_id.clone(),
                workflow_id: settings.workflow_id.clone(),
                rate_limit_per_minute: settings.rate_limit_per_minute,
            },
            created_at: request.created_at,
        })
    }

    /// Structural validation at the processing boundary. A blank required
    /// field means the envelope can never succeed, which is a
    /// configuration-class failure rather than a transient one.
    pub fn validate(&self) -> Result<(), DomainError> {
        fn required(name: &'static str, value: &str) -> Result<(), DomainError> {
            if value.trim().is_empty() {
                Err(DomainError::MissingField(name))
            } else {
                Ok(())
            }
        }

        required("tenant_id", &self.tenant_id.0)?;
        required("project_id", &self.project_id.0)?;
        required("request_id", &self.request_id.0)?;
        required("recipient.endpoint", &self.recipient.endpoint)?;
        required("channel.credential_ref", &self.channel.credential_ref)?;
        required("channel.sender_id", &self.channel.sender_id)?;
        required("channel.workflow_id", &self.channel.workflow_id)?;
        Ok(())
    }
}
