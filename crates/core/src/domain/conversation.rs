use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::envelope::ProcessingEnvelope;
use crate::domain::request::{ChannelKind, ProjectId, RequestId, TenantId};
use crate::errors::DomainError;

/// Deterministically derived conversation identifier.
///
/// The derivation is the idempotency boundary for the whole engine: every
/// redelivery of the same logical request maps onto the same durable record,
/// and the conditional create in the store decides which worker wins.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn derive(
        tenant_id: &TenantId,
        project_id: &ProjectId,
        request_id: &RequestId,
        channel_endpoint: &str,
    ) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.0.as_bytes());
        hasher.update(b"\n");
        hasher.update(project_id.0.as_bytes());
        hasher.update(b"\n");
        hasher.update(request_id.0.as_bytes());
        hasher.update(b"\n");
        hasher.update(channel_endpoint.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("conv-{}", &digest[..32]))
    }

    pub fn for_envelope(envelope: &ProcessingEnvelope) -> Self {
        Self::derive(
            &envelope.tenant_id,
            &envelope.project_id,
            &envelope.request_id,
            &envelope.recipient.endpoint,
        )
    }
}

/// Durable store key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub recipient: String,
    pub conversation_id: ConversationId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Processing,
    InitialMessageSent,
    Failed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::InitialMessageSent => "initial_message_sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "initial_message_sent" => Some(Self::InitialMessageSent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InitialMessageSent | Self::Failed)
    }

    /// Transitions are monotonic: `processing` is entered only at creation
    /// and nothing leaves a terminal state. Same-state is allowed so a
    /// duplicate worker replaying a transition is a no-op, not an error.
    pub fn can_transition(from: Self, to: Self) -> bool {
        match (from, to) {
            (from, to) if from == to => true,
            (Self::Processing, Self::InitialMessageSent) => true,
            (Self::Processing, Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// One entry in the append-only message log. A pending entry carries metrics
/// only; delivery completes it with the provider message id and a summary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub content_summary: Option<String>,
    pub provider_message_id: Option<String>,
    pub usage: UsageMetrics,
}

impl MessageEntry {
    pub fn pending(usage: UsageMetrics, now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            completed_at: None,
            content_summary: None,
            provider_message_id: None,
            usage,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// The durable state entity tracking one processing attempt's outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub key: ConversationKey,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub request_id: RequestId,
    pub channel: ChannelKind,
    pub status: ConversationStatus,
    /// External generation-workflow reference. Set once, never overwritten.
    pub workflow_ref: Option<String>,
    /// Provider message id of the delivered initial message. Presence means
    /// the send already happened and must not be repeated.
    pub delivery_ref: Option<String>,
    pub messages: Vec<MessageEntry>,
    pub failure_reason: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn for_envelope(envelope: &ProcessingEnvelope, now: DateTime<Utc>) -> Self {
        let conversation_id = ConversationId::for_envelope(envelope);
        Self {
            key: ConversationKey {
                recipient: envelope.recipient.endpoint.clone(),
                conversation_id,
            },
            tenant_id: envelope.tenant_id.clone(),
            project_id: envelope.project_id.clone(),
            request_id: envelope.request_id.clone(),
            channel: envelope.channel.channel,
            status: ConversationStatus::Processing,
            workflow_ref: None,
            delivery_ref: None,
            messages: Vec::new(),
            failure_reason: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(
        &mut self,
        to: ConversationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status == to {
            return Ok(());
        }
        if !ConversationStatus::can_transition(self.status, to) {
            return Err(DomainError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        self.state_version += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_workflow_ref(
        &mut self,
        workflow_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        match &self.workflow_ref {
            None => {
                self.workflow_ref = Some(workflow_ref.to_string());
                self.state_version += 1;
                self.updated_at = now;
                Ok(())
            }
            Some(existing) if existing == workflow_ref => Ok(()),
            Some(existing) => Err(DomainError::WorkflowRefImmutable {
                existing: existing.clone(),
                attempted: workflow_ref.to_string(),
            }),
        }
    }

    pub fn append_pending_message(&mut self, usage: UsageMetrics, now: DateTime<Utc>) {
        self.messages.push(MessageEntry::pending(usage, now));
        self.state_version += 1;
        self.updated_at = now;
    }

    pub fn pending_message(&self) -> Option<&MessageEntry> {
        self.messages.last().filter(|entry| entry.is_pending())
    }

    pub fn complete_pending_message(
        &mut self,
        provider_message_id: &str,
        content_summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let entry = self
            .messages
            .last_mut()
            .filter(|entry| entry.is_pending())
            .ok_or_else(|| DomainError::InvariantViolation("no pending message entry".to_string()))?;

        entry.completed_at = Some(now);
        entry.provider_message_id = Some(provider_message_id.to_string());
        entry.content_summary = Some(content_summary.to_string());
        self.delivery_ref = Some(provider_message_id.to_string());
        self.state_version += 1;
        self.updated_at = now;
        Ok(())
    }
}
