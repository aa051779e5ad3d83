use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub String);

/// Client idempotency token. Reused verbatim across client retries of the
/// same logical attempt, which is what makes conversation creation
/// deterministic under redelivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    WhatsApp,
    Sms,
    Email,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Self::WhatsApp),
            "sms" => Some(Self::Sms),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// Destination endpoint for a single channel, e.g. an E.164 phone number for
/// whatsapp/sms or an address for email.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub endpoint: String,
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), display_name: None }
    }
}

/// Validated ingress request. Immutable once accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutreachRequest {
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub request_id: RequestId,
    pub recipient: Recipient,
    pub channel: ChannelKind,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ChannelKind;

    #[test]
    fn channel_kind_round_trips_through_str() {
        for kind in [ChannelKind::WhatsApp, ChannelKind::Sms, ChannelKind::Email] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn channel_kind_parse_rejects_unknown() {
        assert_eq!(ChannelKind::parse("carrier-pigeon"), None);
    }
}
