use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::request::{ChannelKind, ProjectId, TenantId};

/// Per-channel provisioning for one tenant+project. The credential field is a
/// *reference* into the secret store (e.g. `env:ACME_WA_TOKEN`), never a
/// resolved secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub credential_ref: String,
    /// Provider-side sender identity (phone number id, sender address, ...).
    pub sender_id: String,
    /// Identifier of the generation workflow configured for this channel.
    pub workflow_id: String,
    /// Carried for downstream visibility; not enforced by this core.
    pub rate_limit_per_minute: Option<u32>,
}

/// Read-only tenant configuration. Created and updated by an external
/// administrative process; this core only reads it during enrichment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub allowed_channels: Vec<ChannelKind>,
    pub channels: BTreeMap<ChannelKind, ChannelSettings>,
}

impl TenantConfig {
    pub fn channel_settings(&self, channel: ChannelKind) -> Option<&ChannelSettings> {
        if !self.allowed_channels.contains(&channel) {
            return None;
        }
        self.channels.get(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(channel: ChannelKind, allowed: bool) -> TenantConfig {
        let mut channels = BTreeMap::new();
        channels.insert(
            channel,
            ChannelSettings {
                credential_ref: "env:TOKEN".to_string(),
                sender_id: "sender-1".to_string(),
                workflow_id: "wf-1".to_string(),
                rate_limit_per_minute: Some(60),
            },
        );
        TenantConfig {
            tenant_id: TenantId("acme".to_string()),
            project_id: ProjectId("p1".to_string()),
            allowed_channels: if allowed { vec![channel] } else { vec![] },
            channels,
        }
    }

    #[test]
    fn settings_returned_for_allowed_channel() {
        let config = config_with(ChannelKind::WhatsApp, true);
        assert!(config.channel_settings(ChannelKind::WhatsApp).is_some());
    }

    #[test]
    fn disallowed_channel_hides_settings_even_when_provisioned() {
        let config = config_with(ChannelKind::WhatsApp, false);
        assert!(config.channel_settings(ChannelKind::WhatsApp).is_none());
    }
}
