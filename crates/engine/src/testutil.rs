use std::collections::BTreeMap;

use chrono::Utc;

use courier_core::{
    ChannelKind, ChannelSettings, OutreachRequest, ProcessingEnvelope, ProjectId, Recipient,
    RequestId, TenantConfig, TenantId,
};

pub(crate) fn envelope() -> ProcessingEnvelope {
    let request = OutreachRequest {
        tenant_id: TenantId("acme".to_string()),
        project_id: ProjectId("p1".to_string()),
        request_id: RequestId("r-1".to_string()),
        recipient: Recipient::new("+10000000000"),
        channel: ChannelKind::WhatsApp,
        created_at: Utc::now(),
    };
    let mut channels = BTreeMap::new();
    channels.insert(
        ChannelKind::WhatsApp,
        ChannelSettings {
            credential_ref: "env:ACME_WA_TOKEN".to_string(),
            sender_id: "wa-sender-9".to_string(),
            workflow_id: "wf-outreach-1".to_string(),
            rate_limit_per_minute: Some(60),
        },
    );
    let tenant = TenantConfig {
        tenant_id: TenantId("acme".to_string()),
        project_id: ProjectId("p1".to_string()),
        allowed_channels: vec![ChannelKind::WhatsApp],
        channels,
    };
    ProcessingEnvelope::enrich(request, &tenant).expect("enrich")
}
