use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::info;

use courier_core::ChannelKind;

use crate::circuit::CircuitBreaker;
use crate::error::ProviderError;
use crate::limiter::AdaptiveLimiter;
use crate::retry::{run_with_retry, RetryPolicy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryDestination {
    pub channel: ChannelKind,
    /// Provider-side sender identity the message goes out under.
    pub sender_id: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

/// Idempotent message-send surface. Implementations must treat the
/// idempotency key as authoritative: a repeated key returns the original
/// receipt instead of sending twice.
#[async_trait]
pub trait DeliveryApi: Send + Sync {
    async fn send(
        &self,
        credential: &SecretString,
        idempotency_key: &str,
        destination: &DeliveryDestination,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, ProviderError>;
}

/// Wraps the delivery API with the shared call discipline.
pub struct DeliveryAdapter {
    api: Arc<dyn DeliveryApi>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<AdaptiveLimiter>,
    request_timeout: Duration,
}

impl DeliveryAdapter {
    pub fn new(
        api: Arc<dyn DeliveryApi>,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<AdaptiveLimiter>,
        request_timeout: Duration,
    ) -> Self {
        Self { api, policy, breaker, limiter, request_timeout }
    }

    pub async fn send(
        &self,
        credential: &SecretString,
        idempotency_key: &str,
        destination: &DeliveryDestination,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let timeout = self.request_timeout;

        let receipt = run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
            tokio::time::timeout(
                timeout,
                self.api.send(credential, idempotency_key, destination, variables),
            )
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
        })
        .await?;

        info!(
            event_name = "provider.delivery.sent",
            channel = destination.channel.as_str(),
            provider_message_id = %receipt.provider_message_id,
            "message handed to delivery provider"
        );

        Ok(receipt)
    }
}
