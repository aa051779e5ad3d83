//! External provider adapters.
//!
//! Both outbound surfaces (AI generation, message delivery) share one call
//! discipline: per-call timeout, exponential backoff with jitter on transient
//! failures, a shared circuit breaker, and an adaptive limiter fed by
//! provider-reported quota headers. The breaker and limiter are plain
//! constructor-injected values shared across worker slots so tests can
//! substitute their own instances.

pub mod circuit;
pub mod delivery;
pub mod error;
pub mod generation;
pub mod http;
pub mod limiter;
pub mod retry;
pub mod secrets;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig};
pub use delivery::{DeliveryAdapter, DeliveryApi, DeliveryDestination, DeliveryReceipt};
pub use error::ProviderError;
pub use generation::{
    GenerationAdapter, GenerationOutput, GenerationWorkItem, GenerationWorkflow, PollSettings,
    RequiredAction, RunOutput, RunStatus,
};
pub use http::{HttpDeliveryApi, HttpGenerationWorkflow};
pub use limiter::AdaptiveLimiter;
pub use retry::{run_with_retry, RetryPolicy};
pub use secrets::{CachingResolver, CredentialResolver, EnvCredentialResolver};
