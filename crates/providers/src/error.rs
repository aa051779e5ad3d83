use std::time::Duration;

use thiserror::Error;

use courier_core::errors::ErrorClass;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned http status {status}")]
    Http { status: u16 },
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("generation run did not reach a terminal state within {0:?}")]
    PollTimeout(Duration),
    #[error("generation output failed validation: {0}")]
    InvalidOutput(String),
    #[error("credential reference could not be resolved: {0}")]
    Credential(String),
    #[error("generation workflow failed: {0}")]
    Workflow(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::CircuitOpen
            | Self::PollTimeout(_)
            | Self::Workflow(_)
            | Self::Transport(_) => ErrorClass::Transient,
            // 408/429 and server errors will come back eventually; other
            // statuses mean the request itself is wrong.
            Self::Http { status } => match status {
                408 | 429 => ErrorClass::Transient,
                500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Configuration,
            },
            Self::InvalidOutput(_) | Self::Credential(_) => ErrorClass::Configuration,
        }
    }
}
