use thiserror::Error;

use courier_core::errors::{DomainError, ErrorClass};
use courier_providers::ProviderError;
use courier_store::StoreError;

/// Umbrella error for one processing attempt. Each wrapped layer carries its
/// own class; the class decides requeue versus dead-letter routing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("queue transport: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Domain(error) => error.class(),
            Self::Store(error) => error.class(),
            Self::Provider(error) => error.class(),
            Self::Transport(_) => ErrorClass::Transient,
        }
    }
}
