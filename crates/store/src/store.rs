use async_trait::async_trait;
use thiserror::Error;

use courier_core::errors::ErrorClass;
use courier_core::{ConversationKey, ConversationRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found")]
    NotFound,
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u32, found: u32 },
    #[error("could not decode stored conversation: {0}")]
    Decode(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Decode(_) => ErrorClass::Configuration,
            _ => ErrorClass::Transient,
        }
    }
}

/// Durable conversation state, keyed by `(recipient, conversation_id)`.
///
/// No implementation takes locks; correctness under duplicate delivery rests
/// on the conditional create and the version-guarded update.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Conditional create. If a record already exists under the same key the
    /// existing (winner's) record is returned with `created = false`; losing
    /// the race is not an error.
    async fn create_if_absent(
        &self,
        record: ConversationRecord,
    ) -> Result<(ConversationRecord, bool), StoreError>;

    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>, StoreError>;

    /// Persist a locally mutated record, guarded by the version that was last
    /// persisted. A concurrent writer that advanced the record first causes
    /// `VersionConflict`.
    async fn update(
        &self,
        record: &ConversationRecord,
        expected_version: u32,
    ) -> Result<(), StoreError>;
}
