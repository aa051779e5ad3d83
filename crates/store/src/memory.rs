use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use courier_core::{ConversationKey, ConversationRecord};

use crate::store::{ConversationStore, StoreError};

/// In-memory store with the same conditional-write semantics as the sql
/// implementation. Used by engine tests and the local transport demo.
#[derive(Default)]
pub struct MemoryConversationStore {
    records: Mutex<HashMap<ConversationKey, ConversationRecord>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_if_absent(
        &self,
        record: ConversationRecord,
    ) -> Result<(ConversationRecord, bool), StoreError> {
        let mut records = self.records.lock().expect("store lock");
        match records.get(&record.key) {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                records.insert(record.key.clone(), record.clone());
                Ok((record, true))
            }
        }
    }

    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>, StoreError> {
        let records = self.records.lock().expect("store lock");
        Ok(records.get(key).cloned())
    }

    async fn update(
        &self,
        record: &ConversationRecord,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock");
        let stored = records.get_mut(&record.key).ok_or(StoreError::NotFound)?;

        if stored.state_version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found: stored.state_version,
            });
        }

        *stored = record.clone();
        Ok(())
    }
}
