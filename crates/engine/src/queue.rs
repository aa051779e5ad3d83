use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use courier_core::ProcessingEnvelope;

use crate::error::EngineError;

/// Claim on one in-flight message. The receipt is opaque and valid only for
/// the delivery that produced it; a redelivery invalidates earlier receipts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub receipt: String,
    pub receive_count: u32,
}

/// At-least-once message transport with visibility-timeout leasing and a
/// dead-letter side. The transport passively dead-letters a message once its
/// delivery count passes the configured maximum; `move_to_dead_letter` is the
/// active path for failures that can never succeed.
#[async_trait]
pub trait TransportQueue: Send + Sync {
    async fn receive(&self) -> Result<Option<(ProcessingEnvelope, Lease)>, EngineError>;

    async fn extend_lease(&self, lease: &Lease, extension: Duration) -> Result<(), EngineError>;

    /// Acknowledge successful processing; the message is gone for good.
    async fn delete(&self, lease: &Lease) -> Result<(), EngineError>;

    async fn move_to_dead_letter(&self, lease: &Lease) -> Result<(), EngineError>;

    async fn receive_dead_letter(
        &self,
    ) -> Result<Option<(ProcessingEnvelope, Lease)>, EngineError>;

    async fn delete_dead_letter(&self, lease: &Lease) -> Result<(), EngineError>;
}

struct Entry {
    id: u64,
    envelope: ProcessingEnvelope,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

struct Inner {
    main: Vec<Entry>,
    dead: Vec<Entry>,
    next_id: u64,
}

/// In-process transport used by tests and the local worker wiring. Semantics
/// mirror a cloud queue: invisible while leased, redelivered with a bumped
/// receive count after the visibility timeout lapses.
pub struct MemoryQueue {
    visibility: Duration,
    max_receive_count: u32,
    inner: Mutex<Inner>,
    extensions: AtomicU64,
}

impl MemoryQueue {
    pub fn new(visibility: Duration, max_receive_count: u32) -> Self {
        Self {
            visibility,
            max_receive_count,
            inner: Mutex::new(Inner { main: Vec::new(), dead: Vec::new(), next_id: 0 }),
            extensions: AtomicU64::new(0),
        }
    }

    pub fn push(&self, envelope: ProcessingEnvelope) {
        let mut inner = self.inner.lock().expect("queue lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.main.push(Entry {
            id,
            envelope,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_len(&self) -> usize {
        self.inner.lock().expect("queue lock").dead.len()
    }

    /// Total successful lease extensions, across all messages.
    pub fn extension_count(&self) -> u64 {
        self.extensions.load(Ordering::Relaxed)
    }
}

fn take_visible(
    entries: &mut Vec<Entry>,
    now: Instant,
    visibility: Duration,
    prefix: &str,
) -> Option<(ProcessingEnvelope, Lease)> {
    for entry in entries.iter_mut() {
        if entry.visible_at > now {
            continue;
        }
        entry.receive_count += 1;
        let receipt = format!("{prefix}-{}-{}", entry.id, entry.receive_count);
        entry.receipt = Some(receipt.clone());
        entry.visible_at = now + visibility;
        return Some((
            entry.envelope.clone(),
            Lease { receipt, receive_count: entry.receive_count },
        ));
    }
    None
}

#[async_trait]
impl TransportQueue for MemoryQueue {
    async fn receive(&self) -> Result<Option<(ProcessingEnvelope, Lease)>, EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let now = Instant::now();

        // Messages whose delivery budget is spent move to the dead-letter
        // side instead of being handed out again.
        let mut index = 0;
        while index < inner.main.len() {
            let entry = &inner.main[index];
            if entry.visible_at <= now && entry.receive_count >= self.max_receive_count {
                let mut entry = inner.main.remove(index);
                warn!(
                    event_name = "engine.queue.dead_lettered",
                    correlation_id = %entry.envelope.correlation_id,
                    receive_count = entry.receive_count,
                    "delivery budget exhausted"
                );
                entry.receipt = None;
                inner.dead.push(entry);
            } else {
                index += 1;
            }
        }

        Ok(take_visible(&mut inner.main, now, self.visibility, "rcpt"))
    }

    async fn extend_lease(&self, lease: &Lease, extension: Duration) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let entry = inner
            .main
            .iter_mut()
            .find(|entry| entry.receipt.as_deref() == Some(&lease.receipt))
            .ok_or_else(|| EngineError::Transport("unknown or superseded lease".to_string()))?;
        entry.visible_at = Instant::now() + extension;
        self.extensions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, lease: &Lease) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let position = inner
            .main
            .iter()
            .position(|entry| entry.receipt.as_deref() == Some(&lease.receipt))
            .ok_or_else(|| EngineError::Transport("unknown or superseded lease".to_string()))?;
        inner.main.remove(position);
        Ok(())
    }

    async fn move_to_dead_letter(&self, lease: &Lease) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let position = inner
            .main
            .iter()
            .position(|entry| entry.receipt.as_deref() == Some(&lease.receipt))
            .ok_or_else(|| EngineError::Transport("unknown or superseded lease".to_string()))?;
        let mut entry = inner.main.remove(position);
        entry.receipt = None;
        inner.dead.push(entry);
        Ok(())
    }

    async fn receive_dead_letter(
        &self,
    ) -> Result<Option<(ProcessingEnvelope, Lease)>, EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        Ok(take_visible(&mut inner.dead, Instant::now(), self.visibility, "dlq"))
    }

    async fn delete_dead_letter(&self, lease: &Lease) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let position = inner
            .dead
            .iter()
            .position(|entry| entry.receipt.as_deref() == Some(&lease.receipt))
            .ok_or_else(|| EngineError::Transport("unknown or superseded lease".to_string()))?;
        inner.dead.remove(position);
        Ok(())
    }
}
