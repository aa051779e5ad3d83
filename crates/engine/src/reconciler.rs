use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use courier_core::{ConversationId, ConversationKey, ConversationStatus, ProcessingEnvelope};
use courier_store::{ConversationStore, StoreError};

use crate::error::EngineError;
use crate::queue::TransportQueue;

/// Settles conversations whose envelopes exhausted their delivery budget.
///
/// Reconciliation is idempotent: the conversation id is re-derived exactly as
/// the engine derives it, a missing record is a warning and a no-op, and a
/// settled conversation is never resurrected. Running twice over the same
/// envelope changes nothing the second time.
pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    queue: Arc<dyn TransportQueue>,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        queue: Arc<dyn TransportQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self { store, queue, poll_interval }
    }

    pub async fn reconcile(&self, envelope: &ProcessingEnvelope) -> Result<(), EngineError> {
        let conversation_id = ConversationId::for_envelope(envelope);
        let key = ConversationKey {
            recipient: envelope.recipient.endpoint.clone(),
            conversation_id,
        };

        let Some(mut record) = self.store.get(&key).await? else {
            warn!(
                event_name = "reconciler.conversation_missing",
                correlation_id = %envelope.correlation_id,
                conversation_id = %key.conversation_id.0,
                "dead-lettered envelope has no conversation record"
            );
            return Ok(());
        };

        if record.status.is_terminal() {
            info!(
                event_name = "reconciler.already_settled",
                conversation_id = %key.conversation_id.0,
                status = record.status.as_str(),
                "conversation already settled"
            );
            return Ok(());
        }

        let persisted = record.state_version;
        record.failure_reason = Some("processing attempts exhausted".to_string());
        record.transition(ConversationStatus::Failed, Utc::now())?;

        match self.store.update(&record, persisted).await {
            Ok(()) => {
                warn!(
                    event_name = "reconciler.conversation_failed",
                    correlation_id = %envelope.correlation_id,
                    conversation_id = %key.conversation_id.0,
                    channel = envelope.channel.channel.as_str(),
                    "conversation marked failed"
                );
                Ok(())
            }
            // A concurrent reconciler or a late worker won the write; the
            // record is settled either way.
            Err(StoreError::VersionConflict { .. }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Consumes the dead-letter side of the queue until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(event_name = "reconciler.started", "dead-letter reconciler running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.receive_dead_letter().await {
                Ok(Some((envelope, lease))) => {
                    match self.reconcile(&envelope).await {
                        Ok(()) => {
                            if let Err(error) = self.queue.delete_dead_letter(&lease).await {
                                warn!(
                                    event_name = "reconciler.ack_failed",
                                    correlation_id = %envelope.correlation_id,
                                    error = %error,
                                    "could not acknowledge dead-lettered envelope"
                                );
                            }
                        }
                        Err(error) => {
                            // Left for redelivery; reconcile is idempotent.
                            warn!(
                                event_name = "reconciler.reconcile_failed",
                                correlation_id = %envelope.correlation_id,
                                error = %error,
                                "reconciliation attempt failed"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    warn!(
                        event_name = "reconciler.receive_failed",
                        error = %error,
                        "dead-letter receive failed"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(event_name = "reconciler.stopped", "dead-letter reconciler stopped");
    }
}
