use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use serde_json::json;
use tracing::{info, warn};

use courier_core::errors::ErrorClass;
use courier_core::{ConversationRecord, ConversationStatus, ProcessingEnvelope};
use courier_providers::delivery::DeliveryDestination;
use courier_providers::{
    CredentialResolver, DeliveryAdapter, GenerationAdapter, GenerationWorkItem,
};
use courier_store::{ConversationStore, StoreError};

use crate::error::EngineError;
use crate::heartbeat::Heartbeat;
use crate::queue::{Lease, TransportQueue};

/// How one processing attempt ended, from the transport's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge the message; the conversation reached a settled state.
    Completed,
    /// Leave the message for redelivery; a later attempt can still succeed.
    Retryable,
    /// The attempt can never succeed as configured; dead-letter it.
    Terminal,
}

/// One-message-at-a-time state machine over the durable conversation record.
///
/// Every step is idempotent under redelivery: the conditional create is the
/// ownership boundary, provider sends carry a conversation-derived
/// idempotency key, and updates are version-guarded so a concurrent duplicate
/// is adopted rather than fought.
pub struct ProcessingEngine {
    store: Arc<dyn ConversationStore>,
    resolver: Arc<dyn CredentialResolver>,
    generation: GenerationAdapter,
    /// Platform-level generation credential. When absent, the envelope's
    /// channel credential is used for generation too.
    generation_credential: Option<SecretString>,
    delivery: DeliveryAdapter,
    queue: Arc<dyn TransportQueue>,
    heartbeat_interval: Duration,
    heartbeat_extension: Duration,
}

impl ProcessingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        resolver: Arc<dyn CredentialResolver>,
        generation: GenerationAdapter,
        generation_credential: Option<SecretString>,
        delivery: DeliveryAdapter,
        queue: Arc<dyn TransportQueue>,
        heartbeat_interval: Duration,
        heartbeat_extension: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            generation,
            generation_credential,
            delivery,
            queue,
            heartbeat_interval,
            heartbeat_extension,
        }
    }

    /// Process one delivered envelope under its lease. Never returns an
    /// error: failures are classified into `Retryable` or `Terminal` and the
    /// caller routes the message accordingly.
    pub async fn process(&self, envelope: &ProcessingEnvelope, lease: &Lease) -> Outcome {
        let _heartbeat = Heartbeat::spawn(
            Arc::clone(&self.queue),
            lease.clone(),
            self.heartbeat_interval,
            self.heartbeat_extension,
        );

        match self.attempt(envelope).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let outcome = match error.class() {
                    ErrorClass::Transient => Outcome::Retryable,
                    ErrorClass::Configuration => Outcome::Terminal,
                };
                warn!(
                    event_name = "engine.process.failed",
                    correlation_id = %envelope.correlation_id,
                    channel = envelope.channel.channel.as_str(),
                    class = error.class().as_str(),
                    error = %error,
                    "processing attempt failed"
                );
                outcome
            }
        }
    }

    async fn attempt(&self, envelope: &ProcessingEnvelope) -> Result<Outcome, EngineError> {
        envelope.validate()?;

        let candidate = ConversationRecord::for_envelope(envelope, Utc::now());
        let conversation_id = candidate.key.conversation_id.clone();
        let (mut record, created) = self.store.create_if_absent(candidate).await?;

        if record.status.is_terminal() {
            info!(
                event_name = "engine.process.duplicate_delivery",
                correlation_id = %envelope.correlation_id,
                conversation_id = %conversation_id.0,
                status = record.status.as_str(),
                "conversation already settled; acknowledging redelivery"
            );
            return Ok(Outcome::Completed);
        }

        info!(
            event_name = "engine.process.started",
            correlation_id = %envelope.correlation_id,
            conversation_id = %conversation_id.0,
            channel = envelope.channel.channel.as_str(),
            created,
            "processing conversation"
        );

        let credential = self.resolver.resolve(&envelope.channel.credential_ref).await?;

        let started = std::time::Instant::now();
        let work_item = GenerationWorkItem {
            workflow_id: envelope.channel.workflow_id.clone(),
            input: json!({
                "tenant_id": envelope.tenant_id.0,
                "project_id": envelope.project_id.0,
                "channel": envelope.channel.channel.as_str(),
                "recipient": envelope.recipient.endpoint,
                "display_name": envelope.recipient.display_name,
            }),
        };
        let generation_credential =
            self.generation_credential.as_ref().unwrap_or(&credential);
        let output = self.generation.generate(generation_credential, &work_item).await?;
        let mut usage = output.usage;
        usage.latency_ms = started.elapsed().as_millis() as u64;

        // Record the generation evidence before the send, so metrics survive
        // a crash between the two provider calls. A redelivered attempt gets
        // a fresh thread from the provider; the first persisted reference
        // wins and the fresh one is discarded.
        let persisted = record.state_version;
        if record.workflow_ref.is_none() {
            record.set_workflow_ref(&output.workflow_ref, Utc::now())?;
        }
        if record.pending_message().is_none() && record.delivery_ref.is_none() {
            record.append_pending_message(usage, Utc::now());
        }
        if record.state_version != persisted && self.persist(&mut record, persisted).await? {
            if record.status.is_terminal() {
                info!(
                    event_name = "engine.process.duplicate_delivery",
                    correlation_id = %envelope.correlation_id,
                    conversation_id = %conversation_id.0,
                    status = record.status.as_str(),
                    "concurrent duplicate settled the conversation first"
                );
                return Ok(Outcome::Completed);
            }
        }

        if record.delivery_ref.is_none() {
            let destination = DeliveryDestination {
                channel: envelope.channel.channel,
                sender_id: envelope.channel.sender_id.clone(),
                endpoint: envelope.recipient.endpoint.clone(),
            };
            let receipt = self
                .delivery
                .send(&credential, &conversation_id.0, &destination, &output.variables)
                .await?;

            let persisted = record.state_version;
            if record.pending_message().is_none() {
                // An adopted record whose attempt died before recording its
                // entry; the log stays append-only either way.
                record.append_pending_message(usage, Utc::now());
            }
            record.complete_pending_message(
                &receipt.provider_message_id,
                &summarize(&output.variables),
                Utc::now(),
            )?;
            record.transition(ConversationStatus::InitialMessageSent, Utc::now())?;
            if self.persist(&mut record, persisted).await? && !record.status.is_terminal() {
                // Somebody advanced the record but nobody settled it; let a
                // redelivery converge the state.
                return Ok(Outcome::Retryable);
            }
        } else {
            info!(
                event_name = "engine.process.send_skipped",
                correlation_id = %envelope.correlation_id,
                conversation_id = %conversation_id.0,
                delivery_ref = record.delivery_ref.as_deref().unwrap_or_default(),
                "initial message already delivered"
            );
            let persisted = record.state_version;
            record.transition(ConversationStatus::InitialMessageSent, Utc::now())?;
            if record.state_version != persisted
                && self.persist(&mut record, persisted).await?
                && !record.status.is_terminal()
            {
                return Ok(Outcome::Retryable);
            }
        }

        info!(
            event_name = "engine.process.completed",
            correlation_id = %envelope.correlation_id,
            conversation_id = %conversation_id.0,
            channel = envelope.channel.channel.as_str(),
            "conversation reached initial_message_sent"
        );
        Ok(Outcome::Completed)
    }

    /// Version-guarded persist. A conflict means a concurrent duplicate won
    /// the write; its record is adopted in place and `true` is returned.
    async fn persist(
        &self,
        record: &mut ConversationRecord,
        expected_version: u32,
    ) -> Result<bool, EngineError> {
        match self.store.update(record, expected_version).await {
            Ok(()) => Ok(false),
            Err(StoreError::VersionConflict { .. }) => {
                let fresh =
                    self.store.get(&record.key).await?.ok_or(StoreError::NotFound)?;
                *record = fresh;
                Ok(true)
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn summarize(variables: &BTreeMap<String, String>) -> String {
    let text = variables
        .get("body")
        .or_else(|| variables.values().next())
        .cloned()
        .unwrap_or_default();
    text.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use courier_core::{ConversationKey, UsageMetrics};
    use courier_providers::delivery::{DeliveryApi, DeliveryReceipt};
    use courier_providers::generation::{GenerationWorkflow, RunOutput, RunStatus};
    use courier_providers::{
        AdaptiveLimiter, CircuitBreaker, CircuitBreakerConfig, PollSettings, ProviderError,
        RetryPolicy,
    };
    use courier_store::MemoryConversationStore;

    use super::*;
    use crate::queue::MemoryQueue;
    use crate::testutil::envelope;

    struct StaticResolver;

    #[async_trait]
    impl CredentialResolver for StaticResolver {
        async fn resolve(&self, _reference: &str) -> Result<SecretString, ProviderError> {
            Ok(SecretString::from("token-1".to_string()))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl CredentialResolver for FailingResolver {
        async fn resolve(&self, reference: &str) -> Result<SecretString, ProviderError> {
            Err(ProviderError::Credential(format!("`{reference}` is not set")))
        }
    }

    struct StubWorkflow {
        output: Value,
        threads: AtomicU32,
    }

    impl StubWorkflow {
        fn new(output: Value) -> Self {
            Self { output, threads: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl GenerationWorkflow for StubWorkflow {
        async fn create_thread(&self, _credential: &SecretString) -> Result<String, ProviderError> {
            let n = self.threads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("thread-{n}"))
        }

        async fn start_run(
            &self,
            _credential: &SecretString,
            _thread_id: &str,
            _workflow_id: &str,
            _input: &Value,
        ) -> Result<String, ProviderError> {
            Ok("run-1".to_string())
        }

        async fn run_status(
            &self,
            _credential: &SecretString,
            _thread_id: &str,
            _run_id: &str,
        ) -> Result<RunStatus, ProviderError> {
            Ok(RunStatus::Completed)
        }

        async fn submit_required_action(
            &self,
            _credential: &SecretString,
            _thread_id: &str,
            _run_id: &str,
            _call_id: &str,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn collect_output(
            &self,
            _credential: &SecretString,
            _thread_id: &str,
            _run_id: &str,
        ) -> Result<RunOutput, ProviderError> {
            Ok(RunOutput {
                raw: self.output.clone(),
                usage: UsageMetrics { prompt_tokens: 80, completion_tokens: 32, latency_ms: 0 },
            })
        }
    }

    /// Idempotent delivery fake: a repeated idempotency key yields the
    /// original receipt, mirroring the provider-side contract.
    struct RecordingDelivery {
        failures_before_success: AtomicU32,
        attempts: AtomicU32,
        sent: Mutex<HashMap<String, String>>,
    }

    impl RecordingDelivery {
        fn new(failures_before_success: u32) -> Self {
            Self {
                failures_before_success: AtomicU32::new(failures_before_success),
                attempts: AtomicU32::new(0),
                sent: Mutex::new(HashMap::new()),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        fn unique_sends(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryApi for RecordingDelivery {
        async fn send(
            &self,
            _credential: &SecretString,
            idempotency_key: &str,
            _destination: &DeliveryDestination,
            _variables: &BTreeMap<String, String>,
        ) -> Result<DeliveryReceipt, ProviderError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::Timeout(Duration::from_secs(5)));
            }
            let mut sent = self.sent.lock().unwrap();
            let next_id = format!("wamid.{}", sent.len() + 1);
            let id = sent.entry(idempotency_key.to_string()).or_insert(next_id).clone();
            Ok(DeliveryReceipt { provider_message_id: id })
        }
    }

    struct Harness {
        store: Arc<MemoryConversationStore>,
        queue: Arc<MemoryQueue>,
        delivery: Arc<RecordingDelivery>,
        engine: Arc<ProcessingEngine>,
    }

    fn harness(output: Value, delivery_failures: u32) -> Harness {
        harness_with_resolver(output, delivery_failures, Arc::new(StaticResolver))
    }

    fn harness_with_resolver(
        output: Value,
        delivery_failures: u32,
        resolver: Arc<dyn CredentialResolver>,
    ) -> Harness {
        let store = Arc::new(MemoryConversationStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 5));
        let delivery = Arc::new(RecordingDelivery::new(delivery_failures));
        let engine = build_engine(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::clone(&queue),
            Arc::clone(&delivery),
            resolver,
            output,
        );
        Harness { store, queue, delivery, engine }
    }

    fn build_engine(
        store: Arc<dyn ConversationStore>,
        queue: Arc<MemoryQueue>,
        delivery: Arc<RecordingDelivery>,
        resolver: Arc<dyn CredentialResolver>,
        output: Value,
    ) -> Arc<ProcessingEngine> {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 1, max_delay_ms: 4 };
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 50,
            cooldown: Duration::from_secs(30),
        }));
        let limiter = Arc::new(AdaptiveLimiter::new());

        let generation = GenerationAdapter::new(
            Arc::new(StubWorkflow::new(output)),
            policy.clone(),
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            PollSettings::default(),
            Duration::from_secs(5),
        );
        let delivery_adapter = DeliveryAdapter::new(
            Arc::clone(&delivery) as Arc<dyn DeliveryApi>,
            policy,
            breaker,
            limiter,
            Duration::from_secs(5),
        );

        Arc::new(ProcessingEngine::new(
            store,
            resolver,
            generation,
            None,
            delivery_adapter,
            queue as Arc<dyn TransportQueue>,
            Duration::from_secs(10),
            Duration::from_secs(30),
        ))
    }

    fn lease(n: u32) -> Lease {
        Lease { receipt: format!("rcpt-test-{n}"), receive_count: 1 }
    }

    fn variables() -> Value {
        json!({"body": "welcome aboard", "greeting": "hi"})
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_settles_the_conversation() {
        let harness = harness(variables(), 0);
        let envelope = envelope();

        let outcome = harness.engine.process(&envelope, &lease(1)).await;
        assert_eq!(outcome, Outcome::Completed);

        let key = ConversationRecord::for_envelope(&envelope, Utc::now()).key;
        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, ConversationStatus::InitialMessageSent);
        assert_eq!(record.workflow_ref.as_deref(), Some("thread-1"));
        assert!(record.delivery_ref.is_some());
        assert_eq!(record.messages.len(), 1);
        assert!(record.messages[0].completed_at.is_some());
        assert_eq!(harness.delivery.unique_sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_of_a_settled_conversation_makes_no_provider_calls() {
        let harness = harness(variables(), 0);
        let envelope = envelope();

        assert_eq!(harness.engine.process(&envelope, &lease(1)).await, Outcome::Completed);
        let attempts = harness.delivery.attempts();

        assert_eq!(harness.engine.process(&envelope, &lease(2)).await, Outcome::Completed);
        assert_eq!(harness.delivery.attempts(), attempts);
        assert_eq!(harness.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicates_converge_on_one_record_and_one_send() {
        let harness = harness(variables(), 0);
        let envelope = envelope();

        let first = tokio::spawn({
            let engine = Arc::clone(&harness.engine);
            let envelope = envelope.clone();
            async move { engine.process(&envelope, &lease(1)).await }
        });
        let second = tokio::spawn({
            let engine = Arc::clone(&harness.engine);
            let envelope = envelope.clone();
            async move { engine.process(&envelope, &lease(2)).await }
        });

        let outcomes = (first.await.unwrap(), second.await.unwrap());
        assert!(outcomes.0 == Outcome::Completed || outcomes.1 == Outcome::Completed);

        let key = ConversationRecord::for_envelope(&envelope, Utc::now()).key;
        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(harness.store.len(), 1);
        assert_eq!(record.status, ConversationStatus::InitialMessageSent);
        assert_eq!(record.messages.len(), 1);
        assert_eq!(harness.delivery.unique_sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_variable_map_is_terminal_and_leaves_the_record_processing() {
        let harness = harness(json!({}), 0);
        let envelope = envelope();

        let outcome = harness.engine.process(&envelope, &lease(1)).await;
        assert_eq!(outcome, Outcome::Terminal);

        let key = ConversationRecord::for_envelope(&envelope, Utc::now()).key;
        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, ConversationStatus::Processing);
        assert_eq!(harness.delivery.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_timeouts_are_retried_without_duplicating_the_message() {
        let harness = harness(variables(), 3);
        let envelope = envelope();

        let outcome = harness.engine.process(&envelope, &lease(1)).await;
        assert_eq!(outcome, Outcome::Completed);

        let key = ConversationRecord::for_envelope(&envelope, Utc::now()).key;
        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, ConversationStatus::InitialMessageSent);
        assert_eq!(record.messages.len(), 1);
        assert_eq!(harness.delivery.attempts(), 4);
        assert_eq!(harness.delivery.unique_sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_transient_delivery_failure_settles_on_redelivery() {
        // More injected failures than the retry budget: the first attempt
        // persists the thread reference, then runs out of delivery retries.
        let harness = harness(variables(), 6);
        let envelope = envelope();

        assert_eq!(harness.engine.process(&envelope, &lease(1)).await, Outcome::Retryable);

        let key = ConversationRecord::for_envelope(&envelope, Utc::now()).key;
        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, ConversationStatus::Processing);
        assert_eq!(record.workflow_ref.as_deref(), Some("thread-1"));

        // The redelivered attempt must adopt the stored thread reference and
        // finish the send, not trip over its own earlier progress.
        assert_eq!(harness.engine.process(&envelope, &lease(2)).await, Outcome::Completed);

        let record = harness.store.get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, ConversationStatus::InitialMessageSent);
        assert_eq!(record.workflow_ref.as_deref(), Some("thread-1"));
        assert_eq!(record.messages.len(), 1);
        assert_eq!(harness.delivery.unique_sends(), 1);
    }

    /// Store whose writes always fail, for exercising the update step.
    #[derive(Default)]
    struct WriteRefusingStore {
        inner: MemoryConversationStore,
    }

    #[async_trait]
    impl ConversationStore for WriteRefusingStore {
        async fn create_if_absent(
            &self,
            record: ConversationRecord,
        ) -> Result<(ConversationRecord, bool), StoreError> {
            self.inner.create_if_absent(record).await
        }

        async fn get(
            &self,
            key: &ConversationKey,
        ) -> Result<Option<ConversationRecord>, StoreError> {
            self.inner.get(key).await
        }

        async fn update(
            &self,
            _record: &ConversationRecord,
            _expected_version: u32,
        ) -> Result<(), StoreError> {
            Err(StoreError::NotFound)
        }
    }

    /// Runs one attempt against a leased delivery and asserts the lease stops
    /// being extended once `process` has returned.
    async fn assert_heartbeat_stops(
        queue: &MemoryQueue,
        engine: &ProcessingEngine,
        expected: Outcome,
    ) {
        let envelope = envelope();
        queue.push(envelope.clone());
        let (_, lease) = queue.receive().await.unwrap().expect("delivery");

        assert_eq!(engine.process(&envelope, &lease).await, expected);

        let before = queue.extension_count();
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.extension_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_when_credential_resolution_fails() {
        let harness = harness_with_resolver(variables(), 0, Arc::new(FailingResolver));
        assert_heartbeat_stops(&harness.queue, &harness.engine, Outcome::Terminal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_when_generation_output_is_rejected() {
        let harness = harness(json!({}), 0);
        assert_heartbeat_stops(&harness.queue, &harness.engine, Outcome::Terminal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_when_delivery_retries_run_out() {
        let harness = harness(variables(), 6);
        assert_heartbeat_stops(&harness.queue, &harness.engine, Outcome::Retryable).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_when_the_record_write_fails() {
        let store = Arc::new(WriteRefusingStore::default());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 5));
        let delivery = Arc::new(RecordingDelivery::new(0));
        let engine = build_engine(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::clone(&queue),
            Arc::clone(&delivery),
            Arc::new(StaticResolver),
            variables(),
        );

        assert_heartbeat_stops(&queue, &engine, Outcome::Retryable).await;
    }

    #[test]
    fn summary_prefers_the_body_variable() {
        let variables = BTreeMap::from([
            ("body".to_string(), "hello there".to_string()),
            ("a_greeting".to_string(), "hi".to_string()),
        ]);
        assert_eq!(summarize(&variables), "hello there");
    }
}
