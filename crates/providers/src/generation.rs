use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use courier_core::UsageMetrics;

use crate::circuit::CircuitBreaker;
use crate::error::ProviderError;
use crate::limiter::AdaptiveLimiter;
use crate::retry::{run_with_retry, RetryPolicy};

/// One generation request: which provider-side workflow to run and the
/// request context it receives.
#[derive(Clone, Debug)]
pub struct GenerationWorkItem {
    pub workflow_id: String,
    pub input: Value,
}

/// Intermediate state produced by the provider when the run wants its
/// structured output collected before it can finish.
#[derive(Clone, Debug)]
pub struct RequiredAction {
    pub call_id: String,
    pub payload: Value,
}

#[derive(Clone, Debug)]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction(RequiredAction),
    Completed,
    Failed(String),
    Expired,
}

#[derive(Clone, Debug)]
pub struct RunOutput {
    pub raw: Value,
    pub usage: UsageMetrics,
}

/// The stateful provider surface behind the adapter: thread -> run ->
/// poll-to-completion -> structured result.
#[async_trait]
pub trait GenerationWorkflow: Send + Sync {
    async fn create_thread(&self, credential: &SecretString) -> Result<String, ProviderError>;

    async fn start_run(
        &self,
        credential: &SecretString,
        thread_id: &str,
        workflow_id: &str,
        input: &Value,
    ) -> Result<String, ProviderError>;

    async fn run_status(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunStatus, ProviderError>;

    async fn submit_required_action(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
        call_id: &str,
    ) -> Result<(), ProviderError>;

    async fn collect_output(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunOutput, ProviderError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub initial: Duration,
    pub max: Duration,
    pub ceiling: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            ceiling: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Flat variable map keyed to the channel's templating scheme.
    pub variables: BTreeMap<String, String>,
    pub usage: UsageMetrics,
    /// Provider-side thread reference, persisted once on the record.
    pub workflow_ref: String,
}

/// Wraps the asynchronous generation workflow behind a synchronous-looking
/// call: per-call timeout, retry with backoff, shared breaker and limiter,
/// and the bounded poll loop.
pub struct GenerationAdapter {
    workflow: Arc<dyn GenerationWorkflow>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<AdaptiveLimiter>,
    poll: PollSettings,
    request_timeout: Duration,
}

impl GenerationAdapter {
    pub fn new(
        workflow: Arc<dyn GenerationWorkflow>,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<AdaptiveLimiter>,
        poll: PollSettings,
        request_timeout: Duration,
    ) -> Self {
        Self { workflow, policy, breaker, limiter, poll, request_timeout }
    }

    pub async fn generate(
        &self,
        credential: &SecretString,
        work_item: &GenerationWorkItem,
    ) -> Result<GenerationOutput, ProviderError> {
        let timeout = self.request_timeout;

        let thread_id = run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
            with_timeout(timeout, self.workflow.create_thread(credential)).await
        })
        .await?;

        let run_id = run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
            with_timeout(
                timeout,
                self.workflow.start_run(
                    credential,
                    &thread_id,
                    &work_item.workflow_id,
                    &work_item.input,
                ),
            )
            .await
        })
        .await?;

        debug!(
            event_name = "provider.generation.run_started",
            thread_id = %thread_id,
            run_id = %run_id,
            workflow_id = %work_item.workflow_id,
            "generation run started"
        );

        let mut extracted: Option<BTreeMap<String, String>> = None;
        let deadline = Instant::now() + self.poll.ceiling;
        let mut interval = self.poll.initial;

        loop {
            if Instant::now() >= deadline {
                return Err(ProviderError::PollTimeout(self.poll.ceiling));
            }

            let status = run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
                with_timeout(timeout, self.workflow.run_status(credential, &thread_id, &run_id))
                    .await
            })
            .await?;

            match status {
                RunStatus::Queued | RunStatus::InProgress => {
                    tokio::time::sleep(interval).await;
                    interval = (interval * 3 / 2).min(self.poll.max);
                }
                RunStatus::RequiresAction(action) => {
                    if extracted.is_some() {
                        return Err(ProviderError::InvalidOutput(
                            "run requested a second structured-output extraction".to_string(),
                        ));
                    }
                    extracted = Some(parse_variables(&action.payload)?);
                    run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
                        with_timeout(
                            timeout,
                            self.workflow.submit_required_action(
                                credential,
                                &thread_id,
                                &run_id,
                                &action.call_id,
                            ),
                        )
                        .await
                    })
                    .await?;
                }
                RunStatus::Completed => break,
                RunStatus::Failed(reason) => return Err(ProviderError::Workflow(reason)),
                RunStatus::Expired => {
                    return Err(ProviderError::Workflow("run expired".to_string()))
                }
            }
        }

        let output = run_with_retry(&self.policy, &self.breaker, &self.limiter, || async {
            with_timeout(timeout, self.workflow.collect_output(credential, &thread_id, &run_id))
                .await
        })
        .await?;

        let variables = match extracted {
            Some(variables) => variables,
            None => parse_variables(&output.raw)?,
        };

        info!(
            event_name = "provider.generation.completed",
            thread_id = %thread_id,
            run_id = %run_id,
            variable_count = variables.len(),
            prompt_tokens = output.usage.prompt_tokens,
            completion_tokens = output.usage.completion_tokens,
            "generation run completed"
        );

        Ok(GenerationOutput { variables, usage: output.usage, workflow_ref: thread_id })
    }
}

/// The terminal output must be a non-empty flat string-to-string map. Anything
/// else can never template a message, so it is a configuration failure even
/// though the provider call itself succeeded.
fn parse_variables(value: &Value) -> Result<BTreeMap<String, String>, ProviderError> {
    let object = value.as_object().ok_or_else(|| {
        ProviderError::InvalidOutput(format!("expected a JSON object, got: {value}"))
    })?;

    let mut variables = BTreeMap::new();
    for (key, entry) in object {
        let text = entry.as_str().ok_or_else(|| {
            ProviderError::InvalidOutput(format!("variable `{key}` is not a string"))
        })?;
        variables.insert(key.clone(), text.to_string());
    }

    if variables.is_empty() {
        return Err(ProviderError::InvalidOutput("empty variable map".to_string()));
    }

    Ok(variables)
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| ProviderError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::circuit::CircuitBreakerConfig;

    struct ScriptedWorkflow {
        statuses: Mutex<Vec<RunStatus>>,
        output: Value,
    }

    impl ScriptedWorkflow {
        fn new(mut statuses: Vec<RunStatus>, output: Value) -> Self {
            statuses.reverse();
            Self { statuses: Mutex::new(statuses), output }
        }
    }

    #[async_trait]
    impl GenerationWorkflow for ScriptedWorkflow {
        async fn create_thread(&self, _credential: &SecretString) -> Result<String, ProviderError> {
            Ok("thread-1".to_string())
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
            let mut statuses = self.statuses.lock().unwrap();
            Ok(statuses.pop().unwrap_or(RunStatus::InProgress))
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
                usage: UsageMetrics { prompt_tokens: 100, completion_tokens: 20, latency_ms: 0 },
            })
        }
    }

    fn adapter(workflow: ScriptedWorkflow, poll: PollSettings) -> GenerationAdapter {
        GenerationAdapter::new(
            Arc::new(workflow),
            RetryPolicy { max_retries: 1, base_delay_ms: 1, max_delay_ms: 2 },
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            Arc::new(AdaptiveLimiter::new()),
            poll,
            Duration::from_secs(30),
        )
    }

    fn work_item() -> GenerationWorkItem {
        GenerationWorkItem { workflow_id: "wf-1".to_string(), input: json!({"name": "Sam"}) }
    }

    fn credential() -> SecretString {
        SecretString::from("token".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn completed_run_yields_validated_variables() {
        let adapter = adapter(
            ScriptedWorkflow::new(
                vec![RunStatus::Queued, RunStatus::InProgress, RunStatus::Completed],
                json!({"greeting": "hi", "body": "welcome"}),
            ),
            PollSettings::default(),
        );

        let output = adapter.generate(&credential(), &work_item()).await.unwrap();
        assert_eq!(output.variables.len(), 2);
        assert_eq!(output.variables["greeting"], "hi");
        assert_eq!(output.workflow_ref, "thread-1");
        assert_eq!(output.usage.prompt_tokens, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn requires_action_extracts_exactly_once() {
        let action = RequiredAction {
            call_id: "call-1".to_string(),
            payload: json!({"greeting": "hola"}),
        };
        let adapter = adapter(
            ScriptedWorkflow::new(
                vec![
                    RunStatus::InProgress,
                    RunStatus::RequiresAction(action),
                    RunStatus::InProgress,
                    RunStatus::Completed,
                ],
                json!("not-a-map"),
            ),
            PollSettings::default(),
        );

        // The extracted variables win; collect_output is only for usage.
        let output = adapter.generate(&credential(), &work_item()).await.unwrap();
        assert_eq!(output.variables["greeting"], "hola");
    }

    #[tokio::test(start_paused = true)]
    async fn second_requires_action_is_a_configuration_error() {
        let first = RequiredAction { call_id: "c1".to_string(), payload: json!({"a": "1"}) };
        let second = RequiredAction { call_id: "c2".to_string(), payload: json!({"b": "2"}) };
        let adapter = adapter(
            ScriptedWorkflow::new(
                vec![RunStatus::RequiresAction(first), RunStatus::RequiresAction(second)],
                json!({}),
            ),
            PollSettings::default(),
        );

        let error = adapter.generate(&credential(), &work_item()).await.unwrap_err();
        assert!(matches!(error, ProviderError::InvalidOutput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_variable_map_is_a_configuration_error() {
        let adapter = adapter(
            ScriptedWorkflow::new(vec![RunStatus::Completed], json!({})),
            PollSettings::default(),
        );

        let error = adapter.generate(&credential(), &work_item()).await.unwrap_err();
        assert_eq!(error, ProviderError::InvalidOutput("empty variable map".to_string()));
        assert_eq!(error.class(), courier_core::ErrorClass::Configuration);
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_run_times_out_at_the_ceiling() {
        let poll = PollSettings {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            ceiling: Duration::from_secs(30),
        };
        let adapter = adapter(ScriptedWorkflow::new(vec![], json!({})), poll.clone());

        let started = Instant::now();
        let error = adapter.generate(&credential(), &work_item()).await.unwrap_err();

        assert_eq!(error, ProviderError::PollTimeout(poll.ceiling));
        let elapsed = started.elapsed();
        assert!(elapsed >= poll.ceiling - poll.max, "returned too early: {elapsed:?}");
        assert!(elapsed <= poll.ceiling + poll.max, "overshot ceiling: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_surfaces_as_transient_workflow_error() {
        let adapter = adapter(
            ScriptedWorkflow::new(
                vec![RunStatus::Failed("provider went away".to_string())],
                json!({}),
            ),
            PollSettings::default(),
        );

        let error = adapter.generate(&credential(), &work_item()).await.unwrap_err();
        assert!(matches!(error, ProviderError::Workflow(_)));
        assert_eq!(error.class(), courier_core::ErrorClass::Transient);
    }
}
