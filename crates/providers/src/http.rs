//! HTTP implementations of the provider seams.
//!
//! The generation side speaks a threads/runs-style REST workflow; the
//! delivery side posts channel messages with an idempotency key. Both feed
//! observed rate-limit headers into the shared limiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use courier_core::{ChannelKind, UsageMetrics};

use crate::delivery::{DeliveryApi, DeliveryDestination, DeliveryReceipt};
use crate::error::ProviderError;
use crate::generation::{GenerationWorkflow, RequiredAction, RunOutput, RunStatus};
use crate::limiter::AdaptiveLimiter;

fn from_reqwest(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(Duration::from_secs(0))
    } else {
        ProviderError::Transport(error.to_string())
    }
}

fn observe_quota(limiter: &AdaptiveLimiter, headers: &HeaderMap) {
    let remaining = headers
        .get("x-ratelimit-remaining-requests")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(remaining) = remaining {
        let reset = headers
            .get("x-ratelimit-reset-requests")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim_end_matches('s').parse::<f64>().ok())
            .map(Duration::from_secs_f64);
        limiter.record_quota(remaining, reset);
    }
}

async fn execute(limiter: &AdaptiveLimiter, request: RequestBuilder) -> Result<Response, ProviderError> {
    let response = request.send().await.map_err(from_reqwest)?;
    observe_quota(limiter, response.headers());

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }
    Err(ProviderError::Http { status: status.as_u16() })
}

pub struct HttpGenerationWorkflow {
    client: Client,
    base_url: String,
    limiter: Arc<AdaptiveLimiter>,
}

impl HttpGenerationWorkflow {
    pub fn new(base_url: impl Into<String>, limiter: Arc<AdaptiveLimiter>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), limiter }
    }

    fn authed(&self, request: RequestBuilder, credential: &SecretString) -> RequestBuilder {
        request
            .bearer_auth(credential.expose_secret())
            .header("OpenAI-Beta", "assistants=v2")
    }
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    status: String,
    #[serde(default)]
    required_action: Option<RequiredActionResponse>,
    #[serde(default)]
    last_error: Option<LastError>,
    #[serde(default)]
    usage: Option<RunUsage>,
}

#[derive(Deserialize)]
struct RequiredActionResponse {
    submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Deserialize)]
struct SubmitToolOutputs {
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    id: String,
    function: ToolFunction,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: String,
}

#[derive(Deserialize)]
struct LastError {
    message: String,
}

#[derive(Deserialize, Default)]
struct RunUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct ThreadMessage {
    content: Vec<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Deserialize)]
struct MessageText {
    value: String,
}

#[async_trait]
impl GenerationWorkflow for HttpGenerationWorkflow {
    async fn create_thread(&self, credential: &SecretString) -> Result<String, ProviderError> {
        let request =
            self.authed(self.client.post(format!("{}/threads", self.base_url)), credential);
        let response = execute(&self.limiter, request.json(&json!({}))).await?;
        let body: IdResponse = response.json().await.map_err(from_reqwest)?;
        Ok(body.id)
    }

    async fn start_run(
        &self,
        credential: &SecretString,
        thread_id: &str,
        workflow_id: &str,
        input: &Value,
    ) -> Result<String, ProviderError> {
        let request = self.authed(
            self.client.post(format!("{}/threads/{thread_id}/runs", self.base_url)),
            credential,
        );
        let body = json!({
            "assistant_id": workflow_id,
            "additional_instructions": input.to_string(),
        });
        let response = execute(&self.limiter, request.json(&body)).await?;
        let body: IdResponse = response.json().await.map_err(from_reqwest)?;
        Ok(body.id)
    }

    async fn run_status(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunStatus, ProviderError> {
        let request = self.authed(
            self.client.get(format!("{}/threads/{thread_id}/runs/{run_id}", self.base_url)),
            credential,
        );
        let response = execute(&self.limiter, request).await?;
        let run: RunResponse = response.json().await.map_err(from_reqwest)?;

        match run.status.as_str() {
            "queued" => Ok(RunStatus::Queued),
            "in_progress" | "cancelling" => Ok(RunStatus::InProgress),
            "requires_action" => {
                let call = run
                    .required_action
                    .and_then(|action| action.submit_tool_outputs.tool_calls.into_iter().next())
                    .ok_or_else(|| {
                        ProviderError::InvalidOutput(
                            "requires_action without a tool call".to_string(),
                        )
                    })?;
                let payload: Value = serde_json::from_str(&call.function.arguments).map_err(
                    |error| {
                        ProviderError::InvalidOutput(format!(
                            "tool call arguments are not JSON: {error}"
                        ))
                    },
                )?;
                Ok(RunStatus::RequiresAction(RequiredAction { call_id: call.id, payload }))
            }
            "completed" => Ok(RunStatus::Completed),
            "failed" | "cancelled" | "incomplete" => Ok(RunStatus::Failed(
                run.last_error.map(|error| error.message).unwrap_or_else(|| run.status.clone()),
            )),
            "expired" => Ok(RunStatus::Expired),
            other => Err(ProviderError::Workflow(format!("unknown run status `{other}`"))),
        }
    }

    async fn submit_required_action(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
        call_id: &str,
    ) -> Result<(), ProviderError> {
        let request = self.authed(
            self.client.post(format!(
                "{}/threads/{thread_id}/runs/{run_id}/submit_tool_outputs",
                self.base_url
            )),
            credential,
        );
        let body = json!({
            "tool_outputs": [{ "tool_call_id": call_id, "output": "{\"status\":\"received\"}" }],
        });
        execute(&self.limiter, request.json(&body)).await?;
        Ok(())
    }

    async fn collect_output(
        &self,
        credential: &SecretString,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunOutput, ProviderError> {
        let request = self.authed(
            self.client.get(format!("{}/threads/{thread_id}/runs/{run_id}", self.base_url)),
            credential,
        );
        let response = execute(&self.limiter, request).await?;
        let run: RunResponse = response.json().await.map_err(from_reqwest)?;
        let usage = run.usage.unwrap_or_default();

        let request = self.authed(
            self.client
                .get(format!("{}/threads/{thread_id}/messages", self.base_url))
                .query(&[("limit", "1"), ("order", "desc")]),
            credential,
        );
        let response = execute(&self.limiter, request).await?;
        let messages: MessageList = response.json().await.map_err(from_reqwest)?;

        let text = messages
            .data
            .into_iter()
            .next()
            .and_then(|message| message.content.into_iter().find_map(|content| content.text))
            .map(|text| text.value)
            .ok_or_else(|| {
                ProviderError::InvalidOutput("thread has no text output".to_string())
            })?;

        let raw: Value = serde_json::from_str(&text).map_err(|error| {
            ProviderError::InvalidOutput(format!("thread output is not JSON: {error}"))
        })?;

        Ok(RunOutput {
            raw,
            usage: UsageMetrics {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                latency_ms: 0,
            },
        })
    }
}

pub struct HttpDeliveryApi {
    client: Client,
    base_url: String,
    limiter: Arc<AdaptiveLimiter>,
}

impl HttpDeliveryApi {
    pub fn new(base_url: impl Into<String>, limiter: Arc<AdaptiveLimiter>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), limiter }
    }
}

/// Flatten the variable map into the message body. `body` wins when present;
/// otherwise values are joined in key order, which is stable because the map
/// is ordered.
fn message_body(variables: &BTreeMap<String, String>) -> String {
    variables
        .get("body")
        .cloned()
        .unwrap_or_else(|| variables.values().cloned().collect::<Vec<_>>().join("\n"))
}

#[derive(Deserialize)]
struct WhatsAppSendResponse {
    messages: Vec<WhatsAppMessageId>,
}

#[derive(Deserialize)]
struct WhatsAppMessageId {
    id: String,
}

#[derive(Deserialize)]
struct GenericSendResponse {
    #[serde(alias = "id")]
    message_id: String,
}

#[async_trait]
impl DeliveryApi for HttpDeliveryApi {
    async fn send(
        &self,
        credential: &SecretString,
        idempotency_key: &str,
        destination: &DeliveryDestination,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let body = message_body(variables);

        match destination.channel {
            ChannelKind::WhatsApp => {
                let request = self
                    .client
                    .post(format!("{}/{}/messages", self.base_url, destination.sender_id))
                    .bearer_auth(credential.expose_secret())
                    .header("Idempotency-Key", idempotency_key)
                    .json(&json!({
                        "messaging_product": "whatsapp",
                        "to": destination.endpoint,
                        "type": "text",
                        "text": { "body": body },
                    }));
                let response = execute(&self.limiter, request).await?;
                let parsed: WhatsAppSendResponse = response.json().await.map_err(from_reqwest)?;
                let id = parsed.messages.into_iter().next().map(|message| message.id).ok_or_else(
                    || ProviderError::InvalidOutput("send response had no message id".to_string()),
                )?;
                Ok(DeliveryReceipt { provider_message_id: id })
            }
            ChannelKind::Sms | ChannelKind::Email => {
                let request = self
                    .client
                    .post(format!(
                        "{}/{}/{}/messages",
                        self.base_url,
                        destination.channel.as_str(),
                        destination.sender_id
                    ))
                    .bearer_auth(credential.expose_secret())
                    .header("Idempotency-Key", idempotency_key)
                    .json(&json!({
                        "to": destination.endpoint,
                        "body": body,
                        "variables": variables,
                    }));
                let response = execute(&self.limiter, request).await?;
                let parsed: GenericSendResponse = response.json().await.map_err(from_reqwest)?;
                Ok(DeliveryReceipt { provider_message_id: parsed.message_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_variable_takes_precedence() {
        let variables = BTreeMap::from([
            ("body".to_string(), "hello".to_string()),
            ("greeting".to_string(), "hi".to_string()),
        ]);
        assert_eq!(message_body(&variables), "hello");
    }

    #[test]
    fn missing_body_joins_values_in_key_order() {
        let variables = BTreeMap::from([
            ("b_second".to_string(), "two".to_string()),
            ("a_first".to_string(), "one".to_string()),
        ]);
        assert_eq!(message_body(&variables), "one\ntwo");
    }
}
