//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint that speaks the chat-completions protocol with
//! function tools (OpenAI, OpenRouter, local gateways).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChatMessage, ChatRole, NarratorClient, NarratorReply, ToolCall};
use crate::config::NarratorSettings;
use crate::error::ModelError;

/// Narrator backed by a chat-completions HTTP endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Build a client from narrator settings, reading the key from the
    /// configured environment variable.
    pub fn from_settings(settings: &NarratorSettings) -> Self {
        let mut client = Self::new(&settings.base_url, &settings.model);
        client.api_key = settings.api_key();
        client.temperature = settings.temperature;
        client.max_tokens = settings.max_tokens;
        client
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request<'a>(&'a self, messages: &[ChatMessage], tools: &'a [Value]) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: (!tools.is_empty()).then_some(tools),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    async fn send_request(&self, body: &CompletionRequest<'_>) -> Result<CompletionResponse, ModelError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ModelError::Communication(format!("request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(map_http_error(status, body_text));
        }

        response
            .json()
            .await
            .map_err(|err| ModelError::Protocol(format!("failed to parse response: {err}")))
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl NarratorClient for OpenAiClient {
    async fn converse(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<NarratorReply, ModelError> {
        let request = self.build_request(messages, tools);
        let response = self.send_request(&request).await?;
        into_reply(response)
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let content = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
            None
        } else {
            Some(msg.content.clone())
        };
        Self {
            role: msg.role,
            content,
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                })
                .collect(),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object.
    arguments: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn into_reply(response: CompletionResponse) -> Result<NarratorReply, ModelError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| ModelError::Protocol("response contained no choices".into()))?;

    if !message.tool_calls.is_empty() {
        let calls = message
            .tool_calls
            .into_iter()
            .map(|call| {
                let args = if call.function.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.function.arguments).map_err(|err| {
                        ModelError::Protocol(format!(
                            "arguments for {} are not JSON: {err}",
                            call.function.name
                        ))
                    })?
                };
                Ok(ToolCall::new(call.id, call.function.name, args))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        return Ok(NarratorReply::ToolCalls(calls));
    }

    match message.content {
        Some(text) if !text.trim().is_empty() => Ok(NarratorReply::text(text)),
        _ => Err(ModelError::Protocol(
            "response had neither content nor tool calls".into(),
        )),
    }
}

fn map_http_error(status: StatusCode, body: String) -> ModelError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or(body);

    let retryable = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    );

    if retryable {
        ModelError::Communication(format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        ModelError::Protocol(format!("HTTP {}: {}", status.as_u16(), message))
    }
}
