use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{
    ChatOptions, ChatResponse, DeltaTx, LlmProvider, Message, Role, ToolCall, ToolChoice,
    ToolDefinition,
};
use crate::retry::send_with_retry;
use crate::sse::{decode_response, split_think};

const PROVIDER: &str = "openai";
const MAX_RATE_LIMIT_RETRIES: u32 = 2;

/// Client for any `/chat/completions` endpoint speaking the `OpenAI` wire format
/// (llama.cpp, vLLM, Ollama's compatibility layer, hosted APIs).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    streaming: bool,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl OpenAiProvider {
    #[must_use]
    pub fn new(mut base_url: String, model: String, api_key: Option<String>) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: crate::http::default_client(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url,
            model,
            streaming: true,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Same endpoint and credentials, different model. Used for the auxiliary model.
    #[must_use]
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    async fn post(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: convert_messages(messages),
            tool_choice: (!tools.is_empty()).then_some(options.tool_choice),
            tools: tools.iter().map(ApiTool::from).collect(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let response = send_with_retry(PROVIDER, MAX_RATE_LIMIT_RETRIES, || {
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("{PROVIDER} API error {status}: {body}");
            return Err(LlmError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl LlmProvider for OpenAiProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let response = self.post(messages, tools, options, false).await?;
        let text = response.text().await.map_err(LlmError::Http)?;
        parse_chat_response(&text)
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        tx: Option<&DeltaTx>,
    ) -> Result<ChatResponse, LlmError> {
        let response = self.post(messages, tools, options, true).await?;
        Ok(decode_response(response, tx).await)
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}

fn parse_chat_response(text: &str) -> Result<ChatResponse, LlmError> {
    let resp: ApiChatResponse = serde_json::from_str(text)?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(LlmError::EmptyResponse { provider: PROVIDER })?;
    let msg = choice.message;

    let (content, inline_reasoning) = split_think(msg.content.as_deref().unwrap_or_default());
    let mut reasoning = msg.reasoning_content.or(msg.reasoning).unwrap_or_default();
    reasoning.push_str(&inline_reasoning);

    let tool_calls = msg
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(i, tc)| ToolCall {
            id: tc.id.filter(|id| !id.is_empty()).unwrap_or_else(|| format!("call_{i}")),
            name: tc.function.name,
            arguments: match tc.function.arguments {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            },
        })
        .collect();

    Ok(ChatResponse {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls,
        finish_reason: choice.finish_reason,
        partial: false,
    })
}

/// Model-facing form of the conversation. Reasoning is never resubmitted.
fn convert_messages(messages: &[Message]) -> Vec<ApiMessage<'_>> {
    messages
        .iter()
        .map(|m| {
            let content = if m.attachments.is_empty() {
                if m.role == Role::Assistant && m.content.is_empty() && m.has_tool_calls() {
                    None
                } else {
                    Some(ApiContent::Text(&m.content))
                }
            } else {
                let mut parts = Vec::with_capacity(m.attachments.len() + 1);
                if !m.content.is_empty() {
                    parts.push(ContentPart::Text { text: &m.content });
                }
                parts.extend(m.attachments.iter().map(|a| ContentPart::ImageUrl {
                    image_url: ImageUrl { url: a.data_uri() },
                }));
                Some(ApiContent::Parts(parts))
            };
            ApiMessage {
                role: m.role.as_str(),
                content,
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: &tc.id,
                        r#type: "function",
                        function: ApiFunctionCall {
                            name: &tc.name,
                            arguments: &tc.arguments,
                        },
                    })
                    .collect(),
                tool_call_id: m.tool_call_id.as_deref(),
            }
        })
        .collect()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: Option<ApiContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ApiToolCall<'a> {
    id: &'a str,
    r#type: &'a str,
    function: ApiFunctionCall<'a>,
}

#[derive(Serialize)]
struct ApiFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    r#type: &'a str,
    function: ApiFunction<'a>,
}

impl<'a> From<&'a ToolDefinition> for ApiTool<'a> {
    fn from(t: &'a ToolDefinition) -> Self {
        Self {
            r#type: "function",
            function: ApiFunction {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        }
    }
}

#[derive(Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiResponseToolCall>,
}

#[derive(Deserialize)]
struct ApiResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ApiResponseFunction,
}

#[derive(Deserialize)]
struct ApiResponseFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}
