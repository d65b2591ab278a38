use std::collections::BTreeMap;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::{
    Attachment, ChatModel, ModelChunk, ModelChunkStream, ModelCompletion, ModelMessage,
    ModelToolCall, ModelToolChoice, ModelToolDefinition, ModelUsage,
};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const EMPTY_USER_CONTENT_FALLBACK: &str = " ";

#[derive(Debug, Clone)]
/// Runtime configuration for [`OpenAiCompatModel`].
pub struct OpenAiCompatModelConfig {
    /// Bearer key. Local servers usually accept none.
    pub api_key: Option<String>,
    /// Model id sent with every request and used for mode selection.
    pub model: String,
    /// Base URL of the chat-completions API, without the `/chat/completions` suffix.
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl OpenAiCompatModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(4096),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = Some(base_url.into());
        self
    }
}

/// Adapter for any endpoint speaking the OpenAI chat-completions dialect.
#[derive(Debug, Clone)]
pub struct OpenAiCompatModel {
    client: Client,
    config: OpenAiCompatModelConfig,
}

impl OpenAiCompatModel {
    pub fn new(config: OpenAiCompatModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Reads `OPENAI_API_KEY` and `OPENAI_BASE_URL` when present.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let mut config = OpenAiCompatModelConfig::new(model);
        config.api_key = std::env::var("OPENAI_API_KEY").ok();
        config.api_base_url = std::env::var("OPENAI_BASE_URL").ok();
        Self::new(config)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let request = build_request(messages, tools, tool_choice, &self.config);
        let payload = self
            .send(&request)
            .await?
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(payload)
    }

    async fn stream(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelChunkStream, ProviderError> {
        let mut request = build_request(messages, tools, tool_choice, &self.config);
        request.stream = true;
        request.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        let mut body = self.send(&request).await?.bytes_stream();

        Ok(Box::pin(try_stream! {
            let mut lines = SseLineDecoder::default();
            let mut assembler = StreamAssembler::default();

            'read: while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(|err| ProviderError::Stream(err.to_string()))?;
                for line in lines.push(&bytes) {
                    match line {
                        SseLine::Done => break 'read,
                        SseLine::Data(payload) => {
                            for chunk in assembler.apply(&payload)? {
                                yield chunk;
                            }
                        }
                    }
                }
            }

            for chunk in assembler.finish()? {
                yield chunk;
            }
        }))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinitionPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoicePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallPayload>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ToolDefinitionPayload {
    #[serde(rename = "type")]
    type_: String,
    function: ToolFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct ToolFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ToolChoicePayload {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        type_: String,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ToolChoiceFunction {
    name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ToolCallPayload {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    function: ToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallPayload>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl From<Usage> for ModelUsage {
    fn from(usage: Usage) -> Self {
        ModelUsage {
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

fn build_request(
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
    tool_choice: ModelToolChoice,
    config: &OpenAiCompatModelConfig,
) -> ChatCompletionRequest {
    let request_messages = ensure_non_empty_messages(to_request_messages(messages));

    let tools_payload = if tools.is_empty() {
        None
    } else {
        Some(
            tools
                .iter()
                .map(|tool| ToolDefinitionPayload {
                    type_: "function".to_string(),
                    function: ToolFunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect::<Vec<_>>(),
        )
    };

    let tool_choice_payload = if tools.is_empty() {
        None
    } else {
        Some(match tool_choice {
            ModelToolChoice::Auto => ToolChoicePayload::Mode("auto".to_string()),
            ModelToolChoice::Required => ToolChoicePayload::Mode("required".to_string()),
            ModelToolChoice::None => ToolChoicePayload::Mode("none".to_string()),
            ModelToolChoice::Tool(name) => ToolChoicePayload::Specific {
                type_: "function".to_string(),
                function: ToolChoiceFunction { name },
            },
        })
    };

    ChatCompletionRequest {
        model: config.model.clone(),
        messages: request_messages,
        tools: tools_payload,
        tool_choice: tool_choice_payload,
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_tokens,
        stream: false,
        stream_options: None,
    }
}

fn to_request_messages(messages: &[ModelMessage]) -> Vec<RequestMessage> {
    let mut request_messages = Vec::new();

    for message in messages {
        match message {
            ModelMessage::System { content } => {
                if content.is_empty() {
                    continue;
                }
                request_messages.push(RequestMessage::System {
                    content: content.clone(),
                });
            }
            ModelMessage::User {
                content,
                attachments,
            } => {
                if content.is_empty() && attachments.is_empty() {
                    continue;
                }
                request_messages.push(RequestMessage::User {
                    content: user_content(content, attachments),
                });
            }
            ModelMessage::Assistant {
                content,
                tool_calls,
            } => {
                let serialized_tool_calls = tool_calls
                    .iter()
                    .map(|tool_call| ToolCallPayload {
                        id: tool_call.id.clone(),
                        type_: "function".to_string(),
                        function: ToolCallFunction {
                            name: tool_call.name.clone(),
                            arguments: tool_call.arguments.to_string(),
                        },
                    })
                    .collect::<Vec<_>>();

                let assistant_content = content.as_ref().filter(|text| !text.is_empty()).cloned();
                if assistant_content.is_none() && serialized_tool_calls.is_empty() {
                    continue;
                }

                request_messages.push(RequestMessage::Assistant {
                    content: assistant_content,
                    tool_calls: if serialized_tool_calls.is_empty() {
                        None
                    } else {
                        Some(serialized_tool_calls)
                    },
                });
            }
            ModelMessage::ToolResult {
                tool_call_id,
                tool_name: _,
                content,
                is_error,
            } => {
                let rendered = if *is_error {
                    format!("Error: {content}")
                } else {
                    content.clone()
                };

                request_messages.push(RequestMessage::Tool {
                    tool_call_id: tool_call_id.clone(),
                    content: rendered,
                });
            }
        }
    }

    request_messages
}

fn user_content(content: &str, attachments: &[Attachment]) -> UserContent {
    if attachments.is_empty() {
        return UserContent::Text(content.to_string());
    }

    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !content.is_empty() {
        parts.push(ContentPart::Text {
            text: content.to_string(),
        });
    }
    for attachment in attachments {
        parts.push(match attachment {
            Attachment::Text { text } => ContentPart::Text { text: text.clone() },
            Attachment::Image { url, .. } => ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.clone() },
            },
            Attachment::File { uri, name } => ContentPart::Text {
                text: format!("[file {}: {uri}]", name.as_deref().unwrap_or("attachment")),
            },
        });
    }
    UserContent::Parts(parts)
}

fn ensure_non_empty_messages(mut messages: Vec<RequestMessage>) -> Vec<RequestMessage> {
    if messages.is_empty() {
        messages.push(RequestMessage::User {
            content: UserContent::Text(EMPTY_USER_CONTENT_FALLBACK.to_string()),
        });
    }

    messages
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str::<Value>(raw).map_err(|err| {
        ProviderError::Response(format!(
            "tool call arguments for '{name}' are not valid JSON: {err}"
        ))
    })
}

fn normalize_response(response: ChatCompletionResponse) -> Result<ModelCompletion, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("response missing choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Response("response missing choice message".to_string()))?;

    let mut tool_calls = Vec::new();
    for tool_call in message.tool_calls {
        let arguments = parse_arguments(&tool_call.function.name, &tool_call.function.arguments)?;
        tool_calls.push(ModelToolCall {
            id: tool_call.id,
            name: tool_call.function.name,
            arguments,
        });
    }

    Ok(ModelCompletion {
        text: message.content.filter(|text| !text.is_empty()),
        thinking: message.reasoning_content.filter(|text| !text.is_empty()),
        tool_calls,
        usage: response.usage.map(ModelUsage::from),
    })
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Data(String),
    Done,
}

/// Splits a server-sent-event byte stream into `data:` payloads.
#[derive(Default)]
struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw = self.pending.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                lines.push(SseLine::Done);
            } else if !data.is_empty() {
                lines.push(SseLine::Data(data.to_string()));
            }
        }
        lines
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into chunks, assembling tool calls by index.
#[derive(Default)]
struct StreamAssembler {
    calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<ModelUsage>,
}

impl StreamAssembler {
    fn apply(&mut self, payload: &str) -> Result<Vec<ModelChunk>, ProviderError> {
        let chunk = serde_json::from_str::<StreamChunk>(payload)
            .map_err(|err| ProviderError::Stream(format!("malformed stream chunk: {err}")))?;

        if let Some(error) = chunk.error {
            return Ok(vec![ModelChunk::Error(
                error
                    .message
                    .unwrap_or_else(|| "unknown stream error".to_string()),
            )]);
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut chunks = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
                chunks.push(ModelChunk::ReasoningDelta(reasoning));
            }
            if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
                chunks.push(ModelChunk::TextDelta(content));
            }
            for call in delta.tool_calls {
                let entry = self.calls.entry(call.index).or_default();
                if let Some(id) = &call.id {
                    entry.id.clone_from(id);
                }
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                if let Some(name) = &name {
                    entry.name.push_str(name);
                }
                entry.arguments.push_str(&arguments);
                chunks.push(ModelChunk::ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
        }
        Ok(chunks)
    }

    fn finish(&mut self) -> Result<Vec<ModelChunk>, ProviderError> {
        let mut chunks = Vec::new();
        for (_, call) in std::mem::take(&mut self.calls) {
            let arguments = parse_arguments(&call.name, &call.arguments)?;
            chunks.push(ModelChunk::ToolCall(ModelToolCall {
                id: call.id,
                name: call.name,
                arguments,
            }));
        }
        chunks.push(ModelChunk::Finish {
            usage: self.usage.take(),
        });
        Ok(chunks)
    }
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}
