//! Model collaborator seam.
//!
//! The engine only talks to a model through [`ChatModel`]. Providers that can
//! only answer in one shot implement [`ChatModel::invoke`] and inherit a
//! [`ChatModel::stream`] that replays the completion as chunks.

mod openai;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use openai::{OpenAiCompatModel, OpenAiCompatModelConfig};

/// Multimodal reference attached to a user message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Text { text: String },
    Image { url: String, media_type: Option<String> },
    File { uri: String, name: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    System {
        content: String,
    },
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ModelToolCall>,
    },
    #[serde(rename = "tool")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

impl ModelMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ModelUsage {
    pub fn accumulate(&mut self, other: &ModelUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// One unit of a streamed model response.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelChunk {
    ReasoningDelta(String),
    TextDelta(String),
    /// A fully assembled structured call.
    ToolCall(ModelToolCall),
    /// Raw argument text for a structured call still being streamed.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finish {
        usage: Option<ModelUsage>,
    },
    Error(String),
}

pub type ModelChunkStream = BoxStream<'static, Result<ModelChunk, ProviderError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Identifier used to pick a tool-calling mode.
    fn model_id(&self) -> &str;

    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError>;

    async fn stream(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelChunkStream, ProviderError> {
        let completion = self.invoke(messages, tools, tool_choice).await?;
        Ok(Box::pin(stream::iter(
            completion_chunks(completion).into_iter().map(Ok),
        )))
    }
}

/// Replays a one-shot completion in the order a streaming provider would
/// deliver it.
pub fn completion_chunks(completion: ModelCompletion) -> Vec<ModelChunk> {
    let mut chunks = Vec::new();
    if let Some(thinking) = completion.thinking.filter(|text| !text.is_empty()) {
        chunks.push(ModelChunk::ReasoningDelta(thinking));
    }
    if let Some(text) = completion.text.filter(|text| !text.is_empty()) {
        chunks.push(ModelChunk::TextDelta(text));
    }
    chunks.extend(completion.tool_calls.into_iter().map(ModelChunk::ToolCall));
    chunks.push(ModelChunk::Finish {
        usage: completion.usage,
    });
    chunks
}
