//! The two ways a turn can talk to a model about tools.
//!
//! The engine resolves one strategy at the start of a turn and routes every
//! mode-dependent decision through it.

use serde_json::json;
use tracing::debug;

use crate::agent::mode::ResolvedMode;
use crate::agent::orchestrator::ToolCall;
use crate::agent::prompt;
use crate::llm::{ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition};
use crate::parser::{ParserOptions, decode_tool_call};
use crate::tools::ToolDescriptor;

/// Turn-scoped generator for `call_N` ids.
#[derive(Debug, Default)]
pub(crate) struct CallIds {
    next: u32,
}

impl CallIds {
    pub(crate) fn next_id(&mut self) -> String {
        self.next += 1;
        format!("call_{}", self.next)
    }
}

/// Raw call material gathered from one model response.
#[derive(Debug, Default)]
pub(crate) struct ResponseCalls {
    pub native: Vec<ModelToolCall>,
    pub spans: Vec<String>,
}

pub(crate) trait TurnStrategy: Send + Sync {
    fn mode(&self) -> ResolvedMode;

    fn parser_options(&self) -> ParserOptions;

    fn system_prompt(&self, base: &str, tools: &[ToolDescriptor]) -> String;

    fn declarations(&self, tools: &[ToolDescriptor]) -> Vec<ModelToolDefinition>;

    fn tool_choice(&self, declarations: &[ModelToolDefinition]) -> ModelToolChoice {
        if declarations.is_empty() {
            ModelToolChoice::None
        } else {
            ModelToolChoice::Auto
        }
    }

    /// History in the shape this mode sends to the model.
    fn render_history(&self, messages: &[ModelMessage]) -> Vec<ModelMessage>;

    fn collect_calls(&self, response: ResponseCalls, ids: &mut CallIds) -> Vec<ToolCall>;

    /// The assistant turn recorded in history for a response that called tools.
    fn assistant_message(&self, text: &str, calls: &[ToolCall]) -> ModelMessage;
}

pub(crate) fn strategy_for(mode: ResolvedMode) -> &'static dyn TurnStrategy {
    match mode {
        ResolvedMode::Native => &NativeStrategy,
        ResolvedMode::TextConvention => &TextConventionStrategy,
    }
}

/// Tools are declared to the provider and calls come back structured.
pub(crate) struct NativeStrategy;

impl TurnStrategy for NativeStrategy {
    fn mode(&self) -> ResolvedMode {
        ResolvedMode::Native
    }

    fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            detect_tool_calls: false,
        }
    }

    fn system_prompt(&self, base: &str, _tools: &[ToolDescriptor]) -> String {
        prompt::native_system_prompt(base)
    }

    fn declarations(&self, tools: &[ToolDescriptor]) -> Vec<ModelToolDefinition> {
        tools
            .iter()
            .map(|tool| ModelToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect()
    }

    fn render_history(&self, messages: &[ModelMessage]) -> Vec<ModelMessage> {
        messages.to_vec()
    }

    fn collect_calls(&self, response: ResponseCalls, ids: &mut CallIds) -> Vec<ToolCall> {
        response
            .native
            .into_iter()
            .map(|mut call| {
                if call.id.trim().is_empty() {
                    call.id = ids.next_id();
                }
                call
            })
            .collect()
    }

    fn assistant_message(&self, text: &str, calls: &[ToolCall]) -> ModelMessage {
        ModelMessage::Assistant {
            content: (!text.is_empty()).then(|| text.to_string()),
            tool_calls: calls.to_vec(),
        }
    }
}

/// Tools are described in the system prompt and calls are recovered from the
/// model's text.
pub(crate) struct TextConventionStrategy;

impl TurnStrategy for TextConventionStrategy {
    fn mode(&self) -> ResolvedMode {
        ResolvedMode::TextConvention
    }

    fn parser_options(&self) -> ParserOptions {
        ParserOptions::default()
    }

    fn system_prompt(&self, base: &str, tools: &[ToolDescriptor]) -> String {
        prompt::text_convention_system_prompt(base, tools)
    }

    fn declarations(&self, _tools: &[ToolDescriptor]) -> Vec<ModelToolDefinition> {
        Vec::new()
    }

    fn render_history(&self, messages: &[ModelMessage]) -> Vec<ModelMessage> {
        prompt::render_text_convention_history(messages)
    }

    fn collect_calls(&self, response: ResponseCalls, ids: &mut CallIds) -> Vec<ToolCall> {
        response
            .spans
            .iter()
            .filter_map(|raw| {
                let decoded = decode_tool_call(raw);
                if decoded.is_none() {
                    debug!(span_len = raw.len(), "dropping undecodable tool-call span");
                }
                decoded
            })
            .map(|decoded| ToolCall {
                id: ids.next_id(),
                name: decoded.name,
                arguments: decoded.arguments,
            })
            .collect()
    }

    /// Keeps the visible text and re-renders each decoded call in canonical
    /// form, so malformed or forged markup never reaches the history.
    fn assistant_message(&self, text: &str, calls: &[ToolCall]) -> ModelMessage {
        let mut content = text.trim_end().to_string();
        for call in calls {
            if !content.is_empty() {
                content.push('\n');
            }
            let body = json!({"name": call.name, "arguments": call.arguments});
            content.push_str(&format!("<tool_call>{body}</tool_call>"));
        }
        ModelMessage::Assistant {
            content: Some(content),
            tool_calls: calls.to_vec(),
        }
    }
}
