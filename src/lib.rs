//! Streaming agent turn engine.
//!
//! - [`Agent::run_turn`] drives one user turn and yields an ordered
//!   [`AgentEvent`] stream; [`Agent::run_turn_blocking`] aggregates it.
//! - Tool calls are taken from native provider support or recovered from the
//!   model's text, depending on the model (see [`ModeSelector`]).
//! - [`TagStreamParser`] splits streamed output into text, reasoning,
//!   tool-call and checklist spans.
//! - [`OpenAiCompatModel`] talks to any OpenAI-compatible endpoint.

pub mod agent;
pub mod error;
pub mod llm;
pub mod parser;
pub mod tools;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentEvent, Checklist, ChecklistItem, ChecklistStatus,
    EventKind, ModeRules, ModeSelector, ResolvedMode, ToolCall, ToolCallingMode, ToolOrchestrator,
    ToolResult, TurnCallbacks, TurnOptions, TurnOutcome, TurnOutput,
};
pub use error::{AgentError, ProviderError, SchemaError, ToolError};
pub use llm::{
    Attachment, ChatModel, ModelChunk, ModelCompletion, ModelMessage, ModelToolCall,
    ModelToolChoice, ModelToolDefinition, ModelUsage, OpenAiCompatModel, OpenAiCompatModelConfig,
};
pub use parser::{ParserEvent, ParserOptions, TagStreamParser, decode_tool_call};
pub use tools::{ToolDescriptor, ToolProvider, ToolRegistry, ToolSpec};
