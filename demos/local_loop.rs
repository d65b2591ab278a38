use std::error::Error;

use agent_turn_rs::{
    Agent, EventKind, OpenAiCompatModel, OpenAiCompatModelConfig, ToolError, ToolSpec,
    TurnOptions,
};
use futures_util::StreamExt;
use serde_json::json;

const DEFAULT_MODEL: &str = "llama3.1:8b";
const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

fn add_tool() -> ToolSpec {
    ToolSpec::new("add", "add two numbers")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args| async move {
            let a = args
                .get("a")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ToolError::Execution("a missing".to_string()))?;
            let b = args
                .get("b")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ToolError::Execution("b missing".to_string()))?;
            Ok(json!(a + b))
        })
}

/// Runs one turn against a local OpenAI-compatible server (Ollama by default).
///
/// `AGENT_MODEL`, `OPENAI_BASE_URL` and `OPENAI_API_KEY` override the defaults.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let model_id = std::env::var("AGENT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let base_url =
        std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let mut config = OpenAiCompatModelConfig::new(&model_id).with_base_url(base_url);
    config.api_key = std::env::var("OPENAI_API_KEY").ok();

    let agent = Agent::builder()
        .model(OpenAiCompatModel::new(config)?)
        .tool(add_tool())
        .build()?;
    println!("model {model_id} runs in {:?} mode", agent.resolve_mode(None));

    let events = agent.run_turn("What is 10 + 7?", TurnOptions::default());
    futures_util::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event.kind {
            EventKind::ReasoningDelta { content } => print!("{content}"),
            EventKind::ReasoningEnd => println!(),
            EventKind::TextDelta { content } => print!("{content}"),
            EventKind::TextEnd => println!(),
            EventKind::ToolCallStart { call } => {
                println!("tool call [{}] {}: {}", call.id, call.name, call.arguments)
            }
            EventKind::ToolResult { result } => println!(
                "tool result [{}] {}: {} (error={})",
                result.call_id,
                result.name,
                result.content_text(),
                result.is_error
            ),
            EventKind::Complete {
                iterations,
                duration_ms,
                outcome,
            } => println!("done: {outcome:?} after {iterations} iteration(s) in {duration_ms} ms"),
            EventKind::Error { message } => eprintln!("turn failed: {message}"),
            _ => {}
        }
    }

    Ok(())
}
