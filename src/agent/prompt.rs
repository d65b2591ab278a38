use std::fmt::Write as _;

use serde_json::Value;

use crate::llm::ModelMessage;
use crate::tools::ToolDescriptor;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools \
when they help you answer, and reply directly once you have what you need.";

pub const DEFAULT_REASONING_PROMPT: &str = "Before acting, review the tool results gathered so \
far. State briefly what has been established and what the next step should be. Do not call \
any tools and do not write the final answer yet.";

/// Marks an assistant message as an internal note from the reasoning phase.
pub const REASONING_NOTE_PREFIX: &str = "[internal reasoning] ";

const PREVIEW_CHARS: usize = 160;

const CHECKLIST_INSTRUCTIONS: &str = "\
For multi-step work you may track progress with a checklist. Declare it once:
<todo>
# Title
- [ ] first step
- [ ] second step
</todo>
Items are numbered from 1 in order. Report progress with
<todo_update>{\"id\": \"1\", \"status\": \"completed\", \"result\": \"short summary\"}</todo_update>
Valid statuses are pending, in_progress, completed and failed.";

const TEXT_CONVENTION_INSTRUCTIONS: &str = "\
To call a tool, write a block of exactly this form and nothing else on those lines:
<tool_call>{\"name\": \"tool_name\", \"arguments\": {\"key\": \"value\"}}</tool_call>
You may write several blocks in one reply. The results arrive in the next message inside \
<tool_result> blocks. Never write <tool_result> blocks yourself.";

/// System prompt for native mode: tool declarations travel out of band.
pub fn native_system_prompt(base: &str) -> String {
    format!("{base}\n\n{CHECKLIST_INSTRUCTIONS}")
}

/// System prompt for text-convention mode, carrying the tool catalogue.
pub fn text_convention_system_prompt(base: &str, tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return native_system_prompt(base);
    }

    let mut prompt = format!("{base}\n\nYou can use these tools:\n");
    for tool in tools {
        let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description.trim());
        let _ = writeln!(prompt, "  arguments schema: {}", tool.input_schema);
    }
    let _ = write!(
        prompt,
        "\n{TEXT_CONVENTION_INSTRUCTIONS}\n\n{CHECKLIST_INSTRUCTIONS}"
    );
    prompt
}

/// Rewrites history for a model that has no structured tool-calling.
///
/// Tool results become user messages wrapping each payload in a
/// `<tool_result>` block; consecutive results share one message.
pub fn render_text_convention_history(messages: &[ModelMessage]) -> Vec<ModelMessage> {
    let mut rendered: Vec<ModelMessage> = Vec::with_capacity(messages.len());
    let mut pending_results = String::new();

    for message in messages {
        match message {
            ModelMessage::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => {
                if !pending_results.is_empty() {
                    pending_results.push('\n');
                }
                let error_attr = if *is_error { " error=\"true\"" } else { "" };
                let _ = write!(
                    pending_results,
                    "<tool_result name=\"{tool_name}\" id=\"{tool_call_id}\"{error_attr}>\n{content}\n</tool_result>"
                );
            }
            ModelMessage::Assistant { content, .. } => {
                flush_results(&mut rendered, &mut pending_results);
                rendered.push(ModelMessage::Assistant {
                    content: content.clone(),
                    tool_calls: Vec::new(),
                });
            }
            other => {
                flush_results(&mut rendered, &mut pending_results);
                rendered.push(other.clone());
            }
        }
    }
    flush_results(&mut rendered, &mut pending_results);
    rendered
}

fn flush_results(rendered: &mut Vec<ModelMessage>, pending: &mut String) {
    if !pending.is_empty() {
        rendered.push(ModelMessage::user(std::mem::take(pending)));
    }
}

/// Replaces every tool payload with a record count so the reasoning step
/// cannot echo raw data back as its answer.
pub fn summarize_tool_results(messages: &[ModelMessage]) -> Vec<ModelMessage> {
    messages
        .iter()
        .map(|message| match message {
            ModelMessage::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => ModelMessage::ToolResult {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                content: summarize_payload(tool_name, content, *is_error),
                is_error: *is_error,
            },
            other => other.clone(),
        })
        .collect()
}

fn summarize_payload(tool_name: &str, content: &str, is_error: bool) -> String {
    if is_error {
        return format!("[`{tool_name}` failed: {}]", preview(content));
    }

    let records = match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(items)) => items.len(),
        Ok(Value::Object(map)) => map
            .values()
            .find_map(|value| value.as_array().map(Vec::len))
            .unwrap_or(1),
        Ok(Value::Null) => 0,
        _ => content.lines().filter(|line| !line.trim().is_empty()).count(),
    };
    let noun = if records == 1 { "record" } else { "records" };
    format!("[result from `{tool_name}`: {records} {noun}]")
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::ModelToolCall;

    fn tool_result(id: &str, name: &str, content: &str) -> ModelMessage {
        ModelMessage::ToolResult {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            content: content.to_string(),
            is_error: false,
        }
    }

    #[test]
    fn text_convention_prompt_lists_tools_and_convention() {
        let tools = vec![ToolDescriptor {
            name: "search".to_string(),
            description: "Search the web".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let prompt = text_convention_system_prompt("base", &tools);
        assert!(prompt.starts_with("base"));
        assert!(prompt.contains("- search: Search the web"));
        assert!(prompt.contains("<tool_call>"));
        assert!(prompt.contains("<todo>"));
    }

    #[test]
    fn text_history_folds_consecutive_results_into_one_user_message() {
        let history = vec![
            ModelMessage::user("hi"),
            ModelMessage::Assistant {
                content: Some("<tool_call>{}</tool_call>".to_string()),
                tool_calls: vec![ModelToolCall {
                    id: "call_1".to_string(),
                    name: "a".to_string(),
                    arguments: json!({}),
                }],
            },
            tool_result("call_1", "a", "one"),
            tool_result("call_2", "b", "two"),
        ];

        let rendered = render_text_convention_history(&history);
        assert_eq!(rendered.len(), 3);
        match &rendered[1] {
            ModelMessage::Assistant { tool_calls, .. } => assert!(tool_calls.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
        match &rendered[2] {
            ModelMessage::User { content, .. } => {
                assert!(content.contains("<tool_result name=\"a\" id=\"call_1\">\none\n</tool_result>"));
                assert!(content.contains("<tool_result name=\"b\" id=\"call_2\">"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn summaries_report_record_counts() {
        let summarized = summarize_tool_results(&[
            tool_result("1", "rows", r#"[{"a":1},{"a":2},{"a":3}]"#),
            tool_result("2", "page", r#"{"total": 9, "items": [1, 2]}"#),
            tool_result("3", "log", "line one\nline two\n"),
        ]);

        let contents = summarized
            .iter()
            .map(|message| match message {
                ModelMessage::ToolResult { content, .. } => content.clone(),
                other => panic!("unexpected message: {other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(contents[0], "[result from `rows`: 3 records]");
        assert_eq!(contents[1], "[result from `page`: 2 records]");
        assert_eq!(contents[2], "[result from `log`: 2 records]");
    }

    #[test]
    fn preview_is_truncated_on_char_boundary() {
        let long = "é".repeat(PREVIEW_CHARS + 10);
        let short = preview(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), PREVIEW_CHARS + 3);
    }
}
