use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::agent::checklist::ChecklistItem;
use crate::agent::orchestrator::ToolResult;
use crate::llm::{ModelToolCall, ModelUsage};

/// One entry of a turn's ordered event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEvent {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl AgentEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

impl From<EventKind> for AgentEvent {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The model answered without requesting tools.
    Done,
    /// A tool result matched an immediate-result pattern.
    ShortCircuited,
    /// `max_iterations` was reached while the model kept calling tools.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    IterationStart {
        iteration: u32,
    },
    IterationEnd {
        iteration: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<ModelUsage>,
    },
    ReasoningStart,
    ReasoningDelta {
        content: String,
    },
    ReasoningEnd,
    TextStart,
    TextDelta {
        content: String,
    },
    TextEnd,
    ToolCallStart {
        call: ModelToolCall,
    },
    ToolCallDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        delta: String,
    },
    ToolExecuting {
        call_id: String,
        name: String,
    },
    ToolResult {
        result: ToolResult,
    },
    ImmediateResult {
        result: ToolResult,
    },
    ChecklistStart {
        checklist_id: String,
        title: String,
    },
    ChecklistItemAdd {
        checklist_id: String,
        item: ChecklistItem,
    },
    ChecklistItemUpdate {
        checklist_id: String,
        item: ChecklistItem,
    },
    ChecklistEnd {
        checklist_id: String,
        item_count: usize,
    },
    Complete {
        iterations: u32,
        duration_ms: u64,
        outcome: TurnOutcome,
    },
    Error {
        message: String,
    },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AgentEvent::new(EventKind::Complete {
            iterations: 2,
            duration_ms: 15,
            outcome: TurnOutcome::ShortCircuited,
        });
        let value = serde_json::to_value(&event).expect("serializes");

        assert_eq!(value["type"], "complete");
        assert_eq!(value["outcome"], "short_circuited");
        assert_eq!(value["iterations"], 2);
        assert!(value["timestamp_ms"].as_u64().is_some());

        let value = serde_json::to_value(AgentEvent::new(EventKind::TextStart)).expect("serializes");
        assert_eq!(value["type"], "text_start");
    }
}
