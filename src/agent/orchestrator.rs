//! Tool dispatch for one iteration.
//!
//! Every call runs on its own tokio task so an invocation that has already
//! started finishes even if the caller stops listening. Results always come
//! back in call order, whatever order the tasks complete in.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::llm::ModelToolCall;
use crate::tools::ToolProvider;

/// A structured tool invocation request.
pub type ToolCall = ModelToolCall;

/// Key/value pattern that, once found in a successful result, ends the turn.
pub type ResultPattern = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub result: Value,
    pub is_error: bool,
    pub duration_ms: u64,
}

impl ToolResult {
    fn success(call: &ToolCall, result: Value, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            is_error: false,
            duration_ms,
        }
    }

    fn failure(call: &ToolCall, err: &ToolError, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result: Value::String(err.to_string()),
            is_error: true,
            duration_ms,
        }
    }

    /// Result rendered as text for the conversation history.
    pub fn content_text(&self) -> String {
        match &self.result {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub results: Vec<ToolResult>,
    /// Index into `results` of the first result matching an immediate pattern.
    pub immediate: Option<usize>,
}

impl Execution {
    pub fn immediate_result(&self) -> Option<&ToolResult> {
        self.immediate.and_then(|idx| self.results.get(idx))
    }
}

#[derive(Clone)]
pub struct ToolOrchestrator {
    tools: Arc<dyn ToolProvider>,
    allowed: Option<Arc<HashSet<String>>>,
    matchers: Arc<Vec<ResultPattern>>,
    parallel: bool,
}

impl ToolOrchestrator {
    pub fn new(tools: Arc<dyn ToolProvider>) -> Self {
        Self {
            tools,
            allowed: None,
            matchers: Arc::new(Vec::new()),
            parallel: true,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Restricts dispatch to `names`; calls to anything else fail without
    /// reaching the provider.
    pub fn allowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(Arc::new(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn matchers(mut self, matchers: Vec<ResultPattern>) -> Self {
        self.matchers = Arc::new(
            matchers
                .into_iter()
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        );
        self
    }

    pub async fn execute(&self, calls: &[ToolCall]) -> Execution {
        let results = if self.parallel && calls.len() > 1 {
            debug!(count = calls.len(), "dispatching tool calls in parallel");
            let pending = calls.iter().map(|call| self.dispatch(call)).collect::<Vec<_>>();
            join_all(pending).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.dispatch(call).await);
            }
            results
        };

        let immediate = results.iter().position(|result| self.is_immediate(result));
        if let Some(result) = immediate.and_then(|idx| results.get(idx)) {
            info!(tool = %result.name, call_id = %result.call_id, "immediate result matched");
        }
        Execution { results, immediate }
    }

    /// Spawns the invocation right away and returns a future for its result.
    fn dispatch(&self, call: &ToolCall) -> impl Future<Output = ToolResult> + Send + 'static {
        let call = call.clone();
        let permitted = self
            .allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&call.name));
        let tools = Arc::clone(&self.tools);
        let name = call.name.clone();
        let arguments = call.arguments.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            let outcome = if permitted {
                tools.invoke(&name, arguments).await
            } else {
                Err(ToolError::NotAllowed(name))
            };
            (outcome, started.elapsed().as_millis() as u64)
        });

        async move {
            let result = match handle.await {
                Ok((Ok(value), duration_ms)) => ToolResult::success(&call, value, duration_ms),
                Ok((Err(err), duration_ms)) => ToolResult::failure(&call, &err, duration_ms),
                Err(join_err) => ToolResult::failure(
                    &call,
                    &ToolError::Aborted(join_err.to_string()),
                    started.elapsed().as_millis() as u64,
                ),
            };

            if result.is_error {
                warn!(
                    tool = %result.name,
                    call_id = %result.call_id,
                    duration_ms = result.duration_ms,
                    error = %result.content_text(),
                    "tool call failed"
                );
            } else {
                info!(
                    tool = %result.name,
                    call_id = %result.call_id,
                    duration_ms = result.duration_ms,
                    "tool call completed"
                );
            }
            result
        }
    }

    fn is_immediate(&self, result: &ToolResult) -> bool {
        !result.is_error
            && self
                .matchers
                .iter()
                .any(|pattern| result_matches(&result.result, pattern))
    }
}

/// True when `value` is an object, or a string holding a JSON object, that
/// contains every key of `pattern` with an equal value.
pub fn result_matches(value: &Value, pattern: &ResultPattern) -> bool {
    match value {
        Value::Object(map) => object_matches(map, pattern),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => object_matches(&map, pattern),
            _ => false,
        },
        _ => false,
    }
}

fn object_matches(map: &Map<String, Value>, pattern: &ResultPattern) -> bool {
    pattern
        .iter()
        .all(|(key, expected)| map.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tools::ToolDescriptor;

    /// Sleeps for `arguments.delay_ms` then echoes the arguments back.
    struct SleepyTools;

    #[async_trait]
    impl ToolProvider for SleepyTools {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            Ok(Vec::new())
        }

        async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match name {
                "fail" => Err(ToolError::Execution("boom".to_string())),
                "panic" => panic!("tool exploded"),
                _ => Ok(arguments),
            }
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn pattern(value: Value) -> ResultPattern {
        value.as_object().cloned().expect("pattern is an object")
    }

    #[tokio::test]
    async fn parallel_results_keep_call_order() {
        let orchestrator = ToolOrchestrator::new(Arc::new(SleepyTools));
        let calls = vec![
            call("a", "echo", json!({"delay_ms": 80})),
            call("b", "echo", json!({"delay_ms": 10})),
            call("c", "echo", json!({"delay_ms": 60})),
        ];

        let started = Instant::now();
        let execution = orchestrator.execute(&calls).await;
        let elapsed = started.elapsed();

        let ids = execution
            .results
            .iter()
            .map(|result| result.call_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(elapsed < Duration::from_millis(140), "calls ran serially: {elapsed:?}");
    }

    #[tokio::test]
    async fn serial_mode_preserves_order() {
        let orchestrator = ToolOrchestrator::new(Arc::new(SleepyTools)).parallel(false);
        let calls = vec![
            call("a", "echo", json!({"delay_ms": 20})),
            call("b", "echo", json!({"delay_ms": 1})),
        ];
        let execution = orchestrator.execute(&calls).await;
        assert_eq!(execution.results[0].call_id, "a");
        assert_eq!(execution.results[1].call_id, "b");
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let orchestrator = ToolOrchestrator::new(Arc::new(SleepyTools));
        let calls = vec![
            call("a", "fail", json!({})),
            call("b", "panic", json!({})),
            call("c", "echo", json!({"ok": true})),
        ];
        let execution = orchestrator.execute(&calls).await;

        assert!(execution.results[0].is_error);
        assert_eq!(
            execution.results[0].result,
            json!("tool execution failed: boom")
        );
        assert!(execution.results[1].is_error);
        assert!(execution.results[1].content_text().starts_with("tool task aborted"));
        assert!(!execution.results[2].is_error);
        assert_eq!(execution.results[2].result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn disallowed_tools_fail_without_invocation() {
        let orchestrator =
            ToolOrchestrator::new(Arc::new(SleepyTools)).allowed_tools(["echo"]);
        let execution = orchestrator
            .execute(&[call("a", "secret", json!({}))])
            .await;
        assert!(execution.results[0].is_error);
        assert_eq!(
            execution.results[0].content_text(),
            "tool not available in this turn: secret"
        );
    }

    #[tokio::test]
    async fn first_matching_result_is_immediate() {
        let orchestrator = ToolOrchestrator::new(Arc::new(SleepyTools))
            .matchers(vec![pattern(json!({"type": "card"}))]);
        let calls = vec![
            call("a", "echo", json!({"type": "table"})),
            call("b", "echo", json!({"type": "card", "title": "x"})),
            call("c", "echo", json!({"type": "card"})),
        ];
        let execution = orchestrator.execute(&calls).await;
        assert_eq!(execution.immediate, Some(1));
        assert_eq!(
            execution.immediate_result().map(|result| result.call_id.as_str()),
            Some("b")
        );
    }

    #[tokio::test]
    async fn error_results_never_match() {
        let orchestrator = ToolOrchestrator::new(Arc::new(SleepyTools))
            .matchers(vec![pattern(json!({"type": "card"}))]);
        let execution = orchestrator
            .execute(&[call("a", "fail", json!({"type": "card"}))])
            .await;
        assert_eq!(execution.immediate, None);
    }

    #[test]
    fn string_results_holding_json_can_match() {
        let card = pattern(json!({"type": "card"}));
        assert!(result_matches(&json!("{\"type\":\"card\",\"id\":1}"), &card));
        assert!(!result_matches(&json!("type card"), &card));
        assert!(!result_matches(&json!([{"type": "card"}]), &card));
        assert!(!result_matches(&json!({"type": "Card"}), &card));
    }
}
