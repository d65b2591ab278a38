//! The agent turn engine.
//!
//! A turn is one user message driven to completion: the model is streamed,
//! its output parsed, requested tools executed, and the loop repeated until
//! the model stops calling tools, a result short-circuits the turn, or the
//! iteration limit is hit. Everything observable about the turn comes out of
//! [`Agent::run_turn`] as an ordered stream of [`AgentEvent`]s.

mod checklist;
mod config;
mod events;
mod mode;
mod orchestrator;
mod prompt;
mod strategy;

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{AgentError, ProviderError};
use crate::llm::{Attachment, ChatModel, ModelChunk, ModelMessage, ModelToolChoice, ModelUsage};
use crate::parser::{ParseOutput, ParserEvent, ParserOptions, TagStreamParser};
use crate::tools::{ToolDescriptor, ToolProvider, ToolRegistry, ToolSpec};

pub use checklist::{
    Checklist, ChecklistItem, ChecklistStatus, ChecklistTracker, DraftChecklist, DraftItem,
    ItemUpdate, parse_block, parse_update,
};
pub use config::AgentConfig;
pub use events::{AgentEvent, EventKind, TurnOutcome};
pub use mode::{ModeRules, ModeSelector, ResolvedMode, ToolCallingMode};
pub use orchestrator::{
    Execution, ResultPattern, ToolCall, ToolOrchestrator, ToolResult, result_matches,
};
pub use prompt::{DEFAULT_REASONING_PROMPT, DEFAULT_SYSTEM_PROMPT, REASONING_NOTE_PREFIX};

use strategy::{CallIds, ResponseCalls, strategy_for};

#[derive(Default)]
pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    provider: Option<Arc<dyn ToolProvider>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Uses an external tool collaborator. Mutually exclusive with [`Self::tool`].
    pub fn tool_provider<P>(mut self, provider: P) -> Self
    where
        P: ToolProvider + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn shared_tool_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Registers an in-process tool.
    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.config.parallel_tool_calls = parallel;
        self
    }

    pub fn enable_reasoning_phase(mut self, enabled: bool) -> Self {
        self.config.enable_reasoning_phase = Some(enabled);
        self
    }

    pub fn reasoning_phase_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.reasoning_phase_prompt = Some(prompt.into());
        self
    }

    pub fn immediate_result_matcher(mut self, pattern: ResultPattern) -> Self {
        self.config.immediate_result_matchers.push(pattern);
        self
    }

    pub fn tool_calling_mode(mut self, mode: ToolCallingMode) -> Self {
        self.config.tool_calling_mode = mode;
        self
    }

    pub fn mode_rules(mut self, rules: ModeRules) -> Self {
        self.config.mode_rules = rules;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        let tools: Arc<dyn ToolProvider> = match (self.provider, self.tools.is_empty()) {
            (Some(_), false) => {
                return Err(AgentError::Config(
                    "configure either a tool provider or in-process tools, not both".to_string(),
                ));
            }
            (Some(provider), true) => provider,
            (None, false) => {
                let mut registry = ToolRegistry::new();
                for tool in self.tools {
                    registry
                        .register(tool)
                        .map_err(|err| AgentError::Config(err.to_string()))?;
                }
                Arc::new(registry)
            }
            (None, true) => {
                return Err(AgentError::Config(
                    "agent tools must be configured via AgentBuilder::tool_provider(...) or ::tool(...)"
                        .to_string(),
                ));
            }
        };

        self.config.validate()?;
        let selector = ModeSelector::new(&self.config.mode_rules)?;

        Ok(Agent {
            model,
            tools,
            config: self.config,
            selector,
        })
    }
}

/// Per-turn inputs besides the user message.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Prior conversation. System messages in it are replaced by the turn's own.
    pub history: Vec<ModelMessage>,
    /// Restricts the tools visible (and callable) for this turn only.
    pub allowed_tool_names: Option<Vec<String>>,
    pub attachments: Vec<Attachment>,
    /// Overrides the configured tool-calling mode for this turn.
    pub tool_calling_mode: Option<ToolCallingMode>,
}

impl TurnOptions {
    pub fn with_history(mut self, history: Vec<ModelMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn allow_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tool_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_mode(mut self, mode: ToolCallingMode) -> Self {
        self.tool_calling_mode = Some(mode);
        self
    }
}

/// Hooks invoked synchronously by [`Agent::run_turn_blocking`], one per event.
pub trait TurnCallbacks {
    fn on_iteration_start(&mut self, _iteration: u32) {}

    fn on_text_delta(&mut self, _delta: &str) {}

    fn on_reasoning_delta(&mut self, _delta: &str) {}

    fn on_tool_call(&mut self, _call: &ToolCall) {}

    fn on_tool_result(&mut self, _result: &ToolResult) {}

    fn on_immediate_result(&mut self, _result: &ToolResult) {}

    /// Receives every checklist event (start, item add/update, end).
    fn on_checklist(&mut self, _event: &EventKind) {}
}

/// Aggregate of a turn driven to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub messages: Vec<ModelMessage>,
    pub usage: Option<ModelUsage>,
    pub iterations: u32,
    pub duration_ms: u64,
    pub outcome: TurnOutcome,
    pub immediate_result: Option<ToolResult>,
    pub checklist: Option<Checklist>,
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolProvider>,
    config: AgentConfig,
    selector: ModeSelector,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The mode a turn would run in, given an optional per-turn override.
    pub fn resolve_mode(&self, requested: Option<ToolCallingMode>) -> ResolvedMode {
        self.selector.select(
            self.model.model_id(),
            requested.unwrap_or(self.config.tool_calling_mode),
        )
    }

    /// Runs one turn, yielding its events in order.
    ///
    /// The stream ends after `complete`, or after `error` if the model
    /// collaborator failed. Dropping the stream cancels the turn: tool calls
    /// already dispatched run to completion, but no further iteration starts.
    pub fn run_turn(
        &self,
        user_message: impl Into<String>,
        options: TurnOptions,
    ) -> impl Stream<Item = AgentEvent> + '_ {
        let mut turn = Turn::new(user_message.into(), options);

        stream! {
            let events = self.drive(&mut turn);
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                yield event;
            }
        }
    }

    /// Drives a turn to completion and aggregates its output.
    pub async fn run_turn_blocking(
        &self,
        user_message: impl Into<String>,
        options: TurnOptions,
        mut callbacks: Option<&mut dyn TurnCallbacks>,
    ) -> Result<TurnOutput, AgentError> {
        let mut turn = Turn::new(user_message.into(), options);
        let mut duration_ms = None;

        {
            let events = self.drive(&mut turn);
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let Some(callbacks) = callbacks.as_deref_mut() {
                    notify(callbacks, &event.kind);
                }
                if let EventKind::Complete {
                    duration_ms: elapsed,
                    ..
                } = event.kind
                {
                    duration_ms = Some(elapsed);
                }
            }
        }

        if let Some(err) = turn.failure.take() {
            return Err(err);
        }
        let duration_ms = duration_ms.ok_or(AgentError::MissingCompletion)?;
        Ok(turn.into_output(duration_ms))
    }

    async fn visible_tools(
        &self,
        allowed: Option<&[String]>,
    ) -> Result<Vec<ToolDescriptor>, AgentError> {
        let tools = self.tools.list_tools().await?;
        Ok(match allowed {
            Some(names) => tools
                .into_iter()
                .filter(|tool| names.iter().any(|name| name == &tool.name))
                .collect(),
            None => tools,
        })
    }

    fn drive<'a>(&'a self, turn: &'a mut Turn) -> impl Stream<Item = AgentEvent> + 'a {
        stream! {
            let descriptors = match self
                .visible_tools(turn.options.allowed_tool_names.as_deref())
                .await
            {
                Ok(descriptors) => descriptors,
                Err(err) => {
                    yield turn.fail(err);
                    return;
                }
            };

            let mode = self.resolve_mode(turn.options.tool_calling_mode);
            let strategy = strategy_for(mode);
            let declarations = strategy.declarations(&descriptors);
            let tool_choice = strategy.tool_choice(&declarations);
            let reasoning_phase = self
                .config
                .enable_reasoning_phase
                .unwrap_or(mode == ResolvedMode::TextConvention);

            let base_prompt = self
                .config
                .system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT);
            turn.seed(strategy.system_prompt(base_prompt, &descriptors));

            let mut orchestrator = ToolOrchestrator::new(Arc::clone(&self.tools))
                .parallel(self.config.parallel_tool_calls)
                .matchers(self.config.immediate_result_matchers.clone());
            if turn.options.allowed_tool_names.is_some() {
                orchestrator =
                    orchestrator.allowed_tools(descriptors.iter().map(|tool| tool.name.clone()));
            }

            info!(
                model = %self.model.model_id(),
                mode = ?strategy.mode(),
                tools = descriptors.len(),
                reasoning_phase,
                "turn started"
            );

            loop {
                turn.iterations += 1;
                let iteration = turn.iterations;
                debug!(iteration, "iteration started");
                yield AgentEvent::new(EventKind::IterationStart { iteration });

                if reasoning_phase && !turn.tool_calls.is_empty() {
                    let summarized = prompt::summarize_tool_results(&turn.messages);
                    let mut messages = strategy.render_history(&summarized);
                    messages.push(ModelMessage::user(
                        self.config
                            .reasoning_phase_prompt
                            .as_deref()
                            .unwrap_or(DEFAULT_REASONING_PROMPT),
                    ));

                    let mut chunks = match self
                        .model
                        .stream(&messages, &[], ModelToolChoice::None)
                        .await
                    {
                        Ok(chunks) => chunks,
                        Err(err) => {
                            yield turn.fail(err.into());
                            return;
                        }
                    };

                    yield AgentEvent::new(EventKind::ReasoningStart);
                    let mut parser = TagStreamParser::new(ParserOptions {
                        detect_tool_calls: false,
                    });
                    let mut note = String::new();
                    let mut failure = None;
                    let mut finished = false;
                    while !finished {
                        let output = match chunks.next().await {
                            Some(Ok(ModelChunk::TextDelta(delta))) => parser.feed(&delta),
                            Some(Ok(ModelChunk::ReasoningDelta(delta))) => {
                                parser.feed_reasoning(&delta)
                            }
                            Some(Ok(ModelChunk::Finish { usage })) => {
                                turn.record_usage(usage);
                                continue;
                            }
                            Some(Ok(ModelChunk::Error(message))) => {
                                failure = Some(ProviderError::Stream(message));
                                break;
                            }
                            Some(Err(err)) => {
                                failure = Some(err);
                                break;
                            }
                            Some(Ok(_)) => continue,
                            None => {
                                finished = true;
                                parser.finish()
                            }
                        };
                        for delta in reasoning_deltas(output) {
                            note.push_str(&delta);
                            yield AgentEvent::new(EventKind::ReasoningDelta { content: delta });
                        }
                    }
                    yield AgentEvent::new(EventKind::ReasoningEnd);

                    if let Some(err) = failure {
                        yield turn.fail(err.into());
                        return;
                    }
                    let note = note.trim();
                    if !note.is_empty() {
                        turn.messages.push(ModelMessage::assistant(format!(
                            "{REASONING_NOTE_PREFIX}{note}"
                        )));
                    }
                }

                let messages = strategy.render_history(&turn.messages);
                let mut chunks = match self
                    .model
                    .stream(&messages, &declarations, tool_choice.clone())
                    .await
                {
                    Ok(chunks) => chunks,
                    Err(err) => {
                        yield turn.fail(err.into());
                        return;
                    }
                };

                let mut parser = TagStreamParser::new(strategy.parser_options());
                let mut step = StepOutput::default();
                let mut failure = None;
                while let Some(chunk) = chunks.next().await {
                    let kinds = match chunk {
                        Ok(ModelChunk::TextDelta(delta)) => {
                            step.absorb(parser.feed(&delta), &mut turn.checklist)
                        }
                        Ok(ModelChunk::ReasoningDelta(delta)) => {
                            step.absorb(parser.feed_reasoning(&delta), &mut turn.checklist)
                        }
                        Ok(ModelChunk::ToolCall(call)) => {
                            step.calls.native.push(call);
                            Vec::new()
                        }
                        Ok(ModelChunk::ToolCallDelta {
                            id,
                            name,
                            arguments,
                            ..
                        }) => vec![EventKind::ToolCallDelta {
                            call_id: id,
                            name,
                            delta: arguments,
                        }],
                        Ok(ModelChunk::Finish { usage }) => {
                            step.usage = usage;
                            Vec::new()
                        }
                        Ok(ModelChunk::Error(message)) => {
                            failure = Some(ProviderError::Stream(message));
                            break;
                        }
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    };
                    for kind in kinds {
                        yield AgentEvent::new(kind);
                    }
                }
                if let Some(err) = failure {
                    for kind in step.absorb(parser.abort(), &mut turn.checklist) {
                        yield AgentEvent::new(kind);
                    }
                    yield turn.fail(err.into());
                    return;
                }
                for kind in step.absorb(parser.finish(), &mut turn.checklist) {
                    yield AgentEvent::new(kind);
                }

                turn.record_usage(step.usage);
                let calls = strategy.collect_calls(std::mem::take(&mut step.calls), &mut turn.call_ids);

                if calls.is_empty() {
                    turn.messages.push(strategy.assistant_message(&step.text, &[]));
                    turn.content = step.text;
                    debug!(iteration, "iteration finished without tool calls");
                    yield AgentEvent::new(EventKind::IterationEnd {
                        iteration,
                        usage: step.usage,
                    });
                    turn.outcome = Some(TurnOutcome::Done);
                    break;
                }

                for call in &calls {
                    yield AgentEvent::new(EventKind::ToolCallStart { call: call.clone() });
                    yield AgentEvent::new(EventKind::ToolExecuting {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                    });
                }

                let execution = orchestrator.execute(&calls).await;
                turn.messages.push(strategy.assistant_message(&step.text, &calls));
                for (idx, result) in execution.results.iter().enumerate() {
                    turn.messages.push(ModelMessage::ToolResult {
                        tool_call_id: result.call_id.clone(),
                        tool_name: result.name.clone(),
                        content: result.content_text(),
                        is_error: result.is_error,
                    });
                    yield AgentEvent::new(EventKind::ToolResult { result: result.clone() });
                    if execution.immediate == Some(idx) {
                        turn.immediate_result = Some(result.clone());
                        yield AgentEvent::new(EventKind::ImmediateResult { result: result.clone() });
                    }
                }
                turn.content = step.text;
                turn.tool_calls.extend(calls);

                debug!(iteration, tool_calls = execution.results.len(), "iteration finished");
                yield AgentEvent::new(EventKind::IterationEnd {
                    iteration,
                    usage: step.usage,
                });

                if turn.immediate_result.is_some() {
                    turn.outcome = Some(TurnOutcome::ShortCircuited);
                    break;
                }
                if iteration >= self.config.max_iterations {
                    warn!(
                        max_iterations = self.config.max_iterations,
                        "turn stopped at iteration limit"
                    );
                    turn.outcome = Some(TurnOutcome::Exhausted);
                    break;
                }
            }

            let outcome = turn.outcome.unwrap_or(TurnOutcome::Done);
            let duration_ms = turn.elapsed_ms();
            info!(
                iterations = turn.iterations,
                duration_ms,
                outcome = ?outcome,
                "turn complete"
            );
            yield AgentEvent::new(EventKind::Complete {
                iterations: turn.iterations,
                duration_ms,
                outcome,
            });
        }
    }
}

/// Turn-scoped state. Owned by exactly one running turn.
struct Turn {
    user_message: String,
    options: TurnOptions,
    messages: Vec<ModelMessage>,
    checklist: ChecklistTracker,
    call_ids: CallIds,
    iterations: u32,
    usage: Option<ModelUsage>,
    content: String,
    tool_calls: Vec<ToolCall>,
    immediate_result: Option<ToolResult>,
    outcome: Option<TurnOutcome>,
    failure: Option<AgentError>,
    started: Instant,
}

impl Turn {
    fn new(user_message: String, options: TurnOptions) -> Self {
        Self {
            user_message,
            options,
            messages: Vec::new(),
            checklist: ChecklistTracker::new(),
            call_ids: CallIds::default(),
            iterations: 0,
            usage: None,
            content: String::new(),
            tool_calls: Vec::new(),
            immediate_result: None,
            outcome: None,
            failure: None,
            started: Instant::now(),
        }
    }

    fn seed(&mut self, system_prompt: String) {
        let history = std::mem::take(&mut self.options.history);
        self.messages = Vec::with_capacity(history.len() + 2);
        self.messages.push(ModelMessage::system(system_prompt));
        self.messages.extend(
            history
                .into_iter()
                .filter(|message| !matches!(message, ModelMessage::System { .. })),
        );
        self.messages.push(ModelMessage::User {
            content: std::mem::take(&mut self.user_message),
            attachments: std::mem::take(&mut self.options.attachments),
        });
    }

    fn record_usage(&mut self, usage: Option<ModelUsage>) {
        if let Some(usage) = usage {
            self.usage.get_or_insert_default().accumulate(&usage);
        }
    }

    fn fail(&mut self, err: AgentError) -> AgentEvent {
        let message = err.to_string();
        warn!(iteration = self.iterations, error = %message, "turn failed");
        self.failure = Some(err);
        AgentEvent::new(EventKind::Error { message })
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn into_output(self, duration_ms: u64) -> TurnOutput {
        TurnOutput {
            content: self.content,
            tool_calls: self.tool_calls,
            messages: self.messages,
            usage: self.usage,
            iterations: self.iterations,
            duration_ms,
            outcome: self.outcome.unwrap_or(TurnOutcome::Done),
            immediate_result: self.immediate_result,
            checklist: self.checklist.into_checklist(),
        }
    }
}

/// What one model response produced besides its events.
#[derive(Debug, Default)]
struct StepOutput {
    text: String,
    calls: ResponseCalls,
    usage: Option<ModelUsage>,
}

impl StepOutput {
    fn absorb(&mut self, output: ParseOutput, checklist: &mut ChecklistTracker) -> Vec<EventKind> {
        self.text.push_str(&output.content);

        let mut kinds = Vec::with_capacity(output.events.len());
        for event in output.events {
            match event {
                ParserEvent::TextStart => kinds.push(EventKind::TextStart),
                ParserEvent::TextDelta(content) => kinds.push(EventKind::TextDelta { content }),
                ParserEvent::TextEnd => kinds.push(EventKind::TextEnd),
                ParserEvent::ReasoningStart => kinds.push(EventKind::ReasoningStart),
                ParserEvent::ReasoningDelta(content) => {
                    kinds.push(EventKind::ReasoningDelta { content })
                }
                ParserEvent::ReasoningEnd => kinds.push(EventKind::ReasoningEnd),
                ParserEvent::ToolCallDelta(delta) => kinds.push(EventKind::ToolCallDelta {
                    call_id: None,
                    name: None,
                    delta,
                }),
                ParserEvent::ToolCallSpan { raw, .. } => self.calls.spans.push(raw),
                ParserEvent::ChecklistBlock(raw) => kinds.extend(checklist.on_block(&raw)),
                ParserEvent::ChecklistUpdate(raw) => kinds.extend(checklist.on_update(&raw)),
            }
        }
        kinds
    }
}

/// Everything the reasoning step writes counts as reasoning, tagged or not.
fn reasoning_deltas(output: ParseOutput) -> Vec<String> {
    output
        .events
        .into_iter()
        .filter_map(|event| match event {
            ParserEvent::TextDelta(delta) | ParserEvent::ReasoningDelta(delta) => Some(delta),
            _ => None,
        })
        .collect()
}

fn notify(callbacks: &mut dyn TurnCallbacks, kind: &EventKind) {
    match kind {
        EventKind::IterationStart { iteration } => callbacks.on_iteration_start(*iteration),
        EventKind::TextDelta { content } => callbacks.on_text_delta(content),
        EventKind::ReasoningDelta { content } => callbacks.on_reasoning_delta(content),
        EventKind::ToolCallStart { call } => callbacks.on_tool_call(call),
        EventKind::ToolResult { result } => callbacks.on_tool_result(result),
        EventKind::ImmediateResult { result } => callbacks.on_immediate_result(result),
        EventKind::ChecklistStart { .. }
        | EventKind::ChecklistItemAdd { .. }
        | EventKind::ChecklistItemUpdate { .. }
        | EventKind::ChecklistEnd { .. } => callbacks.on_checklist(kind),
        EventKind::IterationEnd { .. }
        | EventKind::ReasoningStart
        | EventKind::ReasoningEnd
        | EventKind::TextStart
        | EventKind::TextEnd
        | EventKind::ToolCallDelta { .. }
        | EventKind::ToolExecuting { .. }
        | EventKind::Complete { .. }
        | EventKind::Error { .. } => {}
    }
}
