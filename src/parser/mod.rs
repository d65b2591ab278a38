//! Incremental parser for tag-annotated model output.
//!
//! The parser is fed raw text fragments as they arrive and splits them into
//! visible text, reasoning, tool-call spans and checklist spans. Marker
//! detection goes through one table so that the earliest marker in the buffer
//! always wins, and any trailing fragment that could still grow into a marker
//! is held back until the next fragment (or [`TagStreamParser::finish`])
//! settles it.

mod decoder;

pub use decoder::{DecodedCall, decode_span, decode_tool_call};
pub(crate) use decoder::JsonScanner;

const FENCE: &str = "```";
const FORGED_RESULT_OPEN: &str = "<tool_result";
const FORGED_RESULT_CLOSE: &str = "</tool_result>";
const MAX_FENCE_INFO_LEN: usize = 32;
const NAME_KEY: &str = "\"name\"";

/// Where a captured tool-call span came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanContainer {
    Tag,
    Fence,
    BareJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecklistSpan {
    Block,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Normal,
    InReasoning,
    InToolCall(SpanContainer),
    InChecklist(ChecklistSpan),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    TextStart,
    TextDelta(String),
    TextEnd,
    ReasoningStart,
    ReasoningDelta(String),
    ReasoningEnd,
    /// Raw characters of a tool-call span as they are captured.
    ToolCallDelta(String),
    /// A complete (or stream-terminated) tool-call span, ready for decoding.
    ToolCallSpan {
        raw: String,
        container: SpanContainer,
    },
    ChecklistBlock(String),
    ChecklistUpdate(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub events: Vec<ParserEvent>,
    /// Visible text released by this call.
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserOptions {
    /// Recognize `<tool_call>`, JSON fences and bare JSON calls.
    pub detect_tool_calls: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            detect_tool_calls: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Reasoning { close: &'static str },
    ToolCall,
    Checklist,
    ChecklistUpdate,
    Fence,
}

struct Marker {
    open: &'static str,
    kind: MarkerKind,
}

const MARKERS: &[Marker] = &[
    Marker {
        open: "<think>",
        kind: MarkerKind::Reasoning { close: "</think>" },
    },
    Marker {
        open: "<thinking>",
        kind: MarkerKind::Reasoning {
            close: "</thinking>",
        },
    },
    Marker {
        open: "<tool_call>",
        kind: MarkerKind::ToolCall,
    },
    Marker {
        open: "<todo>",
        kind: MarkerKind::Checklist,
    },
    Marker {
        open: "<todo_update>",
        kind: MarkerKind::ChecklistUpdate,
    },
    Marker {
        open: FENCE,
        kind: MarkerKind::Fence,
    },
];

impl MarkerKind {
    fn needs_tool_detection(self) -> bool {
        matches!(self, MarkerKind::ToolCall | MarkerKind::Fence)
    }
}

/// Result of scanning the normal-mode buffer for the earliest marker.
enum Scan {
    /// Marker confirmed at `pos`; `consume` bytes belong to the marker itself.
    Found {
        pos: usize,
        consume: usize,
        entry: Entry,
    },
    /// Something at `pos` may still become a marker.
    Undecided { pos: usize },
    None,
}

enum Entry {
    Reasoning { close: &'static str },
    ToolCall(SpanContainer),
    Checklist(ChecklistSpan),
}

enum Candidate {
    Found { consume: usize, entry: Entry },
    Undecided,
    Rejected,
}

#[derive(Debug)]
pub struct TagStreamParser {
    options: ParserOptions,
    scrubber: ForgedResultFilter,
    state: ParseState,
    pending: String,
    span: String,
    fence_header: String,
    reasoning_close: &'static str,
    json: JsonScanner,
    text_open: bool,
    reasoning_open: bool,
    at_line_start: bool,
}

impl Default for TagStreamParser {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}

impl TagStreamParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            scrubber: ForgedResultFilter::default(),
            state: ParseState::Normal,
            pending: String::new(),
            span: String::new(),
            fence_header: String::new(),
            reasoning_close: "</think>",
            json: JsonScanner::default(),
            text_open: false,
            reasoning_open: false,
            at_line_start: true,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feeds one fragment of model text.
    pub fn feed(&mut self, delta: &str) -> ParseOutput {
        let mut out = ParseOutput::default();
        let clean = self.scrubber.push(delta);

        if self.state == ParseState::Normal && self.reasoning_open && !clean.trim().is_empty() {
            self.close_reasoning(&mut out);
        }

        self.pending.push_str(&clean);
        self.drain(&mut out, false);
        out
    }

    /// Feeds reasoning delivered out-of-band by the model (not via tags).
    pub fn feed_reasoning(&mut self, delta: &str) -> ParseOutput {
        let mut out = ParseOutput::default();
        if delta.is_empty() {
            return out;
        }
        self.close_text(&mut out);
        if !self.reasoning_open {
            self.reasoning_open = true;
            out.events.push(ParserEvent::ReasoningStart);
        }
        out.events.push(ParserEvent::ReasoningDelta(delta.to_string()));
        out
    }

    /// Flushes everything still held back at end of stream.
    pub fn finish(&mut self) -> ParseOutput {
        let mut out = ParseOutput::default();
        let tail = self.scrubber.finish();
        self.pending.push_str(&tail);
        self.drain(&mut out, true);

        match self.state {
            ParseState::Normal => {}
            ParseState::InReasoning => {}
            ParseState::InToolCall(SpanContainer::Tag) => {
                let raw = std::mem::take(&mut self.span);
                out.events.push(ParserEvent::ToolCallSpan {
                    raw,
                    container: SpanContainer::Tag,
                });
            }
            ParseState::InToolCall(container) => self.settle_span(&mut out, container, false),
            ParseState::InChecklist(kind) => {
                let raw = std::mem::take(&mut self.span);
                out.events.push(checklist_event(kind, raw));
            }
        }

        self.state = ParseState::Normal;
        self.close_reasoning(&mut out);
        self.close_text(&mut out);
        out
    }

    /// Closes any open text or reasoning block and discards everything still
    /// buffered. Used when the stream fails part way through.
    pub fn abort(&mut self) -> ParseOutput {
        let mut out = ParseOutput::default();
        self.pending.clear();
        self.span.clear();
        self.fence_header.clear();
        self.state = ParseState::Normal;
        self.close_reasoning(&mut out);
        self.close_text(&mut out);
        out
    }

    fn drain(&mut self, out: &mut ParseOutput, at_end: bool) {
        loop {
            let progressed = match self.state {
                ParseState::Normal => self.drain_normal(out, at_end),
                ParseState::InReasoning => self.drain_reasoning(out, at_end),
                ParseState::InToolCall(SpanContainer::BareJson) => self.drain_bare_json(out),
                ParseState::InToolCall(container) => self.drain_tool_call(out, container, at_end),
                ParseState::InChecklist(kind) => self.drain_checklist(out, kind, at_end),
            };
            if !progressed {
                break;
            }
        }
    }

    /// Returns true when the state changed and the loop should run again.
    fn drain_normal(&mut self, out: &mut ParseOutput, at_end: bool) -> bool {
        match self.scan(at_end) {
            Scan::Found {
                pos,
                consume,
                entry,
            } => {
                let before = self.pending[..pos].to_string();
                self.emit_text(out, &before);
                let marker = self.pending[pos..pos + consume].to_string();
                self.pending.drain(..pos + consume);
                self.enter(out, entry, marker);
                true
            }
            Scan::Undecided { pos } => {
                let text = self.pending[..pos].to_string();
                self.emit_text(out, &text);
                self.pending.drain(..pos);
                false
            }
            Scan::None => {
                let keep = if at_end {
                    0
                } else {
                    partial_suffix_len(&self.pending, self.active_markers())
                };
                let release = self.pending.len() - keep;
                let text = self.pending[..release].to_string();
                self.emit_text(out, &text);
                self.pending.drain(..release);
                false
            }
        }
    }

    fn drain_reasoning(&mut self, out: &mut ParseOutput, at_end: bool) -> bool {
        let close = self.reasoning_close;
        if let Some(pos) = self.pending.find(close) {
            let delta = self.pending[..pos].to_string();
            self.emit_reasoning(out, delta);
            self.pending.drain(..pos + close.len());
            self.close_reasoning(out);
            self.return_to_normal();
            return true;
        }

        let keep = if at_end {
            0
        } else {
            partial_suffix_len(&self.pending, [close])
        };
        let release = self.pending.len() - keep;
        let delta = self.pending.drain(..release).collect::<String>();
        self.emit_reasoning(out, delta);
        false
    }

    fn drain_tool_call(
        &mut self,
        out: &mut ParseOutput,
        container: SpanContainer,
        at_end: bool,
    ) -> bool {
        let close = match container {
            SpanContainer::Fence => FENCE,
            _ => "</tool_call>",
        };

        if let Some(pos) = self.pending.find(close) {
            let body = self.pending[..pos].to_string();
            self.capture_tool_text(out, container, &body);
            self.pending.drain(..pos + close.len());
            if container == SpanContainer::Fence {
                self.settle_span(out, container, true);
            } else {
                let raw = std::mem::take(&mut self.span);
                out.events.push(ParserEvent::ToolCallSpan { raw, container });
            }
            self.return_to_normal();
            return true;
        }

        let keep = if at_end {
            0
        } else {
            partial_suffix_len(&self.pending, [close])
        };
        let release = self.pending.len() - keep;
        let body = self.pending.drain(..release).collect::<String>();
        self.capture_tool_text(out, container, &body);
        false
    }

    fn drain_bare_json(&mut self, out: &mut ParseOutput) -> bool {
        let mut end = None;
        for (idx, ch) in self.pending.char_indices() {
            if self.json.step(ch) {
                end = Some(idx + ch.len_utf8());
                break;
            }
        }

        let release = end.unwrap_or(self.pending.len());
        let body = self.pending.drain(..release).collect::<String>();
        self.capture_tool_text(out, SpanContainer::BareJson, &body);

        if end.is_some() {
            self.settle_span(out, SpanContainer::BareJson, true);
            self.state = ParseState::Normal;
            self.at_line_start = false;
            return true;
        }
        false
    }

    fn drain_checklist(&mut self, out: &mut ParseOutput, kind: ChecklistSpan, at_end: bool) -> bool {
        let close = match kind {
            ChecklistSpan::Block => "</todo>",
            ChecklistSpan::Update => "</todo_update>",
        };

        if let Some(pos) = self.pending.find(close) {
            self.span.push_str(&self.pending[..pos]);
            self.pending.drain(..pos + close.len());
            let raw = std::mem::take(&mut self.span);
            out.events.push(checklist_event(kind, raw));
            self.return_to_normal();
            return true;
        }

        let keep = if at_end {
            0
        } else {
            partial_suffix_len(&self.pending, [close])
        };
        let release = self.pending.len() - keep;
        let body = self.pending.drain(..release).collect::<String>();
        self.span.push_str(&body);
        false
    }

    fn active_markers(&self) -> impl Iterator<Item = &'static str> + '_ {
        MARKERS
            .iter()
            .filter(|marker| self.options.detect_tool_calls || !marker.kind.needs_tool_detection())
            .map(|marker| marker.open)
    }

    /// At end of stream nothing can grow any more, so undecided candidates
    /// are rejected.
    fn scan(&self, at_end: bool) -> Scan {
        let mut best: Option<(usize, Candidate)> = None;

        let mut consider = |pos: usize, candidate: Candidate| {
            if best.as_ref().is_none_or(|(best_pos, _)| pos < *best_pos) {
                best = Some((pos, candidate));
            }
        };

        for marker in MARKERS {
            if !self.options.detect_tool_calls && marker.kind.needs_tool_detection() {
                continue;
            }
            for (pos, _) in self.pending.match_indices(marker.open) {
                let candidate = match self.evaluate(marker, pos) {
                    Candidate::Undecided if at_end => Candidate::Rejected,
                    candidate => candidate,
                };
                if !matches!(candidate, Candidate::Rejected) {
                    consider(pos, candidate);
                    break;
                }
            }
        }

        if self.options.detect_tool_calls {
            if let Some((pos, candidate)) = self.scan_bare_json(at_end) {
                consider(pos, candidate);
            }
        }

        match best {
            Some((pos, Candidate::Found { consume, entry })) => Scan::Found {
                pos,
                consume,
                entry,
            },
            Some((pos, Candidate::Undecided)) => Scan::Undecided { pos },
            _ => Scan::None,
        }
    }

    fn evaluate(&self, marker: &Marker, pos: usize) -> Candidate {
        let consume = marker.open.len();
        match marker.kind {
            MarkerKind::Reasoning { close } => Candidate::Found {
                consume,
                entry: Entry::Reasoning { close },
            },
            MarkerKind::ToolCall => Candidate::Found {
                consume,
                entry: Entry::ToolCall(SpanContainer::Tag),
            },
            MarkerKind::Checklist => Candidate::Found {
                consume,
                entry: Entry::Checklist(ChecklistSpan::Block),
            },
            MarkerKind::ChecklistUpdate => Candidate::Found {
                consume,
                entry: Entry::Checklist(ChecklistSpan::Update),
            },
            MarkerKind::Fence => self.evaluate_fence(pos),
        }
    }

    /// A fence only opens a tool-call span when its body starts with `{`.
    fn evaluate_fence(&self, pos: usize) -> Candidate {
        let after = &self.pending[pos + FENCE.len()..];
        let Some(newline) = after.find('\n') else {
            if after.len() > MAX_FENCE_INFO_LEN {
                return Candidate::Rejected;
            }
            return Candidate::Undecided;
        };

        let info = after[..newline].trim();
        if info.len() > MAX_FENCE_INFO_LEN || info.contains('`') {
            return Candidate::Rejected;
        }

        let body = after[newline + 1..].trim_start();
        if body.is_empty() {
            Candidate::Undecided
        } else if body.starts_with('{') {
            Candidate::Found {
                consume: FENCE.len() + newline + 1,
                entry: Entry::ToolCall(SpanContainer::Fence),
            }
        } else {
            Candidate::Rejected
        }
    }

    /// Finds a line-anchored `{` followed by a `"name"` key.
    fn scan_bare_json(&self, at_end: bool) -> Option<(usize, Candidate)> {
        for (pos, _) in self.pending.match_indices('{') {
            if !self.is_line_anchored(pos) {
                continue;
            }
            let rest = self.pending[pos + 1..].trim_start();
            if rest.starts_with(NAME_KEY) {
                return Some((
                    pos,
                    Candidate::Found {
                        consume: 0,
                        entry: Entry::ToolCall(SpanContainer::BareJson),
                    },
                ));
            }
            if !at_end && NAME_KEY.starts_with(rest) {
                return Some((pos, Candidate::Undecided));
            }
        }
        None
    }

    fn is_line_anchored(&self, pos: usize) -> bool {
        let line = &self.pending[..pos];
        match line.rfind('\n') {
            Some(newline) => line[newline + 1..].chars().all(|ch| ch == ' ' || ch == '\t'),
            None => self.at_line_start && line.chars().all(|ch| ch == ' ' || ch == '\t'),
        }
    }

    fn enter(&mut self, out: &mut ParseOutput, entry: Entry, marker: String) {
        // Fenced and bare spans may still turn out to be text, so the open
        // text block stays open until they settle.
        if !matches!(
            entry,
            Entry::ToolCall(SpanContainer::Fence | SpanContainer::BareJson)
        ) {
            self.close_text(out);
        }
        self.span.clear();
        match entry {
            Entry::Reasoning { close } => {
                self.reasoning_close = close;
                self.state = ParseState::InReasoning;
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    out.events.push(ParserEvent::ReasoningStart);
                }
            }
            Entry::ToolCall(container) => {
                match container {
                    SpanContainer::Fence => self.fence_header = marker,
                    SpanContainer::BareJson => self.json = JsonScanner::default(),
                    SpanContainer::Tag => {}
                }
                self.state = ParseState::InToolCall(container);
            }
            Entry::Checklist(kind) => {
                self.state = ParseState::InChecklist(kind);
            }
        }
    }

    fn return_to_normal(&mut self) {
        self.state = ParseState::Normal;
        self.at_line_start = true;
    }

    fn capture_tool_text(&mut self, out: &mut ParseOutput, container: SpanContainer, body: &str) {
        if body.is_empty() {
            return;
        }
        self.span.push_str(body);
        // Fenced and bare spans are only known to be calls once they close.
        if container == SpanContainer::Tag {
            out.events.push(ParserEvent::ToolCallDelta(body.to_string()));
        }
    }

    /// Settles a fenced or bare-JSON span: a call only if it decodes as one,
    /// otherwise its original characters are released as text.
    fn settle_span(&mut self, out: &mut ParseOutput, container: SpanContainer, closed: bool) {
        let raw = std::mem::take(&mut self.span);
        let header = std::mem::take(&mut self.fence_header);
        if decode_span(&raw, container).is_some() {
            self.close_text(out);
            out.events.push(ParserEvent::ToolCallDelta(raw.clone()));
            out.events.push(ParserEvent::ToolCallSpan { raw, container });
            return;
        }

        let text = match container {
            SpanContainer::Fence if closed => format!("{header}{raw}{FENCE}"),
            SpanContainer::Fence => format!("{header}{raw}"),
            _ => raw,
        };
        self.emit_text(out, &text);
    }

    fn emit_text(&mut self, out: &mut ParseOutput, text: &str) {
        if text.is_empty() {
            return;
        }
        self.at_line_start = text.ends_with('\n');

        let text = if self.text_open {
            text
        } else {
            text.trim_start()
        };
        if text.is_empty() {
            return;
        }
        if !self.text_open {
            self.text_open = true;
            out.events.push(ParserEvent::TextStart);
        }
        out.events.push(ParserEvent::TextDelta(text.to_string()));
        out.content.push_str(text);
    }

    fn emit_reasoning(&mut self, out: &mut ParseOutput, delta: String) {
        if !delta.is_empty() {
            out.events.push(ParserEvent::ReasoningDelta(delta));
        }
    }

    fn close_text(&mut self, out: &mut ParseOutput) {
        if self.text_open {
            self.text_open = false;
            out.events.push(ParserEvent::TextEnd);
        }
    }

    fn close_reasoning(&mut self, out: &mut ParseOutput) {
        if self.reasoning_open {
            self.reasoning_open = false;
            out.events.push(ParserEvent::ReasoningEnd);
        }
    }
}

fn checklist_event(kind: ChecklistSpan, raw: String) -> ParserEvent {
    match kind {
        ChecklistSpan::Block => ParserEvent::ChecklistBlock(raw),
        ChecklistSpan::Update => ParserEvent::ChecklistUpdate(raw),
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of any marker.
fn partial_suffix_len<'a>(buffer: &str, markers: impl IntoIterator<Item = &'a str>) -> usize {
    let bytes = buffer.as_bytes();
    markers
        .into_iter()
        .filter_map(|marker| {
            (1..marker.len())
                .rev()
                .find(|len| bytes.ends_with(&marker.as_bytes()[..*len]))
        })
        .max()
        .unwrap_or(0)
}

/// Strips `<tool_result …>…</tool_result>` spans the model writes itself.
#[derive(Debug, Default)]
struct ForgedResultFilter {
    pending: String,
    inside: bool,
}

impl ForgedResultFilter {
    fn push(&mut self, text: &str) -> String {
        self.pending.push_str(text);
        let mut out = String::new();

        loop {
            if self.inside {
                if let Some(pos) = self.pending.find(FORGED_RESULT_CLOSE) {
                    self.pending.drain(..pos + FORGED_RESULT_CLOSE.len());
                    self.inside = false;
                    continue;
                }
                let keep = partial_suffix_len(&self.pending, [FORGED_RESULT_CLOSE]);
                let drop = self.pending.len() - keep;
                self.pending.drain(..drop);
                break;
            }

            match self.find_open() {
                OpenScan::Found(pos) => {
                    out.push_str(&self.pending[..pos]);
                    self.pending.drain(..pos + FORGED_RESULT_OPEN.len());
                    self.inside = true;
                }
                OpenScan::Undecided(pos) => {
                    out.push_str(&self.pending[..pos]);
                    self.pending.drain(..pos);
                    break;
                }
                OpenScan::None => {
                    let keep = partial_suffix_len(&self.pending, [FORGED_RESULT_OPEN]);
                    let release = self.pending.len() - keep;
                    out.push_str(&self.pending[..release]);
                    self.pending.drain(..release);
                    break;
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.inside) {
            String::new()
        } else {
            tail
        }
    }

    fn find_open(&self) -> OpenScan {
        for (pos, _) in self.pending.match_indices(FORGED_RESULT_OPEN) {
            match self.pending[pos + FORGED_RESULT_OPEN.len()..].chars().next() {
                None => return OpenScan::Undecided(pos),
                Some(ch) if ch == '>' || ch.is_whitespace() => return OpenScan::Found(pos),
                Some(_) => continue,
            }
        }
        OpenScan::None
    }
}

enum OpenScan {
    Found(usize),
    Undecided(usize),
    None,
}

#[cfg(test)]
mod tests;
