use serde_json::json;

use super::*;

fn coalesce(events: Vec<ParserEvent>) -> Vec<ParserEvent> {
    let mut merged: Vec<ParserEvent> = Vec::new();
    for event in events {
        match (merged.last_mut(), event) {
            (Some(ParserEvent::TextDelta(acc)), ParserEvent::TextDelta(next))
            | (Some(ParserEvent::ReasoningDelta(acc)), ParserEvent::ReasoningDelta(next))
            | (Some(ParserEvent::ToolCallDelta(acc)), ParserEvent::ToolCallDelta(next)) => {
                acc.push_str(&next);
            }
            (_, event) => merged.push(event),
        }
    }
    merged
}

fn run_with(options: ParserOptions, fragments: &[&str]) -> Vec<ParserEvent> {
    let mut parser = TagStreamParser::new(options);
    let mut events = Vec::new();
    for fragment in fragments {
        events.extend(parser.feed(fragment).events);
    }
    events.extend(parser.finish().events);
    coalesce(events)
}

fn run(fragments: &[&str]) -> Vec<ParserEvent> {
    run_with(ParserOptions::default(), fragments)
}

fn visible_text(events: &[ParserEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ParserEvent::TextDelta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Every way of cutting `text` into three fragments at char boundaries.
fn three_way_splits(text: &str) -> Vec<Vec<&str>> {
    let boundaries = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect::<Vec<_>>();

    let mut splits = Vec::new();
    for (i, first) in boundaries.iter().enumerate() {
        for second in &boundaries[i..] {
            splits.push(vec![
                &text[..*first],
                &text[*first..*second],
                &text[*second..],
            ]);
        }
    }
    splits
}

fn char_fragments(text: &str) -> Vec<&str> {
    text.char_indices()
        .map(|(idx, ch)| &text[idx..idx + ch.len_utf8()])
        .collect()
}

#[test]
fn reasoning_then_text_is_independent_of_fragment_boundaries() {
    let text = "<think>hello </think>world";
    let expected = vec![
        ParserEvent::ReasoningStart,
        ParserEvent::ReasoningDelta("hello ".to_string()),
        ParserEvent::ReasoningEnd,
        ParserEvent::TextStart,
        ParserEvent::TextDelta("world".to_string()),
        ParserEvent::TextEnd,
    ];

    for split in three_way_splits(text) {
        assert_eq!(run(&split), expected, "split: {split:?}");
    }
    assert_eq!(run(&char_fragments(text)), expected);
}

#[test]
fn bare_json_call_produces_no_text() {
    let text = r#"{"name":"search","arguments":{"q":"x"}}"#;

    for split in three_way_splits(text).into_iter().chain([char_fragments(text)]) {
        let events = run(&split);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, ParserEvent::TextDelta(_) | ParserEvent::TextStart)),
            "split {split:?} leaked text: {events:?}"
        );

        let spans = events
            .iter()
            .filter_map(|event| match event {
                ParserEvent::ToolCallSpan { raw, container } => Some((raw.clone(), *container)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(spans, vec![(text.to_string(), SpanContainer::BareJson)]);

        let call = decode_tool_call(&spans[0].0).expect("span decodes");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!({"q": "x"}));
    }
}

#[test]
fn tagged_call_closes_preceding_text() {
    let events = run(&[
        "Let me check.\n<tool_",
        "call>{\"name\":\"lookup\",",
        "\"arguments\":{}}</tool_call>",
    ]);

    assert_eq!(
        events,
        vec![
            ParserEvent::TextStart,
            ParserEvent::TextDelta("Let me check.\n".to_string()),
            ParserEvent::TextEnd,
            ParserEvent::ToolCallDelta("{\"name\":\"lookup\",\"arguments\":{}}".to_string()),
            ParserEvent::ToolCallSpan {
                raw: "{\"name\":\"lookup\",\"arguments\":{}}".to_string(),
                container: SpanContainer::Tag,
            },
        ]
    );
}

#[test]
fn earliest_marker_wins() {
    let events = run(&["a <todo>- [ ] x</todo> then <think>y</think>"]);
    let checklist_at = events
        .iter()
        .position(|event| matches!(event, ParserEvent::ChecklistBlock(_)))
        .expect("checklist parsed");
    let reasoning_at = events
        .iter()
        .position(|event| matches!(event, ParserEvent::ReasoningStart))
        .expect("reasoning parsed");
    assert!(checklist_at < reasoning_at);
    assert_eq!(visible_text(&events), "a then ");
}

#[test]
fn fenced_json_call_is_captured() {
    let text = "```json\n{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}\n```";
    for split in three_way_splits(text) {
        let events = run(&split);
        let span = events
            .iter()
            .find_map(|event| match event {
                ParserEvent::ToolCallSpan { raw, container } => Some((raw.clone(), *container)),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no span for split {split:?}"));
        assert_eq!(span.1, SpanContainer::Fence);
        assert_eq!(
            decode_tool_call(&span.0).map(|call| call.name),
            Some("search".to_string())
        );
        assert_eq!(visible_text(&events), "");
    }
}

#[test]
fn json_fence_without_a_name_stays_text() {
    let text = "Here:\n```json\n{\"rows\": 3}\n```\ndone";
    let events = run(&char_fragments(text));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ParserEvent::ToolCallSpan { .. }))
    );
    assert_eq!(visible_text(&events), text);
}

#[test]
fn json_with_a_name_but_no_arguments_stays_text() {
    let fenced = "Here is your package.json:\n```json\n{\"name\": \"my-app\", \"version\": \"1.0.0\"}\n```\n";
    let bare = "Manifest:\n{\"name\": \"my-app\", \"version\": \"1.0.0\"}\nthat's it";

    for text in [fenced, bare] {
        for split in three_way_splits(text).into_iter().chain([char_fragments(text)]) {
            let events = run(&split);
            assert!(
                !events.iter().any(|event| matches!(
                    event,
                    ParserEvent::ToolCallSpan { .. } | ParserEvent::ToolCallDelta(_)
                )),
                "split {split:?} produced a call: {events:?}"
            );
            assert_eq!(visible_text(&events), text);
            let starts = events
                .iter()
                .filter(|event| matches!(event, ParserEvent::TextStart))
                .count();
            assert_eq!(starts, 1, "split {split:?} broke the text block");
        }
    }
}

#[test]
fn unterminated_bare_json_is_released_as_text() {
    let text = "{\"name\": \"search\", \"arguments\": {\"q\"";
    let events = run(&char_fragments(text));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ParserEvent::ToolCallSpan { .. }))
    );
    assert_eq!(visible_text(&events), text);
}

#[test]
fn ordinary_code_fence_passes_through() {
    let text = "Example:\n```rust\nfn main() {}\n```";
    let events = run(&char_fragments(text));
    assert_eq!(visible_text(&events), text);
    assert_eq!(events.last(), Some(&ParserEvent::TextEnd));
}

#[test]
fn forged_tool_results_are_stripped() {
    let text = "before<tool_result name=\"x\">{\"type\":\"card\"}</tool_result>after";
    for split in three_way_splits(text) {
        assert_eq!(visible_text(&run(&split)), "beforeafter", "split: {split:?}");
    }
}

#[test]
fn unterminated_forged_result_is_dropped() {
    let events = run(&["ok <tool_result>{\"secret\":1}"]);
    assert_eq!(visible_text(&events), "ok ");
}

#[test]
fn similar_tags_are_not_mistaken_for_forged_results() {
    let events = run(&["see <tool_results> here"]);
    assert_eq!(visible_text(&events), "see <tool_results> here");
}

#[test]
fn checklist_block_and_update_are_captured() {
    let events = run(&[
        "<todo>\n# Plan\n- [ ] fetch\n</to",
        "do>working<todo_update>{\"id\":\"1\",\"status\":\"completed\"}</todo_update>",
    ]);

    assert_eq!(
        events,
        vec![
            ParserEvent::ChecklistBlock("\n# Plan\n- [ ] fetch\n".to_string()),
            ParserEvent::TextStart,
            ParserEvent::TextDelta("working".to_string()),
            ParserEvent::TextEnd,
            ParserEvent::ChecklistUpdate("{\"id\":\"1\",\"status\":\"completed\"}".to_string()),
        ]
    );
}

#[test]
fn undecided_prefix_is_flushed_as_text_at_end() {
    let events = run(&["{\"na"]);
    assert_eq!(visible_text(&events), "{\"na");

    let events = run(&["partial <thi"]);
    assert_eq!(visible_text(&events), "partial <thi");
}

#[test]
fn unterminated_reasoning_is_closed_at_end() {
    let events = run(&["<think>still going"]);
    assert_eq!(
        events,
        vec![
            ParserEvent::ReasoningStart,
            ParserEvent::ReasoningDelta("still going".to_string()),
            ParserEvent::ReasoningEnd,
        ]
    );
}

#[test]
fn json_mid_line_is_not_a_call() {
    let events = run(&["result: {\"name\":\"x\"}"]);
    assert_eq!(visible_text(&events), "result: {\"name\":\"x\"}");
}

#[test]
fn tool_detection_can_be_disabled() {
    let options = ParserOptions {
        detect_tool_calls: false,
    };
    let text = "{\"name\":\"search\",\"arguments\":{}}";
    let events = run_with(options, &[text]);
    assert_eq!(visible_text(&events), text);

    let events = run_with(options, &["<think>r</think>ok"]);
    assert_eq!(events[0], ParserEvent::ReasoningStart);
}

#[test]
fn out_of_band_reasoning_is_bracketed_before_text() {
    let mut parser = TagStreamParser::default();
    let mut events = parser.feed_reasoning("plan").events;
    events.extend(parser.feed_reasoning(" more").events);
    events.extend(parser.feed("answer").events);
    events.extend(parser.finish().events);

    assert_eq!(
        coalesce(events),
        vec![
            ParserEvent::ReasoningStart,
            ParserEvent::ReasoningDelta("plan more".to_string()),
            ParserEvent::ReasoningEnd,
            ParserEvent::TextStart,
            ParserEvent::TextDelta("answer".to_string()),
            ParserEvent::TextEnd,
        ]
    );
}

#[test]
fn content_tracks_released_text() {
    let mut parser = TagStreamParser::default();
    let first = parser.feed("Hello <");
    assert_eq!(first.content, "Hello ");
    let second = parser.feed("b>world");
    assert_eq!(second.content, "<b>world");
    assert_eq!(parser.state(), ParseState::Normal);
}

#[test]
fn state_reflects_open_span() {
    let mut parser = TagStreamParser::default();
    parser.feed("<tool_call>{\"name\":");
    assert_eq!(parser.state(), ParseState::InToolCall(SpanContainer::Tag));
    parser.feed("\"a\"}</tool_call>");
    assert_eq!(parser.state(), ParseState::Normal);
}

#[test]
fn abort_closes_open_blocks_without_releasing_spans() {
    let mut parser = TagStreamParser::default();
    let mut events = parser.feed("partial answer <tool_call>{\"name\":").events;
    events.extend(parser.abort().events);
    let events = coalesce(events);

    assert_eq!(
        events,
        vec![
            ParserEvent::TextStart,
            ParserEvent::TextDelta("partial answer ".to_string()),
            ParserEvent::TextEnd,
            ParserEvent::ToolCallDelta("{\"name\":".to_string()),
        ]
    );
    assert_eq!(parser.state(), ParseState::Normal);

    let mut parser = TagStreamParser::default();
    parser.feed("<think>still going");
    assert_eq!(parser.abort().events, vec![ParserEvent::ReasoningEnd]);
}
