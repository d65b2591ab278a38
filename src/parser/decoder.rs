use serde_json::{Map, Value};

use super::SpanContainer;

/// A tool call recovered from free text. Ids are assigned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCall {
    pub name: String,
    pub arguments: Value,
}

/// Recovers `{name, arguments}` from a captured span.
///
/// Returns `None` when no strategy finds a call; that is not an error.
pub fn decode_tool_call(raw: &str) -> Option<DecodedCall> {
    decode(raw, false)
}

/// Decodes a span according to where it was found.
///
/// Only `<tool_call>` tags may omit the arguments. A fenced or bare object
/// needs an `arguments`/`parameters` key as well as a name, so that ordinary
/// JSON with a `name` field (a package manifest, a record) stays text.
pub fn decode_span(raw: &str, container: SpanContainer) -> Option<DecodedCall> {
    decode(raw, container != SpanContainer::Tag)
}

fn decode(raw: &str, require_arguments: bool) -> Option<DecodedCall> {
    let body = strip_fence(raw.trim());
    if body.is_empty() {
        return None;
    }

    parse_call(body, require_arguments).or_else(|| {
        let normalized = normalize_quotes(body);
        if normalized == body {
            None
        } else {
            parse_call(&normalized, require_arguments)
        }
    })
}

fn parse_call(body: &str, require_arguments: bool) -> Option<DecodedCall> {
    let value = serde_json::from_str::<Value>(body).ok().or_else(|| {
        let object = extract_first_object(body)?;
        serde_json::from_str::<Value>(object).ok()
    })?;
    call_from_value(&value, require_arguments)
}

fn call_from_value(value: &Value, require_arguments: bool) -> Option<DecodedCall> {
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = obj.get("arguments").or_else(|| obj.get("parameters"));
    if require_arguments && arguments.is_none() {
        return None;
    }
    let arguments = match arguments {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(text)) if text.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => return None,
        },
        Some(_) => return None,
    };

    Some(DecodedCall {
        name: name.to_string(),
        arguments,
    })
}

fn strip_fence(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

/// Straightens typographic quotes; a body with no double quotes at all has its
/// single quotes promoted.
fn normalize_quotes(body: &str) -> String {
    let straightened = body
        .chars()
        .map(|ch| match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{FF02}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect::<String>();

    if straightened.contains('"') {
        straightened
    } else {
        straightened.replace('\'', "\"")
    }
}

fn extract_first_object(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let mut scanner = JsonScanner::default();
    for (idx, ch) in body[start..].char_indices() {
        if scanner.step(ch) {
            return Some(&body[start..start + idx + ch.len_utf8()]);
        }
    }
    None
}

/// Tracks brace depth of a JSON object, ignoring braces inside strings.
#[derive(Debug, Default, Clone)]
pub(crate) struct JsonScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonScanner {
    /// Consumes one character; returns true when it closes the outermost object.
    pub(crate) fn step(&mut self, ch: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return false;
        }

        match ch {
            '"' => self.in_string = true,
            '{' => self.depth += 1,
            '}' if self.depth > 0 => {
                self.depth -= 1;
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_plain_json_call() {
        let call = decode_tool_call(r#"{"name":"search","arguments":{"q":"x"}}"#)
            .expect("call decodes");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!({"q": "x"}));
    }

    #[test]
    fn decodes_stringified_arguments_and_parameters_alias() {
        let call = decode_tool_call(r#"{"name":"search","arguments":"{\"q\":1}"}"#)
            .expect("stringified arguments decode");
        assert_eq!(call.arguments, json!({"q": 1}));

        let call = decode_tool_call(r#"{"name":"search","parameters":{"q":2}}"#)
            .expect("parameters alias decodes");
        assert_eq!(call.arguments, json!({"q": 2}));
    }

    #[test]
    fn missing_arguments_become_empty_object() {
        let call = decode_tool_call(r#"{"name": "now"}"#).expect("decodes");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn fenced_and_bare_spans_need_an_arguments_key() {
        let manifest = r#"{"name": "my-app", "version": "1.0.0"}"#;
        assert_eq!(decode_span(manifest, SpanContainer::Fence), None);
        assert_eq!(decode_span(manifest, SpanContainer::BareJson), None);
        assert_eq!(
            decode_span(manifest, SpanContainer::Tag).map(|call| call.name),
            Some("my-app".to_string())
        );

        let call = decode_span(r#"{"name": "now", "parameters": {}}"#, SpanContainer::Fence)
            .expect("parameters key is enough");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn normalizes_typographic_and_single_quotes() {
        let call = decode_tool_call("{\u{201C}name\u{201D}: \u{201C}search\u{201D}, \u{201C}arguments\u{201D}: {\u{201C}q\u{201D}: \u{201C}x\u{201D}}}")
            .expect("curly quotes decode");
        assert_eq!(call.name, "search");

        let call = decode_tool_call("{'name': 'search', 'arguments': {'q': 'x'}}")
            .expect("single quotes decode");
        assert_eq!(call.arguments, json!({"q": "x"}));
    }

    #[test]
    fn tolerates_fences_and_trailing_prose() {
        let call = decode_tool_call("```json\n{\"name\":\"search\",\"arguments\":{}}\n```")
            .expect("fenced decodes");
        assert_eq!(call.name, "search");

        let call = decode_tool_call("{\"name\":\"a\",\"arguments\":{\"s\":\"}\"}} trailing words")
            .expect("first object decodes");
        assert_eq!(call.arguments, json!({"s": "}"}));
    }

    #[test]
    fn rejects_spans_without_a_call() {
        assert_eq!(decode_tool_call(""), None);
        assert_eq!(decode_tool_call("not json at all"), None);
        assert_eq!(decode_tool_call(r#"{"arguments":{}}"#), None);
        assert_eq!(decode_tool_call(r#"{"name":"x","arguments":[1]}"#), None);
        assert_eq!(decode_tool_call(r#"{"name":"x","arguments":{"#), None);
    }

    #[test]
    fn scanner_ignores_braces_in_strings() {
        let mut scanner = JsonScanner::default();
        let text = r#"{"a":"{\"}","b":{}}"#;
        let closed_at = text
            .char_indices()
            .find(|(_, ch)| scanner.step(*ch))
            .map(|(idx, _)| idx);
        assert_eq!(closed_at, Some(text.len() - 1));
    }
}
