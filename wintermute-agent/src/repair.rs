//! Deterministic JSON recovery: fence stripping, balanced-block extraction,
//! and a single-pass repair state machine.
//!
//! This stage is pure. The LLM recovery stages built on top of it live in
//! `runtime` and never mix with this code.

/// Isolate the JSON portion of a raw model response: strip code fences, then
/// take the outermost balanced `{…}` or `[…]` block. A block left open by
/// output truncation is returned as-is for `repair_json` to close.
pub fn extract_json(raw: &str) -> &str {
    let text = strip_fences(raw);

    let Some(start) = text.find(['{', '[']) else {
        return text.trim();
    };

    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[start..=start + offset];
                }
            }
            _ => {}
        }
    }

    // Unbalanced at EOF: the model hit its output cap mid-structure.
    &text[start..]
}

fn strip_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_fence = &raw[open + 3..];
    // Skip the language tag line ("json", "JSON", or empty).
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Single-pass repair of common model JSON defects:
///
/// - literal newlines/tabs/carriage-returns inside string tokens are escaped;
/// - an unescaped `"` inside a string is treated as structural (closing the
///   string) only when the next non-whitespace character is one of `: , } ]`,
///   otherwise it is escaped;
/// - if EOF is reached mid-structure, the open `]`/`}` stack is closed in
///   nesting order.
///
/// For any valid JSON input the output is byte-identical.
pub fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
            } else {
                match c {
                    '\\' => {
                        out.push(c);
                        escaped = true;
                    }
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    '"' => {
                        if quote_is_structural(&chars[i + 1..]) {
                            out.push('"');
                            in_string = false;
                        } else {
                            out.push_str("\\\"");
                        }
                    }
                    _ => out.push(c),
                }
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                out.push('"');
                in_string = true;
            }
            '{' => {
                out.push('{');
                stack.push('}');
            }
            '[' => {
                out.push('[');
                stack.push(']');
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }

    if in_string {
        if escaped {
            // A dangling backslash at EOF would escape our closing quote.
            out.pop();
        }
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }

    out
}

/// A `"` closes the current string only when the next non-whitespace
/// character (or EOF) could legally follow a string token.
fn quote_is_structural(rest: &[char]) -> bool {
    for &c in rest {
        if c.is_whitespace() {
            continue;
        }
        return matches!(c, ':' | ',' | '}' | ']');
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn repaired_parses(input: &str) -> Value {
        let fixed = repair_json(extract_json(input));
        serde_json::from_str(&fixed)
            .unwrap_or_else(|e| panic!("repair failed: {e}\ninput: {input}\nfixed: {fixed}"))
    }

    #[test]
    fn valid_json_is_untouched() {
        let cases = [
            r#"{"a": 1, "b": [true, null, "x"]}"#,
            r#"{"nested": {"deep": {"list": [1, 2, 3]}}}"#,
            r#"{"escaped": "he said \"hi\" twice", "tab": "a\tb"}"#,
            r#"[{"x": 1.5}, {"y": -2e3}]"#,
            r#"{}"#,
        ];
        for case in cases {
            assert_eq!(repair_json(case), case, "repair must be identity on {case}");
        }
    }

    #[test]
    fn repair_is_idempotent() {
        let broken = "{\"text\": \"line one\nline two\", \"n\": 1";
        let once = repair_json(broken);
        let twice = repair_json(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn literal_newlines_inside_strings_are_escaped() {
        let input = "{\"summary\": \"first\nsecond\tthird\rend\"}";
        let value = repaired_parses(input);
        assert_eq!(value["summary"], "first\nsecond\tthird\rend");
    }

    #[test]
    fn unescaped_quote_before_comma_is_closed() {
        // The quote after "not" precedes a comma, so it closes the string;
        // the one before "or" does not, so it is escaped.
        let input = r#"{"quote": "to be" or not", "n": 2}"#;
        let value = repaired_parses(input);
        assert_eq!(value["quote"], "to be\" or not");
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn truncated_output_is_closed_in_nesting_order() {
        let input = r#"{"items": [{"a": 1}, {"b": 2"#;
        let fixed = repair_json(input);
        assert_eq!(fixed, r#"{"items": [{"a": 1}, {"b": 2}]}"#);
    }

    #[test]
    fn truncation_inside_a_string_closes_everything() {
        let input = r#"{"claims": [{"text": "the capital of Fr"#;
        let value = repaired_parses(input);
        assert_eq!(value["claims"][0]["text"], "the capital of Fr");
    }

    #[test]
    fn code_fences_are_stripped() {
        let input = "Here you go:\n```json\n{\"a\": 1}\n```\nanything else";
        assert_eq!(extract_json(input), "{\"a\": 1}");
    }

    #[test]
    fn fence_without_language_tag() {
        let input = "```\n[1, 2, 3]\n```";
        assert_eq!(extract_json(input), "[1, 2, 3]");
    }

    #[test]
    fn prose_around_the_object_is_dropped() {
        let input = "Sure! The answer is {\"a\": {\"b\": 1}} — hope that helps.";
        assert_eq!(extract_json(input), "{\"a\": {\"b\": 1}}");
    }

    #[test]
    fn braces_inside_strings_do_not_end_extraction() {
        let input = r#"{"tpl": "use {braces} here", "n": 1} trailing"#;
        assert_eq!(extract_json(input), r#"{"tpl": "use {braces} here", "n": 1}"#);
    }

    #[test]
    fn dangling_backslash_at_eof() {
        let input = r#"{"path": "C:\"#;
        let fixed = repair_json(input);
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["path"], "C:");
    }

    #[test]
    fn no_json_at_all_returns_trimmed_text() {
        assert_eq!(extract_json("  just prose  "), "just prose");
    }
}
