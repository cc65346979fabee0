//! Credential redaction for structured events and logs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"sk-[A-Za-z0-9\-_]{20,}").expect("valid pattern"),
                "[REDACTED_API_KEY]",
            ),
            (
                Regex::new(r"key-[A-Za-z0-9]{20,}").expect("valid pattern"),
                "[REDACTED_API_KEY]",
            ),
            (
                Regex::new(r"Bearer\s+[A-Za-z0-9._\-]{20,}").expect("valid pattern"),
                "Bearer [REDACTED_TOKEN]",
            ),
            (
                Regex::new(r"\b[a-fA-F0-9]{40,}\b").expect("valid pattern"),
                "[REDACTED_HASH]",
            ),
        ]
    })
}

fn credential_key() -> &'static Regex {
    static KEY: OnceLock<Regex> = OnceLock::new();
    KEY.get_or_init(|| {
        Regex::new(r"(?i)(api[_-]?key|secret|token|password|authorization|credential)")
            .expect("valid pattern")
    })
}

/// Scrub credential-shaped substrings from free text.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, replacement) in patterns() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Scrub a JSON value in place: string leaves go through the text patterns,
/// and any value under a credential-named key is replaced wholesale.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let scrubbed = redact(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if credential_key().is_match(key) {
                    *item = Value::String(REDACTED.into());
                } else {
                    redact_value(item);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_keys_and_bearer_tokens_scrubbed() {
        let text = "calling with sk-abcdefghijklmnopqrstuv and Bearer abcdefghijklmnopqrst.123";
        let out = redact(text);
        assert!(!out.contains("sk-abcdefghijklmnopqrstuv"));
        assert!(out.contains("[REDACTED_API_KEY]"));
        assert!(out.contains("Bearer [REDACTED_TOKEN]"));
    }

    #[test]
    fn plain_text_untouched() {
        let text = "tier 2 resolved with quality 0.82";
        assert_eq!(redact(text), text);
    }

    #[test]
    fn credential_named_keys_replaced_wholesale() {
        let mut value = json!({
            "provider": "cloud_a",
            "api_key": "whatever",
            "nested": {"Authorization": "Basic abc", "note": "fine"}
        });
        redact_value(&mut value);
        assert_eq!(value["api_key"], json!("[REDACTED]"));
        assert_eq!(value["nested"]["Authorization"], json!("[REDACTED]"));
        assert_eq!(value["provider"], json!("cloud_a"));
        assert_eq!(value["nested"]["note"], json!("fine"));
    }

    #[test]
    fn long_hex_looks_like_a_secret() {
        let out = redact("hash 0123456789abcdef0123456789abcdef01234567 trailing");
        assert!(out.contains("[REDACTED_HASH]"));
    }
}
