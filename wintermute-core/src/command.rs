//! Tier-0 command registry: deterministic regex and JSON-payload dispatch.
//!
//! Matching never calls a model; a regex hit always carries confidence 1.0.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandPattern {
    pub pattern: Regex,
    pub action: String,
    pub target: String,
    pub description: String,
}

/// Result of a successful tier-0 match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMatch {
    pub action: String,
    pub target: String,
    pub args: BTreeMap<String, Value>,
    pub confidence: f64,
}

/// Ordered registry of deterministic command patterns. First match wins.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    patterns: Vec<CommandPattern>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pattern: &str,
        action: &str,
        target: &str,
        description: &str,
    ) -> Result<(), regex::Error> {
        self.patterns.push(CommandPattern {
            pattern: Regex::new(pattern)?,
            action: action.into(),
            target: target.into(),
            description: description.into(),
        });
        Ok(())
    }

    pub fn patterns(&self) -> &[CommandPattern] {
        &self.patterns
    }

    /// Match input text against registered patterns, in registration order.
    /// JSON objects with a `command` field are re-matched on the command value
    /// with the remaining payload keys merged into args.
    pub fn matches(&self, text: &str) -> Option<CommandMatch> {
        let text = text.trim();

        if let Some(m) = self.try_json(text) {
            return Some(m);
        }

        self.match_patterns(text)
    }

    fn match_patterns(&self, text: &str) -> Option<CommandMatch> {
        for cp in &self.patterns {
            if let Some(caps) = cp.pattern.captures(text) {
                let mut args = BTreeMap::new();
                for name in cp.pattern.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        args.insert(name.to_string(), Value::String(value.as_str().to_string()));
                    }
                }
                return Some(CommandMatch {
                    action: cp.action.clone(),
                    target: cp.target.clone(),
                    args,
                    confidence: 1.0,
                });
            }
        }
        None
    }

    fn try_json(&self, text: &str) -> Option<CommandMatch> {
        let data: Value = serde_json::from_str(text).ok()?;
        let object = data.as_object()?;
        let command = object.get("command")?.as_str()?;

        if let Some(mut m) = self.match_patterns(command) {
            for (k, v) in object {
                if k != "command" && !m.args.contains_key(k) {
                    m.args.insert(k.clone(), v.clone());
                }
            }
            return Some(m);
        }

        // A command key with no matching pattern still dispatches, so callers
        // can report the unknown command instead of escalating it to a model.
        Some(CommandMatch {
            action: "unknown_command".into(),
            target: String::new(),
            args: object.clone().into_iter().collect(),
            confidence: 1.0,
        })
    }
}

/// Register the default slash commands.
pub fn register_defaults(registry: &mut CommandRegistry) {
    let defaults = [
        (
            r"^/cert\s+(?P<cert_id>\S+)$",
            "execute_graph",
            "run_cert",
            "Run the certification graph",
        ),
        (
            r"^/dossier\s+(?P<topic_id>\S+)$",
            "execute_graph",
            "run_dossier",
            "Run the dossier graph",
        ),
        (
            r"^/story\s+(?P<world_id>\S+)$",
            "execute_graph",
            "run_story",
            "Run the story graph",
        ),
        (
            r"^/lab\s+(?P<suite_id>\S+)$",
            "execute_graph",
            "run_lab",
            "Run the lab graph",
        ),
        (r"^/status$", "show_status", "", "Show system status"),
        (r"^/help$", "show_help", "", "Show help information"),
    ];
    for (pattern, action, target, description) in defaults {
        registry
            .register(pattern, action, target, description)
            .expect("default command patterns are valid");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> CommandRegistry {
        let mut r = CommandRegistry::new();
        register_defaults(&mut r);
        r
    }

    #[test]
    fn cert_command_matches_with_capture() {
        let m = registry().matches("/cert az-104").unwrap();
        assert_eq!(m.action, "execute_graph");
        assert_eq!(m.target, "run_cert");
        assert_eq!(m.args["cert_id"], json!("az-104"));
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn free_text_does_not_match() {
        assert!(registry()
            .matches("explain the certification architecture")
            .is_none());
    }

    #[test]
    fn json_payload_rematches_command_value() {
        let m = registry()
            .matches(r#"{"command": "/lab suite-1", "priority": "high"}"#)
            .unwrap();
        assert_eq!(m.action, "execute_graph");
        assert_eq!(m.target, "run_lab");
        assert_eq!(m.args["suite_id"], json!("suite-1"));
        assert_eq!(m.args["priority"], json!("high"));
    }

    #[test]
    fn unknown_json_command_still_dispatches() {
        let m = registry().matches(r#"{"command": "/frobnicate now"}"#).unwrap();
        assert_eq!(m.action, "unknown_command");
        assert_eq!(m.args["command"], json!("/frobnicate now"));
    }

    #[test]
    fn registration_order_wins() {
        let mut r = CommandRegistry::new();
        r.register(r"^/x\s+(?P<a>\S+)$", "first", "t1", "").unwrap();
        r.register(r"^/x\s+(?P<b>\S+)$", "second", "t2", "").unwrap();
        let m = r.matches("/x arg").unwrap();
        assert_eq!(m.action, "first");
    }

    #[test]
    fn status_and_help_have_no_args() {
        let status = registry().matches("/status").unwrap();
        assert_eq!(status.action, "show_status");
        assert!(status.args.is_empty());

        let help = registry().matches("  /help  ").unwrap();
        assert_eq!(help.action, "show_help");
    }
}
