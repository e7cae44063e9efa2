//! Message filters
//!
//! A filter is anything that maps a message to a message. Filters compose
//! left-to-right into a [`FilterChain`]; the empty chain is the identity.
//! Filters may shrink, redact or decorate messages but must stay total:
//! a filter that cannot improve a message returns it unchanged.

use serde_json::Value as JsonValue;

use crate::types::Message;

/// A single message transformation step
pub trait MessageFilter: Send {
    /// Apply filtering logic to a message.
    fn filter(&self, message: Message) -> Message;
}

/// A chain of filters applied sequentially to each message
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn MessageFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain { filters: Vec::new() }
    }

    /// Add a filter to the end of the chain
    pub fn add_filter(&mut self, filter: Box<dyn MessageFilter>) {
        self.filters.push(filter);
    }

    /// Apply all filters in order; each receives the previous output
    pub fn apply(&self, message: Message) -> Message {
        self.filters
            .iter()
            .fold(message, |msg, f| f.filter(msg))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Replaces the values at the configured dot-separated paths with a
/// placeholder. Paths that do not resolve are left alone.
pub struct RedactFields {
    paths: Vec<Vec<String>>,
}

const REDACTED: &str = "[REDACTED]";

impl RedactFields {
    /// `paths` are dot-separated object paths, e.g. `spec.row.password`
    pub fn new(paths: &[&str]) -> Self {
        RedactFields {
            paths: paths
                .iter()
                .map(|p| p.split('.').map(str::to_string).collect())
                .collect(),
        }
    }

    fn redact_path(message: &mut JsonValue, path: &[String]) {
        let Some((leaf, parents)) = path.split_last() else {
            return;
        };
        let mut node = message;
        for key in parents {
            match node.get_mut(key) {
                Some(child) => node = child,
                None => return,
            }
        }
        if let Some(slot) = node.get_mut(leaf) {
            *slot = JsonValue::String(REDACTED.to_string());
        }
    }
}

impl MessageFilter for RedactFields {
    fn filter(&self, mut message: Message) -> Message {
        for path in &self.paths {
            Self::redact_path(&mut message, path);
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Uppercase;

    impl MessageFilter for Uppercase {
        fn filter(&self, message: Message) -> Message {
            match message {
                JsonValue::String(s) => JsonValue::String(s.to_uppercase()),
                other => other,
            }
        }
    }

    struct Suffix(&'static str);

    impl MessageFilter for Suffix {
        fn filter(&self, message: Message) -> Message {
            match message {
                JsonValue::String(s) => JsonValue::String(format!("{}{}", s, self.0)),
                other => other,
            }
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = FilterChain::new();
        let msg = json!({"a": 1});
        assert_eq!(chain.apply(msg.clone()), msg);
    }

    #[test]
    fn test_chain_applies_left_to_right() {
        let mut chain = FilterChain::new();
        chain.add_filter(Box::new(Uppercase));
        chain.add_filter(Box::new(Suffix("!")));
        assert_eq!(chain.apply(json!("abc")), json!("ABC!"));

        let mut reversed = FilterChain::new();
        reversed.add_filter(Box::new(Suffix("!")));
        reversed.add_filter(Box::new(Uppercase));
        assert_eq!(reversed.apply(json!("abc")), json!("ABC!"));
        // Order matters when the steps do not commute
        let mut chain = FilterChain::new();
        chain.add_filter(Box::new(Suffix("x")));
        chain.add_filter(Box::new(Uppercase));
        assert_eq!(chain.apply(json!("a")), json!("AX"));
    }

    #[test]
    fn test_redact_nested_field() {
        let filter = RedactFields::new(&["spec.row.password"]);
        let out = filter.filter(json!({
            "spec": {"row": {"id": 1, "password": "hunter2"}}
        }));
        assert_eq!(out["spec"]["row"]["password"], json!("[REDACTED]"));
        assert_eq!(out["spec"]["row"]["id"], json!(1));
    }

    #[test]
    fn test_redact_missing_path_is_noop() {
        let filter = RedactFields::new(&["spec.missing.key"]);
        let msg = json!({"spec": {"row": {"id": 1}}});
        assert_eq!(filter.filter(msg.clone()), msg);
    }

    #[test]
    fn test_redact_multiple_paths() {
        let filter = RedactFields::new(&["a", "b.c"]);
        let out = filter.filter(json!({"a": 1, "b": {"c": 2, "d": 3}}));
        assert_eq!(out, json!({"a": "[REDACTED]", "b": {"c": "[REDACTED]", "d": 3}}));
    }
}
