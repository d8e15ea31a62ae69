// src/core/renderer.rs
use anyhow::Result;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::core::context::lookup_path;

lazy_static! {
    // {{ name }} / {{ a.b.0 }}; reference tokens ({{ref:..}}, {{script:..}}) never match
    static ref VAR_RE: Regex =
        Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_-]*(?:\.[a-zA-Z0-9_-]+)*)\s*\}\}").unwrap();
}

/// Final variable interpolation over an already reference-resolved body.
pub trait VariableRenderer: Send + Sync {
    fn render(&self, body: &str, variables: &Map<String, Value>) -> Result<String>;
}

/// `{{ path }}` substitution. Strings are inserted raw, other values as
/// compact JSON, unknown paths as the empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRenderer;

impl SimpleRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl VariableRenderer for SimpleRenderer {
    fn render(&self, body: &str, variables: &Map<String, Value>) -> Result<String> {
        let rendered = VAR_RE.replace_all(body, |caps: &Captures| {
            match lookup_path(variables, &caps[1]) {
                Some(value) => value_to_text(value),
                None => String::new(),
            }
        });
        Ok(rendered.into_owned())
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_paths_and_values() {
        let vars = json!({
            "name": "Ada",
            "stats": {"count": 3, "tags": ["x", "y"]},
            "nothing": null
        });
        let out = SimpleRenderer
            .render(
                "Hi {{ name }}: {{stats.count}} {{ stats.tags }} [{{ nothing }}] [{{ missing.path }}]",
                vars.as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(out, r#"Hi Ada: 3 ["x","y"] [] []"#);
    }

    #[test]
    fn test_reference_tokens_untouched() {
        let out = SimpleRenderer
            .render("{{ref:intro}} {{script:wc.count}}", &Map::new())
            .unwrap();
        assert_eq!(out, "{{ref:intro}} {{script:wc.count}}");
    }
}
