// src/core/reference.rs
//
// Reference token scanning: {{ref:id}} and {{script:id[.field][ key=value...]}}
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

lazy_static! {
    static ref REF_RE: Regex = Regex::new(r"\{\{ref:([a-zA-Z0-9_-]+)\}\}").unwrap();
    static ref SCRIPT_RE: Regex = Regex::new(
        r#"\{\{script:([a-zA-Z0-9_-]+)(?:\.([a-zA-Z0-9_-]+))?((?:\s+[a-zA-Z_][a-zA-Z0-9_]*=(?:'[^']*'|"[^"]*"|[^\s'"}]+))*)\s*\}\}"#
    )
    .unwrap();
    static ref ARG_RE: Regex =
        Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)=(?:'([^']*)'|"([^"]*)"|([^\s'"}]+))"#).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Prompt,
    Script,
}

/// One reference token found in a body. Offsets are byte offsets into the
/// scanned string, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedReference {
    pub kind: ReferenceKind,
    pub target_id: String,
    pub field: Option<String>,
    pub inline_args: Option<Map<String, Value>>,
    pub start: usize,
    pub end: usize,
}

/// All reference tokens in `body`, ordered by position.
pub fn scan_references(body: &str) -> Vec<DetectedReference> {
    // both token kinds start with "{{"
    if !body.contains("{{") {
        return Vec::new();
    }

    let mut refs: Vec<DetectedReference> = REF_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(DetectedReference {
                kind: ReferenceKind::Prompt,
                target_id: caps[1].to_string(),
                field: None,
                inline_args: None,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect();

    refs.extend(SCRIPT_RE.captures_iter(body).filter_map(|caps| {
        let whole = caps.get(0)?;
        let args = caps
            .get(3)
            .map(|m| parse_inline_args(m.as_str()))
            .filter(|m| !m.is_empty());
        Some(DetectedReference {
            kind: ReferenceKind::Script,
            target_id: caps[1].to_string(),
            field: caps.get(2).map(|m| m.as_str().to_string()),
            inline_args: args,
            start: whole.start(),
            end: whole.end(),
        })
    }));

    refs.sort_by_key(|r| r.start);
    refs
}

/// Ids of every `{{ref:..}}` token, in order of appearance.
pub fn prompt_reference_ids(body: &str) -> Vec<String> {
    REF_RE
        .captures_iter(body)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// `key='v' n=3 flag=true` → `{"key": "v", "n": 3, "flag": true}`. Quoted
/// values stay strings; bare booleans and numbers become JSON scalars.
pub fn parse_inline_args(text: &str) -> Map<String, Value> {
    let mut args = Map::new();
    for caps in ARG_RE.captures_iter(text) {
        let key = caps[1].to_string();
        let value = if let Some(quoted) = caps.get(2).or_else(|| caps.get(3)) {
            Value::String(quoted.as_str().to_string())
        } else if let Some(bare) = caps.get(4) {
            parse_bare_value(bare.as_str())
        } else {
            continue;
        };
        args.insert(key, value);
    }
    args
}

fn parse_bare_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_mixed_references() {
        let body = "Intro {{ref:header}} then {{script:word-count.count}} and {{script:lint}}.";
        let refs = scan_references(body);
        assert_eq!(refs.len(), 3);

        assert_eq!(refs[0].kind, ReferenceKind::Prompt);
        assert_eq!(refs[0].target_id, "header");
        assert_eq!(&body[refs[0].start..refs[0].end], "{{ref:header}}");

        assert_eq!(refs[1].kind, ReferenceKind::Script);
        assert_eq!(refs[1].target_id, "word-count");
        assert_eq!(refs[1].field.as_deref(), Some("count"));

        assert_eq!(refs[2].field, None);
        assert_eq!(refs[2].inline_args, None);
    }

    #[test]
    fn test_inline_args() {
        let refs = scan_references(r#"{{script:fmt.text style='title case' width=80 dry=true label="x y" code=007x}}"#);
        assert_eq!(refs.len(), 1);
        let args = refs[0].inline_args.clone().unwrap();
        assert_eq!(args["style"], json!("title case"));
        assert_eq!(args["width"], json!(80));
        assert_eq!(args["dry"], json!(true));
        assert_eq!(args["label"], json!("x y"));
        assert_eq!(args["code"], json!("007x"));
        assert_eq!(refs[0].field.as_deref(), Some("text"));
    }

    #[test]
    fn test_ignores_malformed_tokens() {
        assert!(scan_references("plain text").is_empty());
        assert!(scan_references("{{ref:bad id}} {{ref:}} {{ name }} {{ref:../x}}").is_empty());
        assert_eq!(prompt_reference_ids("{{ref:a}}{{ref:b}}{{ref:a}}"), vec!["a", "b", "a"]);
    }
}
