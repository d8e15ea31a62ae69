// src/core/trigger.rs
//
// Deterministic trigger matching: decides which script tools fire for an
// invocation and with which inputs. No scores are learned or guessed; every
// match falls into one of four fixed priority classes.
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::core::tool_loader::{ScriptToolDefinition, TriggerType};

pub const SENTINEL_PREFIX: &str = "tool:";

pub const PRIORITY_EXPLICIT: f64 = 1.0;
pub const PRIORITY_FULL_SCHEMA: f64 = 0.9;
pub const PRIORITY_PARTIAL_SCHEMA: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    /// Named by a `tool:<id>` sentinel.
    Explicit,
    Always,
    FullSchema,
    PartialSchema,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDetectionMatch {
    pub tool_id: String,
    pub priority: f64,
    pub match_reason: MatchReason,
    /// Arguments mapped onto the script's schema property names.
    pub extracted_inputs: Map<String, Value>,
    pub missing_params: Vec<String>,
    pub requires_confirmation: bool,
    pub confirm_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerDetector;

impl TriggerDetector {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate every candidate and return the matches, highest priority first.
    /// Ties keep candidate order.
    pub fn detect(
        &self,
        raw_input: &str,
        args: &Map<String, Value>,
        candidates: &[Arc<ScriptToolDefinition>],
    ) -> Vec<ToolDetectionMatch> {
        let requested = explicit_requests(raw_input, args);
        let mut matches = Vec::new();

        for def in candidates {
            if !def.enabled {
                debug!("Skipping disabled script '{}'", def.id);
                continue;
            }
            if def.execution.trigger == TriggerType::Never {
                continue;
            }

            let ExtractedInputs { inputs, missing, present } = extract_inputs(def, args);

            let classified = if requested.contains(&def.id.to_ascii_lowercase()) {
                Some((PRIORITY_EXPLICIT, MatchReason::Explicit))
            } else {
                match def.execution.trigger {
                    TriggerType::Always => Some((PRIORITY_EXPLICIT, MatchReason::Always)),
                    TriggerType::SchemaMatch => classify_schema(def, &missing, &present),
                    TriggerType::Explicit | TriggerType::Never => None,
                }
            };

            if let Some((priority, match_reason)) = classified {
                debug!("Script '{}' matched ({:?}, {})", def.id, match_reason, priority);
                matches.push(ToolDetectionMatch {
                    tool_id: def.id.clone(),
                    priority,
                    match_reason,
                    extracted_inputs: inputs,
                    missing_params: missing,
                    requires_confirmation: def.execution.confirm,
                    confirm_message: def.execution.confirm_message.clone(),
                });
            }
        }

        matches.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(Ordering::Equal));
        matches
    }
}

// full needs every required property present and well-typed; partial only
// needs one present, whatever its type
fn classify_schema(def: &ScriptToolDefinition, missing: &[String], present: &[String]) -> Option<(f64, MatchReason)> {
    if def.required_properties().is_empty() {
        return None;
    }
    if missing.is_empty() {
        return Some((PRIORITY_FULL_SCHEMA, MatchReason::FullSchema));
    }
    if !def.execution.strict && !present.is_empty() {
        return Some((PRIORITY_PARTIAL_SCHEMA, MatchReason::PartialSchema));
    }
    None
}

/// Collects lower-cased ids named by `tool:<id>` in the argument values
/// (nested ones included) and in the whitespace-separated raw input.
pub fn explicit_requests(raw_input: &str, args: &Map<String, Value>) -> HashSet<String> {
    let mut ids = HashSet::new();
    for value in args.values() {
        collect_sentinels(value, &mut ids);
    }
    for token in raw_input.split_whitespace() {
        let token = token.trim_end_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        if let Some(id) = sentinel_id(token) {
            ids.insert(id);
        }
    }
    ids
}

fn collect_sentinels(value: &Value, ids: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(id) = sentinel_id(s) {
                ids.insert(id);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_sentinels(v, ids)),
        Value::Object(obj) => obj.values().for_each(|v| collect_sentinels(v, ids)),
        _ => {}
    }
}

fn sentinel_id(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let prefix = trimmed.get(..SENTINEL_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(SENTINEL_PREFIX) {
        return None;
    }
    let rest = &trimmed[SENTINEL_PREFIX.len()..];
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Some(rest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Values that carry no real input: `null`, blank strings, empty arrays and
/// sentinel strings.
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty() || sentinel_id(s).is_some(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Checks a value against the `type` keyword of a property schema. Properties
/// without a declared type accept anything.
pub fn matches_declared_type(value: &Value, property_schema: Option<&Value>) -> bool {
    let Some(declared) = property_schema.and_then(|s| s.get("type")) else {
        return true;
    };
    match declared {
        Value::String(t) => matches_type_name(value, t),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| matches_type_name(value, t)),
        _ => true,
    }
}

fn matches_type_name(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Args mapped onto a script's schema.
#[derive(Debug, Clone, Default)]
pub struct ExtractedInputs {
    /// Non-placeholder values that agree with their declared type.
    pub inputs: Map<String, Value>,
    /// Required properties without a usable, well-typed value.
    pub missing: Vec<String>,
    /// Required properties with a non-placeholder value of any type.
    pub present: Vec<String>,
}

/// Maps args onto schema property names.
pub fn extract_inputs(def: &ScriptToolDefinition, args: &Map<String, Value>) -> ExtractedInputs {
    let mut inputs = Map::new();
    let mut supplied = HashSet::new();
    for property in def.schema_properties() {
        if let Some(value) = lookup_arg(args, &property) {
            supplied.insert(property.clone());
            if matches_declared_type(value, def.property_schema(&property)) {
                inputs.insert(property, value.clone());
            } else {
                debug!("Argument for '{}.{}' has the wrong type, ignoring", def.id, property);
            }
        }
    }

    let required = def.required_properties();
    let present = required.iter().filter(|p| supplied.contains(*p)).cloned().collect();
    let missing = required.into_iter().filter(|p| !inputs.contains_key(p)).collect();
    ExtractedInputs { inputs, missing, present }
}

fn lookup_arg<'a>(args: &'a Map<String, Value>, property: &str) -> Option<&'a Value> {
    name_variants(property)
        .iter()
        .filter_map(|name| args.get(name))
        .find(|v| !is_placeholder(v))
}

/// `property` itself plus its snake_case, camelCase and kebab-case spellings.
pub fn name_variants(property: &str) -> Vec<String> {
    let snake = to_snake_case(property);
    let camel = snake_to_camel(&snake);
    let kebab = snake.replace('_', "-");

    let mut variants = vec![property.to_string()];
    for v in [snake, camel, kebab] {
        if !variants.contains(&v) {
            variants.push(v);
        }
    }
    variants
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in name.chars() {
        if c == '-' || c == '_' {
            out.push('_');
            prev_lower_or_digit = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(c);
            prev_lower_or_digit = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

fn snake_to_camel(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper_next = false;
    for c in snake.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
