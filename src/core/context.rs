// src/core/context.rs
use serde_json::{Map, Value};

use crate::runtime::script_runner::ScriptExecutionResult;

/// Variables visible to one template body while it renders.
///
/// Each nested template gets its own copy; nothing here is shared between
/// sibling references.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    data: Map<String, Value>,
}

impl VariableContext {
    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Exposes a script's outcome as `tool_<id>` (parsed output, null on
    /// failure) and `tool_<id>_result` (the full record).
    pub fn insert_tool_result(&mut self, tool_id: &str, result: &ScriptExecutionResult) {
        let (output_var, result_var) = tool_variable_names(tool_id);
        let output = if result.success {
            result.output.clone()
        } else {
            Value::Null
        };
        self.data.insert(output_var, output);
        self.data.insert(
            result_var,
            serde_json::to_value(result).unwrap_or(Value::Null),
        );
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }
}

/// `tool_<id>` / `tool_<id>_result`, with hyphens turned into underscores so
/// the names stay valid identifiers.
pub fn tool_variable_names(tool_id: &str) -> (String, String) {
    let base = format!("tool_{}", tool_id.replace('-', "_"));
    let result = format!("{}_result", base);
    (base, result)
}

/// Walks a dot-notation path through nested objects. Numeric segments index
/// into arrays.
pub fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
