// src/runtime/script_runner.rs
//
// Runs registered script tools.
//
// Protocol: inputs are written to stdin as a single JSON object; stdout is
// parsed as JSON when possible and otherwise kept as raw text.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::tool_loader::{ScriptRuntime, ScriptToolDefinition};
use crate::runtime::process::{ProcessRunner, ProcessSpec, DEFAULT_TIMEOUT_MS};

#[derive(Debug, Clone, Serialize)]
pub struct ScriptExecutionResult {
    pub success: bool,
    /// Parsed JSON output, or the raw trimmed stdout as a string.
    pub output: Value,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    runner: ProcessRunner,
    default_timeout_ms: u64,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(ProcessRunner::default(), DEFAULT_TIMEOUT_MS)
    }
}

impl ScriptExecutor {
    pub fn new(runner: ProcessRunner, default_timeout_ms: u64) -> Self {
        Self {
            runner,
            default_timeout_ms,
        }
    }

    /// Program and leading arguments for a definition's entry point.
    pub fn command_for(def: &ScriptToolDefinition) -> (String, Vec<String>) {
        let script = def.script.to_string_lossy().to_string();
        match def.runtime.detect(&def.script) {
            ScriptRuntime::Python => ("python3".to_string(), vec![script]),
            ScriptRuntime::Node => ("node".to_string(), vec![script]),
            ScriptRuntime::Shell => ("sh".to_string(), vec![script]),
            ScriptRuntime::Auto => (script, Vec::new()),
        }
    }

    pub async fn execute(
        &self,
        def: &ScriptToolDefinition,
        inputs: &Map<String, Value>,
    ) -> ScriptExecutionResult {
        let (program, args) = Self::command_for(def);
        let payload = Value::Object(inputs.clone()).to_string();

        let mut spec = ProcessSpec::new(program)
            .cwd(def.working_dir.clone())
            .env(def.env.clone())
            .stdin(payload)
            .timeout_ms(def.timeout_ms.unwrap_or(self.default_timeout_ms));
        spec.args = args;

        debug!("Executing script '{}' with inputs {:?}", def.id, inputs.keys().collect::<Vec<_>>());
        let out = self.runner.run(spec).await;

        let success = out.success();
        if success {
            info!("⚙️ Script '{}' finished in {} ms", def.id, out.duration_ms);
        } else {
            warn!(
                "Script '{}' failed (exit {}, timed out: {})",
                def.id, out.exit_code, out.timed_out
            );
        }

        ScriptExecutionResult {
            success,
            output: parse_output(&out.stdout),
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            duration_ms: out.duration_ms,
            timed_out: out.timed_out,
        }
    }
}

/// JSON if stdout parses, otherwise the trimmed text; empty stdout is null.
pub fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
