// src/core/tool_loader.rs
use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Name of the per-script definition file inside a tool directory.
pub const DEFINITION_FILE: &str = "tool.json";
pub const DEFAULT_SCHEMA_FILE: &str = "schema.json";
pub const DEFAULT_DESCRIPTION_FILE: &str = "description.md";

lazy_static! {
    pub static ref SCRIPT_ID_RE: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// When a script fires for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    SchemaMatch,
    Explicit,
    Always,
    Never,
}

impl TriggerType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "schema_match" => Ok(Self::SchemaMatch),
            "explicit" => Ok(Self::Explicit),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(anyhow!(
                "Unknown trigger '{}' (expected schema_match, explicit, always or never)",
                other
            )),
        }
    }
}

/// Interpreter hint for the script entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRuntime {
    #[default]
    Auto,
    Python,
    Node,
    Shell,
}

impl ScriptRuntime {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "python" | "python3" => Ok(Self::Python),
            "node" | "nodejs" | "javascript" => Ok(Self::Node),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            other => Err(anyhow!("Unknown runtime '{}'", other)),
        }
    }

    /// Resolves `Auto` from the script's file extension.
    pub fn detect(self, script: &Path) -> Self {
        if self != Self::Auto {
            return self;
        }
        match script.extension().and_then(|e| e.to_str()) {
            Some("py") => Self::Python,
            Some("js") | Some("mjs") | Some("cjs") => Self::Node,
            Some("sh") => Self::Shell,
            _ => Self::Auto,
        }
    }
}

/// Which storage tier a definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionSource {
    Local,
    Workspace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPolicy {
    pub trigger: TriggerType,
    pub confirm: bool,
    pub strict: bool,
    pub confirm_message: Option<String>,
    pub auto_approve_on_valid: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            trigger: TriggerType::SchemaMatch,
            confirm: false,
            strict: false,
            confirm_message: None,
            auto_approve_on_valid: false,
        }
    }
}

/// A fully loaded script tool: definition file plus inlined side files.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptToolDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Absolute path of the entry point.
    pub script: PathBuf,
    pub runtime: ScriptRuntime,
    pub input_schema: Value,
    pub execution: ExecutionPolicy,
    pub timeout_ms: Option<u64>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub enabled: bool,
    /// Directory holding `tool.json`.
    pub dir: PathBuf,
    pub source: DefinitionSource,
}

impl ScriptToolDefinition {
    /// Property names declared by the input schema.
    pub fn schema_properties(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Properties that decide a schema match: `required`, or every property when
    /// the schema lists none.
    pub fn required_properties(&self) -> Vec<String> {
        let required: Vec<String> = self
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if required.is_empty() {
            self.schema_properties()
        } else {
            required
        }
    }

    pub fn property_schema(&self, name: &str) -> Option<&Value> {
        self.input_schema.get("properties")?.get(name)
    }
}

// ============================================================================
// 定义文件格式 (On-disk shape)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptToolFile {
    id: String,
    name: String,
    description: Option<String>,
    script: String,
    runtime: Option<String>,
    schema_file: Option<String>,
    description_file: Option<String>,
    timeout: Option<u64>,
    #[serde(default)]
    env: HashMap<String, String>,
    working_dir: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    execution: RawExecution,
    /// 旧版字段：顶层 mode
    mode: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    trigger: Option<String>,
    confirm: Option<bool>,
    strict: Option<bool>,
    confirm_message: Option<String>,
    auto_approve_on_valid: Option<bool>,
    // deprecated
    mode: Option<String>,
    confidence: Option<f64>,
}

/// Maps the deprecated `mode` / `confidence` fields onto the current
/// `{trigger, confirm, strict}` model. Explicit current fields always win.
fn normalize_execution(raw: RawExecution, top_level_mode: Option<String>) -> Result<ExecutionPolicy> {
    let legacy_mode = raw.mode.or(top_level_mode);

    let (legacy_trigger, legacy_confirm) = match legacy_mode.as_deref().map(str::trim) {
        None => (None, None),
        Some("auto") => (Some(TriggerType::SchemaMatch), Some(false)),
        Some("manual") => (Some(TriggerType::Explicit), Some(false)),
        Some("confirm") => (Some(TriggerType::SchemaMatch), Some(true)),
        Some(other) => return Err(anyhow!("Unknown legacy execution mode '{}'", other)),
    };

    let legacy_strict = raw.confidence.map(|c| c >= 0.9);

    let trigger = match raw.trigger {
        Some(t) => TriggerType::parse(&t)?,
        None => legacy_trigger.unwrap_or_default(),
    };

    Ok(ExecutionPolicy {
        trigger,
        confirm: raw.confirm.or(legacy_confirm).unwrap_or(false),
        strict: raw.strict.or(legacy_strict).unwrap_or(false),
        confirm_message: raw.confirm_message,
        auto_approve_on_valid: raw.auto_approve_on_valid.unwrap_or(false),
    })
}

/// Rejects relative paths that escape their base directory.
fn confined_path(base: &Path, rel: &str, what: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(anyhow!(
            "{} '{}' must be a relative path inside {}",
            what,
            rel,
            base.display()
        ));
    }
    Ok(base.join(rel_path))
}

pub struct ToolLoader;

impl ToolLoader {
    /// Load and validate the definition in `dir/tool.json`.
    ///
    /// `expected_id` is the directory name the definition was looked up by; a
    /// definition declaring a different id is rejected.
    pub fn load_from_dir(dir: &Path, expected_id: &str, source: DefinitionSource) -> Result<ScriptToolDefinition> {
        // child processes chdir into working_dir before opening the script path
        let dir = std::path::absolute(dir)
            .with_context(|| format!("Failed to resolve tool directory: {}", dir.display()))?;
        let dir = dir.as_path();
        let path = dir.join(DEFINITION_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read tool file: {}", path.display()))?;

        let raw: ScriptToolFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse tool JSON: {}", path.display()))?;

        let def = Self::build(raw, dir, expected_id, source)
            .with_context(|| format!("Invalid tool file: {}", path.display()))?;

        debug!("Loaded script tool '{}' from {}", def.id, path.display());
        Ok(def)
    }

    fn build(
        raw: ScriptToolFile,
        dir: &Path,
        expected_id: &str,
        source: DefinitionSource,
    ) -> Result<ScriptToolDefinition> {
        if !SCRIPT_ID_RE.is_match(&raw.id) {
            return Err(anyhow!("Script id '{}' must match [a-zA-Z0-9_-]+", raw.id));
        }
        if raw.id != expected_id {
            return Err(anyhow!(
                "Script id '{}' does not match its directory name '{}'",
                raw.id,
                expected_id
            ));
        }
        if raw.name.trim().is_empty() {
            return Err(anyhow!("Script '{}' must have a non-empty 'name'", raw.id));
        }
        if raw.script.trim().is_empty() {
            return Err(anyhow!("Script '{}' must have a non-empty 'script'", raw.id));
        }
        if raw.timeout == Some(0) {
            return Err(anyhow!("Script '{}' timeout must be positive", raw.id));
        }

        let script = confined_path(dir, raw.script.trim(), "script")?;
        let runtime = ScriptRuntime::parse(raw.runtime.as_deref().unwrap_or("auto"))?;
        let execution = normalize_execution(raw.execution, raw.mode)?;

        let working_dir = match raw.working_dir.as_deref() {
            Some(wd) => confined_path(dir, wd, "workingDir")?,
            None => dir.to_path_buf(),
        };

        let input_schema = Self::load_schema(dir, raw.schema_file.as_deref())?;
        let description = match Self::load_description(dir, raw.description_file.as_deref()) {
            Some(text) => Some(text),
            None => raw.description,
        };

        Ok(ScriptToolDefinition {
            id: raw.id,
            name: raw.name,
            description,
            script,
            runtime,
            input_schema,
            execution,
            timeout_ms: raw.timeout,
            working_dir,
            env: raw.env,
            enabled: raw.enabled,
            dir: dir.to_path_buf(),
            source,
        })
    }

    fn load_schema(dir: &Path, schema_file: Option<&str>) -> Result<Value> {
        let path = confined_path(dir, schema_file.unwrap_or(DEFAULT_SCHEMA_FILE), "schemaFile")?;
        if !path.is_file() {
            if schema_file.is_some() {
                warn!("Schema file {} not found, using empty schema", path.display());
            }
            return Ok(json!({ "type": "object", "properties": {} }));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read schema: {}", path.display()))?;
        let schema: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema: {}", path.display()))?;
        if !schema.is_object() {
            return Err(anyhow!("Schema {} must be a JSON object", path.display()));
        }
        Ok(schema)
    }

    fn load_description(dir: &Path, description_file: Option<&str>) -> Option<String> {
        let path = confined_path(
            dir,
            description_file.unwrap_or(DEFAULT_DESCRIPTION_FILE),
            "descriptionFile",
        )
        .ok()?;
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tool(dir: &Path, tool_json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(DEFINITION_FILE), tool_json).unwrap();
    }

    #[test]
    fn test_load_inlines_side_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("word_count");
        write_tool(
            &dir,
            r#"{"id": "word_count", "name": "Word Count", "script": "script.sh",
                "execution": {"trigger": "schema_match", "strict": true}}"#,
        );
        fs::write(
            dir.join("schema.json"),
            r#"{"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}"#,
        )
        .unwrap();
        fs::write(dir.join("description.md"), "Counts words.\n").unwrap();

        let def = ToolLoader::load_from_dir(&dir, "word_count", DefinitionSource::Local).unwrap();
        assert_eq!(def.description.as_deref(), Some("Counts words."));
        assert_eq!(def.required_properties(), vec!["text".to_string()]);
        assert!(def.execution.strict);
        assert_eq!(def.script, dir.join("script.sh"));
        assert_eq!(def.runtime.detect(&def.script), ScriptRuntime::Shell);
        assert!(def.enabled);
    }

    #[test]
    fn test_relative_dir_yields_absolute_paths() {
        let tmp = tempfile::tempdir_in(".").unwrap();
        let name = tmp.path().file_name().unwrap();
        let rel = Path::new(".").join(name).join("lint");
        write_tool(&rel, r#"{"id": "lint", "name": "Lint", "script": "run.sh", "workingDir": "work"}"#);

        let def = ToolLoader::load_from_dir(&rel, "lint", DefinitionSource::Workspace).unwrap();
        assert!(def.script.is_absolute());
        assert!(def.working_dir.is_absolute());
        assert!(def.dir.is_absolute());
        assert!(def.script.ends_with("lint/run.sh"));
        assert!(def.working_dir.ends_with("lint/work"));
    }

    #[test]
    fn test_missing_schema_defaults_to_empty_object() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("noop");
        write_tool(&dir, r#"{"id": "noop", "name": "Noop", "script": "run.py"}"#);

        let def = ToolLoader::load_from_dir(&dir, "noop", DefinitionSource::Workspace).unwrap();
        assert_eq!(def.input_schema, json!({"type": "object", "properties": {}}));
        assert_eq!(def.execution, ExecutionPolicy::default());
        assert!(def.required_properties().is_empty());
    }

    #[test]
    fn test_rejects_invalid_definitions() {
        let tmp = tempfile::tempdir().unwrap();

        let mismatched = tmp.path().join("alpha");
        write_tool(&mismatched, r#"{"id": "beta", "name": "B", "script": "x.sh"}"#);
        assert!(ToolLoader::load_from_dir(&mismatched, "alpha", DefinitionSource::Local).is_err());

        let escaping = tmp.path().join("escape");
        write_tool(&escaping, r#"{"id": "escape", "name": "E", "script": "../../bin/sh"}"#);
        assert!(ToolLoader::load_from_dir(&escaping, "escape", DefinitionSource::Local).is_err());

        let bad_trigger = tmp.path().join("bad");
        write_tool(
            &bad_trigger,
            r#"{"id": "bad", "name": "B", "script": "x.sh", "execution": {"trigger": "sometimes"}}"#,
        );
        assert!(ToolLoader::load_from_dir(&bad_trigger, "bad", DefinitionSource::Local).is_err());

        let bad_schema = tmp.path().join("schema_broken");
        write_tool(&bad_schema, r#"{"id": "schema_broken", "name": "S", "script": "x.sh"}"#);
        fs::write(bad_schema.join("schema.json"), "{ not json").unwrap();
        assert!(ToolLoader::load_from_dir(&bad_schema, "schema_broken", DefinitionSource::Local).is_err());
    }

    #[test]
    fn test_legacy_mode_migration() {
        let manual = normalize_execution(
            RawExecution {
                mode: Some("manual".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(manual.trigger, TriggerType::Explicit);
        assert!(!manual.confirm);

        let confirm = normalize_execution(
            RawExecution {
                mode: Some("confirm".into()),
                confidence: Some(0.95),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(confirm.trigger, TriggerType::SchemaMatch);
        assert!(confirm.confirm);
        assert!(confirm.strict);

        // current fields override the legacy ones
        let mixed = normalize_execution(
            RawExecution {
                trigger: Some("always".into()),
                strict: Some(false),
                confidence: Some(0.99),
                ..Default::default()
            },
            Some("manual".into()),
        )
        .unwrap();
        assert_eq!(mixed.trigger, TriggerType::Always);
        assert!(!mixed.strict);
    }
}
