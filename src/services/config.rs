// src/services/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::resolver::{ResolverOptions, DEFAULT_MAX_DEPTH};
use crate::runtime::process::{
    ProcessRunner, DEFAULT_MAX_TIMEOUT_MS, DEFAULT_TIMEOUT_MS, MAX_OUTPUT_CHARS, MIN_TIMEOUT_MS,
};
use crate::runtime::script_runner::ScriptExecutor;
use crate::runtime::verify::ShellVerifier;

pub const CONFIG_FILE: &str = "promptweave.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkspaceConfig {
    /// Root holding `resources/scripts/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Glob patterns for template directories or their `prompt.toml` files,
    /// relative to `root`.
    #[serde(default = "default_prompt_patterns")]
    pub prompts: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub throw_on_missing: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// 附加环境变量，合并到每个子进程的白名单环境之上
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_prompt_patterns() -> Vec<String> {
    vec!["prompts/*/prompt.toml".to_string()]
}
fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}
fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_max_timeout_ms() -> u64 {
    DEFAULT_MAX_TIMEOUT_MS
}
fn default_max_output_chars() -> usize {
    MAX_OUTPUT_CHARS
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            prompts: default_prompt_patterns(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            throw_on_missing: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_output_chars: default_max_output_chars(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Loads `promptweave.toml` from the current directory, or defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("⚠️ {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        // a relative root is taken relative to the config file
        if config.workspace.root.is_relative() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                config.workspace.root = parent.join(&config.workspace.root);
            }
        }

        config.validate()?;
        debug!("✓ Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_depth == 0 {
            return Err(anyhow!("resolver.max_depth must be at least 1"));
        }
        if self.execution.max_timeout_ms < MIN_TIMEOUT_MS {
            return Err(anyhow!(
                "execution.max_timeout_ms must be at least {} ms",
                MIN_TIMEOUT_MS
            ));
        }
        if self.execution.max_output_chars == 0 {
            return Err(anyhow!("execution.max_output_chars must be positive"));
        }
        Ok(())
    }

    /// Prompt glob patterns joined onto the workspace root.
    pub fn prompt_patterns(&self) -> Vec<String> {
        self.workspace
            .prompts
            .iter()
            .map(|p| {
                if Path::new(p).is_absolute() {
                    p.clone()
                } else {
                    self.workspace.root.join(p).to_string_lossy().to_string()
                }
            })
            .collect()
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            max_depth: self.resolver.max_depth,
            throw_on_missing: self.resolver.throw_on_missing,
        }
    }

    pub fn process_runner(&self) -> ProcessRunner {
        ProcessRunner::new(self.execution.max_timeout_ms, self.execution.max_output_chars)
            .with_env(self.execution.env.clone())
    }

    pub fn script_executor(&self) -> ScriptExecutor {
        ScriptExecutor::new(self.process_runner(), self.execution.default_timeout_ms)
    }

    pub fn shell_verifier(&self) -> ShellVerifier {
        ShellVerifier::new(self.process_runner(), self.execution.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&tmp.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.resolver.max_depth, DEFAULT_MAX_DEPTH);
        assert!(config.resolver.throw_on_missing);
        assert_eq!(config.execution.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.workspace.prompts, default_prompt_patterns());
    }

    #[test]
    fn test_partial_file_and_relative_root() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[workspace]
root = "ws"

[resolver]
throw_on_missing = false

[execution]
max_output_chars = 500
env = { SCRIPT_MODE = "ci" }
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.workspace.root, tmp.path().join("ws"));
        assert!(!config.resolver.throw_on_missing);
        assert_eq!(config.resolver.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.execution.max_output_chars, 500);
        assert_eq!(config.execution.env["SCRIPT_MODE"], "ci");
        assert_eq!(
            config.prompt_patterns(),
            vec![tmp.path().join("ws/prompts/*/prompt.toml").to_string_lossy().to_string()]
        );
    }

    #[test]
    fn test_rejects_zero_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, "[resolver]\nmax_depth = 0\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());
    }
}
