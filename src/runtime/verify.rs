// src/runtime/verify.rs
//
// Shell verification gates: run a command, pass on exit 0.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::runtime::process::{ProcessRunner, ProcessSpec, DEFAULT_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl VerificationResult {
    fn rejected(reason: &str) -> Self {
        Self {
            passed: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.to_string(),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub timeout_ms: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// A named check, written either as a bare command string or as an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub name: String,
    pub command: String,
    pub required: bool,
    pub timeout_ms: Option<u64>,
}

fn default_required() -> bool {
    true
}

impl<'de> Deserialize<'de> for VerificationCheck {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Command(String),
            Object {
                name: Option<String>,
                command: String,
                #[serde(default = "default_required")]
                required: bool,
                #[serde(default)]
                timeout_ms: Option<u64>,
            },
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Command(command) => Self::new(command.clone(), command),
            Wire::Object {
                name,
                command,
                required,
                timeout_ms,
            } => Self {
                name: name.unwrap_or_else(|| command.clone()),
                command,
                required,
                timeout_ms,
            },
        })
    }
}

impl VerificationCheck {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required: true,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub required: bool,
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    /// `false` if any required check failed.
    pub passed: bool,
    pub checks: Vec<CheckOutcome>,
}

#[derive(Debug, Clone)]
pub struct ShellVerifier {
    runner: ProcessRunner,
    default_timeout_ms: u64,
}

impl Default for ShellVerifier {
    fn default() -> Self {
        Self::new(ProcessRunner::default(), DEFAULT_TIMEOUT_MS)
    }
}

impl ShellVerifier {
    pub fn new(runner: ProcessRunner, default_timeout_ms: u64) -> Self {
        Self {
            runner,
            default_timeout_ms,
        }
    }

    pub async fn verify(&self, command: &str, options: &VerifyOptions) -> VerificationResult {
        if command.trim().is_empty() {
            warn!("Rejected empty verification command");
            return VerificationResult::rejected("Empty verification command");
        }

        let mut spec = ProcessSpec::shell(command)
            .env(options.env.clone())
            .timeout_ms(options.timeout_ms.unwrap_or(self.default_timeout_ms));
        if let Some(cwd) = &options.cwd {
            spec = spec.cwd(cwd.clone());
        }

        let out = self.runner.run(spec).await;
        let passed = out.exit_code == 0 && !out.timed_out && out.spawn_error.is_none();
        info!(
            "{} verify `{}` (exit {}, {} ms)",
            if passed { "✅" } else { "❌" },
            command,
            out.exit_code,
            out.duration_ms
        );

        VerificationResult {
            passed,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            duration_ms: out.duration_ms,
            timed_out: out.timed_out,
        }
    }

    /// Runs every check in order; optional failures are reported but do not
    /// fail the summary.
    pub async fn run_checks(&self, checks: &[VerificationCheck], cwd: Option<&Path>) -> VerificationSummary {
        let mut outcomes = Vec::with_capacity(checks.len());
        let mut passed = true;

        for check in checks {
            let options = VerifyOptions {
                timeout_ms: check.timeout_ms,
                cwd: cwd.map(Path::to_path_buf),
                env: HashMap::new(),
            };
            let result = self.verify(&check.command, &options).await;
            if !result.passed && check.required {
                passed = false;
            }
            outcomes.push(CheckOutcome {
                name: check.name.clone(),
                required: check.required,
                result,
            });
        }

        VerificationSummary {
            passed,
            checks: outcomes,
        }
    }
}
