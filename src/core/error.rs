// src/core/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving `{{ref:..}}` / `{{script:..}}` references.
///
/// Every variant carries enough structure (chains, searched paths, exit codes,
/// available fields) to be shown to an end user without further lookups.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Circular reference detected: {}", chain.join(" -> "))]
    CircularReference { target_id: String, chain: Vec<String> },

    #[error(
        "Maximum reference depth ({max_depth}) exceeded while resolving '{target_id}'. Chain: {}",
        chain.join(" -> ")
    )]
    MaxDepthExceeded {
        target_id: String,
        max_depth: usize,
        chain: Vec<String>,
    },

    #[error("Referenced prompt '{target_id}' not found")]
    PromptNotFound { target_id: String, chain: Vec<String> },

    #[error("Script '{script_id}' is not registered. Searched: {}", display_paths(searched_paths))]
    ScriptNotRegistered {
        script_id: String,
        searched_paths: Vec<PathBuf>,
    },

    #[error("Invalid script id '{script_id}': {reason}")]
    InvalidScriptId { script_id: String, reason: String },

    #[error("Script '{script_id}' is disabled")]
    ScriptDisabled { script_id: String },

    #[error("Script '{script_id}' failed (exit code {exit_code}{}): {}", if *timed_out { ", timed out" } else { "" }, stderr.trim())]
    ScriptExecutionFailed {
        script_id: String,
        exit_code: i32,
        stderr: String,
        timed_out: bool,
    },

    #[error("Script '{script_id}' produced invalid output: {reason}")]
    InvalidScriptOutput { script_id: String, reason: String },

    #[error(
        "Field '{field}' not found in output of script '{script_id}'. Available fields: [{}]",
        available.join(", ")
    )]
    InvalidFieldAccess {
        script_id: String,
        field: String,
        available: Vec<String>,
    },

    #[error("Render error in '{template_id}': {message}")]
    Render { template_id: String, message: String },
}

impl ResolveError {
    /// Resolution chain attached to structural errors, if any.
    pub fn chain(&self) -> Option<&[String]> {
        match self {
            Self::CircularReference { chain, .. }
            | Self::MaxDepthExceeded { chain, .. }
            | Self::PromptNotFound { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_message_contains_chain() {
        let err = ResolveError::CircularReference {
            target_id: "a".to_string(),
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular reference detected: a -> b -> a");
        assert_eq!(err.chain().unwrap().len(), 3);
    }

    #[test]
    fn test_field_access_lists_available_fields() {
        let err = ResolveError::InvalidFieldAccess {
            script_id: "stats".into(),
            field: "total".into(),
            available: vec!["count".into(), "mean".into()],
        };
        assert!(err.to_string().contains("[count, mean]"));
        assert!(err.chain().is_none());
    }
}
