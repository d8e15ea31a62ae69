// src/core/prompt_parser.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::tool_loader::SCRIPT_ID_RE;

pub const PROMPT_FILE: &str = "prompt.toml";

/// A loaded template. Immutable once registered.
#[derive(Debug, Clone, Serialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub system_message: Option<String>,
    pub user_message: Option<String>,
    /// Script tool ids this template declares.
    pub tools: Vec<String>,
    /// Owning directory; template-local scripts live under `dir/tools/`.
    pub dir: PathBuf,
}

impl PromptTemplate {
    /// System and user segments joined by a blank line.
    pub fn body(&self) -> String {
        match (&self.system_message, &self.user_message) {
            (Some(system), Some(user)) => format!("{}\n\n{}", system, user),
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => String::new(),
        }
    }
}

// ============================================================================
// 文件格式 (prompt.toml)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PromptFile {
    id: String,
    name: Option<String>,
    description: Option<String>,
    system_message: Option<String>,
    system_file: Option<String>,
    user_message: Option<String>,
    user_file: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
}

pub struct PromptParser;

impl PromptParser {
    /// Reads `dir/prompt.toml` plus any segment files it points at.
    pub fn load_from_dir(dir: &Path) -> Result<PromptTemplate> {
        let path = dir.join(PROMPT_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
        Self::parse(&content, dir).with_context(|| format!("Invalid prompt file: {}", path.display()))
    }

    pub fn parse(content: &str, dir: &Path) -> Result<PromptTemplate> {
        let raw: PromptFile = toml::from_str(content)?;

        if !SCRIPT_ID_RE.is_match(&raw.id) {
            return Err(anyhow!("Prompt id '{}' must match [a-zA-Z0-9_-]+", raw.id));
        }
        for tool in &raw.tools {
            if !SCRIPT_ID_RE.is_match(tool) {
                return Err(anyhow!("Tool id '{}' in prompt '{}' is not valid", tool, raw.id));
            }
        }

        let system_message = Self::segment(dir, raw.system_message, raw.system_file.as_deref(), "system")?;
        let user_message = Self::segment(dir, raw.user_message, raw.user_file.as_deref(), "user")?;

        Ok(PromptTemplate {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            description: raw.description,
            system_message,
            user_message,
            tools: raw.tools,
            dir: dir.to_path_buf(),
        })
    }

    fn segment(dir: &Path, inline: Option<String>, file: Option<&str>, what: &str) -> Result<Option<String>> {
        match (inline, file) {
            (Some(_), Some(_)) => Err(anyhow!("Set either {0}_message or {0}_file, not both", what)),
            (Some(text), None) => Ok(Some(text)),
            (None, Some(rel)) => {
                let path = dir.join(rel);
                fs::read_to_string(&path)
                    .map(Some)
                    .with_context(|| format!("Failed to read {} segment: {}", what, path.display()))
            }
            (None, None) => Ok(None),
        }
    }
}
