// src/services/prompt_loader.rs
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use glob::glob;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::prompt_parser::{PromptParser, PromptTemplate, PROMPT_FILE};
use crate::services::interface::TemplateSource;

/// 提示词注册表
#[derive(Debug, Default)]
pub struct PromptRegistry {
    // id -> template
    templates: DashMap<String, Arc<PromptTemplate>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载配置文件中定义的路径列表
    ///
    /// Patterns match `prompt.toml` files (or their directories). Broken files
    /// are logged and skipped. Returns how many templates were registered.
    pub fn load_from_paths(&self, patterns: &[String]) -> Result<usize> {
        let mut loaded = 0;
        for pattern in patterns {
            let paths = glob(pattern).map_err(|e| anyhow!("Invalid glob pattern '{}': {}", pattern, e))?;

            for entry in paths {
                match entry {
                    Ok(path) => {
                        let dir = if path.is_dir() {
                            path
                        } else if path.file_name().and_then(|n| n.to_str()) == Some(PROMPT_FILE) {
                            match path.parent() {
                                Some(parent) => parent.to_path_buf(),
                                None => continue,
                            }
                        } else {
                            continue;
                        };
                        if !dir.join(PROMPT_FILE).is_file() {
                            continue;
                        }
                        match self.load_dir(&dir) {
                            Ok(_) => loaded += 1,
                            Err(e) => warn!("Skipping prompt in {}: {:#}", dir.display(), e),
                        }
                    }
                    Err(e) => warn!("Error reading glob entry: {}", e),
                }
            }
        }
        Ok(loaded)
    }

    /// 读取单个目录并注册
    pub fn load_dir(&self, dir: &Path) -> Result<Arc<PromptTemplate>> {
        let template = PromptParser::load_from_dir(dir)?;
        info!("📝 Loaded Prompt: [{}] from {}", template.id, dir.display());
        Ok(self.insert(template))
    }

    /// Registers (or replaces) a template.
    pub fn insert(&self, template: PromptTemplate) -> Arc<PromptTemplate> {
        let template = Arc::new(template);
        if let Some(old) = self.templates.insert(template.id.clone(), template.clone()) {
            if old.dir != template.dir {
                warn!(
                    "Prompt '{}' in {} replaces the one in {}",
                    template.id,
                    template.dir.display(),
                    old.dir.display()
                );
            }
        }
        template
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateSource for PromptRegistry {
    fn find_by_id(&self, id: &str) -> Option<Arc<PromptTemplate>> {
        self.templates.get(id).map(|t| t.value().clone())
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
