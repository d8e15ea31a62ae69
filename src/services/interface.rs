// src/services/interface.rs
use std::sync::Arc;

use crate::core::prompt_parser::PromptTemplate;

/// Template lookup consumed by the resolver and the validator.
pub trait TemplateSource: Send + Sync {
    fn find_by_id(&self, id: &str) -> Option<Arc<PromptTemplate>>;

    /// Every registered id, sorted.
    fn ids(&self) -> Vec<String>;
}
