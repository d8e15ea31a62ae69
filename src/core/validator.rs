// src/core/validator.rs
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::core::reference::prompt_reference_ids;
use crate::services::interface::TemplateSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    SelfReference,
    MissingReference,
    CircularReference,
}

/// Authoring-time finding. Returned as data, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub kind: ValidationErrorKind,
    pub target_id: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<Vec<String>>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chain {
            Some(chain) => write!(f, "{} ({})", self.details, chain.join(" -> ")),
            None => write!(f, "{}", self.details),
        }
    }
}

/// Static counterpart of the resolver: follows `{{ref:..}}` tokens through
/// the template source without executing anything.
pub struct ReferenceValidator;

impl ReferenceValidator {
    /// Checks `body` as if it were the content of `template_id`. The body
    /// does not need to be registered yet, so unsaved edits can be validated.
    pub fn validate(template_id: &str, body: &str, source: &dyn TemplateSource) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for target in prompt_reference_ids(body) {
            if !seen.insert(target.clone()) {
                continue;
            }

            if target == template_id {
                errors.push(ValidationError {
                    kind: ValidationErrorKind::SelfReference,
                    details: format!("Prompt '{}' references itself", template_id),
                    chain: Some(vec![template_id.to_string(), target.clone()]),
                    target_id: target,
                });
                continue;
            }

            if source.find_by_id(&target).is_none() {
                errors.push(ValidationError {
                    kind: ValidationErrorKind::MissingReference,
                    details: format!("Referenced prompt '{}' does not exist", target),
                    chain: None,
                    target_id: target,
                });
                continue;
            }

            let mut path = vec![template_id.to_string(), target.clone()];
            let mut done = HashSet::new();
            Self::walk(&target, source, &mut path, &mut done, &mut errors);
        }

        errors
    }

    /// Validates every registered template, keeping only templates with findings.
    pub fn validate_all(source: &dyn TemplateSource) -> BTreeMap<String, Vec<ValidationError>> {
        source
            .ids()
            .into_iter()
            .filter_map(|id| {
                let template = source.find_by_id(&id)?;
                let errors = Self::validate(&id, &template.body(), source);
                (!errors.is_empty()).then_some((id, errors))
            })
            .collect()
    }

    // DFS with push/pop; `path` always ends with `node`
    fn walk(
        node: &str,
        source: &dyn TemplateSource,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        let Some(template) = source.find_by_id(node) else {
            return;
        };

        let mut children = prompt_reference_ids(&template.body());
        let mut unique = HashSet::new();
        children.retain(|c| unique.insert(c.clone()));

        for child in children {
            if path.contains(&child) {
                let mut chain = path.clone();
                chain.push(child.clone());
                errors.push(ValidationError {
                    kind: ValidationErrorKind::CircularReference,
                    details: format!("Circular reference through '{}'", child),
                    chain: Some(chain),
                    target_id: child,
                });
                continue;
            }
            if done.contains(&child) {
                continue;
            }
            if source.find_by_id(&child).is_none() {
                let mut chain = path.clone();
                chain.push(child.clone());
                errors.push(ValidationError {
                    kind: ValidationErrorKind::MissingReference,
                    details: format!("Prompt '{}' references missing prompt '{}'", node, child),
                    chain: Some(chain),
                    target_id: child,
                });
                continue;
            }

            path.push(child.clone());
            Self::walk(&child, source, path, done, errors);
            path.pop();
        }

        done.insert(node.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::prompt_parser::PromptTemplate;
    use crate::services::prompt_loader::PromptRegistry;
    use std::path::PathBuf;

    fn registry(entries: &[(&str, &str)]) -> PromptRegistry {
        let registry = PromptRegistry::new();
        for (id, body) in entries {
            registry.insert(PromptTemplate {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                system_message: None,
                user_message: Some(body.to_string()),
                tools: Vec::new(),
                dir: PathBuf::from("/prompts").join(id),
            });
        }
        registry
    }

    #[test]
    fn test_clean_body_has_no_findings() {
        let source = registry(&[("footer", "bye")]);
        assert!(ReferenceValidator::validate("page", "hi {{ref:footer}} {{script:x}}", &source).is_empty());
    }

    #[test]
    fn test_self_and_missing() {
        let source = registry(&[]);
        let errors = ReferenceValidator::validate("page", "{{ref:page}} {{ref:ghost}} {{ref:ghost}}", &source);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, ValidationErrorKind::SelfReference);
        assert_eq!(errors[1].kind, ValidationErrorKind::MissingReference);
        assert_eq!(errors[1].target_id, "ghost");
    }

    #[test]
    fn test_cycle_chain() {
        let source = registry(&[("B", "{{ref:C}}"), ("C", "{{ref:A}}")]);
        let errors = ReferenceValidator::validate("A", "{{ref:B}}", &source);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ValidationErrorKind::CircularReference);
        assert_eq!(
            errors[0].chain.as_deref(),
            Some(&["A".to_string(), "B".to_string(), "C".to_string(), "A".to_string()][..])
        );
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let source = registry(&[("L", "{{ref:D}}"), ("R", "{{ref:D}}"), ("D", "leaf")]);
        assert!(ReferenceValidator::validate("top", "{{ref:L}} {{ref:R}}", &source).is_empty());
    }

    #[test]
    fn test_validate_all() {
        let source = registry(&[("ok", "fine"), ("loop", "{{ref:loop}}"), ("dangling", "{{ref:nowhere}}")]);
        let report = ReferenceValidator::validate_all(&source);
        assert_eq!(report.len(), 2);
        assert_eq!(report["loop"][0].kind, ValidationErrorKind::SelfReference);
        assert_eq!(report["dangling"][0].kind, ValidationErrorKind::MissingReference);
    }
}
