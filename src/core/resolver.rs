// src/core/resolver.rs
//
// Reference Resolver: 模板引用展开
//
// 展开模板正文中的 {{ref:id}} 与 {{script:id[.field]}}。嵌套模板递归展开，
// 每层递归拿到的是 chain 的一份延长副本（chain + [id]），兄弟分支之间不共享，
// 因此不会把两个独立分支误判为循环引用。

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::context::VariableContext;
use crate::core::error::ResolveError;
use crate::core::prompt_parser::PromptTemplate;
use crate::core::reference::{scan_references, DetectedReference, ReferenceKind};
use crate::core::renderer::{value_to_text, SimpleRenderer, VariableRenderer};
use crate::core::tool_loader::ScriptToolDefinition;
use crate::core::trigger::{extract_inputs, TriggerDetector};
use crate::runtime::script_runner::{ScriptExecutionResult, ScriptExecutor};
use crate::services::interface::TemplateSource;
use crate::services::tool_registry::ScriptRegistry;

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Owner key used for script references outside any template.
const ROOT_OWNER: &str = "_root";

#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    pub max_depth: usize,
    /// `false` turns unknown `{{ref:..}}` targets into empty text plus a warning.
    pub throw_on_missing: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            throw_on_missing: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveDiagnostics {
    pub references_resolved: usize,
    pub scripts_executed: usize,
    pub warnings: Vec<String>,
    pub resolution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub rendered_body: String,
    /// Keyed `templateId:toolId`.
    pub script_results: HashMap<String, ScriptExecutionResult>,
    pub resolved_ids: HashSet<String>,
    pub diagnostics: ResolveDiagnostics,
}

/// Bookkeeping for one top-level resolve call.
#[derive(Default)]
struct ResolutionState {
    script_results: HashMap<String, ScriptExecutionResult>,
    // results reusable within this pass (no inline args)
    cache: HashMap<String, ScriptExecutionResult>,
    resolved_ids: HashSet<String>,
    references_resolved: usize,
    scripts_executed: usize,
    warnings: Vec<String>,
}

impl ResolutionState {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn finish(self, rendered_body: String, started: Instant) -> ResolveOutcome {
        ResolveOutcome {
            rendered_body,
            script_results: self.script_results,
            resolved_ids: self.resolved_ids,
            diagnostics: ResolveDiagnostics {
                references_resolved: self.references_resolved,
                scripts_executed: self.scripts_executed,
                warnings: self.warnings,
                resolution_time_ms: started.elapsed().as_millis() as u64,
            },
        }
    }
}

pub struct ReferenceResolver {
    templates: Arc<dyn TemplateSource>,
    scripts: Arc<ScriptRegistry>,
    executor: ScriptExecutor,
    detector: TriggerDetector,
    renderer: Arc<dyn VariableRenderer>,
    options: ResolverOptions,
}

impl ReferenceResolver {
    pub fn new(templates: Arc<dyn TemplateSource>, scripts: Arc<ScriptRegistry>) -> Self {
        Self {
            templates,
            scripts,
            executor: ScriptExecutor::default(),
            detector: TriggerDetector::new(),
            renderer: Arc::new(SimpleRenderer::new()),
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_executor(mut self, executor: ScriptExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn VariableRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Substitutes every reference in `body`. Variable interpolation of the
    /// top-level body itself is left to the caller; nested templates are
    /// rendered before they are spliced in.
    pub async fn resolve(
        &self,
        body: &str,
        variables: &Map<String, Value>,
        chain: &[String],
    ) -> Result<ResolveOutcome, ResolveError> {
        let started = Instant::now();
        if scan_references(body).is_empty() {
            return Ok(ResolveOutcome {
                rendered_body: body.to_string(),
                script_results: HashMap::new(),
                resolved_ids: HashSet::new(),
                diagnostics: ResolveDiagnostics::default(),
            });
        }

        let owner = chain.last().and_then(|id| self.templates.find_by_id(id));
        let mut state = ResolutionState::default();
        let rendered = self
            .resolve_body(body, variables, chain, owner.as_deref(), &mut state)
            .await?;

        let outcome = state.finish(rendered, started);
        debug!(
            "Resolved {} references in {} ms",
            outcome.diagnostics.references_resolved, outcome.diagnostics.resolution_time_ms
        );
        Ok(outcome)
    }

    /// Resolves and renders a whole registered template: runs its scripts,
    /// expands its body with chain `[id]`, then interpolates variables.
    pub async fn resolve_template(
        &self,
        id: &str,
        variables: &Map<String, Value>,
    ) -> Result<ResolveOutcome, ResolveError> {
        let started = Instant::now();
        let template = self
            .templates
            .find_by_id(id)
            .ok_or_else(|| ResolveError::PromptNotFound {
                target_id: id.to_string(),
                chain: Vec::new(),
            })?;

        let mut state = ResolutionState::default();
        let context = self.prepare_template(&template, variables, &mut state).await?;
        let chain = vec![template.id.clone()];
        let body = self
            .resolve_body(&template.body(), context.as_map(), &chain, Some(template.as_ref()), &mut state)
            .await?;
        let rendered = self.render(&template.id, &body, context.as_map())?;
        state.resolved_ids.insert(template.id.clone());

        let outcome = state.finish(rendered, started);
        info!(
            "🧩 Rendered [{}] ({} refs, {} scripts, {} ms)",
            id,
            outcome.diagnostics.references_resolved,
            outcome.diagnostics.scripts_executed,
            outcome.diagnostics.resolution_time_ms
        );
        Ok(outcome)
    }

    fn resolve_body<'a>(
        &'a self,
        body: &'a str,
        variables: &'a Map<String, Value>,
        chain: &'a [String],
        owner: Option<&'a PromptTemplate>,
        state: &'a mut ResolutionState,
    ) -> BoxFuture<'a, Result<String, ResolveError>> {
        Box::pin(async move {
            let refs = scan_references(body);
            if refs.is_empty() {
                return Ok(body.to_string());
            }

            // highest offset first, so earlier offsets stay valid
            let mut output = body.to_string();
            for reference in refs.iter().rev() {
                let replacement = match reference.kind {
                    ReferenceKind::Prompt => {
                        self.resolve_prompt_ref(&reference.target_id, variables, chain, state)
                            .await?
                    }
                    ReferenceKind::Script => {
                        self.resolve_script_ref(reference, variables, owner, state).await?
                    }
                };
                output.replace_range(reference.start..reference.end, &replacement);
            }
            Ok(output)
        })
    }

    fn resolve_prompt_ref<'a>(
        &'a self,
        target_id: &'a str,
        variables: &'a Map<String, Value>,
        chain: &'a [String],
        state: &'a mut ResolutionState,
    ) -> BoxFuture<'a, Result<String, ResolveError>> {
        Box::pin(async move {
            if chain.iter().any(|id| id == target_id) {
                let mut cycle = chain.to_vec();
                cycle.push(target_id.to_string());
                return Err(ResolveError::CircularReference {
                    target_id: target_id.to_string(),
                    chain: cycle,
                });
            }
            if chain.len() >= self.options.max_depth {
                return Err(ResolveError::MaxDepthExceeded {
                    target_id: target_id.to_string(),
                    max_depth: self.options.max_depth,
                    chain: chain.to_vec(),
                });
            }

            let Some(template) = self.templates.find_by_id(target_id) else {
                if self.options.throw_on_missing {
                    return Err(ResolveError::PromptNotFound {
                        target_id: target_id.to_string(),
                        chain: chain.to_vec(),
                    });
                }
                state.warn(format!("Referenced prompt '{}' not found, substituted empty text", target_id));
                return Ok(String::new());
            };

            let mut next_chain = chain.to_vec();
            next_chain.push(template.id.clone());

            let context = self.prepare_template(&template, variables, state).await?;
            let body = self
                .resolve_body(&template.body(), context.as_map(), &next_chain, Some(template.as_ref()), state)
                .await?;
            let rendered = self.render(&template.id, &body, context.as_map())?;

            state.references_resolved += 1;
            state.resolved_ids.insert(template.id.clone());
            debug!("Resolved {{{{ref:{}}}}} at depth {}", target_id, next_chain.len());
            Ok(rendered)
        })
    }

    async fn resolve_script_ref(
        &self,
        reference: &DetectedReference,
        variables: &Map<String, Value>,
        owner: Option<&PromptTemplate>,
        state: &mut ResolutionState,
    ) -> Result<String, ResolveError> {
        let script_id = &reference.target_id;
        let def = self.scripts.require(script_id, owner.map(|t| t.dir.as_path()))?;
        if !def.enabled {
            return Err(ResolveError::ScriptDisabled {
                script_id: script_id.clone(),
            });
        }

        let mut inputs = extract_inputs(&def, variables).inputs;
        if let Some(inline) = &reference.inline_args {
            for (key, value) in inline {
                inputs.insert(key.clone(), value.clone());
            }
        }

        let key = format!("{}:{}", owner.map(|t| t.id.as_str()).unwrap_or(ROOT_OWNER), def.id);
        let reusable = reference.inline_args.is_none();
        let result = self.run_script(&def, &inputs, &key, reusable, state).await?;
        state.references_resolved += 1;

        match &reference.field {
            None => Ok(value_to_text(&result.output)),
            Some(field) => match &result.output {
                Value::Object(obj) => obj.get(field).map(value_to_text).ok_or_else(|| {
                    ResolveError::InvalidFieldAccess {
                        script_id: script_id.clone(),
                        field: field.clone(),
                        available: obj.keys().cloned().collect(),
                    }
                }),
                _ => Err(ResolveError::InvalidScriptOutput {
                    script_id: script_id.clone(),
                    reason: format!("field '{}' requested but output is not a JSON object", field),
                }),
            },
        }
    }

    /// Runs the scripts a template declares and exposes their outputs as
    /// `tool_<id>` / `tool_<id>_result` on top of the caller's variables.
    async fn prepare_template(
        &self,
        template: &PromptTemplate,
        variables: &Map<String, Value>,
        state: &mut ResolutionState,
    ) -> Result<VariableContext, ResolveError> {
        let mut context = VariableContext::from_map(variables.clone());
        if template.tools.is_empty() {
            return Ok(context);
        }

        let mut candidates: Vec<Arc<ScriptToolDefinition>> = Vec::with_capacity(template.tools.len());
        for tool_id in &template.tools {
            match self.scripts.load(tool_id, Some(template.dir.as_path())) {
                Some(def) => candidates.push(def),
                None => state.warn(format!(
                    "Script '{}' declared by prompt '{}' is not registered",
                    tool_id, template.id
                )),
            }
        }

        for matched in self.detector.detect("", variables, &candidates) {
            let Some(def) = candidates.iter().find(|d| d.id == matched.tool_id) else {
                continue;
            };
            if matched.requires_confirmation
                && !(def.execution.auto_approve_on_valid && matched.missing_params.is_empty())
            {
                state.warn(format!(
                    "Script '{}' in prompt '{}' requires confirmation, skipped",
                    def.id, template.id
                ));
                continue;
            }

            let key = format!("{}:{}", template.id, def.id);
            let result = self
                .run_script(def, &matched.extracted_inputs, &key, true, state)
                .await?;
            context.insert_tool_result(&def.id, &result);
        }
        Ok(context)
    }

    /// Executes a script (or reuses this pass's earlier run) and records the
    /// result. Failures are returned as errors.
    async fn run_script(
        &self,
        def: &ScriptToolDefinition,
        inputs: &Map<String, Value>,
        key: &str,
        reusable: bool,
        state: &mut ResolutionState,
    ) -> Result<ScriptExecutionResult, ResolveError> {
        let cached = if reusable { state.cache.get(key).cloned() } else { None };
        let result = match cached {
            Some(hit) => {
                debug!("Reusing result for {}", key);
                hit
            }
            None => {
                let fresh = self.executor.execute(def, inputs).await;
                state.scripts_executed += 1;
                if reusable {
                    state.cache.insert(key.to_string(), fresh.clone());
                }
                fresh
            }
        };
        state.script_results.insert(key.to_string(), result.clone());

        if !result.success {
            return Err(ResolveError::ScriptExecutionFailed {
                script_id: def.id.clone(),
                exit_code: result.exit_code,
                stderr: result.stderr.clone(),
                timed_out: result.timed_out,
            });
        }
        Ok(result)
    }

    fn render(&self, template_id: &str, body: &str, variables: &Map<String, Value>) -> Result<String, ResolveError> {
        self.renderer
            .render(body, variables)
            .map_err(|e| ResolveError::Render {
                template_id: template_id.to_string(),
                message: format!("{:#}", e),
            })
    }
}
