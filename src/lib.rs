// src/lib.rs

// ============================================================================
// 模块定义 (Modules)
// ============================================================================

pub mod core;
pub mod runtime;
pub mod services;

// ============================================================================
// 公共导出 (Public Exports)
// ============================================================================

pub use core::error::ResolveError;
pub use core::prompt_parser::{PromptParser, PromptTemplate};
pub use core::reference::{scan_references, DetectedReference, ReferenceKind};
pub use core::renderer::{SimpleRenderer, VariableRenderer};
pub use core::resolver::{ReferenceResolver, ResolveDiagnostics, ResolveOutcome, ResolverOptions};
pub use core::tool_loader::{ExecutionPolicy, ScriptToolDefinition, ToolLoader, TriggerType};
pub use core::trigger::{ExtractedInputs, MatchReason, ToolDetectionMatch, TriggerDetector};
pub use core::validator::{ReferenceValidator, ValidationError, ValidationErrorKind};

pub use runtime::process::{ProcessOutput, ProcessRunner, ProcessSpec};
pub use runtime::script_runner::{ScriptExecutionResult, ScriptExecutor};
pub use runtime::verify::{ShellVerifier, VerificationCheck, VerificationResult, VerifyOptions};

pub use services::config::EngineConfig;
pub use services::interface::TemplateSource;
pub use services::prompt_loader::PromptRegistry;
pub use services::tool_registry::{RegistryStats, ScriptRegistry};
