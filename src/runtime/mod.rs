// src/runtime/mod.rs
//
// Runtime modules for external script / command execution

pub mod process;
pub mod sandbox;
pub mod script_runner;
pub mod verify;

pub use process::{ProcessOutput, ProcessRunner, ProcessSpec};
pub use script_runner::{ScriptExecutionResult, ScriptExecutor};
pub use verify::{ShellVerifier, VerificationCheck, VerificationResult, VerifyOptions};
