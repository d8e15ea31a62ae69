// src/core/mod.rs
pub mod context;
pub mod error;
pub mod prompt_parser;
pub mod reference;
pub mod renderer;
pub mod resolver;
pub mod tool_loader;
pub mod trigger;
pub mod validator;
