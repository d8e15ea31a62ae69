// src/services/mod.rs
pub mod config;
pub mod interface;
pub mod prompt_loader;
pub mod tool_registry;
