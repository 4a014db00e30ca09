//! Configuration for the execution service
//!
//! Provides the YAML-backed configuration document together with the loader
//! that resolves environment placeholders and validates the result.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{CoderunConfig, Environment, ExecutionConfig, RuntimeConfig, ServerSettings};
