//! Shared types, error model, and configuration for Parley.
//!
//! This crate is the foundation depended on by all other Parley crates.
//! It provides:
//! - [`ParleyError`] — the unified error type
//! - Domain types ([`QaEntry`], [`History`], [`UserId`], [`Scope`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, GeneratorConfig, GeneratorProvider, ServerConfig, StoreBackend, StoreConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ParleyError, Result};
pub use types::{CLEAR_HISTORY_TOKEN, ERROR_ANSWER_PREFIX, History, QaEntry, Scope, UserId};
