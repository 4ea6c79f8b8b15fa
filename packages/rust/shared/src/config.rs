//! Application configuration for Parley.
//!
//! User config lives at `~/.parley/parley.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "parley.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".parley";

// ---------------------------------------------------------------------------
// Config structs (matching parley.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Key-value store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Answer generator settings.
    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Request header carrying the authenticated user name.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            user_header: default_user_header(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}
fn default_user_header() -> String {
    "x-remote-user".into()
}

/// Which [`StoreConfig`] backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file for the sqlite backend. A leading `~` expands to home.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// The database path with `~` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }
}

fn default_store_path() -> String {
    "~/.parley/parley.db".into()
}

/// Which answer generator to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorProvider {
    #[default]
    Xai,
    Echo,
}

/// `[generator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Provider implementation.
    #[serde(default)]
    pub provider: GeneratorProvider,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent to the provider.
    #[serde(default = "default_model")]
    pub model: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// File whose contents open the system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_path: Option<String>,

    /// Streamed deltas are buffered until at least this many bytes.
    #[serde(default = "default_min_fragment_bytes")]
    pub min_fragment_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: GeneratorProvider::default(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            system_prompt_path: None,
            min_fragment_bytes: default_min_fragment_bytes(),
        }
    }
}

fn default_api_key_env() -> String {
    "XAI_API_KEY".into()
}
fn default_model() -> String {
    "grok-2-1212".into()
}
fn default_base_url() -> String {
    "https://api.x.ai/v1".into()
}
fn default_min_fragment_bytes() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.parley/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| ParleyError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.parley/parley.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ParleyError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ParleyError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ParleyError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ParleyError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ParleyError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the generator API key env var is set and non-empty.
///
/// Providers that need no key always pass.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    if config.generator.provider != GeneratorProvider::Xai {
        return Ok(());
    }

    let var_name = &config.generator.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ParleyError::config(format!(
            "generator API key not found. Set the {var_name} environment variable,\n\
             or use `provider = \"echo\"` under [generator] for offline runs."
        ))),
    }
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ParleyError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
