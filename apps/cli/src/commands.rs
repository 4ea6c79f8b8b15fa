//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use parley_shared::{
    AppConfig, GeneratorProvider, StoreBackend, UserId, init_config, load_config,
    load_config_from, validate_api_key,
};
use parley_storage::{HistoryStore, open_store, open_store_readonly};
use tracing::info;

use crate::server;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Parley — streaming chat over HTTP.
#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Serve a per-user chat with streamed, rendered answers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.parley/parley.toml.
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the HTTP server.
    Serve {
        /// Address to listen on (overrides [server] bind).
        #[arg(short, long)]
        bind: Option<String>,

        /// Keep state in memory instead of the configured database.
        #[arg(long)]
        memory: bool,

        /// Use the offline echo generator.
        #[arg(long)]
        echo: bool,
    },

    /// Inspect or reset a user's stored history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// History subcommands.
#[derive(Subcommand)]
pub(crate) enum HistoryAction {
    /// Print the history as JSON.
    Show {
        #[arg(long)]
        user: String,
    },
    /// Delete the history.
    Clear {
        #[arg(long)]
        user: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "parley=info,tower_http=info",
        1 => "parley=debug,tower_http=debug",
        _ => "parley=trace,tower_http=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind, memory, echo } => cmd_serve(config, bind, memory, echo).await,
        Command::History { action } => match action {
            HistoryAction::Show { user } => cmd_history_show(&config, &user).await,
            HistoryAction::Clear { user } => cmd_history_clear(&config, &user).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

fn resolve_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Apply `serve` flags on top of the loaded config.
fn apply_serve_overrides(
    mut config: AppConfig,
    bind: Option<String>,
    memory: bool,
    echo: bool,
) -> AppConfig {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if memory {
        config.store.backend = StoreBackend::Memory;
    }
    if echo {
        config.generator.provider = GeneratorProvider::Echo;
    }
    config
}

async fn cmd_serve(config: AppConfig, bind: Option<String>, memory: bool, echo: bool) -> Result<()> {
    let config = apply_serve_overrides(config, bind, memory, echo);
    validate_api_key(&config)?;

    info!(
        bind = %config.server.bind,
        store = ?config.store.backend,
        provider = ?config.generator.provider,
        "starting server"
    );
    server::serve(&config).await
}

async fn cmd_history_show(config: &AppConfig, user: &str) -> Result<()> {
    let user = UserId::parse(user)?;
    let kv = open_store_readonly(&config.store).await?;
    let history = HistoryStore::new(kv).get(&user).await?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

async fn cmd_history_clear(config: &AppConfig, user: &str) -> Result<()> {
    let user = UserId::parse(user)?;
    let kv = open_store(&config.store).await?;
    HistoryStore::new(kv).delete(&user).await?;
    println!("History cleared for {user}");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from(["parley", "-vv", "serve", "--bind", "0.0.0.0:9000", "--echo"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Serve { bind, memory, echo } => {
                assert_eq!(bind.as_deref(), Some("0.0.0.0:9000"));
                assert!(!memory);
                assert!(echo);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn parses_history_user() {
        let cli = Cli::try_parse_from(["parley", "history", "clear", "--user", "alice"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::History {
                action: HistoryAction::Clear { ref user }
            } if user == "alice"
        ));
    }

    #[test]
    fn serve_overrides_replace_config_values() {
        let config = apply_serve_overrides(
            AppConfig::default(),
            Some("127.0.0.1:9999".into()),
            true,
            true,
        );
        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.generator.provider, GeneratorProvider::Echo);
    }

    #[test]
    fn no_overrides_keep_defaults() {
        let config = apply_serve_overrides(AppConfig::default(), None, false, false);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.generator.provider, GeneratorProvider::Xai);
    }
}
