use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RelayConfig;
use crate::router::{build_router_with_state, AppState};
use crate::session::load_alias_map;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8585;

#[derive(Parser, Debug)]
#[command(name = "claude-relay", bin_name = "claude-relay")]
#[command(about = "Messages API gateway for the claude CLI", version)]
#[command(arg_required_else_help = true)]
pub struct RelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST, env = "CLAUDE_RELAY_HOST")]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, env = "CLAUDE_RELAY_PORT")]
    port: u16,

    /// Path to the claude CLI binary.
    #[arg(long, default_value = "claude", env = "CLAUDE_RELAY_CLAUDE_BIN")]
    claude_bin: PathBuf,

    /// Working directory the CLI runs in. Defaults to the current directory.
    #[arg(long, env = "CLAUDE_RELAY_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// The CLI's own config/auth directory (where its session store lives).
    #[arg(long, env = "CLAUDE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// HMAC secret for the /deploy webhook.
    #[arg(long, env = "CLAUDE_RELAY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Script launched by an accepted deploy webhook.
    #[arg(long, env = "CLAUDE_RELAY_UPDATE_SCRIPT")]
    update_script: Option<PathBuf>,

    /// JSON file mapping extracted identities to canonical ones.
    #[arg(long, env = "CLAUDE_RELAY_ALIAS_MAP")]
    alias_map: Option<PathBuf>,

    /// JSON file the session registry persists to across restarts.
    #[arg(long, env = "CLAUDE_RELAY_SESSION_STORE")]
    session_store: Option<PathBuf>,

    /// Evict registry entries idle for this many seconds. 0 disables eviction.
    #[arg(long, default_value_t = 0, env = "CLAUDE_RELAY_SESSION_TTL_SECS")]
    session_ttl_secs: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("server error: {0}")]
    Server(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn run_claude_relay() -> Result<(), CliError> {
    let cli = RelayCli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

fn build_config(args: &ServerArgs) -> Result<RelayConfig, CliError> {
    let workspace = match &args.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = RelayConfig::new(args.claude_bin.clone(), workspace);
    config.config_dir = args.config_dir.clone();
    config.webhook_secret = args.webhook_secret.clone();
    config.update_script = args.update_script.clone();
    config.session_store = args.session_store.clone();
    if args.session_ttl_secs > 0 {
        config.session_ttl = Some(Duration::from_secs(args.session_ttl_secs));
    }
    if let Some(path) = &args.alias_map {
        config.aliases = load_alias_map(path)
            .map_err(|err| CliError::Config(format!("alias map {}: {err}", path.display())))?;
    }
    Ok(config)
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = build_config(args)?;
    tracing::info!(
        claude_bin = %config.claude_bin.display(),
        workspace = %config.workspace.display(),
        "starting gateway"
    );

    let state = Arc::new(AppState::new(config));
    let (router, state) = build_router_with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                shutdown_state.engine().shutdown();
                // Give children a moment to flush their session files.
                tokio::time::sleep(Duration::from_millis(500)).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}
