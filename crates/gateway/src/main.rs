use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use wg_domain::config::{Config, ConfigSeverity};
use wg_gateway::api;
use wg_gateway::state::AppState;
use wg_store::Store;

#[derive(Parser)]
#[command(name = "workgrid", about = "Agent scheduling and execution engine", version)]
struct Cli {
    /// Path to the TOML config file (default: ./workgrid.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane server (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the effective configuration.
    Validate,
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(cli.config.as_deref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config { command }) => {
            let config = Config::load(cli.config.as_deref())?;
            match command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        match issue.severity {
                            ConfigSeverity::Warning => println!("warning: {issue}"),
                            ConfigSeverity::Error => println!("error: {issue}"),
                        }
                    }
                    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                        std::process::exit(1);
                    }
                    println!("configuration ok");
                    Ok(())
                }
                ConfigCommand::Show => {
                    println!("{}", toml::to_string_pretty(&config)?);
                    Ok(())
                }
            }
        }
        Some(Command::Version) => {
            println!("workgrid {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wg_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "workgrid starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.store.data_dir)?);
    tracing::info!(data_dir = %config.store.data_dir.display(), "store ready");

    // ── Driver ───────────────────────────────────────────────────────
    let driver = wg_driver::driver_from_config(&config).await?;
    tracing::info!(driver = ?config.driver.kind, "driver ready");

    // ── State & router ───────────────────────────────────────────────
    let state = AppState::build(config.clone(), store, driver.clone());
    tracing::info!(channels = ?state.channels.types(), "channels registered");

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // ── Serve ────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Shutdown ─────────────────────────────────────────────────────
    driver.shutdown(config.driver.preserve_on_shutdown).await;
    tracing::info!("workgrid stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    tracing::info!("shutdown signal received");
}
