//! # Quarry Server
//!
//! Runs the execution governor behind an HTTP API: per-learner dbt
//! workspaces, admission-controlled dbt jobs with streamed output, pooled
//! ad-hoc SQL, and per-principal rate limiting.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use quarry_config::{Config, ConfigLoad, ConfigLoader, ConfigWarnings};
use quarry_server::{AppState, routes};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "quarry-server")]
#[command(about = "Execution governor for multi-tenant dbt and SQL workloads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to quarry.toml (overrides QUARRY_CONFIG and default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate configuration, report warnings, and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
                // Override via RUST_LOG.
                |_| "info,quarry_core=info,tower_http=warn".into(),
            ),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        Some(Command::CheckConfig) => {
            report_config(&config);
            Ok(())
        }
        None => run_server(config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }

    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    log_warnings(&warnings);

    Ok(config)
}

fn log_warnings(warnings: &ConfigWarnings) {
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }
}

fn report_config(config: &Config) {
    let governor = &config.governor;
    info!(
        host = %config.server.host,
        port = config.server.port,
        workspace_root = %governor.workspace.root.display(),
        template_dir = %governor.workspace.template_dir.display(),
        max_connections = governor.pool.max_connections,
        max_concurrent_jobs = governor.jobs.max_concurrent_jobs,
        rate_limiting = governor.rate_limits.enabled,
        "configuration is valid"
    );
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let addr = config.bind_address()?;
    let state = AppState::from_config(config)?;

    let shutdown = CancellationToken::new();
    let maintenance = state.governor.spawn_maintenance(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting Quarry server");

    let governor = Arc::clone(&state.governor);
    let app = routes::create_app(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .context("server error")?;

    shutdown.cancel();
    for handle in maintenance {
        if let Err(e) = handle.await {
            warn!(error = %e, "maintenance task did not stop cleanly");
        }
    }
    // Give terminated jobs their grace period before the runtime goes away.
    let active = governor.jobs().stats();
    if active.pending + active.running > 0 {
        tokio::time::sleep(governor.settings().jobs.kill_grace() * 2).await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels `token`, which also stops
/// running jobs so open log streams can finish.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    token.cancel();
}
