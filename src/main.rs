use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use costwatch::{
    AppState,
    config::CostwatchConfig,
    observability,
    routes::{self, trigger::TriggerResponse},
};

/// CLI arguments for costwatch
#[derive(Parser, Debug)]
#[command(version, about = "Daily cloud cost reporter", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./costwatch.toml if it exists,
    /// otherwise configuration is read from environment variables)
    #[arg(short, long, global = true, env = "COSTWATCH_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the trigger endpoint (default)
    Serve,
    /// Run one report and exit
    Run {
        /// Day to report (YYYY-MM-DD). Defaults to yesterday in the reporting timezone.
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Log the points instead of writing them to the sink
        #[arg(long)]
        dry_run: bool,
    },
}

const DEFAULT_CONFIG_FILE: &str = "costwatch.toml";

/// Pick the config file to load. `None` means build it from the environment.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path));
    }

    let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd_config.exists() {
        return Ok(Some(cwd_config));
    }

    Ok(None)
}

/// Load and validate configuration, exiting the process on failure.
fn load_config(explicit_path: Option<&str>) -> (CostwatchConfig, String) {
    let path = match resolve_config_path(explicit_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let (result, source) = match path.as_deref() {
        Some(path) => (CostwatchConfig::from_file(path), path.display().to_string()),
        None => (CostwatchConfig::from_env(), "environment".to_string()),
    };

    match result {
        Ok(config) => (config, source),
        Err(e) => {
            eprintln!("Failed to load config from {source}: {e}");
            std::process::exit(1);
        }
    }
}

/// Initialize tracing and metrics. Tracing failures are fatal, metrics
/// failures only degrade `/metrics`.
fn init_observability(config: &CostwatchConfig) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }
}

fn build_state(config: &CostwatchConfig, dry_run: bool) -> AppState {
    match AppState::from_config(config, dry_run) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize reporter");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Run { date, dry_run }) => {
            run_once(args.config.as_deref(), date, dry_run).await;
        }
        Some(Command::Serve) | None => {
            run_server(args.config.as_deref()).await;
        }
    }
}

async fn run_once(explicit_config_path: Option<&str>, date: Option<NaiveDate>, dry_run: bool) {
    let (config, source) = load_config(explicit_config_path);
    init_observability(&config);
    tracing::info!(config_source = %source, "Starting one-shot report");

    let state = build_state(&config, dry_run);

    match state.reporter.run(date).await {
        Ok(summary) => {
            let response = TriggerResponse::from(summary);
            match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "Failed to render run summary"),
            }
        }
        Err(e) => {
            eprintln!("Report failed ({}): {e}", e.kind());
            std::process::exit(1);
        }
    }
}

async fn run_server(explicit_config_path: Option<&str>) {
    let (config, source) = load_config(explicit_config_path);
    init_observability(&config);
    tracing::info!(config_source = %source, "Starting cost reporter");

    let state = build_state(&config, false);
    let app = routes::build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, finishing in-flight requests");
}
