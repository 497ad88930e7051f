//! Keycloak Gateway - API gateway with Keycloak sessions, grants and
//! per-route authorization.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use keycloak_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{self, Gateway},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(&config).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> keycloak_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Validate configuration and report
async fn run_check(config: &Config) -> ExitCode {
    let problems = gateway::check(config).await;

    if problems.is_empty() {
        println!(
            "✅ Configuration valid: {} plugin(s), {} pipeline(s)",
            config.plugins.len(),
            config.pipelines.len()
        );
        return ExitCode::SUCCESS;
    }

    eprintln!("❌ {} problem(s) found:", problems.len());
    for problem in &problems {
        eprintln!("   {problem}");
    }
    ExitCode::FAILURE
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        plugins = config.plugins.len(),
        pipelines = config.pipelines.len(),
        "Starting Keycloak Gateway"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
