use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::grpc::GrpcServer;
use tollgate::ratelimit::{Janitor, RateLimiter};

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Adaptive request rate limiting service")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the gRPC listen address
    #[arg(long, global = true)]
    grpc_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the admission service (default)
    Serve,
    /// Validate the configuration and print the effective policy table
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }

    init_tracing(&config.logging);
    match cli.config.as_deref() {
        Some(path) => info!(path = %path, "Loaded configuration file"),
        None => info!("No configuration file given, using defaults and environment"),
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::CheckConfig => check_config(&config),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
    }
}

fn check_config(config: &TollgateConfig) -> anyhow::Result<()> {
    let table = config.policy_table()?;
    config.key_resolver()?;
    config.sweep_interval()?;

    let yaml = serde_yaml::to_string(&table.to_rules()).context("Failed to render policy table")?;
    println!("# profile: {:?}", config.rate_limiting.profile);
    print!("{}", yaml);
    Ok(())
}

async fn serve(config: TollgateConfig) -> anyhow::Result<()> {
    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policies = config.policy_table().context("Invalid rate limit policies")?;
    let resolver = config.key_resolver()?;
    info!(
        profile = ?config.rate_limiting.profile,
        categories = policies.len(),
        grpc_addr = %config.server.grpc_addr,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::new(policies).with_resolver(resolver));
    info!("Rate limiter initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let janitor = Janitor::new(Arc::clone(&limiter), config.sweep_interval()?, config.retention())
        .spawn(shutdown_rx);

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&limiter))
        .with_trust_proxy_headers(config.rate_limiting.trust_proxy_headers);

    // Run the server with graceful shutdown on Ctrl+C
    let served = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    janitor.await.context("Janitor task failed")?;
    limiter.clear();
    info!("Rate limiter state released");

    served?;
    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
