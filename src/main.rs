//! SDS Control Plane
//!
//! Serves the portal REST API over an in-memory resource ledger, dispatching
//! volume work to dock agents or the controller and driving Ceph RBD
//! mirroring between two clusters.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sds_control_plane::domain::ports::PasswordDecrypterRef;
use sds_control_plane::{
    AesGcmPasswordCipher, ApiServer, ControlPlaneConfig, Dispatcher, ExecutorFactory,
    InMemoryLedger, OperationRunner, PlaintextPassword, ReplicationConfig,
    ReplicationOrchestrator, ReplicationService, RequestIntake, ResourceLocks, SshTransport,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SDS Control Plane - volume lifecycle and cross-cluster replication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML deployment configuration
    #[arg(long, env = "SDS_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address, overrides the configuration file
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            warn!("No configuration file given, using defaults");
            ControlPlaneConfig::default()
        }
    };
    if let Some(addr) = &args.api_addr {
        config.api.rest_addr = addr
            .parse()
            .with_context(|| format!("invalid REST API address {}", addr))?;
    }

    info!("Starting SDS Control Plane");
    info!("  Version: {}", sds_control_plane::VERSION);
    info!("  REST API: {}", config.api.rest_addr);
    info!("  Default routing: {:?}", config.routing.default_policy);
    info!("  Replication: {}", config.replication.is_some());

    // Ledger and lock table
    let ledger = InMemoryLedger::new();
    config.seed_ledger(&ledger);
    let locks = ResourceLocks::new();
    let runner = OperationRunner::new();

    // Request intake
    let connector = ExecutorFactory::http(config.executor.request_timeout());
    let dispatcher = Arc::new(Dispatcher::new(
        ledger.clone(),
        connector,
        config.routing.clone(),
    ));
    let intake = RequestIntake::new(ledger.clone(), dispatcher, locks.clone(), runner.clone());

    // Replication
    let orchestrator = match &config.replication {
        Some(replication) => Some(Arc::new(build_orchestrator(replication)?)),
        None => None,
    };
    let replication = ReplicationService::new(ledger.clone(), locks, orchestrator);

    let api_server = ApiServer::new(config.api.clone(), intake, replication);
    api_server.run(shutdown_signal()).await?;

    info!("Draining {} in-flight operation(s)", runner.in_flight());
    runner.shutdown().await;

    info!("Control plane shutdown complete");
    Ok(())
}

fn build_orchestrator(config: &ReplicationConfig) -> anyhow::Result<ReplicationOrchestrator> {
    let decrypter: PasswordDecrypterRef = if config.password_encrypted {
        Arc::new(
            AesGcmPasswordCipher::from_env(&config.credential_key_env)
                .context("loading replication credential key")?,
        )
    } else {
        warn!("Replication password is stored in plaintext");
        Arc::new(PlaintextPassword)
    };
    let transport = Arc::new(SshTransport::new(config.ssh.clone()));

    info!(
        "Replication between {} ({}) and {} ({})",
        config.primary.host,
        config.primary.cluster_name,
        config.secondary.host,
        config.secondary.cluster_name
    );
    Ok(ReplicationOrchestrator::new(
        Arc::new(config.clone()),
        transport,
        decrypter,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower_http=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}
