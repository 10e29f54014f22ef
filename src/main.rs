//! Deploy Coordinator - nonce coordination and gas admission for multi-chain deployments
//!
//! One-shot commands manage nonces and check gas; `serve` runs the monitor
//! alongside the HTTP API and metrics endpoint.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

use deploy_coordinator::api::{self, AppState};
use deploy_coordinator::cli::{self, Cli, Command, Services};
use deploy_coordinator::config::{LogFormat, Settings};
use deploy_coordinator::metrics::{self, MetricsServer};
use deploy_coordinator::monitor::MonitorEngine;
use deploy_coordinator::{ChainClient, GasAdmissionGate, NonceCoordinator, StateStore};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    // Load configuration
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = cli.state_dir {
        settings.state.dir = dir;
    }

    // Initialize logging
    init_logging(settings.logging.format);

    let settings = Arc::new(settings);
    let store = StateStore::new(&settings.state.dir);
    let chain_client = Arc::new(ChainClient::new(&settings)?);

    let services = Services {
        settings: settings.clone(),
        nonces: Arc::new(NonceCoordinator::new(
            settings.clone(),
            store.clone(),
            chain_client.clone(),
        )),
        gate: Arc::new(GasAdmissionGate::new(
            settings.clone(),
            store.clone(),
            chain_client.clone(),
        )),
    };

    let mut stdout = std::io::stdout().lock();
    let ok = match cli.command {
        Command::Nonce { command } => cli::execute_nonce(command, &services, &mut stdout).await?,
        Command::Gas { command } => cli::execute_gas(command, &services, &mut stdout).await?,
        Command::Serve => {
            drop(stdout);
            serve(services, chain_client, store).await?;
            true
        }
    };

    Ok(ok)
}

async fn serve(services: Services, chain_client: Arc<ChainClient>, store: StateStore) -> Result<()> {
    let settings = services.settings.clone();

    info!("Starting Deploy Coordinator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for {} chains, state in {:?}",
        settings.enabled_chains().len(),
        store.dir()
    );

    store.health_check()?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize monitor engine
    let monitor = Arc::new(MonitorEngine::new(
        settings.clone(),
        services.nonces.clone(),
        services.gate.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            nonces: services.nonces.clone(),
            gate: services.gate.clone(),
            chain_client: chain_client.clone(),
            store: store.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start monitor engine
    let monitor_handle = tokio::spawn({
        let monitor = monitor.clone();
        async move {
            if let Err(e) = monitor.run().await {
                error!("Monitor engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_client = chain_client.clone();
        let store = store.clone();
        let interval = settings.monitor.gas_sample_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_client.health_check().await;
                let chains_ok = health.iter().all(|(_, healthy)| *healthy);
                for (chain, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                match store.health_check() {
                    Ok(()) if chains_ok => metrics::record_health_check(),
                    Ok(()) => metrics::record_health_check_failure(),
                    Err(e) => {
                        warn!("State directory health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Deploy Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    monitor.stop().await;

    // Abort background tasks
    api_handle.abort();
    monitor_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Deploy Coordinator stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,deploy_coordinator=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
}
