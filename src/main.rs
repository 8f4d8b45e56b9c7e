//! Supertransaction executor - multi-chain instruction set orchestration
//!
//! Quotes instruction sets into signed execution plans and drives them across
//! chains and bridge routes until every node confirms or the run fails.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use supertx_executor::api::{self, AppState};
use supertx_executor::chain::ChainManager;
use supertx_executor::config::Settings;
use supertx_executor::coordination::{
    Coordinator, CoordinatorConfig, Dispatchers, OwnerSignatureVerifier,
};
use supertx_executor::metrics::MetricsServer;
use supertx_executor::monitor::StatusMonitor;
use supertx_executor::planner::{FixedGasPrices, GasOracle, Planner, PriceTable};
use supertx_executor::registry::ChainRegistry;
use supertx_executor::state::StateManager;
use supertx_executor::tx::{EvmBridgeProvider, EvmDispatcher, TransactionSender};

const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting supertransaction executor v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains, {} bridge routes",
        settings.enabled_chains().len(),
        settings.bridges.len()
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    let registry = Arc::new(ChainRegistry::from_settings(&settings)?);

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings, registry.clone()).await?);
    info!("Chain connections initialized");

    let wallet = TransactionSender::load_wallet(&settings.wallet)?;
    let sender = Arc::new(TransactionSender::new(chain_manager.clone(), wallet).await?);

    let mut dispatchers = Dispatchers::new();
    for chain_id in chain_manager.connected_chains() {
        dispatchers = dispatchers.with_chain(
            chain_id,
            Arc::new(EvmDispatcher::new(chain_id, registry.clone(), sender.clone())),
        );
    }
    for route in registry.routes() {
        dispatchers = dispatchers.with_bridge(
            route.id.clone(),
            Arc::new(EvmBridgeProvider::new(
                route.clone(),
                registry.clone(),
                sender.clone(),
            )),
        );
    }

    info!(
        "Dispatching on chains {:?} with {} bridge routes",
        dispatchers.chain_ids(),
        registry.routes().count()
    );

    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        dispatchers,
        Arc::new(OwnerSignatureVerifier),
        Arc::new(StatusMonitor::new(EVENT_BUFFER)),
        state_manager.clone(),
        CoordinatorConfig::from(&settings.executor),
    ));
    info!("Coordinator initialized");

    let gas: Arc<dyn GasOracle> = if settings.fees.live_gas_prices {
        chain_manager.clone()
    } else {
        Arc::new(FixedGasPrices::from_settings(&settings)?)
    };
    let planner = Arc::new(Planner::new(
        registry.clone(),
        chain_manager.clone(),
        gas,
        PriceTable::new(settings.fees.usd_micros.clone()),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            planner,
            coordinator: coordinator.clone(),
            archive: state_manager.clone(),
            registry: registry.clone(),
            state_manager: Some(state_manager.clone()),
            chain_manager: Some(chain_manager.clone()),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Evict settled runs
    let coordination_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Coordinator error: {}", e);
            }
        }
    });

    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let period = Duration::from_secs(settings.executor.health_check_interval_secs.max(1));
        async move {
            chain_manager.run_health_checks(period).await;
        }
    });

    info!(
        "Executor {} is running with wallet {:?}",
        settings.executor.instance_id,
        sender.wallet_address()
    );
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    coordinator.stop().await;
    chain_manager.stop().await;

    api_handle.abort();
    coordination_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    let live = coordinator.monitor().live_runs();
    if live > 0 {
        info!("{} runs still held in memory at shutdown", live);
    }

    info!("Executor stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,supertx_executor=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await.context("Ctrl+C handler") {
            error!("{:#}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
