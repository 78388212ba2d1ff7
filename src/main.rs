//! Governance Relayer - cross-chain governance proposal finalization
//!
//! This relayer mirrors proposals from the main governance module to every
//! secondary chain, and once voting ends it finalizes secondary tallies,
//! collects them on the main chain, finalizes and executes there, and pushes
//! the final status back to every mirror.

use anyhow::{Context, Result};
use ethers::signers::Signer;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod governance;
mod metrics;
mod state;
mod tx;

#[cfg(test)]
mod testing;

use chain::{BackoffPolicy, ChainConnectionManager, EthersConnector, EventWatcher};
use config::Settings;
use coordination::{FinalizationWorkflow, ReconciliationScheduler, WorkflowDriver};
use events::ChainRole;
use governance::{
    MainGovernance, MainGovernanceClient, SecondaryGovernance, SecondaryGovernanceClient,
};
use metrics::MetricsServer;
use state::IdempotencyCache;
use tx::{EthersDispatcher, NonceManager, ProviderNonceSource, TransactionSubmitter};

/// How long background loops get to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Governance Relayer v{}", env!("CARGO_PKG_VERSION"));
    let started_at = Instant::now();

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: main chain {} and {} secondary chains",
        settings.main.chain_id,
        settings.enabled_secondaries().len()
    );

    let wallet = tx::load_wallet(&settings.wallet)?;
    let signer = wallet.address();

    // Connect to every ledger; failures are retried by the health checker
    let connections = Arc::new(ChainConnectionManager::new(
        EthersConnector::new(settings.relayer.request_timeout()),
        settings.all_chains().into_iter().cloned().collect(),
        BackoffPolicy::from(&settings.relayer),
    ));
    for (chain_id, connected) in connections.connect_all().await {
        if !connected {
            warn!("Chain {} unavailable at startup", chain_id);
        }
    }
    info!("Chain connections initialized");

    // Write path
    let nonces = Arc::new(NonceManager::new(Arc::new(ProviderNonceSource::new(
        connections.clone(),
    ))));
    let dispatcher = Arc::new(EthersDispatcher::new(
        connections.clone(),
        wallet,
        settings.relayer.confirmation_timeout(),
    ));
    let submitter = Arc::new(TransactionSubmitter::new(
        dispatcher,
        nonces,
        signer,
        &settings.relayer,
    ));

    // Governance surfaces
    let main_client: Arc<dyn MainGovernance> = Arc::new(
        MainGovernanceClient::new(
            settings.main.chain_id,
            &settings.main.governance_address,
            connections.clone(),
            submitter.clone(),
        )
        .context("main governance client")?,
    );
    let mut secondary_clients: Vec<Arc<dyn SecondaryGovernance>> = Vec::new();
    for chain in settings.enabled_secondaries() {
        let client = SecondaryGovernanceClient::new(
            chain.chain_id,
            &chain.governance_address,
            connections.clone(),
            submitter.clone(),
        )
        .with_context(|| format!("secondary governance client for {}", chain.name))?;
        secondary_clients.push(Arc::new(client));
    }

    let cache = Arc::new(IdempotencyCache::open(&settings.cache.path).await);

    // Coordination
    let workflow = Arc::new(FinalizationWorkflow::new(
        main_client,
        secondary_clients,
        cache.clone(),
    ));
    let driver = Arc::new(WorkflowDriver::new(workflow.clone()));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        driver.clone(),
        &settings.relayer,
    ));
    info!("Finalization workflow initialized");

    let (trigger_tx, trigger_rx) = mpsc::channel(settings.relayer.trigger_channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Event watchers
    let secondary_chains = workflow.secondary_chains();
    let poll_interval = Duration::from_millis(settings.relayer.event_poll_interval_ms);
    for chain in settings.all_chains() {
        let role = if chain.chain_id == settings.main.chain_id {
            ChainRole::Main
        } else {
            ChainRole::Secondary
        };
        let watcher = EventWatcher::new(
            chain.clone(),
            role,
            connections.clone(),
            secondary_chains.clone(),
            trigger_tx.clone(),
            poll_interval,
        )?;
        handles.push(tokio::spawn(watcher.run(shutdown_rx.clone())));
    }
    drop(trigger_tx);

    // Health checks
    handles.push(tokio::spawn(connections.clone().run_health_checks(
        Duration::from_secs(settings.relayer.health_check_interval_secs),
        shutdown_rx.clone(),
    )));

    // Workflow driver and reconciliation sweeps
    handles.push(tokio::spawn(driver.run(trigger_rx, shutdown_rx.clone())));
    handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            connections: connections.clone(),
            cache: cache.clone(),
            started_at,
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

    info!(
        "Governance Relayer {} is running",
        settings.relayer.instance_id
    );
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Loops stop at their next tick; the next start resumes from chain state
    if shutdown_tx.send(true).is_err() {
        warn!("No background task was listening for shutdown");
    }
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    match tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Background task failed: {}", e);
                }
            }
        }
        Err(_) => {
            warn!("Background tasks still busy after {:?}, aborting", SHUTDOWN_GRACE);
            for handle in aborts {
                handle.abort();
            }
        }
    }

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    if let Err(e) = cache.flush().await {
        warn!("Final cache flush failed: {}", e);
    }

    info!("Governance Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,governance_relayer=debug,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
