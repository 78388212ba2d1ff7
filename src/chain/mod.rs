//! Chain module - handles multi-chain connections and event watching
//!
//! This module provides:
//! - One persistent connection per configured ledger
//! - Health checks with bounded exponential-backoff reconnection
//! - Per-chain degradation tracking (one bad chain never stops the others)
//! - WebSocket event streaming with HTTP polling fallback

pub mod provider;
pub mod watcher;

pub use provider::{ChainProvider, EthersConnector, GasPrice};
pub use watcher::{EventWatcher, LogSource};

use crate::config::{ChainConfig, RelayerConfig};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A live link to one ledger
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    /// Cheap liveness probe
    async fn is_alive(&self) -> bool;
}

/// Knows how to dial a ledger endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self, endpoint: &ChainConfig) -> RelayerResult<Arc<Self::Conn>>;
}

/// Reconnection schedule
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based); the first attempt is immediate
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

impl From<&RelayerConfig> for BackoffPolicy {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct LinkState {
    /// Failed attempts in the current reconnect cycle
    attempts: u32,
    /// A reconnect task is running for this chain
    reconnecting: bool,
    /// Reconnect attempts were exhausted
    degraded: bool,
}

/// Manages connections to all configured chains
pub struct ChainConnectionManager<C: Connector> {
    connector: C,
    /// Endpoint configuration indexed by chain ID
    endpoints: BTreeMap<u64, ChainConfig>,
    /// Live connections indexed by chain ID
    connections: DashMap<u64, Arc<C::Conn>>,
    /// Reconnect bookkeeping indexed by chain ID
    links: DashMap<u64, LinkState>,
    backoff: BackoffPolicy,
}

impl<C: Connector> ChainConnectionManager<C> {
    pub fn new(connector: C, endpoints: Vec<ChainConfig>, backoff: BackoffPolicy) -> Self {
        let endpoints: BTreeMap<u64, ChainConfig> =
            endpoints.into_iter().map(|e| (e.chain_id, e)).collect();
        let links = endpoints
            .keys()
            .map(|id| (*id, LinkState::default()))
            .collect();

        Self {
            connector,
            endpoints,
            connections: DashMap::new(),
            links,
            backoff,
        }
    }

    /// Dial every endpoint once. Failures are left for the health checker.
    pub async fn connect_all(&self) -> Vec<(u64, bool)> {
        let attempts = self.endpoints.values().map(|endpoint| async move {
            match self.connect(endpoint).await {
                Ok(_) => (endpoint.chain_id, true),
                Err(e) => {
                    warn!(
                        "Initial connection to chain {} ({}) failed: {}",
                        endpoint.name, endpoint.chain_id, e
                    );
                    crate::metrics::record_chain_health(endpoint.chain_id, false);
                    (endpoint.chain_id, false)
                }
            }
        });

        join_all(attempts).await
    }

    /// Open a connection to `endpoint` and make it the chain's live connection
    pub async fn connect(&self, endpoint: &ChainConfig) -> RelayerResult<Arc<C::Conn>> {
        let conn = self.connector.connect(endpoint).await?;
        self.connections.insert(endpoint.chain_id, conn.clone());
        crate::metrics::record_chain_health(endpoint.chain_id, true);
        info!(
            "Connected to chain {} (ID: {})",
            endpoint.name, endpoint.chain_id
        );
        Ok(conn)
    }

    /// Live connection for a chain
    pub fn connection(&self, chain_id: u64) -> RelayerResult<Arc<C::Conn>> {
        if let Some(conn) = self.connections.get(&chain_id) {
            return Ok(conn.clone());
        }
        if self.endpoints.contains_key(&chain_id) {
            Err(RelayerError::ChainUnavailable { chain_id })
        } else {
            Err(RelayerError::ChainNotFound { chain_id })
        }
    }

    /// Whether the chain has a connection that answers
    pub async fn is_healthy(&self, chain_id: u64) -> bool {
        let conn = match self.connections.get(&chain_id) {
            Some(conn) => conn.clone(),
            None => return false,
        };
        let alive = conn.is_alive().await;
        if !alive {
            debug!("Chain {} connection is not answering", conn.chain_id());
        }
        alive
    }

    /// Re-dial a chain with bounded exponential backoff
    pub async fn reconnect(&self, chain_id: u64) -> RelayerResult<()> {
        let endpoint = self
            .endpoints
            .get(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        let mut last_error = None;
        for attempt in 1..=self.backoff.max_attempts {
            let delay = self.backoff.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            crate::metrics::record_reconnect_attempt(chain_id);
            match self.connect(endpoint).await {
                Ok(_) => {
                    self.update_link(chain_id, |link| {
                        link.attempts = 0;
                        link.degraded = false;
                    });
                    crate::metrics::record_chain_degraded(chain_id, false);
                    info!("Chain {} reconnected after {} attempt(s)", chain_id, attempt);
                    return Ok(());
                }
                Err(e) => {
                    self.update_link(chain_id, |link| link.attempts = attempt);
                    warn!(
                        "Reconnect attempt {}/{} for chain {} failed: {}",
                        attempt, self.backoff.max_attempts, chain_id, e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.update_link(chain_id, |link| link.degraded = true);
        crate::metrics::record_chain_degraded(chain_id, true);
        error!(
            "Chain {} is persistently degraded after {} reconnect attempts; other chains continue",
            chain_id, self.backoff.max_attempts
        );

        Err(RelayerError::ChainConnection {
            chain_id,
            message: format!(
                "reconnect attempts exhausted: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    /// Probe every chain without reconnecting
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let checks = self.endpoints.keys().map(|chain_id| async move {
            let healthy = self.is_healthy(*chain_id).await;
            crate::metrics::record_chain_health(*chain_id, healthy);
            (*chain_id, healthy)
        });

        join_all(checks).await
    }

    /// Chain IDs whose reconnect attempts were exhausted
    pub fn degraded_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self
            .links
            .iter()
            .filter(|entry| entry.value().degraded)
            .map(|entry| *entry.key())
            .collect();
        chains.sort_unstable();
        chains
    }

    /// Failed attempts in the chain's current reconnect cycle
    pub fn reconnect_attempts(&self, chain_id: u64) -> u32 {
        self.links
            .get(&chain_id)
            .map(|link| link.attempts)
            .unwrap_or(0)
    }

    /// All configured chain IDs
    pub fn chain_ids(&self) -> Vec<u64> {
        self.endpoints.keys().copied().collect()
    }

    /// Chain IDs that currently hold a connection
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }

    fn update_link(&self, chain_id: u64, f: impl FnOnce(&mut LinkState)) {
        let mut link = self.links.entry(chain_id).or_default();
        f(link.value_mut());
    }
}

impl<C: Connector> ChainConnectionManager<C> {
    /// Run `reconnect` in the background unless one is already running
    pub fn schedule_reconnect(self: &Arc<Self>, chain_id: u64) {
        {
            let mut link = self.links.entry(chain_id).or_default();
            if link.reconnecting {
                debug!("Reconnect already in progress for chain {}", chain_id);
                return;
            }
            link.reconnecting = true;
        }

        crate::metrics::record_chain_health(chain_id, false);
        self.connections.remove(&chain_id);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = manager.reconnect(chain_id).await;
            manager.update_link(chain_id, |link| link.reconnecting = false);
        });
    }

    /// One health-check pass: probe all chains concurrently and schedule
    /// reconnects for the unhealthy ones
    pub async fn health_tick(self: &Arc<Self>) -> Vec<(u64, bool)> {
        let results = self.health_check().await;
        for (chain_id, healthy) in &results {
            if !healthy {
                warn!("Chain {} health check failed, scheduling reconnect", chain_id);
                self.schedule_reconnect(*chain_id);
            }
        }
        crate::metrics::record_health_check();
        results
    }

    /// Periodic health checking until shutdown
    pub async fn run_health_checks(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; connections were just dialed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health_tick().await;
                }
                _ = shutdown.changed() => {
                    info!("Health checker stopped");
                    break;
                }
            }
        }
    }
}
