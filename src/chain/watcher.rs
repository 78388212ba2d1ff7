//! Governance event watcher with WebSocket streaming and HTTP polling fallback

use crate::config::ChainConfig;
use crate::coordination::Trigger;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainRole, EventParser, GovernanceEvent};

use super::{ChainConnectionManager, Connection, Connector};

use async_trait::async_trait;
use ethers::prelude::*;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Largest block range requested in one `eth_getLogs` call
const MAX_BLOCK_RANGE: u64 = 1_000;

/// Where a watcher reads governance logs from
#[async_trait]
pub trait LogSource: Connection {
    async fn block_number(&self) -> RelayerResult<u64>;

    async fn logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>>;

    /// Live log stream, or `None` when the connection cannot stream
    async fn subscribe<'a>(&'a self, filter: &'a Filter) -> RelayerResult<Option<BoxStream<'a, Log>>>;
}

/// Watches one ledger's governance module and turns its events into triggers
pub struct EventWatcher<C: Connector> {
    /// Chain configuration
    config: ChainConfig,
    connections: Arc<ChainConnectionManager<C>>,
    parser: EventParser,
    governance_address: Address,
    /// Secondary chains a new proposal must be mirrored to
    secondary_chains: Vec<u64>,
    trigger_tx: mpsc::Sender<Trigger>,
    poll_interval: Duration,
}

enum Exit {
    Shutdown,
    Interrupted(RelayerError),
}

impl<C> EventWatcher<C>
where
    C: Connector,
    C::Conn: LogSource,
{
    pub fn new(
        config: ChainConfig,
        role: ChainRole,
        connections: Arc<ChainConnectionManager<C>>,
        secondary_chains: Vec<u64>,
        trigger_tx: mpsc::Sender<Trigger>,
        poll_interval: Duration,
    ) -> RelayerResult<Self> {
        let governance_address: Address = config
            .governance_address
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid governance address: {}", e)))?;

        Ok(Self {
            parser: EventParser::new(config.chain_id, role),
            config,
            connections,
            governance_address,
            secondary_chains,
            trigger_tx,
            poll_interval,
        })
    }

    /// Main watch loop. Interrupted streams schedule a reconnect and resume
    /// after a delay; returns on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Event watcher started for chain {}", self.config.chain_id);

        loop {
            let exit = match self.connections.connection(self.config.chain_id) {
                Ok(source) => self.watch(source.as_ref(), &mut shutdown).await,
                Err(e) => Exit::Interrupted(e),
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Interrupted(e) => {
                    warn!(
                        "Event stream for chain {} interrupted: {}",
                        self.config.chain_id, e
                    );
                    self.connections.schedule_reconnect(self.config.chain_id);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval * 5) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Event watcher stopped for chain {}", self.config.chain_id);
    }

    async fn watch(&self, source: &C::Conn, shutdown: &mut watch::Receiver<bool>) -> Exit {
        let filter = Filter::new().address(self.governance_address);
        let exit = match source.subscribe(&filter).await {
            Ok(Some(stream)) => {
                info!("Using WebSocket for chain {}", self.config.chain_id);
                self.drain_stream(stream, shutdown).await
            }
            Ok(None) => {
                info!("Using HTTP polling for chain {}", self.config.chain_id);
                self.watch_polling(source, shutdown).await
            }
            Err(e) => Exit::Interrupted(e),
        };
        exit
    }

    async fn drain_stream(&self, mut stream: BoxStream<'_, Log>, shutdown: &mut watch::Receiver<bool>) -> Exit {
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(log) => self.process_log(log).await,
                    None => {
                        return Exit::Interrupted(RelayerError::ChainConnection {
                            chain_id: self.config.chain_id,
                            message: "log subscription closed".to_string(),
                        })
                    }
                },
                _ = shutdown.changed() => return Exit::Shutdown,
            }
        }
    }

    /// HTTP polling-based event watching
    async fn watch_polling(&self, source: &C::Conn, shutdown: &mut watch::Receiver<bool>) -> Exit {
        // Events before startup are recovered by the reconciliation sweeps
        let mut last_block = match source.block_number().await {
            Ok(block) => block,
            Err(e) => return Exit::Interrupted(e),
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => return Exit::Shutdown,
            }

            last_block = match self.poll_once(source, last_block).await {
                Ok(block) => block,
                Err(e) => return Exit::Interrupted(e),
            };
        }
    }

    /// Process every block after `last_block` up to the head in bounded
    /// ranges. Returns the last block processed.
    async fn poll_once(&self, source: &C::Conn, mut last_block: u64) -> RelayerResult<u64> {
        let current_block = source.block_number().await?;

        while last_block < current_block {
            let from_block = last_block + 1;
            let to_block = std::cmp::min(current_block, from_block + MAX_BLOCK_RANGE - 1);

            debug!(
                "Chain {}: Processing blocks {} to {}",
                self.config.chain_id, from_block, to_block
            );

            let filter = Filter::new()
                .address(self.governance_address)
                .from_block(from_block)
                .to_block(to_block);

            for log in source.logs(&filter).await? {
                self.process_log(log).await;
            }
            last_block = to_block;
            crate::metrics::record_blocks_processed(self.config.chain_id, to_block);
        }

        Ok(last_block)
    }

    /// Parse a single log entry and forward its triggers
    async fn process_log(&self, log: Log) {
        let event = match self.parser.parse_log(&log) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to parse log on chain {}: {}", self.config.chain_id, e);
                return;
            }
        };

        if let GovernanceEvent::Unknown { topic, .. } = &event {
            debug!("Ignoring unknown log {:?} on chain {}", topic, self.config.chain_id);
            return;
        }

        debug!("Chain {} event: {:?}", event.chain_id(), event);
        crate::metrics::record_event(self.config.chain_id, event.name());

        for trigger in event.triggers(&self.secondary_chains) {
            if self.trigger_tx.send(trigger).await.is_err() {
                error!("Trigger channel closed; dropping event from chain {}", self.config.chain_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BackoffPolicy;
    use crate::governance::abi::MAIN_ABI;
    use crate::testing::{chain_config, StubConnector};

    fn proposal_created(id: u64, block: u64) -> Log {
        let mut topic = [0u8; 32];
        U256::from(id).to_big_endian(&mut topic);
        Log {
            topics: vec![
                MAIN_ABI.event("ProposalCreated").unwrap().signature(),
                H256::from(topic),
            ],
            block_number: Some(U64::from(block)),
            ..Default::default()
        }
    }

    async fn watcher(
        connector: &StubConnector,
        poll_interval: Duration,
    ) -> (EventWatcher<StubConnector>, mpsc::Receiver<Trigger>) {
        let connections = Arc::new(ChainConnectionManager::new(
            connector.clone(),
            vec![chain_config(1)],
            BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        connections.connect_all().await;
        let (tx, rx) = mpsc::channel(64);
        let watcher = EventWatcher::new(
            chain_config(1),
            ChainRole::Main,
            connections,
            vec![137],
            tx,
            poll_interval,
        )
        .unwrap();
        (watcher, rx)
    }

    async fn next_trigger(rx: &mut mpsc::Receiver<Trigger>) -> Trigger {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_poll_splits_long_ranges() {
        let connector = StubConnector::default();
        connector.set_head(1, 2_500);
        connector.push_log(1, proposal_created(4, 1_500));
        let (watcher, mut rx) = watcher(&connector, Duration::from_millis(1)).await;
        let source = watcher.connections.connection(1).unwrap();

        let last = watcher.poll_once(source.as_ref(), 0).await.unwrap();

        assert_eq!(last, 2_500);
        assert_eq!(
            connector.log_queries(1),
            vec![(1, 1_000), (1_001, 2_000), (2_001, 2_500)]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Trigger::Mirror { proposal_id: 4, chain_id: 137 }
        );

        // Caught up: nothing new to query
        assert_eq!(watcher.poll_once(source.as_ref(), last).await.unwrap(), 2_500);
        assert_eq!(connector.log_queries(1).len(), 3);
    }

    #[tokio::test]
    async fn test_polling_used_without_stream() {
        let connector = StubConnector::default();
        connector.set_head(1, 100);
        let (watcher, mut rx) = watcher(&connector, Duration::from_millis(1)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.run(shutdown_rx));

        // Let the watcher record the starting head before the new block lands
        for _ in 0..200 {
            if connector.head_reads(1) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        connector.push_log(1, proposal_created(9, 101));
        connector.set_head(1, 101);

        assert_eq!(
            next_trigger(&mut rx).await,
            Trigger::Mirror { proposal_id: 9, chain_id: 137 }
        );
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_forwards_then_reconnects() {
        let connector = StubConnector::default();
        connector.set_stream(1, vec![proposal_created(2, 7)]);
        let (watcher, mut rx) = watcher(&connector, Duration::from_millis(1)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.run(shutdown_rx));

        assert_eq!(
            next_trigger(&mut rx).await,
            Trigger::Mirror { proposal_id: 2, chain_id: 137 }
        );

        // The stream ends after its one log, so the link is re-dialed
        for _ in 0..200 {
            if connector.connects(1) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connector.connects(1) >= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
