//! Trigger driver
//!
//! Event watchers and sweeps both funnel triggers through here. Decisions
//! for one proposal are serialized behind its own async mutex; different
//! proposals run concurrently.

use super::{FinalizationWorkflow, StepResult, WorkflowState};
use crate::error::RelayerResult;
use crate::governance::ProposalId;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Work item for the finalization workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Make sure the proposal exists on a secondary chain
    Mirror { proposal_id: ProposalId, chain_id: u64 },
    /// A secondary tally closed; collect it and continue
    CollectVotes { proposal_id: ProposalId, chain_id: u64 },
    /// Push the final status to every mirror
    StatusSync { proposal_id: ProposalId },
    /// Drive the proposal as far as live state allows
    Finalize { proposal_id: ProposalId },
}

impl Trigger {
    pub fn proposal_id(&self) -> ProposalId {
        match self {
            Trigger::Mirror { proposal_id, .. }
            | Trigger::CollectVotes { proposal_id, .. }
            | Trigger::StatusSync { proposal_id }
            | Trigger::Finalize { proposal_id } => *proposal_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Mirror { .. } => "mirror",
            Trigger::CollectVotes { .. } => "collect_votes",
            Trigger::StatusSync { .. } => "status_sync",
            Trigger::Finalize { .. } => "finalize",
        }
    }
}

/// Where a trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Event,
    Sweep,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Event => "event",
            TriggerSource::Sweep => "sweep",
        }
    }
}

/// What handling a trigger achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Mirror(StepResult),
    Workflow(WorkflowState),
}

/// Serializes workflow decisions per proposal
pub struct WorkflowDriver {
    workflow: Arc<FinalizationWorkflow>,
    locks: DashMap<ProposalId, Arc<Mutex<()>>>,
}

impl WorkflowDriver {
    pub fn new(workflow: Arc<FinalizationWorkflow>) -> Self {
        Self {
            workflow,
            locks: DashMap::new(),
        }
    }

    pub fn workflow(&self) -> &Arc<FinalizationWorkflow> {
        &self.workflow
    }

    fn lock_for(&self, id: ProposalId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Handle one trigger while holding the proposal's lock
    pub async fn handle(&self, trigger: Trigger, source: TriggerSource) -> RelayerResult<TriggerOutcome> {
        let id = trigger.proposal_id();
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.handle_locked(trigger, source).await
        };

        // Only the map and this call hold the lock: nobody is waiting on it
        self.locks.remove_if(&id, |_, entry| Arc::strong_count(entry) == 2);
        result
    }

    async fn handle_locked(&self, trigger: Trigger, source: TriggerSource) -> RelayerResult<TriggerOutcome> {
        debug!("Handling {:?} from {}", trigger, source.as_str());
        crate::metrics::record_trigger(trigger.name(), source.as_str());

        let outcome = match trigger {
            Trigger::Mirror {
                proposal_id,
                chain_id,
            } => TriggerOutcome::Mirror(self.workflow.ensure_mirror(proposal_id, chain_id).await?),
            Trigger::CollectVotes { proposal_id, .. } | Trigger::Finalize { proposal_id } => {
                TriggerOutcome::Workflow(self.workflow.advance(proposal_id).await?)
            }
            Trigger::StatusSync { proposal_id } => {
                TriggerOutcome::Workflow(self.workflow.sync_status(proposal_id).await?)
            }
        };

        debug!("{:?} -> {:?}", trigger, outcome);
        Ok(outcome)
    }

    /// Consume event triggers until shutdown; one task per trigger
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Trigger>, mut shutdown: watch::Receiver<bool>) {
        info!("Workflow driver started");

        loop {
            tokio::select! {
                trigger = rx.recv() => {
                    let trigger = match trigger {
                        Some(trigger) => trigger,
                        None => break,
                    };
                    let driver = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = driver.handle(trigger, TriggerSource::Event).await {
                            if e.is_retryable() {
                                warn!("{:?} failed, will retry on next trigger: {}", trigger, e.describe());
                            } else {
                                error!("{:?} failed: {}", trigger, e.describe());
                            }
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Workflow driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Ledgers;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_triggers_for_one_proposal_write_once() {
        let ledgers = Ledgers::new(&[137]).await;
        ledgers.main.add_proposal(1, 0, 120);
        ledgers.mirror_all(1);
        ledgers.set_time(121);
        let driver = Arc::new(WorkflowDriver::new(ledgers.workflow.clone()));

        let a = {
            let driver = driver.clone();
            tokio::spawn(async move {
                driver
                    .handle(Trigger::Finalize { proposal_id: 1 }, TriggerSource::Sweep)
                    .await
            })
        };
        let b = {
            let driver = driver.clone();
            tokio::spawn(async move {
                driver
                    .handle(
                        Trigger::CollectVotes {
                            proposal_id: 1,
                            chain_id: 137,
                        },
                        TriggerSource::Event,
                    )
                    .await
            })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        let writes = ledgers.writes();
        assert_eq!(
            writes
                .iter()
                .filter(|w| w.as_str() == "main.finalizeProposalVotes(1)")
                .count(),
            1
        );
        assert_eq!(
            writes.iter().filter(|w| w.starts_with("137.finalizeVotes")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_dispatches_channel_triggers() {
        let ledgers = Ledgers::new(&[137, 10]).await;
        ledgers.main.add_proposal(2, 0, 120);
        let driver = Arc::new(WorkflowDriver::new(ledgers.workflow.clone()));

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(driver.run(rx, shutdown_rx));

        tx.send(Trigger::Mirror { proposal_id: 2, chain_id: 137 }).await.unwrap();
        tx.send(Trigger::Mirror { proposal_id: 2, chain_id: 10 }).await.unwrap();

        for _ in 0..100 {
            if ledgers.writes().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let mut writes = ledgers.writes();
        writes.sort();
        assert_eq!(writes, vec!["10.mirrorProposal(2)", "137.mirrorProposal(2)"]);
    }

    #[tokio::test]
    async fn test_lock_entries_are_dropped_after_handling() {
        let ledgers = Ledgers::new(&[137]).await;
        for id in 1..=5 {
            ledgers.main.add_proposal(id, 0, 120);
        }
        let driver = Arc::new(WorkflowDriver::new(ledgers.workflow.clone()));

        let handles: Vec<_> = (1..=5)
            .map(|id| {
                let driver = driver.clone();
                tokio::spawn(async move {
                    driver
                        .handle(Trigger::Mirror { proposal_id: id, chain_id: 137 }, TriggerSource::Event)
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(ledgers.secondary(137).mirror_count(), 5);
        assert!(driver.locks.is_empty());
    }
}
