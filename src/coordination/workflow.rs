//! Finalization workflow
//!
//! Drives one proposal from an elapsed voting window to `Done`:
//!
//! ```text
//! Active -> Expired -> SecondaryFinalizing -> CollectionPending -> MainFinalizing
//!        -> Finalized{Accepted|Rejected} -> ExecutionPending -> StatusSyncPending -> Done
//! ```
//!
//! Every mutating call is preceded by a fresh read of the live flags it
//! depends on, and "already done" reverts count as success, so any step can
//! be re-run by a duplicate event or a later sweep. There is no failure
//! state: unmet preconditions stop the pass and the next trigger resumes it.

use crate::error::{ErrorKind, RelayerError, RelayerResult};
use crate::governance::{
    MainGovernance, MainProposal, MirrorRequest, ProposalId, ProposalStatus, SecondaryGovernance,
};
use crate::state::IdempotencyCache;

use dashmap::DashSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final outcome of the aggregated tally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Accepted,
    Rejected,
}

/// Where a proposal's finalization stands after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Active,
    Expired,
    SecondaryFinalizing,
    CollectionPending,
    MainFinalizing,
    Finalized(Outcome),
    ExecutionPending,
    StatusSyncPending,
    Done,
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Active => "active",
            WorkflowState::Expired => "expired",
            WorkflowState::SecondaryFinalizing => "secondary_finalizing",
            WorkflowState::CollectionPending => "collection_pending",
            WorkflowState::MainFinalizing => "main_finalizing",
            WorkflowState::Finalized(Outcome::Accepted) => "finalized_accepted",
            WorkflowState::Finalized(Outcome::Rejected) => "finalized_rejected",
            WorkflowState::ExecutionPending => "execution_pending",
            WorkflowState::StatusSyncPending => "status_sync_pending",
            WorkflowState::Done => "done",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The write was mined
    Applied,
    /// The live state already reflected the change
    AlreadyDone,
    /// A remote precondition is not met yet
    Deferred,
}

/// Progress of one secondary chain toward collection on main
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SecondaryProgress {
    VotingOpen,
    Finalizing,
    Collecting,
    Collected,
}

/// Turns triggers into the ordered sequence of governance calls
pub struct FinalizationWorkflow {
    main: Arc<dyn MainGovernance>,
    secondaries: BTreeMap<u64, Arc<dyn SecondaryGovernance>>,
    cache: Arc<IdempotencyCache>,
    /// Registered chains already reported as lacking a client
    unconfigured: DashSet<u64>,
}

impl FinalizationWorkflow {
    pub fn new(
        main: Arc<dyn MainGovernance>,
        secondaries: Vec<Arc<dyn SecondaryGovernance>>,
        cache: Arc<IdempotencyCache>,
    ) -> Self {
        let secondaries = secondaries
            .into_iter()
            .map(|s| (s.chain_id(), s))
            .collect();
        Self {
            main,
            secondaries,
            cache,
            unconfigured: DashSet::new(),
        }
    }

    pub fn main(&self) -> &Arc<dyn MainGovernance> {
        &self.main
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    /// Secondary chain IDs this relayer can write to
    pub fn secondary_chains(&self) -> Vec<u64> {
        self.secondaries.keys().copied().collect()
    }

    fn secondary(&self, chain_id: u64) -> RelayerResult<&Arc<dyn SecondaryGovernance>> {
        self.secondaries
            .get(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Map a write result onto a step result
    fn absorb(&self, label: &str, proposal_id: ProposalId, result: RelayerResult<()>) -> RelayerResult<StepResult> {
        match result {
            Ok(()) => Ok(StepResult::Applied),
            Err(e) => match e.kind() {
                ErrorKind::AlreadyDone => {
                    debug!("{} for proposal {} already done: {}", label, proposal_id, e.describe());
                    crate::metrics::record_write_absorbed(label);
                    Ok(StepResult::AlreadyDone)
                }
                ErrorKind::Precondition => {
                    warn!(
                        "{} for proposal {} deferred: {}",
                        label,
                        proposal_id,
                        e.describe()
                    );
                    Ok(StepResult::Deferred)
                }
                _ => Err(e),
            },
        }
    }

    /// Ensure the proposal is mirrored on `chain_id`. Reads first; the write
    /// is only issued when no mirror exists.
    pub async fn ensure_mirror(&self, id: ProposalId, chain_id: u64) -> RelayerResult<StepResult> {
        let secondary = self.secondary(chain_id)?;
        if secondary.proposal(id).await?.is_some() {
            debug!("Proposal {} already mirrored on chain {}", id, chain_id);
            return Ok(StepResult::AlreadyDone);
        }

        let proposal = self.main.proposal(id).await?;
        self.mirror(&proposal, secondary.as_ref()).await
    }

    async fn mirror(
        &self,
        proposal: &MainProposal,
        secondary: &dyn SecondaryGovernance,
    ) -> RelayerResult<StepResult> {
        let request = MirrorRequest::from(proposal);
        let result = self.absorb(
            "mirrorProposal",
            proposal.id,
            secondary.mirror_proposal(&request).await,
        )?;
        if result == StepResult::Applied {
            info!(
                "Mirrored proposal {} to chain {}",
                proposal.id,
                secondary.chain_id()
            );
        }
        Ok(result)
    }

    /// Run one finalization pass for a proposal
    pub async fn advance(&self, id: ProposalId) -> RelayerResult<WorkflowState> {
        let state = self.advance_inner(id).await?;
        crate::metrics::record_workflow_state(state.name());
        Ok(state)
    }

    /// Re-check and push the final status to every mirror, ignoring the
    /// cached `statusSynced` flag
    pub async fn sync_status(&self, id: ProposalId) -> RelayerResult<WorkflowState> {
        let proposal = self.main.proposal(id).await?;
        if !proposal.vote_tally_finalized {
            debug!("Proposal {} not finalized, status sync deferred", id);
            return Ok(WorkflowState::Active);
        }
        let state = self.propagate_status(&proposal).await?;
        crate::metrics::record_workflow_state(state.name());
        Ok(state)
    }

    async fn advance_inner(&self, id: ProposalId) -> RelayerResult<WorkflowState> {
        let mut proposal = self.main.proposal(id).await?;

        if !proposal.vote_tally_finalized {
            let chains = self.main.registered_chains().await?;

            let mut least = SecondaryProgress::Collected;
            for chain_id in chains {
                let progress = match self.settle_secondary(&proposal, chain_id).await {
                    Ok(progress) => progress,
                    Err(e) => {
                        warn!(
                            "Proposal {} on chain {}: {}",
                            id,
                            chain_id,
                            e.describe()
                        );
                        SecondaryProgress::VotingOpen
                    }
                };
                least = least.min(progress);
            }

            let now = self.main.latest_timestamp().await?;
            if now < proposal.end_time {
                debug!("Proposal {} voting open on main until {}", id, proposal.end_time);
                return Ok(WorkflowState::Active);
            }

            match least {
                SecondaryProgress::VotingOpen => return Ok(WorkflowState::Expired),
                SecondaryProgress::Finalizing => return Ok(WorkflowState::SecondaryFinalizing),
                SecondaryProgress::Collecting => return Ok(WorkflowState::CollectionPending),
                SecondaryProgress::Collected => {}
            }

            let step = self.absorb(
                "finalizeProposalVotes",
                id,
                self.main.finalize_proposal_votes(id).await,
            )?;
            if step == StepResult::Deferred {
                return Ok(WorkflowState::MainFinalizing);
            }

            proposal = self.main.proposal(id).await?;
            if !proposal.vote_tally_finalized {
                warn!("Proposal {} still not finalized on main after finalize call", id);
                return Ok(WorkflowState::MainFinalizing);
            }
            info!(
                "Proposal {} finalized on main: {} yes / {} no",
                id, proposal.final_yes_votes, proposal.final_no_votes
            );
        }

        if let Err(e) = self.cache.mark_finalized(id).await {
            warn!("Failed to record proposal {} as finalized: {}", id, e);
        }

        let outcome = match proposal.final_status() {
            ProposalStatus::Accepted => Outcome::Accepted,
            _ => Outcome::Rejected,
        };
        crate::metrics::record_workflow_state(WorkflowState::Finalized(outcome).name());

        // Mirrors get `Accepted` whether or not execution has landed
        let mut execution_pending = false;
        if outcome == Outcome::Accepted {
            if proposal.executed {
                if let Err(e) = self.cache.mark_executed(id).await {
                    warn!("Failed to record proposal {} as executed: {}", id, e);
                }
            } else {
                match self.execute(id).await {
                    Ok(Some(executed)) => proposal = executed,
                    Ok(None) => execution_pending = true,
                    Err(e) => {
                        warn!("Execution of proposal {} failed: {}", id, e.describe());
                        execution_pending = true;
                    }
                }
            }
        }

        let synced = self
            .cache
            .get(id)
            .await
            .map(|r| r.status_synced)
            .unwrap_or(false);
        let all_match = if synced {
            debug!("Proposal {} status already synced", id);
            true
        } else {
            self.push_status(&proposal).await?
        };

        if execution_pending {
            return Ok(WorkflowState::ExecutionPending);
        }
        if !all_match {
            return Ok(WorkflowState::StatusSyncPending);
        }
        self.settle(&proposal).await;
        Ok(WorkflowState::Done)
    }

    /// Execute on main. Returns the refreshed proposal once main reports it
    /// executed, `None` while execution is deferred.
    async fn execute(&self, id: ProposalId) -> RelayerResult<Option<MainProposal>> {
        let step = self.absorb(
            "executeProposal",
            id,
            self.main.execute_proposal(id).await,
        )?;
        if step == StepResult::Deferred {
            return Ok(None);
        }

        let proposal = self.main.proposal(id).await?;
        if !proposal.executed {
            warn!("Proposal {} not executed after execute call", id);
            return Ok(None);
        }
        info!("Executed proposal {}", id);
        if let Err(e) = self.cache.mark_executed(id).await {
            warn!("Failed to record proposal {} as executed: {}", id, e);
        }
        Ok(Some(proposal))
    }

    /// Bring one secondary chain's tally into main's record
    async fn settle_secondary(
        &self,
        proposal: &MainProposal,
        chain_id: u64,
    ) -> RelayerResult<SecondaryProgress> {
        let id = proposal.id;
        if self.main.secondary_votes(id, chain_id).await?.collected {
            return Ok(SecondaryProgress::Collected);
        }

        let secondary = self.secondary(chain_id)?;
        let mut mirror = match secondary.proposal(id).await? {
            Some(mirror) => mirror,
            None => {
                warn!("Proposal {} missing on chain {}, mirroring first", id, chain_id);
                self.mirror(proposal, secondary.as_ref()).await?;
                match secondary.proposal(id).await? {
                    Some(mirror) => mirror,
                    None => return Ok(SecondaryProgress::VotingOpen),
                }
            }
        };

        if !mirror.vote_finalized {
            let now = secondary.latest_timestamp().await?;
            if now < mirror.end_time {
                debug!(
                    "Proposal {} voting open on chain {} until {}",
                    id, chain_id, mirror.end_time
                );
                return Ok(SecondaryProgress::VotingOpen);
            }

            let step = self.absorb("finalizeVotes", id, secondary.finalize_votes(id).await)?;
            if step == StepResult::Deferred {
                return Ok(SecondaryProgress::Finalizing);
            }

            mirror = match secondary.proposal(id).await? {
                Some(mirror) if mirror.vote_finalized => mirror,
                _ => return Ok(SecondaryProgress::Finalizing),
            };
            info!(
                "Finalized votes for proposal {} on chain {}: {} yes / {} no",
                id, chain_id, mirror.yes_votes, mirror.no_votes
            );
        }

        let step = self.absorb(
            "collectSecondaryChainVotes",
            id,
            self.main
                .collect_secondary_votes(id, chain_id, mirror.yes_votes, mirror.no_votes)
                .await,
        )?;
        if step == StepResult::Deferred {
            return Ok(SecondaryProgress::Collecting);
        }

        if self.main.secondary_votes(id, chain_id).await?.collected {
            info!("Collected chain {} votes for proposal {}", chain_id, id);
            Ok(SecondaryProgress::Collected)
        } else {
            Ok(SecondaryProgress::Collecting)
        }
    }

    /// Push the final status to every mirror that differs from it. Returns
    /// whether every mirror now matches.
    async fn push_status(&self, proposal: &MainProposal) -> RelayerResult<bool> {
        let id = proposal.id;
        let target = proposal.final_status();

        let mut all_match = true;
        for (chain_id, secondary) in self.status_targets().await? {
            match self.sync_mirror_status(proposal, secondary, target).await {
                Ok(true) => {}
                Ok(false) => all_match = false,
                Err(e) => {
                    warn!(
                        "Status sync of proposal {} to chain {} failed: {}",
                        id,
                        chain_id,
                        e.describe()
                    );
                    all_match = false;
                }
            }
        }
        Ok(all_match)
    }

    async fn propagate_status(&self, proposal: &MainProposal) -> RelayerResult<WorkflowState> {
        if !self.push_status(proposal).await? {
            return Ok(WorkflowState::StatusSyncPending);
        }
        if execution_outstanding(proposal) {
            return Ok(WorkflowState::ExecutionPending);
        }
        self.settle(proposal).await;
        Ok(WorkflowState::Done)
    }

    /// Record that every mirror carries the final status
    async fn settle(&self, proposal: &MainProposal) {
        if let Err(e) = self.cache.mark_status_synced(proposal.id).await {
            warn!("Failed to record proposal {} as synced: {}", proposal.id, e);
        }
        info!(
            "Proposal {} settled with status {:?}",
            proposal.id,
            proposal.final_status()
        );
    }

    /// Registered chains that have a configured client. A registered chain
    /// without one is reported once as a configuration error and skipped.
    async fn status_targets(&self) -> RelayerResult<Vec<(u64, &Arc<dyn SecondaryGovernance>)>> {
        let chains = self.main.registered_chains().await?;
        let mut targets = Vec::with_capacity(chains.len());
        for chain_id in chains {
            match self.secondaries.get(&chain_id) {
                Some(secondary) => targets.push((chain_id, secondary)),
                None => {
                    if self.unconfigured.insert(chain_id) {
                        error!(
                            "Chain {} is registered on main but has no configured secondary client",
                            chain_id
                        );
                    }
                }
            }
        }
        Ok(targets)
    }

    /// Whether any reachable mirror is missing or shows a status other than
    /// the proposal's final status
    pub async fn status_diverges(&self, proposal: &MainProposal) -> RelayerResult<bool> {
        let target = proposal.final_status();
        for (chain_id, secondary) in self.status_targets().await? {
            match secondary.proposal(proposal.id).await {
                Ok(Some(mirror)) if mirror.status.propagated() == target => {}
                Ok(_) => return Ok(true),
                Err(e) => warn!(
                    "Could not read proposal {} on chain {}: {}",
                    proposal.id,
                    chain_id,
                    e.describe()
                ),
            }
        }
        Ok(false)
    }

    /// Returns whether the mirror on `chain_id` now shows `target`
    async fn sync_mirror_status(
        &self,
        proposal: &MainProposal,
        secondary: &Arc<dyn SecondaryGovernance>,
        target: ProposalStatus,
    ) -> RelayerResult<bool> {
        let id = proposal.id;
        let chain_id = secondary.chain_id();

        let mirror = match secondary.proposal(id).await? {
            Some(mirror) => mirror,
            None => {
                self.mirror(proposal, secondary.as_ref()).await?;
                match secondary.proposal(id).await? {
                    Some(mirror) => mirror,
                    None => return Ok(false),
                }
            }
        };

        if mirror.status.propagated() == target {
            debug!("Chain {} already shows {:?} for proposal {}", chain_id, target, id);
            return Ok(true);
        }

        let step = self.absorb(
            "updateProposalStatus",
            id,
            secondary.update_proposal_status(id, target).await,
        )?;
        if step == StepResult::Deferred {
            return Ok(false);
        }

        let confirmed = secondary
            .proposal(id)
            .await?
            .map(|m| m.status.propagated() == target)
            .unwrap_or(false);
        if confirmed {
            info!("Chain {} status for proposal {} set to {:?}", chain_id, id, target);
        }
        Ok(confirmed)
    }
}

/// Accepted on main but not executed yet
fn execution_outstanding(proposal: &MainProposal) -> bool {
    proposal.final_status() == ProposalStatus::Accepted && !proposal.executed
}
