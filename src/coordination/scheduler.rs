//! Reconciliation sweeps
//!
//! Two independent periodic passes re-derive triggers from polled state so
//! progress never depends on an event having been observed:
//! - `sync_proposals`: every proposal is mirrored everywhere and every mirror
//!   of a finalized proposal carries its final status
//! - `process_ended_proposals`: every unsettled proposal whose window has
//!   elapsed is driven through the finalization workflow

use super::{StepResult, Trigger, TriggerOutcome, TriggerSource, WorkflowDriver, WorkflowState};
use crate::config::RelayerConfig;
use crate::error::RelayerResult;
use crate::governance::ProposalId;

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counts for one sweep run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub skipped: usize,
    pub triggered: usize,
    pub failed: usize,
}

/// Periodic trigger source
pub struct ReconciliationScheduler {
    driver: Arc<WorkflowDriver>,
    sync_interval: Duration,
    process_interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(driver: Arc<WorkflowDriver>, config: &RelayerConfig) -> Self {
        Self {
            driver,
            sync_interval: Duration::from_secs(config.sync_interval_secs),
            process_interval: Duration::from_secs(config.process_interval_secs),
        }
    }

    /// Mirror every proposal everywhere and re-issue status sync where a
    /// mirror diverges from main's final status
    pub async fn sync_proposals(&self) -> RelayerResult<SweepReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_proposals", %run_id);

        async {
            let started = Instant::now();
            let workflow = self.driver.workflow();
            let ids = workflow.main().proposal_ids().await?;
            let mut report = SweepReport::default();

            for id in ids {
                report.examined += 1;
                match self.sync_one(id).await {
                    Ok(true) => report.triggered += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!("Sync of proposal {} failed: {}", id, e.describe());
                        report.failed += 1;
                    }
                }
            }

            info!(
                "Sync sweep done: {} examined, {} skipped, {} triggered, {} failed",
                report.examined, report.skipped, report.triggered, report.failed
            );
            crate::metrics::record_sweep("sync_proposals", started.elapsed(), &report);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Returns whether any write-bearing trigger was handled
    async fn sync_one(&self, id: ProposalId) -> RelayerResult<bool> {
        let workflow = self.driver.workflow();
        let mut acted = false;
        let mut first_error = None;

        for chain_id in workflow.secondary_chains() {
            let trigger = Trigger::Mirror {
                proposal_id: id,
                chain_id,
            };
            match self.driver.handle(trigger, TriggerSource::Sweep).await {
                Ok(TriggerOutcome::Mirror(StepResult::Applied)) => acted = true,
                Ok(_) => {}
                Err(e) => {
                    warn!("Mirror of proposal {} to chain {} failed: {}", id, chain_id, e.describe());
                    first_error.get_or_insert(e);
                }
            }
        }

        let proposal = workflow.main().proposal(id).await?;
        if proposal.vote_tally_finalized && workflow.status_diverges(&proposal).await? {
            debug!("Proposal {} has a diverging mirror status", id);
            self.driver
                .handle(Trigger::StatusSync { proposal_id: id }, TriggerSource::Sweep)
                .await?;
            acted = true;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(acted),
        }
    }

    /// Drive every unsettled, ended proposal through the workflow
    pub async fn process_ended_proposals(&self) -> RelayerResult<SweepReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("process_ended_proposals", %run_id);

        async {
            let started = Instant::now();
            let workflow = self.driver.workflow();
            let cache = workflow.cache();

            if cache.needs_rebuild() {
                if let Err(e) = cache.rebuild(workflow.main().as_ref()).await {
                    warn!("Cache rebuild failed, continuing without it: {}", e);
                }
            }

            let ids = workflow.main().proposal_ids().await?;
            let now = workflow.main().latest_timestamp().await?;
            let mut report = SweepReport::default();

            for id in ids {
                report.examined += 1;

                if cache.is_settled(id).await {
                    report.skipped += 1;
                    continue;
                }

                let proposal = match workflow.main().proposal(id).await {
                    Ok(proposal) => proposal,
                    Err(e) => {
                        warn!("Could not read proposal {}: {}", id, e.describe());
                        report.failed += 1;
                        continue;
                    }
                };
                if now < proposal.end_time {
                    report.skipped += 1;
                    continue;
                }

                match self
                    .driver
                    .handle(Trigger::Finalize { proposal_id: id }, TriggerSource::Sweep)
                    .await
                {
                    Ok(TriggerOutcome::Workflow(state)) => {
                        if state != WorkflowState::Done {
                            debug!("Proposal {} paused at {}", id, state);
                        }
                        report.triggered += 1;
                    }
                    Ok(_) => report.triggered += 1,
                    Err(e) => {
                        warn!("Finalization of proposal {} failed: {}", id, e.describe());
                        report.failed += 1;
                    }
                }
            }

            info!(
                "Process sweep done: {} examined, {} skipped, {} triggered, {} failed",
                report.examined, report.skipped, report.triggered, report.failed
            );
            crate::metrics::record_sweep("process_ended_proposals", started.elapsed(), &report);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_proposals().await {
                        warn!("Sync sweep aborted: {}", e.describe());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_process_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.process_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_ended_proposals().await {
                        warn!("Process sweep aborted: {}", e.describe());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Run both sweeps until shutdown. The first tick of each fires immediately.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "Reconciliation scheduler started (sync every {:?}, process every {:?})",
            self.sync_interval, self.process_interval
        );
        tokio::join!(
            Arc::clone(&self).run_sync_loop(shutdown.clone()),
            Arc::clone(&self).run_process_loop(shutdown),
        );
        info!("Reconciliation scheduler stopped");
    }
}
