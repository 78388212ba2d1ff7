//! Governance module surface
//!
//! The main and secondary governance contracts are remote procedure surfaces.
//! This module defines the data the relayer reads from them and the two traits
//! the finalization workflow drives. The ethers-backed implementations live in
//! [`client`]; tests substitute in-memory ledgers.

pub mod abi;
pub mod client;
pub mod decoder;

pub use client::{MainGovernanceClient, SecondaryGovernanceClient};
pub use decoder::ErrorDecoder;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Proposal identifier shared by the main chain and every mirror
pub type ProposalId = u64;

/// Proposal status as stored by the governance modules (`uint8` on chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Executed,
}

impl ProposalStatus {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(ProposalStatus::Pending),
            1 => Some(ProposalStatus::Accepted),
            2 => Some(ProposalStatus::Rejected),
            3 => Some(ProposalStatus::Executed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ProposalStatus::Pending => 0,
            ProposalStatus::Accepted => 1,
            ProposalStatus::Rejected => 2,
            ProposalStatus::Executed => 3,
        }
    }

    /// Status as propagated to secondary mirrors.
    ///
    /// Mirrors only distinguish accepted from rejected; execution happens on
    /// the main chain, so `Executed` is folded into `Accepted`.
    pub fn propagated(self) -> Self {
        match self {
            ProposalStatus::Executed => ProposalStatus::Accepted,
            other => other,
        }
    }
}

/// Proposal as held by the main governance module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MainProposal {
    pub id: ProposalId,
    pub title: String,
    pub content_hash: [u8; 32],
    pub proposer: Address,
    pub start_time: u64,
    pub end_time: u64,
    pub yes_votes: U256,
    pub no_votes: U256,
    pub status: ProposalStatus,
    pub final_yes_votes: U256,
    pub final_no_votes: U256,
    pub vote_tally_finalized: bool,
    pub executed: bool,
}

impl MainProposal {
    /// Whether the aggregated tally passed
    pub fn is_accepted(&self) -> bool {
        self.final_yes_votes > self.final_no_votes
    }

    /// Final status to push to mirrors once the tally is finalized
    pub fn final_status(&self) -> ProposalStatus {
        match self.status {
            ProposalStatus::Accepted | ProposalStatus::Executed => ProposalStatus::Accepted,
            ProposalStatus::Rejected => ProposalStatus::Rejected,
            ProposalStatus::Pending if self.is_accepted() => ProposalStatus::Accepted,
            ProposalStatus::Pending => ProposalStatus::Rejected,
        }
    }
}

/// Mirror of a main proposal on a secondary chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryMirror {
    pub id: ProposalId,
    pub title: String,
    pub content_hash: [u8; 32],
    pub proposer: Address,
    pub start_time: u64,
    pub end_time: u64,
    pub yes_votes: U256,
    pub no_votes: U256,
    pub status: ProposalStatus,
    pub vote_finalized: bool,
}

/// Main chain's record of one secondary chain's tally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryVoteCollection {
    pub proposal_id: ProposalId,
    pub chain_id: u64,
    pub yes_votes: U256,
    pub no_votes: U256,
    pub collected: bool,
}

/// Arguments of `mirrorProposal`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    pub id: ProposalId,
    pub title: String,
    pub content_hash: [u8; 32],
    pub start_time: u64,
    pub end_time: u64,
    pub proposer: Address,
}

impl From<&MainProposal> for MirrorRequest {
    fn from(p: &MainProposal) -> Self {
        Self {
            id: p.id,
            title: p.title.clone(),
            content_hash: p.content_hash,
            start_time: p.start_time,
            end_time: p.end_time,
            proposer: p.proposer,
        }
    }
}

/// Query/command surface of the main governance module
#[async_trait]
pub trait MainGovernance: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Timestamp of the latest block; authoritative for main-chain deadlines
    async fn latest_timestamp(&self) -> RelayerResult<u64>;

    async fn proposal_ids(&self) -> RelayerResult<Vec<ProposalId>>;

    async fn proposal(&self, id: ProposalId) -> RelayerResult<MainProposal>;

    async fn secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
    ) -> RelayerResult<SecondaryVoteCollection>;

    async fn registered_chains(&self) -> RelayerResult<Vec<u64>>;

    async fn collect_secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
        yes_votes: U256,
        no_votes: U256,
    ) -> RelayerResult<()>;

    async fn finalize_proposal_votes(&self, id: ProposalId) -> RelayerResult<()>;

    async fn execute_proposal(&self, id: ProposalId) -> RelayerResult<()>;
}

/// Query/command surface of a secondary governance module
#[async_trait]
pub trait SecondaryGovernance: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Timestamp of the latest block; authoritative for this chain's deadlines
    async fn latest_timestamp(&self) -> RelayerResult<u64>;

    /// Mirror details, or `None` if the proposal has not been mirrored yet
    async fn proposal(&self, id: ProposalId) -> RelayerResult<Option<SecondaryMirror>>;

    async fn mirror_proposal(&self, request: &MirrorRequest) -> RelayerResult<()>;

    async fn finalize_votes(&self, id: ProposalId) -> RelayerResult<()>;

    async fn update_proposal_status(
        &self,
        id: ProposalId,
        status: ProposalStatus,
    ) -> RelayerResult<()>;
}
