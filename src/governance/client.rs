//! ethers-backed governance module clients
//!
//! Reads go through `eth_call` against the chain's live connection; writes
//! go through the shared [`TransactionSubmitter`] so they are nonce-sequenced
//! and retried.

use super::abi::{decode_return, encode_call, uint, MAIN_ABI, SECONDARY_ABI};
use super::{
    MainGovernance, MainProposal, MirrorRequest, ProposalId, ProposalStatus, SecondaryGovernance,
    SecondaryMirror, SecondaryVoteCollection,
};
use crate::chain::{ChainConnectionManager, EthersConnector};
use crate::error::{ErrorKind, RelayerError, RelayerResult};
use crate::tx::{TransactionSubmitter, WriteRequest};

use async_trait::async_trait;
use ethers::abi::{Abi, Token};
use ethers::types::{Address, U256};
use std::sync::Arc;

/// Governance contract on one chain
struct ContractHandle {
    chain_id: u64,
    address: Address,
    abi: &'static Abi,
    connections: Arc<ChainConnectionManager<EthersConnector>>,
    submitter: Arc<TransactionSubmitter>,
}

impl ContractHandle {
    fn new(
        chain_id: u64,
        address: &str,
        abi: &'static Abi,
        connections: Arc<ChainConnectionManager<EthersConnector>>,
        submitter: Arc<TransactionSubmitter>,
    ) -> RelayerResult<Self> {
        let address: Address = address.parse().map_err(|e| {
            RelayerError::Config(format!(
                "Invalid governance address for chain {}: {}",
                chain_id, e
            ))
        })?;

        Ok(Self {
            chain_id,
            address,
            abi,
            connections,
            submitter,
        })
    }

    async fn latest_timestamp(&self) -> RelayerResult<u64> {
        self.connections
            .connection(self.chain_id)?
            .latest_timestamp()
            .await
    }

    async fn call(
        &self,
        function: &'static str,
        args: &[Token],
    ) -> RelayerResult<super::abi::TokenReader> {
        let data = encode_call(self.abi, function, args)?;
        let provider = self.connections.connection(self.chain_id)?;
        let output = provider.call(self.address, data).await?;
        decode_return(self.abi, function, &output)
    }

    async fn send(&self, function: &'static str, args: &[Token]) -> RelayerResult<()> {
        let data = encode_call(self.abi, function, args)?;
        self.submitter
            .submit(WriteRequest {
                chain_id: self.chain_id,
                to: self.address,
                data,
                label: function,
            })
            .await
            .map(|_| ())
    }
}

fn status(chain_id: u64, raw: u8) -> RelayerResult<ProposalStatus> {
    ProposalStatus::from_u8(raw).ok_or_else(|| {
        RelayerError::Abi(format!("chain {} returned unknown status {}", chain_id, raw))
    })
}

/// Client for the main governance module
pub struct MainGovernanceClient {
    contract: ContractHandle,
}

impl MainGovernanceClient {
    pub fn new(
        chain_id: u64,
        address: &str,
        connections: Arc<ChainConnectionManager<EthersConnector>>,
        submitter: Arc<TransactionSubmitter>,
    ) -> RelayerResult<Self> {
        Ok(Self {
            contract: ContractHandle::new(chain_id, address, &MAIN_ABI, connections, submitter)?,
        })
    }
}

#[async_trait]
impl MainGovernance for MainGovernanceClient {
    fn chain_id(&self) -> u64 {
        self.contract.chain_id
    }

    async fn latest_timestamp(&self) -> RelayerResult<u64> {
        self.contract.latest_timestamp().await
    }

    async fn proposal_ids(&self) -> RelayerResult<Vec<ProposalId>> {
        self.contract.call("getProposalIds", &[]).await?.u64_array()
    }

    async fn proposal(&self, id: ProposalId) -> RelayerResult<MainProposal> {
        let mut r = match self.contract.call("getProposalDetails", &[uint(id)]).await {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::Precondition => {
                return Err(RelayerError::ProposalNotFound { proposal_id: id })
            }
            Err(e) => return Err(e),
        };

        Ok(MainProposal {
            id,
            title: r.string()?,
            content_hash: r.bytes32()?,
            proposer: r.address()?,
            start_time: r.u64()?,
            end_time: r.u64()?,
            yes_votes: r.uint()?,
            no_votes: r.uint()?,
            status: status(self.contract.chain_id, r.u8()?)?,
            final_yes_votes: r.uint()?,
            final_no_votes: r.uint()?,
            vote_tally_finalized: r.boolean()?,
            executed: r.boolean()?,
        })
    }

    async fn secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
    ) -> RelayerResult<SecondaryVoteCollection> {
        let mut r = self
            .contract
            .call("getSecondaryChainVotes", &[uint(id), uint(chain_id)])
            .await?;

        Ok(SecondaryVoteCollection {
            proposal_id: id,
            chain_id,
            yes_votes: r.uint()?,
            no_votes: r.uint()?,
            collected: r.boolean()?,
        })
    }

    async fn registered_chains(&self) -> RelayerResult<Vec<u64>> {
        self.contract.call("getRegisteredChains", &[]).await?.u64_array()
    }

    async fn collect_secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
        yes_votes: U256,
        no_votes: U256,
    ) -> RelayerResult<()> {
        self.contract
            .send(
                "collectSecondaryChainVotes",
                &[
                    uint(id),
                    uint(chain_id),
                    Token::Uint(yes_votes),
                    Token::Uint(no_votes),
                ],
            )
            .await
    }

    async fn finalize_proposal_votes(&self, id: ProposalId) -> RelayerResult<()> {
        self.contract.send("finalizeProposalVotes", &[uint(id)]).await
    }

    async fn execute_proposal(&self, id: ProposalId) -> RelayerResult<()> {
        self.contract.send("executeProposal", &[uint(id)]).await
    }
}

/// Client for a secondary governance module
pub struct SecondaryGovernanceClient {
    contract: ContractHandle,
}

impl SecondaryGovernanceClient {
    pub fn new(
        chain_id: u64,
        address: &str,
        connections: Arc<ChainConnectionManager<EthersConnector>>,
        submitter: Arc<TransactionSubmitter>,
    ) -> RelayerResult<Self> {
        Ok(Self {
            contract: ContractHandle::new(
                chain_id,
                address,
                &SECONDARY_ABI,
                connections,
                submitter,
            )?,
        })
    }
}

#[async_trait]
impl SecondaryGovernance for SecondaryGovernanceClient {
    fn chain_id(&self) -> u64 {
        self.contract.chain_id
    }

    async fn latest_timestamp(&self) -> RelayerResult<u64> {
        self.contract.latest_timestamp().await
    }

    async fn proposal(&self, id: ProposalId) -> RelayerResult<Option<SecondaryMirror>> {
        // Unmirrored ids either revert with ProposalNotFound or read as zeroed storage
        let mut r = match self.contract.call("getProposalDetails", &[uint(id)]).await {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::Precondition => return Ok(None),
            Err(e) => return Err(e),
        };

        let title = r.string()?;
        let content_hash = r.bytes32()?;
        let start_time = r.u64()?;
        let end_time = r.u64()?;
        if start_time == 0 && end_time == 0 {
            return Ok(None);
        }

        Ok(Some(SecondaryMirror {
            id,
            title,
            content_hash,
            start_time,
            end_time,
            yes_votes: r.uint()?,
            no_votes: r.uint()?,
            status: status(self.contract.chain_id, r.u8()?)?,
            vote_finalized: r.boolean()?,
            proposer: r.address()?,
        }))
    }

    async fn mirror_proposal(&self, request: &MirrorRequest) -> RelayerResult<()> {
        self.contract
            .send(
                "mirrorProposal",
                &[
                    uint(request.id),
                    Token::String(request.title.clone()),
                    Token::FixedBytes(request.content_hash.to_vec()),
                    uint(request.start_time),
                    uint(request.end_time),
                    Token::Address(request.proposer),
                ],
            )
            .await
    }

    async fn finalize_votes(&self, id: ProposalId) -> RelayerResult<()> {
        self.contract.send("finalizeVotes", &[uint(id)]).await
    }

    async fn update_proposal_status(
        &self,
        id: ProposalId,
        status: ProposalStatus,
    ) -> RelayerResult<()> {
        self.contract
            .send(
                "updateProposalStatus",
                &[uint(id), Token::Uint(U256::from(status.as_u8()))],
            )
            .await
    }
}
