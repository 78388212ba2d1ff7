//! Governance event types and parsing
//!
//! Defines the events emitted by the main and secondary governance modules
//! and the triggers each one produces for the finalization workflow.

use crate::coordination::Trigger;
use crate::error::{RelayerError, RelayerResult};
use crate::governance::abi::{to_u64, MAIN_ABI, SECONDARY_ABI};
use crate::governance::{ProposalId, ProposalStatus};

use ethers::abi::{Abi, RawLog, Token};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};

/// Which governance module a ledger runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainRole {
    Main,
    Secondary,
}

/// Events emitted by the governance modules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GovernanceEvent {
    /// Proposal created on main
    ProposalCreated {
        chain_id: u64,
        proposal_id: ProposalId,
        block_number: u64,
        tx_hash: H256,
    },

    /// Proposal executed (or its outcome recorded) on main
    ProposalExecuted {
        chain_id: u64,
        proposal_id: ProposalId,
        status: Option<ProposalStatus>,
        block_number: u64,
        tx_hash: H256,
    },

    /// Secondary tally closed
    VotesTallied {
        chain_id: u64,
        proposal_id: ProposalId,
        yes_votes: U256,
        no_votes: U256,
        block_number: u64,
        tx_hash: H256,
    },

    /// Log from the governance address that matches no known event
    Unknown {
        chain_id: u64,
        topic: H256,
        block_number: u64,
        tx_hash: H256,
    },
}

impl GovernanceEvent {
    /// Get the chain ID for this event
    pub fn chain_id(&self) -> u64 {
        match self {
            GovernanceEvent::ProposalCreated { chain_id, .. } => *chain_id,
            GovernanceEvent::ProposalExecuted { chain_id, .. } => *chain_id,
            GovernanceEvent::VotesTallied { chain_id, .. } => *chain_id,
            GovernanceEvent::Unknown { chain_id, .. } => *chain_id,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            GovernanceEvent::ProposalCreated { .. } => "proposal_created",
            GovernanceEvent::ProposalExecuted { .. } => "proposal_executed",
            GovernanceEvent::VotesTallied { .. } => "votes_tallied",
            GovernanceEvent::Unknown { .. } => "unknown",
        }
    }

    /// Workflow triggers produced by this event
    pub fn triggers(&self, secondary_chains: &[u64]) -> Vec<Trigger> {
        match self {
            GovernanceEvent::ProposalCreated { proposal_id, .. } => secondary_chains
                .iter()
                .map(|chain_id| Trigger::Mirror {
                    proposal_id: *proposal_id,
                    chain_id: *chain_id,
                })
                .collect(),
            GovernanceEvent::ProposalExecuted { proposal_id, .. } => {
                vec![Trigger::StatusSync {
                    proposal_id: *proposal_id,
                }]
            }
            GovernanceEvent::VotesTallied {
                chain_id,
                proposal_id,
                ..
            } => vec![Trigger::CollectVotes {
                proposal_id: *proposal_id,
                chain_id: *chain_id,
            }],
            GovernanceEvent::Unknown { .. } => Vec::new(),
        }
    }
}

/// Parses governance module logs for one ledger
pub struct EventParser {
    chain_id: u64,
    role: ChainRole,
}

impl EventParser {
    pub fn new(chain_id: u64, role: ChainRole) -> Self {
        Self { chain_id, role }
    }

    fn abi(&self) -> &'static Abi {
        match self.role {
            ChainRole::Main => &MAIN_ABI,
            ChainRole::Secondary => &SECONDARY_ABI,
        }
    }

    /// Parse a log entry into a GovernanceEvent
    pub fn parse_log(&self, log: &Log) -> RelayerResult<GovernanceEvent> {
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let topic = log.topics.first().copied().unwrap_or_default();

        let event = match self
            .abi()
            .events()
            .find(|event| event.signature() == topic)
        {
            Some(event) => event,
            None => {
                return Ok(GovernanceEvent::Unknown {
                    chain_id: self.chain_id,
                    topic,
                    block_number,
                    tx_hash,
                })
            }
        };

        let parsed = event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| RelayerError::EventParsing(format!("{}: {}", event.name, e)))?;
        let values: Vec<Token> = parsed.params.into_iter().map(|p| p.value).collect();

        let proposal_id = values
            .first()
            .and_then(|t| t.clone().into_uint())
            .and_then(to_u64)
            .ok_or_else(|| {
                RelayerError::EventParsing(format!("{}: invalid proposal id", event.name))
            })?;
        let uint_at = |index: usize| values.get(index).and_then(|t| t.clone().into_uint());

        match event.name.as_str() {
            "ProposalCreated" => Ok(GovernanceEvent::ProposalCreated {
                chain_id: self.chain_id,
                proposal_id,
                block_number,
                tx_hash,
            }),
            "ProposalExecuted" => Ok(GovernanceEvent::ProposalExecuted {
                chain_id: self.chain_id,
                proposal_id,
                status: uint_at(1)
                    .filter(|v| *v <= U256::from(u8::MAX))
                    .and_then(|v| ProposalStatus::from_u8(v.low_u32() as u8)),
                block_number,
                tx_hash,
            }),
            "VotesTallied" => Ok(GovernanceEvent::VotesTallied {
                chain_id: self.chain_id,
                proposal_id,
                yes_votes: uint_at(1).unwrap_or_default(),
                no_votes: uint_at(2).unwrap_or_default(),
                block_number,
                tx_hash,
            }),
            other => Err(RelayerError::EventParsing(format!(
                "unhandled event {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;

    fn id_topic(id: u64) -> H256 {
        let mut buf = [0u8; 32];
        U256::from(id).to_big_endian(&mut buf);
        H256::from(buf)
    }

    fn log(abi: &Abi, name: &str, id: u64, data: Vec<Token>) -> Log {
        let event = abi.event(name).unwrap();
        Log {
            topics: vec![event.signature(), id_topic(id)],
            data: encode(&data).into(),
            block_number: Some(U64::from(42)),
            transaction_hash: Some(H256::repeat_byte(0xab)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_proposal_created() {
        let parser = EventParser::new(1, ChainRole::Main);
        let event = parser
            .parse_log(&log(&MAIN_ABI, "ProposalCreated", 7, vec![]))
            .unwrap();

        assert_eq!(
            event,
            GovernanceEvent::ProposalCreated {
                chain_id: 1,
                proposal_id: 7,
                block_number: 42,
                tx_hash: H256::repeat_byte(0xab),
            }
        );
        assert_eq!(
            event.triggers(&[137, 10]),
            vec![
                Trigger::Mirror {
                    proposal_id: 7,
                    chain_id: 137
                },
                Trigger::Mirror {
                    proposal_id: 7,
                    chain_id: 10
                },
            ]
        );
    }

    #[test]
    fn test_parse_votes_tallied() {
        let parser = EventParser::new(137, ChainRole::Secondary);
        let event = parser
            .parse_log(&log(
                &SECONDARY_ABI,
                "VotesTallied",
                3,
                vec![Token::Uint(1000.into()), Token::Uint(25.into())],
            ))
            .unwrap();

        match &event {
            GovernanceEvent::VotesTallied {
                proposal_id,
                yes_votes,
                no_votes,
                ..
            } => {
                assert_eq!(*proposal_id, 3);
                assert_eq!(*yes_votes, U256::from(1000));
                assert_eq!(*no_votes, U256::from(25));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            event.triggers(&[137]),
            vec![Trigger::CollectVotes {
                proposal_id: 3,
                chain_id: 137
            }]
        );
    }

    #[test]
    fn test_parse_proposal_executed() {
        let parser = EventParser::new(1, ChainRole::Main);
        let event = parser
            .parse_log(&log(
                &MAIN_ABI,
                "ProposalExecuted",
                9,
                vec![Token::Uint(3.into())],
            ))
            .unwrap();

        assert_eq!(event.name(), "proposal_executed");
        assert!(matches!(
            event,
            GovernanceEvent::ProposalExecuted {
                status: Some(ProposalStatus::Executed),
                ..
            }
        ));
        assert_eq!(
            event.triggers(&[137]),
            vec![Trigger::StatusSync { proposal_id: 9 }]
        );
    }

    #[test]
    fn test_foreign_log_is_unknown() {
        // VotesTallied is not part of the main module's surface
        let parser = EventParser::new(1, ChainRole::Main);
        let event = parser
            .parse_log(&log(&SECONDARY_ABI, "VotesTallied", 1, vec![
                Token::Uint(1.into()),
                Token::Uint(2.into()),
            ]))
            .unwrap();

        assert!(matches!(event, GovernanceEvent::Unknown { chain_id: 1, .. }));
        assert!(event.triggers(&[137]).is_empty());
    }
}
