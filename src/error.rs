//! Error types for the governance relayer

use crate::governance::decoder::RevertClass;
use crate::governance::ErrorDecoder;

use ethers::types::{Bytes, H256};
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Chain {chain_id} has no live connection")]
    ChainUnavailable { chain_id: u64 },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Call reverted on chain {chain_id}: {message}")]
    Revert {
        chain_id: u64,
        message: String,
        data: Option<Bytes>,
    },

    #[error("Transaction {tx_hash:?} for {label} reverted on chain {chain_id}")]
    MinedRevert {
        chain_id: u64,
        tx_hash: H256,
        label: String,
    },

    #[error("Transaction {tx_hash:?} on chain {chain_id} not confirmed: {message}")]
    Unconfirmed {
        chain_id: u64,
        tx_hash: H256,
        message: String,
    },

    #[error("Transaction error on chain {chain_id}: {message}")]
    Transaction { chain_id: u64, message: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Proposal {proposal_id} not found")]
    ProposalNotFound { proposal_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes the workflow reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dropped connection, RPC timeout
    TransientNetwork,
    /// The remote module reports the action already happened
    AlreadyDone,
    /// Nonce too low or already used
    SequencingConflict,
    /// Remote precondition not met yet (e.g. voting still open)
    Precondition,
    /// Missing credential, unknown chain
    Configuration,
    Other,
}

const SEQUENCING_MARKERS: &[&str] = &[
    "nonce too low",
    "nonce has already been used",
    "already known",
    "replacement transaction underpriced",
    "invalid nonce",
];

const ALREADY_DONE_MARKERS: &[&str] = &[
    "already executed",
    "already finalized",
    "already collected",
    "already mirrored",
    "already exists",
    "already set",
];

const PRECONDITION_MARKERS: &[&str] = &[
    "not ended",
    "not yet",
    "not finalized",
    "not collected",
    "still active",
];

impl RelayerError {
    /// Classify this error against the relayer's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayerError::ChainConnection { .. }
            | RelayerError::ChainUnavailable { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::Unconfirmed { .. } => ErrorKind::TransientNetwork,
            RelayerError::Config(_) | RelayerError::ChainNotFound { .. } | RelayerError::Wallet(_) => {
                ErrorKind::Configuration
            }
            RelayerError::Nonce { message, .. } => {
                if matches_any(message, SEQUENCING_MARKERS) {
                    ErrorKind::SequencingConflict
                } else {
                    ErrorKind::TransientNetwork
                }
            }
            RelayerError::Revert { message, data, .. } => {
                if let Some(data) = data {
                    if let Ok(decoded) = ErrorDecoder::global().decode(data) {
                        match decoded.class {
                            RevertClass::AlreadyDone => return ErrorKind::AlreadyDone,
                            RevertClass::Precondition => return ErrorKind::Precondition,
                            RevertClass::Other => {}
                        }
                    }
                }
                classify_message(message)
            }
            RelayerError::Transaction { message, .. } | RelayerError::GasEstimation(message) => {
                classify_message(message)
            }
            _ => ErrorKind::Other,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::SequencingConflict
        )
    }

    /// Readable form of the error, decoding revert payloads where possible
    pub fn describe(&self) -> String {
        match self {
            RelayerError::Revert {
                chain_id,
                message,
                data: Some(data),
            } => match ErrorDecoder::global().decode(data) {
                Ok(decoded) => format!("chain {} reverted with {}", chain_id, decoded),
                Err(_) => format!(
                    "chain {} reverted ({}), raw payload 0x{}",
                    chain_id,
                    message,
                    hex::encode(data)
                ),
            },
            other => other.to_string(),
        }
    }
}

pub(crate) fn classify_message(message: &str) -> ErrorKind {
    if matches_any(message, SEQUENCING_MARKERS) {
        ErrorKind::SequencingConflict
    } else if matches_any(message, ALREADY_DONE_MARKERS) {
        ErrorKind::AlreadyDone
    } else if matches_any(message, PRECONDITION_MARKERS) {
        ErrorKind::Precondition
    } else {
        ErrorKind::Other
    }
}

fn matches_any(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
