//! Governance module ABIs and token helpers
//!
//! Human-readable ABI fragments for the main and secondary modules. Reads and
//! writes are encoded against these and return data is decoded positionally.

use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{parse_abi, Abi, Token};
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;

lazy_static! {
    pub static ref MAIN_ABI: Abi = parse_abi(&[
        "function getProposalIds() view returns (uint256[])",
        "function getProposalDetails(uint256) view returns (string,bytes32,address,uint256,uint256,uint256,uint256,uint8,uint256,uint256,bool,bool)",
        "function getSecondaryChainVotes(uint256,uint256) view returns (uint256,uint256,bool)",
        "function getRegisteredChains() view returns (uint256[])",
        "function collectSecondaryChainVotes(uint256,uint256,uint256,uint256)",
        "function finalizeProposalVotes(uint256)",
        "function executeProposal(uint256)",
        "function castVote(uint256,bool)",
        "function createProposal(string,bytes32,uint256) returns (uint256)",
        "event ProposalCreated(uint256 indexed proposalId)",
        "event ProposalExecuted(uint256 indexed proposalId, uint8 status)",
    ])
    .expect("valid main governance ABI");

    pub static ref SECONDARY_ABI: Abi = parse_abi(&[
        "function getProposalDetails(uint256) view returns (string,bytes32,uint256,uint256,uint256,uint256,uint8,bool,address)",
        "function mirrorProposal(uint256,string,bytes32,uint256,uint256,address)",
        "function finalizeVotes(uint256)",
        "function updateProposalStatus(uint256,uint8)",
        "function castVote(uint256,bool)",
        "event VotesTallied(uint256 indexed proposalId, uint256 yesVotes, uint256 noVotes)",
    ])
    .expect("valid secondary governance ABI");
}

/// Encode calldata for `function` of `abi`
pub fn encode_call(abi: &Abi, function: &str, args: &[Token]) -> RelayerResult<Bytes> {
    let f = abi
        .function(function)
        .map_err(|e| RelayerError::Abi(format!("{}: {}", function, e)))?;
    f.encode_input(args)
        .map(Bytes::from)
        .map_err(|e| RelayerError::Abi(format!("encode {}: {}", function, e)))
}

/// Decode the return data of `function`
pub fn decode_return(abi: &Abi, function: &'static str, data: &[u8]) -> RelayerResult<TokenReader> {
    let f = abi
        .function(function)
        .map_err(|e| RelayerError::Abi(format!("{}: {}", function, e)))?;
    let tokens = f
        .decode_output(data)
        .map_err(|e| RelayerError::Abi(format!("decode {}: {}", function, e)))?;
    Ok(TokenReader::new(function, tokens))
}

pub fn uint(n: u64) -> Token {
    Token::Uint(U256::from(n))
}

/// Sequential reader over decoded return values
pub struct TokenReader {
    context: &'static str,
    tokens: std::vec::IntoIter<Token>,
}

impl TokenReader {
    pub fn new(context: &'static str, tokens: Vec<Token>) -> Self {
        Self {
            context,
            tokens: tokens.into_iter(),
        }
    }

    fn next(&mut self, expected: &str) -> RelayerResult<Token> {
        self.tokens.next().ok_or_else(|| {
            RelayerError::Abi(format!("{}: missing {} value", self.context, expected))
        })
    }

    fn mismatch(&self, expected: &str, got: &Token) -> RelayerError {
        RelayerError::Abi(format!("{}: expected {}, got {:?}", self.context, expected, got))
    }

    pub fn uint(&mut self) -> RelayerResult<U256> {
        match self.next("uint")? {
            Token::Uint(v) => Ok(v),
            other => Err(self.mismatch("uint", &other)),
        }
    }

    pub fn u64(&mut self) -> RelayerResult<u64> {
        let v = self.uint()?;
        to_u64(v).ok_or_else(|| RelayerError::Abi(format!("{}: {} exceeds u64", self.context, v)))
    }

    pub fn u8(&mut self) -> RelayerResult<u8> {
        let v = self.uint()?;
        if v > U256::from(u8::MAX) {
            return Err(RelayerError::Abi(format!("{}: {} exceeds u8", self.context, v)));
        }
        Ok(v.low_u32() as u8)
    }

    pub fn boolean(&mut self) -> RelayerResult<bool> {
        match self.next("bool")? {
            Token::Bool(b) => Ok(b),
            other => Err(self.mismatch("bool", &other)),
        }
    }

    pub fn string(&mut self) -> RelayerResult<String> {
        match self.next("string")? {
            Token::String(s) => Ok(s),
            other => Err(self.mismatch("string", &other)),
        }
    }

    pub fn address(&mut self) -> RelayerResult<Address> {
        match self.next("address")? {
            Token::Address(a) => Ok(a),
            other => Err(self.mismatch("address", &other)),
        }
    }

    pub fn bytes32(&mut self) -> RelayerResult<[u8; 32]> {
        match self.next("bytes32")? {
            Token::FixedBytes(b) if b.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&b);
                Ok(out)
            }
            other => Err(self.mismatch("bytes32", &other)),
        }
    }

    pub fn u64_array(&mut self) -> RelayerResult<Vec<u64>> {
        match self.next("uint256[]")? {
            Token::Array(items) => {
                let mut inner = TokenReader::new(self.context, items);
                let mut out = Vec::new();
                while inner.tokens.len() > 0 {
                    out.push(inner.u64()?);
                }
                Ok(out)
            }
            other => Err(self.mismatch("uint256[]", &other)),
        }
    }
}

pub fn to_u64(v: U256) -> Option<u64> {
    if v > U256::from(u64::MAX) {
        None
    } else {
        Some(v.as_u64())
    }
}
