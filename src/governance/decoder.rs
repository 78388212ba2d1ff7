//! Best-effort decoding of governance module revert payloads
//!
//! Custom errors are matched by their 4-byte selector against the catalogue
//! below. The standard `Error(string)` and `Panic(uint256)` payloads are
//! recognised as well. Anything else is reported back as a [`DecodeError`] and
//! callers fall back to logging the raw bytes.

use crate::error::{classify_message, ErrorKind};

use ethers::abi::{self, ParamType, Token};
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Selector of `Error(string)`
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of `Panic(uint256)`
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// How the workflow should treat a decoded revert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertClass {
    AlreadyDone,
    Precondition,
    Other,
}

#[derive(Debug, Clone, Copy)]
enum Param {
    Uint256,
    Uint8,
    Address,
}

impl Param {
    fn param_type(self) -> ParamType {
        match self {
            Param::Uint256 => ParamType::Uint(256),
            Param::Uint8 => ParamType::Uint(8),
            Param::Address => ParamType::Address,
        }
    }
}

struct KnownError {
    name: &'static str,
    params: &'static [Param],
    class: RevertClass,
}

const CATALOGUE: &[KnownError] = &[
    KnownError { name: "ProposalNotFound", params: &[Param::Uint256], class: RevertClass::Precondition },
    KnownError { name: "ProposalAlreadyExists", params: &[Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "ProposalAlreadyMirrored", params: &[Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "VotingPeriodNotEnded", params: &[Param::Uint256], class: RevertClass::Precondition },
    KnownError { name: "VotingPeriodEnded", params: &[Param::Uint256], class: RevertClass::Other },
    KnownError { name: "VotesAlreadyFinalized", params: &[Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "VotesNotFinalized", params: &[Param::Uint256], class: RevertClass::Precondition },
    KnownError { name: "VotesAlreadyCollected", params: &[Param::Uint256, Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "SecondaryVotesNotCollected", params: &[Param::Uint256, Param::Uint256], class: RevertClass::Precondition },
    KnownError { name: "VoteTallyAlreadyFinalized", params: &[Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "VoteTallyNotFinalized", params: &[Param::Uint256], class: RevertClass::Precondition },
    KnownError { name: "ProposalAlreadyExecuted", params: &[Param::Uint256], class: RevertClass::AlreadyDone },
    KnownError { name: "ProposalNotAccepted", params: &[Param::Uint256], class: RevertClass::Other },
    KnownError { name: "StatusAlreadySet", params: &[Param::Uint256, Param::Uint8], class: RevertClass::AlreadyDone },
    KnownError { name: "ChainNotRegistered", params: &[Param::Uint256], class: RevertClass::Other },
    KnownError { name: "AlreadyVoted", params: &[Param::Uint256, Param::Address], class: RevertClass::Other },
    KnownError { name: "Unauthorized", params: &[Param::Address], class: RevertClass::Other },
];

lazy_static! {
    static ref DECODER: ErrorDecoder = ErrorDecoder::new();
}

/// Why a payload could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload shorter than a selector ({0} bytes)")]
    TooShort(usize),

    #[error("unknown error selector 0x{0}")]
    UnknownSelector(String),

    #[error("malformed arguments for {name}: {message}")]
    Malformed { name: String, message: String },
}

/// A revert rendered as `Name(args)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRevert {
    pub name: String,
    pub args: Vec<String>,
    pub class: RevertClass,
}

impl fmt::Display for DecodedRevert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(", "))
    }
}

struct Entry {
    name: &'static str,
    params: Vec<ParamType>,
    class: RevertClass,
}

/// Decoder over the governance modules' error interface
pub struct ErrorDecoder {
    by_selector: HashMap<[u8; 4], Entry>,
}

impl ErrorDecoder {
    fn new() -> Self {
        let by_selector = CATALOGUE
            .iter()
            .map(|known| {
                let params: Vec<ParamType> = known.params.iter().map(|p| p.param_type()).collect();
                let selector = selector(known.name, &params);
                (
                    selector,
                    Entry {
                        name: known.name,
                        params,
                        class: known.class,
                    },
                )
            })
            .collect();

        Self { by_selector }
    }

    /// Shared decoder instance
    pub fn global() -> &'static ErrorDecoder {
        &DECODER
    }

    /// Decode a raw revert payload
    pub fn decode(&self, data: &[u8]) -> Result<DecodedRevert, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::TooShort(data.len()));
        }

        let mut sel = [0u8; 4];
        sel.copy_from_slice(&data[..4]);
        let body = &data[4..];

        if sel == ERROR_STRING_SELECTOR {
            let tokens = decode_args("Error", &[ParamType::String], body)?;
            let reason = tokens
                .into_iter()
                .next()
                .and_then(|t| t.into_string())
                .unwrap_or_default();
            let class = match classify_message(&reason) {
                ErrorKind::AlreadyDone => RevertClass::AlreadyDone,
                ErrorKind::Precondition => RevertClass::Precondition,
                _ => RevertClass::Other,
            };
            return Ok(DecodedRevert {
                name: "Error".to_string(),
                args: vec![format!("{:?}", reason)],
                class,
            });
        }

        if sel == PANIC_SELECTOR {
            let tokens = decode_args("Panic", &[ParamType::Uint(256)], body)?;
            return Ok(DecodedRevert {
                name: "Panic".to_string(),
                args: tokens.iter().map(render_token).collect(),
                class: RevertClass::Other,
            });
        }

        let entry = self
            .by_selector
            .get(&sel)
            .ok_or_else(|| DecodeError::UnknownSelector(hex::encode(sel)))?;
        let tokens = decode_args(entry.name, &entry.params, body)?;

        Ok(DecodedRevert {
            name: entry.name.to_string(),
            args: tokens.iter().map(render_token).collect(),
            class: entry.class,
        })
    }

    /// Decode for logging: `Name(args)` or the raw hex payload
    pub fn describe(&self, data: &[u8]) -> String {
        match self.decode(data) {
            Ok(decoded) => decoded.to_string(),
            Err(e) => {
                tracing::debug!("Undecodable revert payload: {}", e);
                format!("0x{}", hex::encode(data))
            }
        }
    }

    /// Build a revert payload for a catalogue error
    #[cfg(test)]
    pub fn encode(&self, name: &str, args: &[Token]) -> Option<ethers::types::Bytes> {
        let (sel, _) = self.by_selector.iter().find(|(_, e)| e.name == name)?;
        let mut out = sel.to_vec();
        out.extend(abi::encode(args));
        Some(out.into())
    }
}

fn selector(name: &str, params: &[ParamType]) -> [u8; 4] {
    let signature = format!(
        "{}({})",
        name,
        params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    let hash = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

fn decode_args(name: &str, params: &[ParamType], body: &[u8]) -> Result<Vec<Token>, DecodeError> {
    abi::decode(params, body).map_err(|e| DecodeError::Malformed {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn render_token(token: &Token) -> String {
    match token {
        Token::Uint(v) | Token::Int(v) => v.to_string(),
        Token::Address(a) => format!("{:?}", a),
        Token::String(s) => format!("{:?}", s),
        Token::Bool(b) => b.to_string(),
        Token::FixedBytes(b) | Token::Bytes(b) => format!("0x{}", hex::encode(b)),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    #[test]
    fn test_standard_selectors_match_keccak() {
        assert_eq!(selector("Error", &[ParamType::String]), ERROR_STRING_SELECTOR);
        assert_eq!(selector("Panic", &[ParamType::Uint(256)]), PANIC_SELECTOR);
    }

    #[test]
    fn test_decode_custom_error() {
        let decoder = ErrorDecoder::global();
        let data = decoder
            .encode(
                "VotesAlreadyCollected",
                &[Token::Uint(U256::from(42)), Token::Uint(U256::from(137))],
            )
            .unwrap();

        let decoded = decoder.decode(&data).unwrap();
        assert_eq!(decoded.to_string(), "VotesAlreadyCollected(42, 137)");
        assert_eq!(decoded.class, RevertClass::AlreadyDone);
    }

    #[test]
    fn test_decode_error_string() {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::String(
            "Voting period not ended".to_string(),
        )]));

        let decoded = ErrorDecoder::global().decode(&data).unwrap();
        assert_eq!(decoded.name, "Error");
        assert_eq!(decoded.class, RevertClass::Precondition);
    }

    #[test]
    fn test_unknown_payload_degrades_to_raw() {
        let decoder = ErrorDecoder::global();
        assert!(matches!(
            decoder.decode(&[0xde, 0xad, 0xbe, 0xef, 0x00]),
            Err(DecodeError::UnknownSelector(_))
        ));
        assert!(matches!(decoder.decode(&[0x01]), Err(DecodeError::TooShort(1))));
        assert_eq!(decoder.describe(&[0xde, 0xad, 0xbe, 0xef]), "0xdeadbeef");
    }
}
