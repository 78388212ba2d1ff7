//! Local relayer state
//!
//! Handles:
//! - The idempotency cache of settled proposals
//! - Whole-file JSON persistence for restart recovery
//! - Rebuild from on-chain flags when the file is missing or unreadable

mod cache;

pub use cache::{CacheStats, IdempotencyCache, ProposalRecord};
