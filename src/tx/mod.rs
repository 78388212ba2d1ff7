//! Transaction submission module with nonce management and gas pricing

mod dispatcher;
mod gas;
mod nonce;
mod sender;

pub use dispatcher::{load_wallet, EthersDispatcher};
pub use nonce::{NonceManager, ProviderNonceSource};
pub use sender::{TransactionSubmitter, WriteRequest};
