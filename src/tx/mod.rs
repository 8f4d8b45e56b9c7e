//! Transaction submission with nonce management and gas buffering, plus the
//! EVM implementations of the chain dispatcher and bridge provider

mod bridge;
mod gas;
mod nonce;
mod sender;

pub use bridge::EvmBridgeProvider;
pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use sender::{EvmDispatcher, TransactionSender};
