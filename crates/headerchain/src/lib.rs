//! Header tree, fork choice and main-chain persistence.

pub mod chain;
pub mod store;

pub use chain::{ChainError, HeaderChain, HeaderId, InsertOutcome};
pub use store::{HeaderStore, HeaderStoreError};
