//! Consensus constants and per-network chain parameters.

pub mod money;
pub mod params;

pub use params::{consensus_params, hash256_from_hex, Checkpoint, ConsensusParams, Network};

/// A 256-bit hash in little-endian byte order, as it appears on the wire.
pub type Hash256 = [u8; 32];
