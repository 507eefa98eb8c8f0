//! Network boundary consumed by the pipeline.

use boltd_consensus::Hash256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The peer channel died mid-request.
    ChannelClosed(String),
    Timeout,
    /// A requested block was not served.
    NotFound(Hash256),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::ChannelClosed(reason) => write!(f, "peer channel closed: {reason}"),
            FetchError::Timeout => write!(f, "block request timed out"),
            FetchError::NotFound(hash) => write!(
                f,
                "block {} not served",
                boltd_primitives::hash::hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for FetchError {}

/// Serves raw block payloads for a list of header hashes. Implementations
/// own all wire-level concerns; errors surface as channel failures and the
/// pipeline retries the batch rather than terminating.
pub trait BlockFetcher: Send + Sync {
    fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, FetchError>;
}
