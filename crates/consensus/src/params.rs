//! Consensus parameter definitions.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// Highest admissible proof-of-work target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_retarget_interval: i64,
    pub pow_retarget_timespan: i64,
    /// Per-retarget clamp: actual timespan is bounded to
    /// `timespan / factor ..= timespan * factor`.
    pub pow_max_adjust_factor: i64,
    /// Header timestamps may run at most this far ahead of wall-clock time.
    pub max_future_block_time_secs: u32,
    /// Number of prior headers over which the median-time-past is taken.
    pub median_time_span: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_reward: Amount,
    pub genesis_coinbase_message: &'static str,
}

impl ConsensusParams {
    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.height == height)
    }

    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints.iter().map(|c| c.height).max().unwrap_or(0)
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

const GENESIS_COINBASE_MESSAGE: &str =
    "bolt genesis 2021-04-17: index what you keep, forget what is spent";

fn mainnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        pow_limit: pow_limit_from_exponent(0x1d00ffff),
        pow_target_spacing: 600,
        pow_retarget_interval: 2016,
        pow_retarget_timespan: 14 * 24 * 60 * 60,
        pow_max_adjust_factor: 4,
        max_future_block_time_secs: 2 * 60 * 60,
        median_time_span: 11,
        checkpoints: Vec::new(),
        genesis_time: 1_618_704_000,
        genesis_bits: 0x1d00ffff,
        genesis_nonce: 0x6b2d_0f41,
        genesis_reward: 50 * COIN,
        genesis_coinbase_message: GENESIS_COINBASE_MESSAGE,
    }
}

fn testnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        genesis_time: 1_618_704_600,
        genesis_nonce: 0x0000_1f2e,
        ..mainnet_params()
    }
}

fn regtest_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        pow_limit: pow_limit_from_exponent(0x207fffff),
        pow_retarget_interval: 150,
        genesis_time: 1_618_705_200,
        genesis_bits: 0x207fffff,
        genesis_nonce: 2,
        ..mainnet_params()
    }
}

/// Expand a compact-encoded limit into its full little-endian target.
fn pow_limit_from_exponent(bits: u32) -> Hash256 {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007f_ffff;
    let mut out = [0u8; 32];
    if size <= 3 {
        let shifted = word >> (8 * (3 - size));
        out[..4].copy_from_slice(&shifted.to_le_bytes());
    } else {
        let bytes = word.to_le_bytes();
        for i in 0..3 {
            let position = size - 3 + i;
            if position < 32 {
                out[position] = bytes[i];
            }
        }
    }
    out
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a display-order (big-endian) hex hash into little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim().trim_start_matches("0x");
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_limit_expansion() {
        let limit = pow_limit_from_exponent(0x1d00ffff);
        // 0x00000000ffff0000...0000 big-endian, so the two 0xff bytes sit at
        // little-endian positions 26 and 27.
        assert_eq!(limit[26], 0xff);
        assert_eq!(limit[27], 0xff);
        assert!(limit[28..].iter().all(|&b| b == 0));
        assert!(limit[..26].iter().all(|&b| b == 0));
    }

    #[test]
    fn hex_round_trip() {
        let hex = "00000000ffff0000000000000000000000000000000000000000000000000000";
        let hash = hash256_from_hex(hex).expect("parse");
        assert_eq!(hash, pow_limit_from_exponent(0x1d00ffff));
        assert!(hash256_from_hex("abcd").is_err());
    }

    #[test]
    fn network_parse() {
        assert_eq!(Network::parse("mainnet"), Some(Network::Mainnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("nope"), None);
    }
}
