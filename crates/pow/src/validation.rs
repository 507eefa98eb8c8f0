//! Proof-of-work checks and the retarget schedule.

use boltd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, u256_to_compact, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    TargetAboveLimit,
    HashAboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "{err}"),
            PowError::TargetAboveLimit => write!(f, "target exceeds proof-of-work limit"),
            PowError::HashAboveTarget => write!(f, "header hash exceeds claimed target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Verify the proof-of-work claim: the compact target must decode, stay at
/// or below the network limit, and the header hash must not exceed it.
pub fn check_proof_of_work(
    header_hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let limit = U256::from_little_endian(&params.pow_limit);
    if target > limit {
        return Err(PowError::TargetAboveLimit);
    }
    let hash_value = U256::from_little_endian(header_hash);
    if hash_value > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

/// Compact target expected at `next_height`, given the tip header's bits
/// and, at retarget boundaries, the timestamps spanning the interval.
///
/// Off-boundary heights inherit the previous target. At a boundary the
/// previous target is scaled by the clamped actual timespan.
pub fn next_work_required(
    next_height: i64,
    tip_bits: u32,
    tip_time: u32,
    interval_start_time: u32,
    params: &ConsensusParams,
) -> Result<u32, PowError> {
    if next_height % params.pow_retarget_interval != 0 {
        return Ok(tip_bits);
    }

    let mut actual = i64::from(tip_time).saturating_sub(i64::from(interval_start_time));
    let min = params.pow_retarget_timespan / params.pow_max_adjust_factor;
    let max = params.pow_retarget_timespan * params.pow_max_adjust_factor;
    actual = actual.clamp(min, max);

    let old_target = compact_to_u256(tip_bits)?;
    let limit = U256::from_little_endian(&params.pow_limit);
    let new_target =
        old_target * U256::from(actual as u64) / U256::from(params.pow_retarget_timespan as u64);
    let new_target = new_target.min(limit);

    Ok(u256_to_compact(new_target))
}
