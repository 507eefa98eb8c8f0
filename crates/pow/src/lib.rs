//! Proof-of-work arithmetic: compact targets, per-header work, retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, compact_to_target, hash_meets_target, target_to_compact, CompactError,
};
pub use validation::{check_proof_of_work, next_work_required, PowError};
