//! Binary merkle root over transaction ids.

use boltd_consensus::Hash256;

use crate::hash::sha256d_parts;

/// Pairwise double-SHA-256 reduction; odd-length levels duplicate the last
/// node. A single id is its own root; an empty list hashes to zero.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    match txids.len() {
        0 => [0u8; 32],
        1 => txids[0],
        _ => {
            let mut level: Vec<Hash256> = txids.to_vec();
            while level.len() > 1 {
                if level.len() % 2 == 1 {
                    let last = level[level.len() - 1];
                    level.push(last);
                }
                let mut next = Vec::with_capacity(level.len() / 2);
                for pair in level.chunks_exact(2) {
                    next.push(sha256d_parts(&[&pair[0], &pair[1]]));
                }
                level = next;
            }
            level[0]
        }
    }
}
