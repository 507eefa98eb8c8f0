use boltd_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double-SHA-256 over the concatenation of several byte ranges, without
/// materializing the joined buffer.
pub fn sha256d_parts(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let first = hasher.finalize();
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// The low 32 bits of a transaction or header hash, used as a compact
/// (non-unique) index key.
pub fn truncated_key(hash: &Hash256) -> u32 {
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_match_contiguous() {
        let data = b"the quick brown fox";
        assert_eq!(sha256d(data), sha256d_parts(&[&data[..9], &data[9..]]));
        assert_eq!(sha256d(data), sha256d_parts(&[data]));
    }

    #[test]
    fn truncation_is_little_endian() {
        let mut hash = [0u8; 32];
        hash[0] = 0x78;
        hash[1] = 0x56;
        hash[2] = 0x34;
        hash[3] = 0x12;
        assert_eq!(truncated_key(&hash), 0x1234_5678);
    }
}
