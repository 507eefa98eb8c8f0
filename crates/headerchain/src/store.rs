//! Flat-file persistence of the main-chain headers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use boltd_primitives::block::{BlockHeader, HEADER_SIZE};

#[derive(Debug)]
pub enum HeaderStoreError {
    Io(std::io::Error),
    TruncatedFile,
    Decode(boltd_primitives::encoding::DecodeError),
}

impl std::fmt::Display for HeaderStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderStoreError::Io(err) => write!(f, "{err}"),
            HeaderStoreError::TruncatedFile => write!(f, "header file length not a multiple of 80"),
            HeaderStoreError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeaderStoreError {}

impl From<std::io::Error> for HeaderStoreError {
    fn from(err: std::io::Error) -> Self {
        HeaderStoreError::Io(err)
    }
}

/// Concatenated 80-byte headers in chain order, rewritten atomically via a
/// temp file so a crash never leaves a half-written chain.
pub struct HeaderStore {
    path: PathBuf,
}

impl HeaderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<BlockHeader>, HeaderStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)?;
        if bytes.len() % HEADER_SIZE != 0 {
            return Err(HeaderStoreError::TruncatedFile);
        }
        let mut headers = Vec::with_capacity(bytes.len() / HEADER_SIZE);
        for chunk in bytes.chunks_exact(HEADER_SIZE) {
            headers.push(BlockHeader::consensus_decode(chunk).map_err(HeaderStoreError::Decode)?);
        }
        Ok(headers)
    }

    pub fn save(&self, headers: &[BlockHeader]) -> Result<(), HeaderStoreError> {
        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            for header in headers {
                file.write_all(&header.consensus_encode())?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boltd_primitives::block::CURRENT_VERSION;

    fn header(tag: u8) -> BlockHeader {
        BlockHeader {
            version: CURRENT_VERSION,
            prev_block: [tag; 32],
            merkle_root: [tag.wrapping_add(1); 32],
            time: 1_618_704_000 + u32::from(tag),
            bits: 0x207fffff,
            nonce: u32::from(tag),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HeaderStore::new(dir.path().join("headers.dat"));
        assert!(store.load().expect("empty load").is_empty());

        let headers = vec![header(0), header(1), header(2)];
        store.save(&headers).expect("save");
        assert_eq!(store.load().expect("load"), headers);
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.dat");
        fs::write(&path, [0u8; 79]).expect("write");
        let store = HeaderStore::new(path);
        assert!(matches!(
            store.load(),
            Err(HeaderStoreError::TruncatedFile)
        ));
    }
}
