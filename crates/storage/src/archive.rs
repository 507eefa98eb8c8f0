//! Partitioned block archive: one file per batch index.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use boltd_log::log_warn;
use fs2::FileExt;

const LOCK_RETRIES: u32 = 5;
const LOCK_BACKOFF_MS: u64 = 50;

#[derive(Debug)]
pub enum ArchiveError {
    Io(std::io::Error),
    /// The partition file stayed locked by another writer through every
    /// retry.
    Busy(u32),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "{err}"),
            ArchiveError::Busy(index) => {
                write!(f, "archive partition {index} is locked by another writer")
            }
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err)
    }
}

/// Sequential container of raw block bytes, one partition file per batch
/// index, named `blk{index:05}.dat`.
pub struct BlockArchive {
    dir: PathBuf,
}

impl BlockArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("blk{index:05}.dat"))
    }

    pub fn exists(&self, index: u32) -> bool {
        self.partition_path(index).exists()
    }

    pub fn read(&self, index: u32) -> Result<Vec<u8>, ArchiveError> {
        Ok(fs::read(self.partition_path(index))?)
    }

    /// Write one partition, taking an exclusive lock with bounded
    /// retry/backoff so a concurrent reader or straggling writer does not
    /// fail the pipeline outright.
    pub fn write(&self, index: u32, buffer: &[u8]) -> Result<(), ArchiveError> {
        let path = self.partition_path(index);
        let mut backoff = Duration::from_millis(LOCK_BACKOFF_MS);
        for attempt in 0..LOCK_RETRIES {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut file = file;
                    file.set_len(0)?;
                    file.write_all(buffer)?;
                    file.sync_all()?;
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    log_warn!(
                        "archive partition {index} busy (attempt {}), retrying",
                        attempt + 1
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => return Err(ArchiveError::Io(err)),
            }
        }
        Err(ArchiveError::Busy(index))
    }
}
