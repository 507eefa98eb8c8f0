//! Double-buffered snapshot directory rotation.
//!
//! A snapshot write stages every file into `incoming`, then rotates
//! `current` to `previous` and renames `incoming` into place. A crash at
//! any point leaves at least one complete generation on disk.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    /// No readable snapshot generation exists.
    NoSnapshot,
    Corrupt(&'static str),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Io(err) => write!(f, "{err}"),
            SnapshotError::NoSnapshot => write!(f, "no snapshot present"),
            SnapshotError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

pub struct SnapshotSlots {
    root: PathBuf,
}

impl SnapshotSlots {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn previous_dir(&self) -> PathBuf {
        self.root.join("previous")
    }

    fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    /// Fallback order for loading: newest generation first.
    pub fn generations(&self) -> [PathBuf; 2] {
        [self.current_dir(), self.previous_dir()]
    }

    /// Start a snapshot write: returns an empty staging directory.
    pub fn begin(&self) -> Result<PathBuf, SnapshotError> {
        let incoming = self.incoming_dir();
        if incoming.exists() {
            fs::remove_dir_all(&incoming)?;
        }
        fs::create_dir_all(&incoming)?;
        Ok(incoming)
    }

    /// Publish the staged snapshot: `current` becomes `previous`, the
    /// staging directory becomes `current`.
    pub fn commit(&self) -> Result<(), SnapshotError> {
        let current = self.current_dir();
        let previous = self.previous_dir();
        if current.exists() {
            if previous.exists() {
                fs::remove_dir_all(&previous)?;
            }
            fs::rename(&current, &previous)?;
        }
        fs::rename(self.incoming_dir(), &current)?;
        Ok(())
    }

    /// Drop a staged snapshot without publishing it.
    pub fn abandon(&self) -> Result<(), SnapshotError> {
        let incoming = self.incoming_dir();
        if incoming.exists() {
            fs::remove_dir_all(&incoming)?;
        }
        Ok(())
    }

    /// Remove every generation (used when recovery falls back to genesis).
    pub fn clear(&self) -> Result<(), SnapshotError> {
        for dir in [self.current_dir(), self.previous_dir(), self.incoming_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

pub fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>, SnapshotError> {
    Ok(fs::read(dir.join(name))?)
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), SnapshotError> {
    let path = dir.join(name);
    fs::write(&path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_two_generations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let slots = SnapshotSlots::new(dir.path()).expect("slots");

        let staging = slots.begin().expect("begin");
        write_file(&staging, "state", b"gen1").expect("write");
        slots.commit().expect("commit");
        assert_eq!(read_file(&slots.current_dir(), "state").expect("read"), b"gen1");

        let staging = slots.begin().expect("begin");
        write_file(&staging, "state", b"gen2").expect("write");
        slots.commit().expect("commit");
        assert_eq!(read_file(&slots.current_dir(), "state").expect("read"), b"gen2");
        assert_eq!(
            read_file(&slots.previous_dir(), "state").expect("read"),
            b"gen1"
        );

        let generations = slots.generations();
        assert!(generations[0].ends_with("current"));
        assert!(generations[1].ends_with("previous"));
    }

    #[test]
    fn abandon_discards_staging() {
        let dir = tempfile::tempdir().expect("tempdir");
        let slots = SnapshotSlots::new(dir.path()).expect("slots");
        let staging = slots.begin().expect("begin");
        write_file(&staging, "state", b"half written").expect("write");
        slots.abandon().expect("abandon");
        assert!(!slots.current_dir().exists());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let slots = SnapshotSlots::new(dir.path()).expect("slots");
        let staging = slots.begin().expect("begin");
        write_file(&staging, "state", b"gen1").expect("write");
        slots.commit().expect("commit");
        slots.clear().expect("clear");
        assert!(!slots.current_dir().exists());
        assert!(!slots.previous_dir().exists());
    }
}
