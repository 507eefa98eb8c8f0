//! Crash-safe snapshot persistence for the UTXO engine.
//!
//! A snapshot generation holds a 40-byte progress record plus one
//! serialized file per index table. Recovery is three-tier: `current`
//! slot, then `previous`, then a cleared engine rebuilt from genesis.

use std::path::Path;

use boltd_log::{log_info, log_warn};
use boltd_primitives::encoding::{Decoder, Encoder};
use boltd_storage::snapshot::{read_file, write_file};
use boltd_storage::{SnapshotError, SnapshotSlots};
use rayon::prelude::*;

use crate::engine::UtxoTable;

const STATE_FILE: &str = "state";
const STATE_RECORD_LEN: usize = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    /// Loaded from the `current` slot.
    Current,
    /// `current` was unusable; loaded from `previous`.
    Previous,
    /// No usable generation; the engine was cleared for a genesis rebuild.
    Empty,
}

pub fn save_snapshot(table: &UtxoTable, slots: &SnapshotSlots) -> Result<(), SnapshotError> {
    let staging = slots.begin()?;
    match write_generation(table, &staging) {
        Ok(()) => {
            slots.commit()?;
            log_info!(
                "snapshot written at batch {}, height {}",
                table.archive_index(),
                table.block_height()
            );
            Ok(())
        }
        Err(err) => {
            let _ = slots.abandon();
            Err(err)
        }
    }
}

fn write_generation(table: &UtxoTable, staging: &Path) -> Result<(), SnapshotError> {
    let mut encoder = Encoder::with_capacity(STATE_RECORD_LEN);
    encoder.write_u32_le(table.archive_index());
    encoder.write_i32_le(table.block_height());
    encoder.write_hash_le(table.last_header_hash());
    write_file(staging, STATE_FILE, &encoder.into_inner())?;

    table
        .tables()
        .as_slice()
        .par_iter()
        .map(|t| write_file(staging, t.id().snapshot_file(), &t.write_snapshot()))
        .collect::<Result<(), SnapshotError>>()
}

/// Load the most recent usable snapshot generation. On total failure the
/// engine is cleared and `Empty` is returned so the caller rebuilds from
/// the genesis block.
pub fn load_snapshot(
    table: &mut UtxoTable,
    slots: &SnapshotSlots,
) -> Result<LoadOutcome, SnapshotError> {
    for (generation, dir) in slots.generations().iter().enumerate() {
        if !dir.exists() {
            continue;
        }
        match read_generation(table, dir) {
            Ok(()) => {
                let outcome = if generation == 0 {
                    LoadOutcome::Current
                } else {
                    LoadOutcome::Previous
                };
                log_info!(
                    "loaded snapshot from {}: batch {}, height {}",
                    dir.display(),
                    table.archive_index(),
                    table.block_height()
                );
                return Ok(outcome);
            }
            Err(err) => {
                log_warn!("snapshot in {} unusable: {err}", dir.display());
                table.clear();
            }
        }
    }

    table.clear();
    log_warn!("no usable snapshot, rebuilding from genesis");
    Ok(LoadOutcome::Empty)
}

fn read_generation(table: &mut UtxoTable, dir: &Path) -> Result<(), SnapshotError> {
    let record = read_file(dir, STATE_FILE)?;
    if record.len() != STATE_RECORD_LEN {
        return Err(SnapshotError::Corrupt("state record has wrong length"));
    }
    let mut decoder = Decoder::new(&record);
    let archive_index = decoder
        .read_u32_le()
        .map_err(|_| SnapshotError::Corrupt("state record truncated"))?;
    let block_height = decoder
        .read_i32_le()
        .map_err(|_| SnapshotError::Corrupt("state record truncated"))?;
    let header_hash = decoder
        .read_hash_le()
        .map_err(|_| SnapshotError::Corrupt("state record truncated"))?;

    for entry in table.tables_mut() {
        let bytes = read_file(dir, entry.id().snapshot_file())?;
        entry
            .load_snapshot(&bytes)
            .map_err(|_| SnapshotError::Corrupt("table snapshot corrupted"))?;
    }

    table.set_progress(archive_index, block_height, header_hash);
    Ok(())
}
