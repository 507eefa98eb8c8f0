mod util;

use std::path::Path;
use std::sync::Arc;

use boltd_storage::{BlockArchive, SnapshotSlots};
use boltd_sync::{parse_batch, Batch, SyncConfig, Synchronizer};
use boltd_utxo::{LoadOutcome, TableId};

use util::{batch_buffers, fixture, Fixture};

type EngineState = (Vec<Vec<u8>>, i32, [u8; 32], u32);

fn engine_state(sync: &Synchronizer) -> EngineState {
    sync.with_utxo(|utxo| {
        (
            TableId::ALL
                .into_iter()
                .map(|id| utxo.table_snapshot_bytes(id))
                .collect(),
            utxo.block_height(),
            *utxo.last_header_hash(),
            utxo.archive_index(),
        )
    })
}

fn seed_archive(dir: &Path, buffers: &[Vec<u8>]) -> BlockArchive {
    let archive = BlockArchive::new(dir.join("blocks")).expect("archive");
    for (index, buffer) in buffers.iter().enumerate() {
        archive.write(index as u32, buffer).expect("seed");
    }
    archive
}

fn recovered_synchronizer(fx: &Fixture, dir: &Path, config: SyncConfig) -> (Synchronizer, LoadOutcome) {
    let archive = BlockArchive::new(dir.join("blocks")).expect("archive");
    let slots = SnapshotSlots::new(dir.join("snapshots")).expect("slots");
    let (utxo, outcome) = Synchronizer::recover_utxo(&slots, &fx.genesis).expect("recover");
    (
        Synchronizer::new(Arc::clone(&fx.chain), utxo, archive, slots, config),
        outcome,
    )
}

#[test]
fn restart_from_snapshot_resumes_at_next_batch() {
    let fx = fixture(16);
    let buffers = batch_buffers(&fx.blocks, 2);
    assert_eq!(buffers.len(), 8);

    // Reference: one uninterrupted replay of the whole archive.
    let dir_a = tempfile::tempdir().expect("tempdir");
    seed_archive(dir_a.path(), &buffers);
    let (reference, outcome) = recovered_synchronizer(&fx, dir_a.path(), SyncConfig::default());
    assert_eq!(outcome, LoadOutcome::Empty);
    reference.sync_from_archive().expect("reference sync");
    let reference_state = engine_state(&reference);
    assert_eq!(reference_state.1, 16);
    assert_eq!(reference_state.3, 8);

    // Crashing run: snapshot every 4 batches, die mid-way with merged but
    // unsnapshotted batches.
    let dir_b = tempfile::tempdir().expect("tempdir");
    seed_archive(dir_b.path(), &buffers);
    let config = SyncConfig {
        snapshot_interval: 4,
        ..SyncConfig::default()
    };
    let (crashing, _) = recovered_synchronizer(&fx, dir_b.path(), config);
    {
        let chain = fx.chain.read().expect("chain");
        for index in 0..6u32 {
            let parsed = parse_batch(&chain, &buffers[index as usize]).expect("parse");
            crashing.submit(
                Batch::from_archive(index, buffers[index as usize].clone()),
                parsed,
            );
        }
    }
    assert_eq!(crashing.metrics().batches_merged, 6);
    assert_eq!(crashing.metrics().snapshots_written, 1);
    drop(crashing); // crash: no closing snapshot

    // Restart: the snapshot covers batches 0..=3, so merging resumes at
    // batch 4 and replays the tail of the archive.
    let (restarted, outcome) = recovered_synchronizer(&fx, dir_b.path(), config);
    assert_eq!(outcome, LoadOutcome::Current);
    let resumed_at = restarted.with_utxo(|utxo| utxo.archive_index());
    assert_eq!(resumed_at, 4);
    let metrics = restarted.sync_from_archive().expect("resume sync");
    assert_eq!(metrics.batches_merged, 4);
    assert_eq!(metrics.blocks_merged, 8);

    assert_eq!(engine_state(&restarted), reference_state);
}

#[test]
fn unusable_snapshots_rebuild_from_genesis() {
    let fx = fixture(8);
    let buffers = batch_buffers(&fx.blocks, 2);

    let dir = tempfile::tempdir().expect("tempdir");
    seed_archive(dir.path(), &buffers);
    let config = SyncConfig {
        snapshot_interval: 2,
        ..SyncConfig::default()
    };
    let (first, _) = recovered_synchronizer(&fx, dir.path(), config);
    first.sync_from_archive().expect("sync");
    let reference_state = engine_state(&first);

    // Wreck both snapshot generations.
    let slots = SnapshotSlots::new(dir.path().join("snapshots")).expect("slots");
    std::fs::write(slots.current_dir().join("state"), b"garbage").expect("corrupt current");
    std::fs::write(slots.previous_dir().join("state"), b"garbage").expect("corrupt previous");

    let (rebuilt, outcome) = recovered_synchronizer(&fx, dir.path(), config);
    assert_eq!(outcome, LoadOutcome::Empty);
    assert_eq!(rebuilt.with_utxo(|utxo| utxo.archive_index()), 0);
    rebuilt.sync_from_archive().expect("rebuild sync");

    assert_eq!(engine_state(&rebuilt), reference_state);
}
