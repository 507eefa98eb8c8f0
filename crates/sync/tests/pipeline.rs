mod util;

use std::sync::Arc;
use std::thread;

use boltd_storage::{BlockArchive, SnapshotSlots};
use boltd_sync::{parse_batch, Batch, SyncConfig, SyncError, Synchronizer};
use boltd_utxo::{TableId, UtxoError};

use util::{batch_buffers, fixture};

fn synchronizer_at(
    fx: &util::Fixture,
    dir: &std::path::Path,
    config: SyncConfig,
) -> Synchronizer {
    let archive = BlockArchive::new(dir.join("blocks")).expect("archive");
    let slots = SnapshotSlots::new(dir.join("snapshots")).expect("slots");
    let (utxo, _) = Synchronizer::recover_utxo(&slots, &fx.genesis).expect("recover");
    Synchronizer::new(Arc::clone(&fx.chain), utxo, archive, slots, config)
}

fn table_state(sync: &Synchronizer) -> (Vec<Vec<u8>>, i32, [u8; 32], u32) {
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

#[test]
fn archive_replay_merges_every_batch() {
    let fx = fixture(12);
    let dir = tempfile::tempdir().expect("tempdir");
    let buffers = batch_buffers(&fx.blocks, 3);

    let archive = BlockArchive::new(dir.path().join("blocks")).expect("archive");
    for (index, buffer) in buffers.iter().enumerate() {
        archive.write(index as u32, buffer).expect("seed archive");
    }

    let sync = synchronizer_at(&fx, dir.path(), SyncConfig::default());
    let metrics = sync.sync_from_archive().expect("sync");

    assert_eq!(metrics.batches_merged, 4);
    assert_eq!(metrics.blocks_merged, 12);
    assert_eq!(metrics.out_of_order_merges, 0);
    // Finishing a run always leaves a durable snapshot behind.
    assert_eq!(metrics.snapshots_written, 1);

    let (_, height, last_hash, archive_index) = table_state(&sync);
    assert_eq!(height, 12);
    assert_eq!(last_hash, fx.blocks[11].header.hash());
    assert_eq!(archive_index, 4);
}

#[test]
fn out_of_order_submission_merges_in_index_order() {
    let fx = fixture(12);
    let dir = tempfile::tempdir().expect("tempdir");
    let buffers = batch_buffers(&fx.blocks, 2);

    // Reference: strictly sequential submission.
    let reference = synchronizer_at(&fx, dir.path().join("ref").as_path(), SyncConfig::default());
    {
        let chain = fx.chain.read().expect("chain");
        for (index, buffer) in buffers.iter().enumerate() {
            let parsed = parse_batch(&chain, buffer).expect("parse");
            reference.submit(Batch::from_archive(index as u32, buffer.clone()), parsed);
        }
    }
    let reference_state = table_state(&reference);

    // Batch 2 "finishes parsing" before batches 0 and 1; merge order must
    // still be 0, 1, 2, ...
    let scrambled = synchronizer_at(
        &fx,
        dir.path().join("scrambled").as_path(),
        SyncConfig::default(),
    );
    {
        let chain = fx.chain.read().expect("chain");
        let order = [2usize, 0, 4, 5, 1, 3];
        for index in order {
            let parsed = parse_batch(&chain, &buffers[index]).expect("parse");
            scrambled.submit(
                Batch::from_archive(index as u32, buffers[index].clone()),
                parsed,
            );
        }
    }
    assert_eq!(table_state(&scrambled), reference_state);
    assert_eq!(scrambled.metrics().out_of_order_merges, 0);
    assert_eq!(scrambled.metrics().batches_merged, 6);

    // Same property under genuinely concurrent submission.
    let concurrent = synchronizer_at(
        &fx,
        dir.path().join("concurrent").as_path(),
        SyncConfig::default(),
    );
    let parsed: Vec<_> = {
        let chain = fx.chain.read().expect("chain");
        buffers
            .iter()
            .map(|buffer| parse_batch(&chain, buffer).expect("parse"))
            .collect()
    };
    thread::scope(|scope| {
        for order in [vec![5usize, 2, 0], vec![1usize, 4, 3]] {
            let concurrent = &concurrent;
            let buffers = &buffers;
            let parsed = &parsed;
            scope.spawn(move || {
                for index in order {
                    concurrent.submit(
                        Batch::from_archive(index as u32, buffers[index].clone()),
                        parsed[index].clone(),
                    );
                }
            });
        }
    });
    assert_eq!(table_state(&concurrent), reference_state);
    assert_eq!(concurrent.metrics().out_of_order_merges, 0);
}

#[test]
fn corrupted_archive_batch_aborts_replay() {
    let fx = fixture(4);
    let dir = tempfile::tempdir().expect("tempdir");
    let buffers = batch_buffers(&fx.blocks, 2);

    let archive = BlockArchive::new(dir.path().join("blocks")).expect("archive");
    archive.write(0, &buffers[0]).expect("seed");
    let mut corrupted = buffers[1].clone();
    // Flip a byte inside the first transaction, breaking the merkle root.
    let offset = 90;
    corrupted[offset] ^= 0xff;
    archive.write(1, &corrupted).expect("seed corrupt");

    // One worker keeps the abort point deterministic.
    let config = SyncConfig {
        parse_workers: 1,
        ..SyncConfig::default()
    };
    let sync = synchronizer_at(&fx, dir.path(), config);
    match sync.sync_from_archive() {
        Err(SyncError::Parse { batch: 1, .. }) => {}
        other => panic!("expected parse abort for batch 1, got {other:?}"),
    }
    // Batch 0 merged before the corruption was hit.
    assert_eq!(sync.metrics().batches_merged, 1);
}

#[test]
fn spend_of_unknown_output_aborts_pipeline() {
    use std::sync::{Arc, RwLock};

    use boltd_consensus::{consensus_params, Network};
    use boltd_headerchain::HeaderChain;
    use boltd_primitives::genesis::genesis_block;
    use boltd_primitives::outpoint::OutPoint;
    use boltd_primitives::transaction::{Transaction, TxIn, TxOut};

    let params = consensus_params(Network::Regtest);
    let genesis = genesis_block(&params);
    let mut chain = HeaderChain::new(genesis.header, params.clone());

    let block1 = util::build_block(&genesis.header, vec![util::coinbase_tx(1)], &params);
    chain
        .insert_header_at(block1.header, util::NOW)
        .expect("insert");

    // Block 2 spends an output that was never created.
    let rogue = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: [0x5a; 32],
                index: 0,
            },
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let block2 = util::build_block(&block1.header, vec![util::coinbase_tx(2), rogue], &params);
    chain
        .insert_header_at(block2.header, util::NOW)
        .expect("insert");

    let dir = tempfile::tempdir().expect("tempdir");
    let archive = BlockArchive::new(dir.path().join("blocks")).expect("archive");
    let mut buffer = block1.consensus_encode();
    buffer.extend_from_slice(&block2.consensus_encode());
    archive.write(0, &buffer).expect("seed");

    let slots = SnapshotSlots::new(dir.path().join("snapshots")).expect("slots");
    let (utxo, _) = Synchronizer::recover_utxo(&slots, &genesis).expect("recover");
    let sync = Synchronizer::new(
        Arc::new(RwLock::new(chain)),
        utxo,
        archive,
        slots,
        SyncConfig::default(),
    );

    match sync.sync_from_archive() {
        Err(SyncError::Utxo {
            batch: 0,
            error: UtxoError::NotFound { txid },
        }) => assert_eq!(txid, [0x5a; 32]),
        other => panic!("expected not-found abort, got {other:?}"),
    }
}

#[test]
fn unknown_header_fails_parse() {
    let fx = fixture(3);
    let foreign = fixture(3);
    let chain = fx.chain.read().expect("chain");
    let buffer = batch_buffers(&foreign.blocks, 3).remove(0);
    match parse_batch(&chain, &buffer) {
        Err(boltd_sync::ParseError::UnknownHeader(_)) => {}
        other => panic!("expected unknown header, got {other:?}"),
    }
}

#[test]
fn network_sync_downloads_archives_and_retries() {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use boltd_consensus::Hash256;
    use boltd_sync::{BlockFetcher, FetchError};

    struct FlakyFetcher {
        blocks: HashMap<Hash256, Vec<u8>>,
        failed_once: Mutex<HashSet<Hash256>>,
    }

    impl BlockFetcher for FlakyFetcher {
        fn fetch_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, FetchError> {
            let first = hashes[0];
            {
                let mut failed = self.failed_once.lock().expect("failed set");
                if failed.insert(first) {
                    // Every batch fails its first attempt.
                    return Err(FetchError::Timeout);
                }
            }
            hashes
                .iter()
                .map(|hash| {
                    self.blocks
                        .get(hash)
                        .cloned()
                        .ok_or(FetchError::NotFound(*hash))
                })
                .collect()
        }
    }

    let fx = fixture(10);
    let dir = tempfile::tempdir().expect("tempdir");

    let fetcher = FlakyFetcher {
        blocks: fx
            .blocks
            .iter()
            .map(|block| (block.header.hash(), block.consensus_encode()))
            .collect(),
        failed_once: Mutex::new(HashSet::new()),
    };

    let config = SyncConfig {
        blocks_per_batch: 2,
        download_tasks: 3,
        ..SyncConfig::default()
    };
    let sync = synchronizer_at(&fx, dir.path(), config);
    let metrics = sync.sync_from_network(&fetcher).expect("network sync");

    assert_eq!(metrics.batches_merged, 5);
    assert_eq!(metrics.blocks_merged, 10);
    assert_eq!(metrics.out_of_order_merges, 0);

    let (_, height, last_hash, archive_index) = table_state(&sync);
    assert_eq!(height, 10);
    assert_eq!(last_hash, fx.blocks[9].header.hash());
    assert_eq!(archive_index, 5);

    // Merged network batches were archived under their batch indices.
    let archive = BlockArchive::new(dir.path().join("blocks")).expect("archive");
    let expected = batch_buffers(&fx.blocks, 2);
    for (index, buffer) in expected.iter().enumerate() {
        assert_eq!(&archive.read(index as u32).expect("partition"), buffer);
    }
}
