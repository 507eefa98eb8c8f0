//! The batch synchronizer: a peer pool of parse workers feeding one
//! strictly-ordered merge point.
//!
//! Workers pull batches from a bounded queue and parse them concurrently.
//! Whichever worker holds the batch whose index matches the shared merge
//! counter performs the merge inside the single mutex-guarded critical
//! section; everyone else deposits into the out-of-order holding map and
//! goes back for more work.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use boltd_consensus::Hash256;
use boltd_headerchain::HeaderChain;
use boltd_log::{log_error, log_info, log_warn};
use boltd_primitives::block::Block;
use boltd_primitives::hash::hash256_to_hex;
use boltd_storage::{ArchiveError, BlockArchive, SnapshotError, SnapshotSlots};
use boltd_utxo::{load_snapshot, save_snapshot, LoadOutcome, SpendRef, UtxoError, UtxoTable};
use crossbeam_channel::bounded;

use crate::batch::Batch;
use crate::parse::{parse_batch, ParseError, ParsedBatch};
use crate::source::BlockFetcher;

#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Parse/merge worker threads.
    pub parse_workers: usize,
    /// Bounded depth of the batch work queue.
    pub queue_depth: usize,
    /// Snapshot every this many merged batches.
    pub snapshot_interval: u32,
    /// Block count per network download batch.
    pub blocks_per_batch: usize,
    /// Concurrent download threads.
    pub download_tasks: usize,
    /// Download attempts per batch before the run aborts.
    pub fetch_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parse_workers: 4,
            queue_depth: 8,
            snapshot_interval: 100,
            blocks_per_batch: 10,
            download_tasks: 8,
            fetch_retries: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncMetrics {
    pub batches_merged: u32,
    pub blocks_merged: u64,
    pub transactions_merged: u64,
    pub snapshots_written: u32,
    /// Merges observed out of index order; always zero by construction.
    pub out_of_order_merges: u32,
}

#[derive(Debug)]
pub enum SyncError {
    Parse { batch: u32, error: ParseError },
    Utxo { batch: u32, error: UtxoError },
    Archive(ArchiveError),
    Snapshot(SnapshotError),
    Fetch { batch: u32, attempts: u32 },
    UnknownResumePoint(Hash256),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Parse { batch, error } => {
                write!(f, "parsing batch {batch} failed: {error}")
            }
            SyncError::Utxo { batch, error } => {
                write!(f, "merging batch {batch} failed: {error}")
            }
            SyncError::Archive(err) => write!(f, "{err}"),
            SyncError::Snapshot(err) => write!(f, "{err}"),
            SyncError::Fetch { batch, attempts } => {
                write!(f, "download of batch {batch} failed after {attempts} attempts")
            }
            SyncError::UnknownResumePoint(hash) => write!(
                f,
                "snapshot resume header {} not in chain",
                hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SnapshotError> for SyncError {
    fn from(err: SnapshotError) -> Self {
        SyncError::Snapshot(err)
    }
}

struct MergeState {
    utxo: UtxoTable,
    /// Index of the next batch allowed to merge.
    next_index: u32,
    /// Parsed batches that finished ahead of their turn.
    pending: HashMap<u32, (Batch, ParsedBatch)>,
    metrics: SyncMetrics,
    abort: Option<SyncError>,
}

struct DownloadJob {
    index: u32,
    hashes: Vec<Hash256>,
    attempts: u32,
}

pub struct Synchronizer {
    chain: Arc<RwLock<HeaderChain>>,
    archive: BlockArchive,
    slots: SnapshotSlots,
    config: SyncConfig,
    merge: Mutex<MergeState>,
}

impl Synchronizer {
    pub fn new(
        chain: Arc<RwLock<HeaderChain>>,
        utxo: UtxoTable,
        archive: BlockArchive,
        slots: SnapshotSlots,
        config: SyncConfig,
    ) -> Self {
        let config = SyncConfig {
            parse_workers: config.parse_workers.max(1),
            snapshot_interval: config.snapshot_interval.max(1),
            blocks_per_batch: config.blocks_per_batch.max(1),
            download_tasks: config.download_tasks.max(1),
            ..config
        };
        let next_index = utxo.archive_index();
        Self {
            chain,
            archive,
            slots,
            config,
            merge: Mutex::new(MergeState {
                utxo,
                next_index,
                pending: HashMap::new(),
                metrics: SyncMetrics::default(),
                abort: None,
            }),
        }
    }

    /// Load the latest usable snapshot into a fresh engine, merging the
    /// genesis block when recovery falls back to an empty state.
    pub fn recover_utxo(
        slots: &SnapshotSlots,
        genesis: &Block,
    ) -> Result<(UtxoTable, LoadOutcome), SyncError> {
        let mut utxo = UtxoTable::new();
        let outcome = load_snapshot(&mut utxo, slots)?;
        if outcome == LoadOutcome::Empty {
            merge_genesis(&mut utxo, genesis)?;
        }
        Ok((utxo, outcome))
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.lock_state().metrics
    }

    pub fn with_utxo<R>(&self, f: impl FnOnce(&UtxoTable) -> R) -> R {
        f(&self.lock_state().utxo)
    }

    pub fn into_utxo(self) -> UtxoTable {
        self.merge.into_inner().expect("merge lock").utxo
    }

    /// Replay every archive partition at or after the engine's recorded
    /// batch index, then write a closing snapshot.
    pub fn sync_from_archive(&self) -> Result<SyncMetrics, SyncError> {
        let start_index = self.lock_state().next_index;
        let (batch_tx, batch_rx) = bounded::<Batch>(self.config.queue_depth);

        thread::scope(|scope| {
            for _ in 0..self.config.parse_workers {
                let receiver = batch_rx.clone();
                scope.spawn(move || self.worker_loop(receiver));
            }
            drop(batch_rx);

            let mut index = start_index;
            while self.archive.exists(index) && !self.aborted() {
                match self.archive.read(index) {
                    Ok(buffer) => {
                        if batch_tx.send(Batch::from_archive(index, buffer)).is_err() {
                            break;
                        }
                        index += 1;
                    }
                    Err(err) => {
                        self.record_abort(SyncError::Archive(err));
                        break;
                    }
                }
            }
            drop(batch_tx);
        });

        self.finish(start_index)
    }

    /// Download block ranges computed from the header chain, bounded by a
    /// fixed pool of in-flight downloads, and merge them in batch order.
    pub fn sync_from_network(&self, fetcher: &dyn BlockFetcher) -> Result<SyncMetrics, SyncError> {
        let start_index = self.lock_state().next_index;
        let jobs = Mutex::new(self.plan_downloads(start_index)?);
        if jobs.lock().expect("job queue").is_empty() {
            return self.finish(start_index);
        }

        let (batch_tx, batch_rx) = bounded::<Batch>(self.config.queue_depth);

        thread::scope(|scope| {
            for _ in 0..self.config.parse_workers {
                let receiver = batch_rx.clone();
                scope.spawn(move || self.worker_loop(receiver));
            }
            drop(batch_rx);

            for _ in 0..self.config.download_tasks {
                let sender = batch_tx.clone();
                let jobs = &jobs;
                scope.spawn(move || self.download_loop(fetcher, jobs, sender));
            }
            drop(batch_tx);
        });

        self.finish(start_index)
    }

    /// One header-hash list per batch, walking the main chain from the last
    /// merged block to the tip.
    fn plan_downloads(&self, start_index: u32) -> Result<VecDeque<DownloadJob>, SyncError> {
        let chain = self.read_chain();
        let last_hash = *self.lock_state().utxo.last_header_hash();
        let mut cursor = chain
            .read_header(&last_hash)
            .ok_or(SyncError::UnknownResumePoint(last_hash))?;

        let mut jobs = VecDeque::new();
        let mut index = start_index;
        loop {
            let hashes = chain.main_hashes_after(cursor, self.config.blocks_per_batch);
            if hashes.is_empty() {
                break;
            }
            let last = hashes[hashes.len() - 1];
            jobs.push_back(DownloadJob {
                index,
                hashes,
                attempts: 0,
            });
            index += 1;
            cursor = match chain.read_header(&last) {
                Some(id) => id,
                None => break,
            };
        }
        Ok(jobs)
    }

    fn download_loop(
        &self,
        fetcher: &dyn BlockFetcher,
        jobs: &Mutex<VecDeque<DownloadJob>>,
        sender: crossbeam_channel::Sender<Batch>,
    ) {
        loop {
            if self.aborted() {
                return;
            }
            let Some(mut job) = jobs.lock().expect("job queue").pop_front() else {
                return;
            };
            match fetcher.fetch_blocks(&job.hashes) {
                Ok(buffers) => {
                    let buffer = buffers.concat();
                    if sender.send(Batch::from_network(job.index, buffer)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    job.attempts += 1;
                    log_warn!(
                        "download of batch {} failed (attempt {}): {err}",
                        job.index,
                        job.attempts
                    );
                    if job.attempts > self.config.fetch_retries {
                        self.record_abort(SyncError::Fetch {
                            batch: job.index,
                            attempts: job.attempts,
                        });
                        return;
                    }
                    // Failed batches go back to the front so the merge
                    // counter is never starved waiting on a hole.
                    jobs.lock().expect("job queue").push_front(job);
                }
            }
        }
    }

    fn worker_loop(&self, receiver: crossbeam_channel::Receiver<Batch>) {
        for batch in receiver.iter() {
            if self.aborted() {
                continue;
            }
            let parsed = {
                let chain = self.read_chain();
                parse_batch(&chain, &batch.buffer)
            };
            match parsed {
                Ok(parsed) => self.submit(batch, parsed),
                Err(error) => {
                    // Archive batches are local corruption; network batches
                    // could be retried by the caller, but either way the
                    // merge counter must not advance past a hole.
                    self.record_abort(SyncError::Parse {
                        batch: batch.index,
                        error,
                    });
                }
            }
        }
    }

    /// Hand a parsed batch to the merge point. Either it is this batch's
    /// turn and the caller merges it (plus any queued successors), or it is
    /// deposited into the holding map.
    pub fn submit(&self, batch: Batch, parsed: ParsedBatch) {
        let mut state = self.lock_state();
        if state.abort.is_some() {
            return;
        }
        if batch.index != state.next_index {
            state.pending.insert(batch.index, (batch, parsed));
            return;
        }

        let mut current = (batch, parsed);
        loop {
            if current.0.index != state.next_index {
                state.metrics.out_of_order_merges += 1;
            }
            if let Err(err) = self.merge_one(&mut state, &current.0, &current.1) {
                log_error!("aborting sync: {err}");
                state.abort = Some(err);
                return;
            }
            state.next_index += 1;
            let next_index = state.next_index;
            match state.pending.remove(&next_index) {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    /// The serialized section: insert then spend per block in order,
    /// archive the batch, advance the counter's state, snapshot on
    /// interval.
    fn merge_one(
        &self,
        state: &mut MergeState,
        batch: &Batch,
        parsed: &ParsedBatch,
    ) -> Result<(), SyncError> {
        for block in &parsed.blocks {
            for tx in &block.txs {
                state
                    .utxo
                    .insert_outputs(&tx.txid, tx.output_count, batch.index)
                    .map_err(|error| SyncError::Utxo {
                        batch: batch.index,
                        error,
                    })?;
            }
            for tx in &block.txs {
                for input in &tx.inputs {
                    state
                        .utxo
                        .spend(&SpendRef {
                            txid: input.txid,
                            vout: input.vout,
                        })
                        .map_err(|error| SyncError::Utxo {
                            batch: batch.index,
                            error,
                        })?;
                }
            }
            state.utxo.advance_block(&block.header_hash);
            state.metrics.blocks_merged += 1;
            state.metrics.transactions_merged += block.txs.len() as u64;
        }

        if !batch.from_archive {
            match self.archive.write(batch.index, &batch.buffer) {
                Ok(()) => {}
                Err(err @ ArchiveError::Busy(_)) => {
                    // Contention on the archive skips this partition's
                    // write; the merge itself goes on.
                    log_warn!("skipping archive write for batch {}: {err}", batch.index);
                }
                Err(err) => return Err(SyncError::Archive(err)),
            }
        }

        state.utxo.set_archive_index(batch.index + 1);
        state.metrics.batches_merged += 1;

        log_info!(
            "merged batch {} at height {}, {} entries",
            batch.index,
            state.utxo.block_height(),
            state.utxo.entry_count()
        );

        if (batch.index + 1) % self.config.snapshot_interval == 0 {
            self.snapshot(state);
        }

        Ok(())
    }

    fn snapshot(&self, state: &mut MergeState) {
        match save_snapshot(&state.utxo, &self.slots) {
            Ok(()) => state.metrics.snapshots_written += 1,
            // A failed snapshot skips this interval; the previous
            // generation stays valid.
            Err(err) => log_warn!("snapshot failed, skipping interval: {err}"),
        }
    }

    fn finish(&self, start_index: u32) -> Result<SyncMetrics, SyncError> {
        let mut state = self.lock_state();
        if let Some(err) = state.abort.take() {
            return Err(err);
        }
        if state.next_index > start_index {
            self.snapshot(&mut state);
        }
        Ok(state.metrics)
    }

    fn aborted(&self) -> bool {
        self.lock_state().abort.is_some()
    }

    fn record_abort(&self, err: SyncError) {
        let mut state = self.lock_state();
        if state.abort.is_none() {
            log_error!("aborting sync: {err}");
            state.abort = Some(err);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MergeState> {
        self.merge.lock().expect("merge lock")
    }

    fn read_chain(&self) -> std::sync::RwLockReadGuard<'_, HeaderChain> {
        self.chain.read().expect("chain lock")
    }
}

/// Fold the genesis block's outputs into an empty engine. Genesis is not
/// part of any batch; batches cover heights one and up.
fn merge_genesis(utxo: &mut UtxoTable, genesis: &Block) -> Result<(), SyncError> {
    for tx in &genesis.transactions {
        utxo.insert_outputs(&tx.txid(), tx.vout.len(), 0)
            .map_err(|error| SyncError::Utxo { batch: 0, error })?;
    }
    utxo.advance_block(&genesis.header.hash());
    Ok(())
}
