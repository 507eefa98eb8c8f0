//! Arena-backed header tree with accumulated-work fork choice.
//!
//! Headers are stored in a flat arena addressed by [`HeaderId`]; parent and
//! child links are indices, and every competing chain is tracked as a tip
//! with its cumulative work cached. The main chain is always the tip with
//! strictly greatest accumulated work.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use smallvec::SmallVec;

use boltd_consensus::{ConsensusParams, Hash256};
use boltd_log::log_info;
use boltd_pow::validation::{check_proof_of_work, next_work_required, PowError};
use boltd_pow::CompactError;
use boltd_primitives::block::BlockHeader;
use boltd_primitives::hash::{hash256_to_hex, truncated_key};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HeaderId(u32);

impl HeaderId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Previous header unknown.
    Orphan(Hash256),
    Duplicate(Hash256),
    CheckpointMismatch { height: i32 },
    /// Fork attaches at or below the last checkpoint.
    ForkBelowCheckpoint { height: i32 },
    TimestampPremature,
    TimestampBelowMedian,
    UnexpectedBits { expected: u32, actual: u32 },
    Pow(PowError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Orphan(hash) => {
                write!(f, "previous header {} not in chain", hash256_to_hex(hash))
            }
            ChainError::Duplicate(hash) => {
                write!(f, "header {} already in chain", hash256_to_hex(hash))
            }
            ChainError::CheckpointMismatch { height } => {
                write!(f, "header at height {height} violates checkpoint")
            }
            ChainError::ForkBelowCheckpoint { height } => {
                write!(f, "fork at height {height} reaches below last checkpoint")
            }
            ChainError::TimestampPremature => write!(f, "header timestamp too far in the future"),
            ChainError::TimestampBelowMedian => {
                write!(f, "header timestamp not above median time past")
            }
            ChainError::UnexpectedBits { expected, actual } => {
                write!(f, "difficulty bits {actual:#x}, expected {expected:#x}")
            }
            ChainError::Pow(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<PowError> for ChainError {
    fn from(err: PowError) -> Self {
        ChainError::Pow(err)
    }
}

impl From<CompactError> for ChainError {
    fn from(err: CompactError) -> Self {
        ChainError::Pow(PowError::Compact(err))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InsertOutcome {
    pub id: HeaderId,
    pub height: i32,
    /// Whether the insertion moved the main-chain pointer to a new fork.
    pub reorged: bool,
}

struct HeaderNode {
    header: BlockHeader,
    hash: Hash256,
    height: i32,
    /// Cumulative work from genesis through this header.
    work: U256,
    parent: Option<HeaderId>,
    children: SmallVec<[HeaderId; 1]>,
}

#[derive(Clone, Copy)]
struct ChainTip {
    tip: HeaderId,
    height: i32,
    work: U256,
}

pub struct HeaderChain {
    params: ConsensusParams,
    arena: Vec<HeaderNode>,
    /// Truncated header-hash key to arena ids; colliding keys share a slot.
    by_key: HashMap<u32, SmallVec<[HeaderId; 1]>>,
    tips: Vec<ChainTip>,
    main: usize,
    /// Main-chain ids indexed by height.
    main_path: Vec<HeaderId>,
}

impl HeaderChain {
    pub fn new(genesis: BlockHeader, params: ConsensusParams) -> Self {
        let hash = genesis.hash();
        let work = genesis_work(genesis.bits);
        let node = HeaderNode {
            header: genesis,
            hash,
            height: 0,
            work,
            parent: None,
            children: SmallVec::new(),
        };
        let mut by_key = HashMap::new();
        by_key.insert(truncated_key(&hash), SmallVec::from_elem(HeaderId(0), 1));
        Self {
            params,
            arena: vec![node],
            by_key,
            tips: vec![ChainTip {
                tip: HeaderId(0),
                height: 0,
                work,
            }],
            main: 0,
            main_path: vec![HeaderId(0)],
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn genesis(&self) -> HeaderId {
        HeaderId(0)
    }

    pub fn header(&self, id: HeaderId) -> &BlockHeader {
        &self.arena[id.index()].header
    }

    pub fn hash(&self, id: HeaderId) -> &Hash256 {
        &self.arena[id.index()].hash
    }

    pub fn height(&self, id: HeaderId) -> i32 {
        self.arena[id.index()].height
    }

    pub fn work(&self, id: HeaderId) -> U256 {
        self.arena[id.index()].work
    }

    /// Look a header up by hash via the truncated-key index, comparing full
    /// hashes to disambiguate key collisions.
    pub fn read_header(&self, hash: &Hash256) -> Option<HeaderId> {
        let ids = self.by_key.get(&truncated_key(hash))?;
        ids.iter()
            .copied()
            .find(|id| &self.arena[id.index()].hash == hash)
    }

    pub fn main_tip(&self) -> HeaderId {
        self.tips[self.main].tip
    }

    pub fn main_height(&self) -> i32 {
        self.tips[self.main].height
    }

    pub fn main_work(&self) -> U256 {
        self.tips[self.main].work
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    /// Whether `id` lies on the current main chain.
    pub fn is_in_main(&self, id: HeaderId) -> bool {
        let height = self.arena[id.index()].height;
        self.main_path.get(height as usize) == Some(&id)
    }

    /// Successor of `id` on the main chain, if `id` is on it and not the tip.
    pub fn next_in_main(&self, id: HeaderId) -> Option<HeaderId> {
        if !self.is_in_main(id) {
            return None;
        }
        let height = self.arena[id.index()].height;
        self.main_path.get(height as usize + 1).copied()
    }

    pub fn header_at_height(&self, height: i32) -> Option<HeaderId> {
        if height < 0 {
            return None;
        }
        self.main_path.get(height as usize).copied()
    }

    /// Up to `count` main-chain header hashes strictly after `id`, used to
    /// assemble block-download batches.
    pub fn main_hashes_after(&self, id: HeaderId, count: usize) -> Vec<Hash256> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = id;
        while out.len() < count {
            match self.next_in_main(cursor) {
                Some(next) => {
                    out.push(self.arena[next.index()].hash);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    /// Block-locator hashes: the last ten main-chain headers, then
    /// exponentially sparser steps back to genesis.
    pub fn locator_hashes(&self) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut height = self.main_height();
        let mut step = 1i32;
        while height > 0 {
            if let Some(id) = self.header_at_height(height) {
                out.push(self.arena[id.index()].hash);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        out.push(self.arena[0].hash);
        out
    }

    pub fn insert_header(&mut self, header: BlockHeader) -> Result<InsertOutcome, ChainError> {
        self.insert_header_at(header, unix_now())
    }

    /// Validate and connect one header, `now_secs` being wall-clock time for
    /// the future-drift bound.
    pub fn insert_header_at(
        &mut self,
        header: BlockHeader,
        now_secs: u32,
    ) -> Result<InsertOutcome, ChainError> {
        let hash = header.hash();
        if self.read_header(&hash).is_some() {
            return Err(ChainError::Duplicate(hash));
        }
        let parent = self
            .read_header(&header.prev_block)
            .ok_or(ChainError::Orphan(header.prev_block))?;
        let height = self.arena[parent.index()].height + 1;

        self.validate_header(&header, &hash, parent, height, now_secs)?;

        let work = self.arena[parent.index()].work
            + boltd_pow::block_proof(header.bits).map_err(PowError::Compact)?;
        let id = HeaderId(self.arena.len() as u32);
        self.arena.push(HeaderNode {
            header,
            hash,
            height,
            work,
            parent: Some(parent),
            children: SmallVec::new(),
        });
        self.arena[parent.index()].children.push(id);
        self.by_key.entry(truncated_key(&hash)).or_default().push(id);

        // Extend the parent's chain if the parent was a tip; otherwise the
        // new header starts a fork.
        let tip_slot = self.tips.iter().position(|t| t.tip == parent);
        let slot = match tip_slot {
            Some(slot) => {
                self.tips[slot] = ChainTip {
                    tip: id,
                    height,
                    work,
                };
                slot
            }
            None => {
                self.tips.push(ChainTip {
                    tip: id,
                    height,
                    work,
                });
                self.tips.len() - 1
            }
        };

        let mut reorged = false;
        if slot == self.main {
            self.main_path.push(id);
        } else if self.tips[slot].work > self.tips[self.main].work {
            reorged = true;
            self.main = slot;
            self.rebuild_main_path();
            log_info!(
                "chain reorganized to {} at height {}",
                hash256_to_hex(&hash),
                height
            );
        }

        Ok(InsertOutcome {
            id,
            height,
            reorged,
        })
    }

    fn validate_header(
        &self,
        header: &BlockHeader,
        hash: &Hash256,
        parent: HeaderId,
        height: i32,
        now_secs: u32,
    ) -> Result<(), ChainError> {
        check_proof_of_work(hash, header.bits, &self.params)?;

        let expected_bits = self.expected_bits(parent, height)?;
        if header.bits != expected_bits {
            return Err(ChainError::UnexpectedBits {
                expected: expected_bits,
                actual: header.bits,
            });
        }

        if i64::from(header.time)
            > i64::from(now_secs) + i64::from(self.params.max_future_block_time_secs)
        {
            return Err(ChainError::TimestampPremature);
        }
        if header.time <= self.median_time_past(parent) {
            return Err(ChainError::TimestampBelowMedian);
        }

        let last_checkpoint = self.params.last_checkpoint_height();
        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if &checkpoint.hash != hash {
                return Err(ChainError::CheckpointMismatch { height });
            }
        }
        // A second header under a parent below the last checkpoint would
        // start a fork that could only displace checkpointed history.
        if height <= last_checkpoint && !self.arena[parent.index()].children.is_empty() {
            return Err(ChainError::ForkBelowCheckpoint { height });
        }

        Ok(())
    }

    fn expected_bits(&self, parent: HeaderId, height: i32) -> Result<u32, ChainError> {
        let parent_node = &self.arena[parent.index()];
        let interval = self.params.pow_retarget_interval;
        let interval_start = if i64::from(height) % interval == 0 {
            let mut cursor = parent;
            for _ in 0..(interval - 1) {
                match self.arena[cursor.index()].parent {
                    Some(previous) => cursor = previous,
                    None => break,
                }
            }
            self.arena[cursor.index()].header.time
        } else {
            0
        };
        Ok(next_work_required(
            i64::from(height),
            parent_node.header.bits,
            parent_node.header.time,
            interval_start,
            &self.params,
        )?)
    }

    /// Median timestamp of the last `median_time_span` headers ending at
    /// `tip` inclusive.
    fn median_time_past(&self, tip: HeaderId) -> u32 {
        let mut times: SmallVec<[u32; 11]> = SmallVec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            if times.len() >= self.params.median_time_span {
                break;
            }
            let node = &self.arena[id.index()];
            times.push(node.header.time);
            cursor = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn rebuild_main_path(&mut self) {
        let tip = self.tips[self.main];
        let mut path = vec![HeaderId(0); tip.height as usize + 1];
        let mut cursor = Some(tip.tip);
        while let Some(id) = cursor {
            let node = &self.arena[id.index()];
            path[node.height as usize] = id;
            cursor = node.parent;
        }
        self.main_path = path;
    }

    /// Drop fork tips that have fallen more than `depth` blocks behind the
    /// main tip. Headers stay in the arena; only the tip set shrinks.
    pub fn prune_forks(&mut self, depth: i32) {
        let main_tip = self.tips[self.main].tip;
        let threshold = self.main_height().saturating_sub(depth);
        self.tips
            .retain(|t| t.tip == main_tip || t.height >= threshold);
        self.main = self
            .tips
            .iter()
            .position(|t| t.tip == main_tip)
            .expect("main tip retained");
    }

    pub fn header_count(&self) -> usize {
        self.arena.len()
    }

    /// Main-chain headers from genesis to tip, for persistence.
    pub fn main_chain_headers(&self) -> Vec<BlockHeader> {
        self.main_path
            .iter()
            .map(|id| self.arena[id.index()].header)
            .collect()
    }
}

fn genesis_work(bits: u32) -> U256 {
    boltd_pow::block_proof(bits).unwrap_or_default()
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
