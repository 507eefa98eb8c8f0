//! Shared fixture: a small regtest chain with real proof of work and
//! cross-block spends.
#![allow(dead_code)]

use std::sync::{Arc, RwLock};

use boltd_consensus::{consensus_params, ConsensusParams, Network};
use boltd_headerchain::HeaderChain;
use boltd_pow::validation::check_proof_of_work;
use boltd_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use boltd_primitives::genesis::genesis_block;
use boltd_primitives::merkle::merkle_root;
use boltd_primitives::outpoint::OutPoint;
use boltd_primitives::transaction::{Transaction, TxIn, TxOut};

pub const NOW: u32 = 1_700_000_000;

pub struct Fixture {
    pub params: ConsensusParams,
    pub genesis: Block,
    /// Blocks at heights 1..=length.
    pub blocks: Vec<Block>,
    pub chain: Arc<RwLock<HeaderChain>>,
}

pub fn mine(mut header: BlockHeader, params: &ConsensusParams) -> BlockHeader {
    loop {
        if check_proof_of_work(&header.hash(), header.bits, params).is_ok() {
            return header;
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Assemble and mine a block with the given transactions on top of `prev`.
pub fn build_block(
    prev: &BlockHeader,
    transactions: Vec<Transaction>,
    params: &ConsensusParams,
) -> Block {
    let txids: Vec<_> = transactions.iter().map(|tx| tx.txid()).collect();
    let header = mine(
        BlockHeader {
            version: CURRENT_VERSION,
            prev_block: prev.hash(),
            merkle_root: merkle_root(&txids),
            time: prev.time + 600,
            bits: prev.bits,
            nonce: 0,
        },
        params,
    );
    Block {
        header,
        transactions,
    }
}

pub fn coinbase_tx(height: usize) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: (height as u32).to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![
            TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
            },
            TxOut {
                value: 1_000,
                script_pubkey: vec![0x52],
            },
        ],
        lock_time: 0,
    }
}

fn spend_tx(coinbase_txid: [u8; 32]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![
            TxIn {
                prevout: OutPoint {
                    hash: coinbase_txid,
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: u32::MAX,
            },
            TxIn {
                prevout: OutPoint {
                    hash: coinbase_txid,
                    index: 1,
                },
                script_sig: Vec::new(),
                sequence: u32::MAX,
            },
        ],
        vout: vec![TxOut {
            value: 4_999_999_000,
            script_pubkey: vec![0x53],
        }],
        lock_time: 0,
    }
}

/// Build `length` blocks on top of genesis. Every block past height two
/// fully spends the coinbase from two blocks back, so merge order matters
/// across batch boundaries.
pub fn fixture(length: usize) -> Fixture {
    let params = consensus_params(Network::Regtest);
    let genesis = genesis_block(&params);
    let mut chain = HeaderChain::new(genesis.header, params.clone());

    let mut blocks: Vec<Block> = Vec::with_capacity(length);
    let mut prev = genesis.header;
    for height in 1..=length {
        let mut transactions = vec![coinbase_tx(height)];
        if height >= 3 {
            let earlier_coinbase = blocks[height - 3].transactions[0].txid();
            transactions.push(spend_tx(earlier_coinbase));
        }

        let block = build_block(&prev, transactions, &params);
        chain
            .insert_header_at(block.header, NOW)
            .expect("insert fixture header");
        prev = block.header;
        blocks.push(block);
    }

    Fixture {
        params,
        genesis,
        blocks,
        chain: Arc::new(RwLock::new(chain)),
    }
}

/// Concatenate block serializations into batch buffers of `per_batch`
/// blocks each.
pub fn batch_buffers(blocks: &[Block], per_batch: usize) -> Vec<Vec<u8>> {
    blocks
        .chunks(per_batch)
        .map(|chunk| {
            chunk
                .iter()
                .flat_map(|block| block.consensus_encode())
                .collect()
        })
        .collect()
}
