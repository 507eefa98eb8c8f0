//! Deterministic genesis block construction.

use boltd_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader, CURRENT_VERSION};
use crate::merkle::merkle_root;
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut, CURRENT_TX_VERSION};

/// Build the genesis block for a parameter set. The merkle root is derived
/// from the coinbase rather than hardcoded, so the header hash follows from
/// the parameters alone.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = Transaction {
        version: CURRENT_TX_VERSION,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: params.genesis_coinbase_message.as_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: params.genesis_reward,
            // Anyone-can-spend placeholder; the genesis output is
            // unspendable by convention regardless.
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };

    let header = BlockHeader {
        version: CURRENT_VERSION,
        prev_block: [0u8; 32],
        merkle_root: merkle_root(&[coinbase.txid()]),
        time: params.genesis_time,
        bits: params.genesis_bits,
        nonce: params.genesis_nonce,
    };

    Block {
        header,
        transactions: vec![coinbase],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boltd_consensus::{consensus_params, Network};

    #[test]
    fn genesis_is_stable() {
        let params = consensus_params(Network::Regtest);
        let a = genesis_block(&params);
        let b = genesis_block(&params);
        assert_eq!(a.header.hash(), b.header.hash());
        assert_eq!(a.header.merkle_root, a.transactions[0].txid());
        assert!(a.transactions[0].is_coinbase());
    }

    #[test]
    fn networks_diverge() {
        let mainnet = genesis_block(&consensus_params(Network::Mainnet));
        let testnet = genesis_block(&consensus_params(Network::Testnet));
        assert_ne!(mainnet.header.hash(), testnet.header.hash());
    }
}
