//! Pure batch parsing: raw block bytes to staged insert/spend data.
//!
//! Parsing validates each block against its expected header-chain position
//! and recomputes the merkle root, but touches no engine state; that is
//! what lets batches parse concurrently while merges stay serialized.

use boltd_consensus::Hash256;
use boltd_headerchain::{HeaderChain, HeaderId};
use boltd_primitives::block::HEADER_SIZE;
use boltd_primitives::encoding::{DecodeError, Decoder};
use boltd_primitives::hash::{hash256_to_hex, sha256d, sha256d_parts};
use boltd_primitives::merkle::merkle_root;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Decode(DecodeError),
    /// First block of the batch does not match any known header.
    UnknownHeader(Hash256),
    /// Block does not hash to the main-chain successor of its predecessor.
    UnexpectedHeaderHash {
        expected: Hash256,
        actual: Hash256,
    },
    /// Buffer continues past the main-chain tip.
    BeyondMainChain(Hash256),
    /// Merkle root recomputation does not match the header.
    PayloadCorrupted(Hash256),
    EmptyBatch,
    MissingCoinbase(Hash256),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Decode(err) => write!(f, "{err}"),
            ParseError::UnknownHeader(hash) => {
                write!(f, "header {} not in chain", hash256_to_hex(hash))
            }
            ParseError::UnexpectedHeaderHash { expected, actual } => write!(
                f,
                "unexpected header hash {}, expected {}",
                hash256_to_hex(actual),
                hash256_to_hex(expected)
            ),
            ParseError::BeyondMainChain(hash) => write!(
                f,
                "block {} continues past the main-chain tip",
                hash256_to_hex(hash)
            ),
            ParseError::PayloadCorrupted(hash) => {
                write!(f, "payload corrupted in block {}", hash256_to_hex(hash))
            }
            ParseError::EmptyBatch => write!(f, "batch buffer holds no blocks"),
            ParseError::MissingCoinbase(hash) => {
                write!(f, "block {} has no transactions", hash256_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<DecodeError> for ParseError {
    fn from(err: DecodeError) -> Self {
        ParseError::Decode(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxInputRef {
    pub txid: Hash256,
    pub vout: u32,
}

#[derive(Clone, Debug)]
pub struct ParsedTx {
    pub txid: Hash256,
    pub output_count: usize,
    /// Empty for the coinbase: its input spends nothing.
    pub inputs: Vec<TxInputRef>,
}

#[derive(Clone, Debug)]
pub struct ParsedBlock {
    pub header_hash: Hash256,
    pub txs: Vec<ParsedTx>,
}

#[derive(Clone, Debug)]
pub struct ParsedBatch {
    pub blocks: Vec<ParsedBlock>,
    pub first: HeaderId,
    pub last: HeaderId,
    /// The batch's last block is the current main-chain tip.
    pub reached_tip: bool,
}

/// Decode a buffer of contiguous blocks, validating header linkage and
/// merkle roots along the way.
pub fn parse_batch(chain: &HeaderChain, buffer: &[u8]) -> Result<ParsedBatch, ParseError> {
    let mut decoder = Decoder::new(buffer);
    let mut blocks = Vec::new();
    let mut first = None;
    let mut position: Option<HeaderId> = None;

    while !decoder.is_empty() {
        let header_start = decoder.position();
        let header =
            boltd_primitives::block::BlockHeader::consensus_decode_from(&mut decoder)?;
        let header_hash = sha256d(decoder.slice(header_start, header_start + HEADER_SIZE));

        let id = match position {
            None => chain
                .read_header(&header_hash)
                .ok_or(ParseError::UnknownHeader(header_hash))?,
            Some(previous) => {
                let expected = chain
                    .next_in_main(previous)
                    .ok_or(ParseError::BeyondMainChain(header_hash))?;
                let expected_hash = chain.hash(expected);
                if expected_hash != &header_hash {
                    return Err(ParseError::UnexpectedHeaderHash {
                        expected: *expected_hash,
                        actual: header_hash,
                    });
                }
                expected
            }
        };
        first.get_or_insert(id);
        position = Some(id);

        let tx_count = decoder.read_varint()? as usize;
        if tx_count == 0 {
            return Err(ParseError::MissingCoinbase(header_hash));
        }
        let mut txs = Vec::with_capacity(tx_count);
        let mut txids = Vec::with_capacity(tx_count);
        for tx_index in 0..tx_count {
            let tx = parse_tx(&mut decoder, tx_index == 0)?;
            txids.push(tx.txid);
            txs.push(tx);
        }

        if merkle_root(&txids) != header.merkle_root {
            return Err(ParseError::PayloadCorrupted(header_hash));
        }

        blocks.push(ParsedBlock { header_hash, txs });
    }

    let (Some(first), Some(last)) = (first, position) else {
        return Err(ParseError::EmptyBatch);
    };
    Ok(ParsedBatch {
        blocks,
        first,
        last,
        reached_tip: chain.next_in_main(last).is_none(),
    })
}

/// Decode one transaction, skipping witness data but excluding it from the
/// txid, and staging only what the engine needs: the txid, the output
/// count, and the spent-output references.
fn parse_tx(decoder: &mut Decoder, is_coinbase: bool) -> Result<ParsedTx, ParseError> {
    let tx_start = decoder.position();
    decoder.skip(4)?; // version
    let version_end = decoder.position();

    let has_witness = decoder.peek_u8()? == SEGWIT_MARKER;
    if has_witness {
        decoder.skip(1)?;
        if decoder.read_u8()? != SEGWIT_FLAG {
            return Err(ParseError::Decode(DecodeError::InvalidData(
                "invalid segwit flag",
            )));
        }
    }
    let body_start = decoder.position();

    let input_count = decoder.read_varint()? as usize;
    let mut inputs = Vec::with_capacity(if is_coinbase { 0 } else { input_count });
    for _ in 0..input_count {
        let txid = decoder.read_hash_le()?;
        let vout = decoder.read_u32_le()?;
        let script_len = decoder.read_varint()? as usize;
        decoder.skip(script_len)?;
        decoder.skip(4)?; // sequence
        if !is_coinbase {
            inputs.push(TxInputRef { txid, vout });
        }
    }

    let output_count = decoder.read_varint()? as usize;
    for _ in 0..output_count {
        decoder.skip(8)?; // value
        let script_len = decoder.read_varint()? as usize;
        decoder.skip(script_len)?;
    }
    let body_end = decoder.position();

    if has_witness {
        for _ in 0..input_count {
            let item_count = decoder.read_varint()? as usize;
            for _ in 0..item_count {
                let item_len = decoder.read_varint()? as usize;
                decoder.skip(item_len)?;
            }
        }
    }

    let lock_time_start = decoder.position();
    decoder.skip(4)?;
    let lock_time_end = decoder.position();

    let txid = sha256d_parts(&[
        decoder.slice(tx_start, version_end),
        decoder.slice(body_start, body_end),
        decoder.slice(lock_time_start, lock_time_end),
    ]);

    Ok(ParsedTx {
        txid,
        output_count,
        inputs,
    })
}
