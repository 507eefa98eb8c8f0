//! The UTXO engine: three index tables coordinated as one logical set.

use boltd_consensus::Hash256;
use boltd_primitives::hash::{hash256_to_hex, truncated_key};

use crate::tables::{
    IndexTable, SpendViolation, TableId, TableMetrics, TableU32, TableU64, TableWide, TABLE_COUNT,
};

/// Reference to an output being spent: the full producing txid plus the
/// output index. The truncated key is derived, not trusted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendRef {
    pub txid: Hash256,
    pub vout: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendOutcome {
    /// The spend emptied its entry, which was removed from its table.
    pub all_outputs_spent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    /// Referenced transaction is in no table: double-spend, malformed
    /// block, or an ordering defect upstream.
    NotFound { txid: Hash256 },
    /// The entry exists but the output index is out of range or already
    /// clear.
    OutputUnavailable { txid: Hash256, vout: u32 },
    /// No table can represent this output count.
    Unrepresentable { output_count: usize },
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::NotFound { txid } => {
                write!(f, "referenced tx {} not found in UTXO table", hash256_to_hex(txid))
            }
            UtxoError::OutputUnavailable { txid, vout } => write!(
                f,
                "output {vout} of {} absent or already spent",
                hash256_to_hex(txid)
            ),
            UtxoError::Unrepresentable { output_count } => {
                write!(f, "no index table fits {output_count} outputs")
            }
        }
    }
}

impl std::error::Error for UtxoError {}

pub struct UtxoTable {
    tables: [Box<dyn IndexTable>; TABLE_COUNT],
    /// Next batch index to merge; equal to the number of merged batches.
    archive_index: u32,
    /// Height of the last merged block, -1 before genesis.
    block_height: i32,
    last_header_hash: Hash256,
}

impl Default for UtxoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoTable {
    pub fn new() -> Self {
        Self {
            tables: [
                Box::new(TableU32::default()),
                Box::new(TableU64::default()),
                Box::new(TableWide::default()),
            ],
            archive_index: 0,
            block_height: -1,
            last_header_hash: [0u8; 32],
        }
    }

    pub fn archive_index(&self) -> u32 {
        self.archive_index
    }

    pub fn set_archive_index(&mut self, index: u32) {
        self.archive_index = index;
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn last_header_hash(&self) -> &Hash256 {
        &self.last_header_hash
    }

    pub fn metrics(&self) -> [TableMetrics; TABLE_COUNT] {
        [
            self.tables[0].metrics(),
            self.tables[1].metrics(),
            self.tables[2].metrics(),
        ]
    }

    pub fn entry_count(&self) -> usize {
        self.metrics()
            .iter()
            .map(|m| m.primary + m.collision)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Stage one transaction's outputs. Collisions are detected purely from
    /// already-inserted keys, so outcomes are reproducible for a given
    /// transaction sequence.
    pub fn insert_outputs(
        &mut self,
        txid: &Hash256,
        output_count: usize,
        batch_index: u32,
    ) -> Result<(), UtxoError> {
        let host = self
            .fitting_table(output_count)
            .ok_or(UtxoError::Unrepresentable { output_count })?;
        let key = truncated_key(txid);

        for table in TableId::ALL {
            if self.tables[table.index()].contains_primary(key) {
                self.tables[table.index()].add_collision_flag(key, host);
                self.tables[host.index()].insert_collision(*txid, output_count, batch_index);
                return Ok(());
            }
        }

        self.tables[host.index()].insert_primary(key, output_count, batch_index);
        Ok(())
    }

    /// Spend one output. Probes tables in priority order for the primary
    /// entry; when collision counters are set, collision records are
    /// resolved by full hash before the primary is touched.
    pub fn spend(&mut self, input: &SpendRef) -> Result<SpendOutcome, UtxoError> {
        let key = truncated_key(&input.txid);

        for table in TableId::ALL {
            if !self.tables[table.index()].contains_primary(key) {
                continue;
            }
            let counts = self.tables[table.index()].collision_counts(key);

            for other in TableId::ALL {
                if counts[other.index()] == 0 {
                    continue;
                }
                if let Some(result) =
                    self.tables[other.index()].spend_collision(key, &input.txid, input.vout)
                {
                    let status = result.map_err(|SpendViolation| UtxoError::OutputUnavailable {
                        txid: input.txid,
                        vout: input.vout,
                    })?;
                    if status.all_spent {
                        self.tables[other.index()].remove_collision(key, &input.txid);
                        let mut counts = counts;
                        counts[other.index()] = counts[other.index()].saturating_sub(1);
                        self.tables[table.index()].set_collision_counts(key, counts);
                    }
                    return Ok(SpendOutcome {
                        all_outputs_spent: status.all_spent,
                    });
                }
            }

            // Collision candidates exhausted: the truncated key can only
            // refer to the primary entry.
            let status = self.tables[table.index()]
                .spend_primary(key, input.vout)
                .map_err(|SpendViolation| UtxoError::OutputUnavailable {
                    txid: input.txid,
                    vout: input.vout,
                })?;
            if status.all_spent {
                self.tables[table.index()].remove_primary(key);
                self.promote_after_removal(key, counts);
            }
            return Ok(SpendOutcome {
                all_outputs_spent: status.all_spent,
            });
        }

        Err(UtxoError::NotFound { txid: input.txid })
    }

    /// After a flagged primary is removed, the first surviving collision
    /// record becomes the key's primary in its host table, carrying the
    /// remaining collision counts.
    fn promote_after_removal(&mut self, key: u32, counts: [u8; TABLE_COUNT]) {
        for host in TableId::ALL {
            if counts[host.index()] == 0 {
                continue;
            }
            if self.tables[host.index()].promote_collision(key) {
                let mut remaining = counts;
                remaining[host.index()] -= 1;
                self.tables[host.index()].set_collision_counts(key, remaining);
                return;
            }
        }
    }

    /// Record one merged block in the scalar progress markers.
    pub fn advance_block(&mut self, header_hash: &Hash256) {
        self.block_height += 1;
        self.last_header_hash = *header_hash;
    }

    pub fn set_progress(&mut self, archive_index: u32, block_height: i32, header_hash: Hash256) {
        self.archive_index = archive_index;
        self.block_height = block_height;
        self.last_header_hash = header_hash;
    }

    pub fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.archive_index = 0;
        self.block_height = -1;
        self.last_header_hash = [0u8; 32];
    }

    pub fn table_snapshot_bytes(&self, id: TableId) -> Vec<u8> {
        self.tables[id.index()].write_snapshot()
    }

    pub(crate) fn tables(&self) -> &[Box<dyn IndexTable>; TABLE_COUNT] {
        &self.tables
    }

    pub(crate) fn tables_mut(&mut self) -> &mut [Box<dyn IndexTable>; TABLE_COUNT] {
        &mut self.tables
    }

    fn fitting_table(&self, output_count: usize) -> Option<TableId> {
        TableId::ALL
            .into_iter()
            .find(|table| self.tables[table.index()].fits(output_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[0] = tag;
        out[31] = 0xee;
        out
    }

    #[test]
    fn narrow_transactions_land_in_u32_table() {
        let mut table = UtxoTable::new();
        table.insert_outputs(&txid(1), 1, 0).expect("insert");
        let metrics = table.metrics();
        assert_eq!(metrics[TableId::U32.index()].primary, 1);
        assert_eq!(metrics[TableId::U64.index()].primary, 0);
    }

    #[test]
    fn width_selects_table() {
        let mut table = UtxoTable::new();
        table.insert_outputs(&txid(1), 10, 0).expect("u32");
        table.insert_outputs(&txid(2), 11, 0).expect("u64");
        table.insert_outputs(&txid(3), 42, 0).expect("u64 max");
        table.insert_outputs(&txid(4), 43, 0).expect("wide");
        let metrics = table.metrics();
        assert_eq!(metrics[TableId::U32.index()].primary, 1);
        assert_eq!(metrics[TableId::U64.index()].primary, 2);
        assert_eq!(metrics[TableId::Wide.index()].primary, 1);
    }

    #[test]
    fn zero_outputs_rejected() {
        let mut table = UtxoTable::new();
        assert_eq!(
            table.insert_outputs(&txid(1), 0, 0),
            Err(UtxoError::Unrepresentable { output_count: 0 })
        );
    }

    #[test]
    fn genesis_scenario() {
        let mut table = UtxoTable::new();
        let coinbase = txid(0x42);
        table.insert_outputs(&coinbase, 1, 0).expect("insert");
        assert_eq!(table.entry_count(), 1);

        let outcome = table
            .spend(&SpendRef {
                txid: coinbase,
                vout: 0,
            })
            .expect("spend");
        assert!(outcome.all_outputs_spent);
        assert!(table.is_empty());

        assert_eq!(
            table.spend(&SpendRef {
                txid: coinbase,
                vout: 0,
            }),
            Err(UtxoError::NotFound { txid: coinbase })
        );
    }

    #[test]
    fn spend_unknown_output_index_is_fatal() {
        let mut table = UtxoTable::new();
        let id = txid(0x42);
        table.insert_outputs(&id, 2, 0).expect("insert");
        assert_eq!(
            table.spend(&SpendRef { txid: id, vout: 5 }),
            Err(UtxoError::OutputUnavailable { txid: id, vout: 5 })
        );
    }

    #[test]
    fn progress_markers_advance() {
        let mut table = UtxoTable::new();
        assert_eq!(table.block_height(), -1);
        table.advance_block(&txid(9));
        assert_eq!(table.block_height(), 0);
        assert_eq!(table.last_header_hash(), &txid(9));
    }
}
