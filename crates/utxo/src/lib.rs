//! Compact multi-table UTXO index engine.

pub mod engine;
pub mod snapshot;
pub mod tables;

pub use engine::{SpendOutcome, SpendRef, UtxoError, UtxoTable};
pub use snapshot::{load_snapshot, save_snapshot, LoadOutcome};
pub use tables::{TableId, TableMetrics, NON_OUTPUT_BITS};
