//! The three compact index tables.
//!
//! Every unspent-output entry packs, low to high: a 16-bit originating
//! batch index, three 2-bit collision counters (one per table), then one
//! bit per output, 1 = unspent. The encoding is chosen by total bit count:
//! a `u32` value, a `u64` value, or an array of `u32` words for wide
//! transactions. Tables are always probed in that order.

use std::collections::HashMap;

use boltd_consensus::Hash256;
use boltd_primitives::encoding::{DecodeError, Decoder, Encoder};
use boltd_primitives::hash::truncated_key;
use smallvec::SmallVec;

pub const TABLE_COUNT: usize = 3;
pub const BATCH_INDEX_BITS: u32 = 16;
pub const COLLISION_BITS_PER_TABLE: u32 = 2;
pub const NON_OUTPUT_BITS: u32 = BATCH_INDEX_BITS + COLLISION_BITS_PER_TABLE * TABLE_COUNT as u32;

const BATCH_INDEX_MASK: u32 = (1 << BATCH_INDEX_BITS) - 1;
const COLLISION_FIELD_MASK: u32 = 0b11;
const META_MASK: u32 = (1 << NON_OUTPUT_BITS) - 1;
/// Collision counters saturate at 3; four transactions sharing one
/// truncated key is beyond the design point of the 2-bit field.
const COLLISION_COUNT_MAX: u8 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TableId {
    U32 = 0,
    U64 = 1,
    Wide = 2,
}

impl TableId {
    /// Fixed probe priority: narrowest encoding first.
    pub const ALL: [TableId; TABLE_COUNT] = [TableId::U32, TableId::U64, TableId::Wide];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn snapshot_file(self) -> &'static str {
        match self {
            TableId::U32 => "table_u32",
            TableId::U64 => "table_u64",
            TableId::Wide => "table_wide",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TableMetrics {
    pub primary: usize,
    pub collision: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendStatus {
    pub all_spent: bool,
}

/// Spending a bit that is out of range or already clear. Both cases mean
/// the referenced output does not exist in the table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendViolation;

/// Uniform capability surface over the three encodings. The engine never
/// touches a table's maps directly.
pub trait IndexTable: Send + Sync {
    fn id(&self) -> TableId;
    fn fits(&self, output_count: usize) -> bool;

    fn insert_primary(&mut self, key: u32, output_count: usize, batch_index: u32);
    fn insert_collision(&mut self, txid: Hash256, output_count: usize, batch_index: u32);
    fn contains_primary(&self, key: u32) -> bool;

    fn collision_counts(&self, key: u32) -> [u8; TABLE_COUNT];
    fn add_collision_flag(&mut self, key: u32, host: TableId);
    fn set_collision_counts(&mut self, key: u32, counts: [u8; TABLE_COUNT]);

    fn spend_primary(&mut self, key: u32, vout: u32) -> Result<SpendStatus, SpendViolation>;
    fn remove_primary(&mut self, key: u32);

    /// Spend against a collision record matching `txid`. `None` when no
    /// record under this key carries that full hash.
    fn spend_collision(
        &mut self,
        key: u32,
        txid: &Hash256,
        vout: u32,
    ) -> Option<Result<SpendStatus, SpendViolation>>;
    fn remove_collision(&mut self, key: u32, txid: &Hash256);

    /// Move the first collision record under `key` into primary position.
    fn promote_collision(&mut self, key: u32) -> bool;

    fn metrics(&self) -> TableMetrics;
    fn clear(&mut self);

    /// Canonical (key-sorted) serialization for snapshots.
    fn write_snapshot(&self) -> Vec<u8>;
    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), DecodeError>;
}

fn collision_shift(table: TableId) -> u32 {
    BATCH_INDEX_BITS + COLLISION_BITS_PER_TABLE * table.index() as u32
}

fn meta_collision_counts(meta: u32) -> [u8; TABLE_COUNT] {
    let mut out = [0u8; TABLE_COUNT];
    for table in TableId::ALL {
        out[table.index()] = ((meta >> collision_shift(table)) & COLLISION_FIELD_MASK) as u8;
    }
    out
}

fn meta_with_counts(meta: u32, counts: [u8; TABLE_COUNT]) -> u32 {
    let mut out = meta & BATCH_INDEX_MASK | (meta & !META_MASK);
    for table in TableId::ALL {
        let count = u32::from(counts[table.index()].min(COLLISION_COUNT_MAX));
        out |= count << collision_shift(table);
    }
    out
}

fn meta_add_flag(meta: u32, host: TableId) -> u32 {
    let mut counts = meta_collision_counts(meta);
    let slot = &mut counts[host.index()];
    *slot = slot.saturating_add(1).min(COLLISION_COUNT_MAX);
    meta_with_counts(meta, counts)
}

/// One unspent-output value in the `u32` encoding.
fn make_u32_value(output_count: usize, batch_index: u32) -> u32 {
    let outputs = ((1u32 << output_count) - 1) << NON_OUTPUT_BITS;
    (batch_index & BATCH_INDEX_MASK) | outputs
}

fn spend_u32(value: &mut u32, vout: u32) -> Result<SpendStatus, SpendViolation> {
    let position = NON_OUTPUT_BITS + vout;
    if position >= 32 {
        return Err(SpendViolation);
    }
    let bit = 1u32 << position;
    if *value & bit == 0 {
        return Err(SpendViolation);
    }
    *value &= !bit;
    Ok(SpendStatus {
        all_spent: *value & !META_MASK == 0,
    })
}

fn make_u64_value(output_count: usize, batch_index: u32) -> u64 {
    let outputs = ((1u64 << output_count) - 1) << NON_OUTPUT_BITS;
    u64::from(batch_index & BATCH_INDEX_MASK) | outputs
}

fn spend_u64(value: &mut u64, vout: u32) -> Result<SpendStatus, SpendViolation> {
    let position = NON_OUTPUT_BITS + vout;
    if position >= 64 {
        return Err(SpendViolation);
    }
    let bit = 1u64 << position;
    if *value & bit == 0 {
        return Err(SpendViolation);
    }
    *value &= !bit;
    Ok(SpendStatus {
        all_spent: *value & !u64::from(META_MASK) == 0,
    })
}

type WideValue = SmallVec<[u32; 4]>;

fn make_wide_value(output_count: usize, batch_index: u32) -> WideValue {
    let total_bits = NON_OUTPUT_BITS as usize + output_count;
    let words = total_bits.div_ceil(32);
    let mut value: WideValue = SmallVec::with_capacity(words);
    for word in 0..words {
        let low = word * 32;
        let high = (low + 32).min(total_bits);
        let mut bits = 0u32;
        for position in low..high {
            if position >= NON_OUTPUT_BITS as usize {
                bits |= 1 << (position - low);
            }
        }
        value.push(bits);
    }
    value[0] |= batch_index & BATCH_INDEX_MASK;
    value
}

fn spend_wide(value: &mut WideValue, vout: u32) -> Result<SpendStatus, SpendViolation> {
    let position = NON_OUTPUT_BITS as usize + vout as usize;
    let word = position / 32;
    if word >= value.len() {
        return Err(SpendViolation);
    }
    let bit = 1u32 << (position % 32);
    if value[word] & bit == 0 {
        return Err(SpendViolation);
    }
    value[word] &= !bit;
    let mut remaining = value[0] & !META_MASK;
    for word in &value[1..] {
        remaining |= *word;
    }
    Ok(SpendStatus {
        all_spent: remaining == 0,
    })
}

/// Collision records for one truncated key, keyed by full transaction id.
type CollisionSlot<V> = SmallVec<[(Hash256, V); 1]>;

macro_rules! compact_table {
    ($name:ident, $value:ty, $id:expr, $max_outputs:expr, $make:ident, $spend:ident,
     $write_value:ident, $read_value:ident) => {
        #[derive(Default)]
        pub struct $name {
            primary: HashMap<u32, $value>,
            collisions: HashMap<u32, CollisionSlot<$value>>,
        }

        impl IndexTable for $name {
            fn id(&self) -> TableId {
                $id
            }

            fn fits(&self, output_count: usize) -> bool {
                output_count > 0 && output_count <= $max_outputs
            }

            fn insert_primary(&mut self, key: u32, output_count: usize, batch_index: u32) {
                self.primary.insert(key, $make(output_count, batch_index));
            }

            fn insert_collision(&mut self, txid: Hash256, output_count: usize, batch_index: u32) {
                let key = truncated_key(&txid);
                self.collisions
                    .entry(key)
                    .or_default()
                    .push((txid, $make(output_count, batch_index)));
            }

            fn contains_primary(&self, key: u32) -> bool {
                self.primary.contains_key(&key)
            }

            fn collision_counts(&self, key: u32) -> [u8; TABLE_COUNT] {
                self.primary
                    .get(&key)
                    .map(|value| meta_collision_counts(*value as u32 & META_MASK))
                    .unwrap_or_default()
            }

            fn add_collision_flag(&mut self, key: u32, host: TableId) {
                if let Some(value) = self.primary.get_mut(&key) {
                    let meta = meta_add_flag(*value as u32 & META_MASK, host);
                    *value = (*value & !(<$value>::from(META_MASK))) | <$value>::from(meta);
                }
            }

            fn set_collision_counts(&mut self, key: u32, counts: [u8; TABLE_COUNT]) {
                if let Some(value) = self.primary.get_mut(&key) {
                    let meta = meta_with_counts(*value as u32 & META_MASK, counts);
                    *value = (*value & !(<$value>::from(META_MASK))) | <$value>::from(meta);
                }
            }

            fn spend_primary(&mut self, key: u32, vout: u32) -> Result<SpendStatus, SpendViolation> {
                match self.primary.get_mut(&key) {
                    Some(value) => $spend(value, vout),
                    None => Err(SpendViolation),
                }
            }

            fn remove_primary(&mut self, key: u32) {
                self.primary.remove(&key);
            }

            fn spend_collision(
                &mut self,
                key: u32,
                txid: &Hash256,
                vout: u32,
            ) -> Option<Result<SpendStatus, SpendViolation>> {
                let slot = self.collisions.get_mut(&key)?;
                let (_, value) = slot.iter_mut().find(|(hash, _)| hash == txid)?;
                Some($spend(value, vout))
            }

            fn remove_collision(&mut self, key: u32, txid: &Hash256) {
                if let Some(slot) = self.collisions.get_mut(&key) {
                    slot.retain(|(hash, _)| hash != txid);
                    if slot.is_empty() {
                        self.collisions.remove(&key);
                    }
                }
            }

            fn promote_collision(&mut self, key: u32) -> bool {
                let Some(slot) = self.collisions.get_mut(&key) else {
                    return false;
                };
                // Lowest full hash wins so promotion is reproducible no
                // matter what order the records were inserted or reloaded.
                let Some(winner) = slot
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (hash, _))| *hash)
                    .map(|(position, _)| position)
                else {
                    return false;
                };
                let (_, value) = slot.remove(winner);
                if slot.is_empty() {
                    self.collisions.remove(&key);
                }
                self.primary.insert(key, value);
                true
            }

            fn metrics(&self) -> TableMetrics {
                TableMetrics {
                    primary: self.primary.len(),
                    collision: self.collisions.values().map(|slot| slot.len()).sum(),
                }
            }

            fn clear(&mut self) {
                self.primary.clear();
                self.collisions.clear();
            }

            fn write_snapshot(&self) -> Vec<u8> {
                let mut encoder = Encoder::new();

                let mut primaries: Vec<_> = self.primary.iter().collect();
                primaries.sort_unstable_by_key(|(key, _)| **key);
                encoder.write_u32_le(primaries.len() as u32);
                for (key, value) in primaries {
                    encoder.write_u32_le(*key);
                    $write_value(&mut encoder, value);
                }

                let mut collisions: Vec<_> = self
                    .collisions
                    .values()
                    .flat_map(|slot| slot.iter())
                    .collect();
                collisions.sort_unstable_by_key(|(hash, _)| *hash);
                encoder.write_u32_le(collisions.len() as u32);
                for (hash, value) in collisions {
                    encoder.write_hash_le(hash);
                    $write_value(&mut encoder, value);
                }

                encoder.into_inner()
            }

            fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
                self.clear();
                let mut decoder = Decoder::new(bytes);

                let primary_count = decoder.read_u32_le()?;
                for _ in 0..primary_count {
                    let key = decoder.read_u32_le()?;
                    let value = $read_value(&mut decoder)?;
                    self.primary.insert(key, value);
                }

                let collision_count = decoder.read_u32_le()?;
                for _ in 0..collision_count {
                    let hash = decoder.read_hash_le()?;
                    let value = $read_value(&mut decoder)?;
                    self.collisions
                        .entry(truncated_key(&hash))
                        .or_default()
                        .push((hash, value));
                }

                if !decoder.is_empty() {
                    return Err(DecodeError::TrailingBytes);
                }
                Ok(())
            }
        }
    };
}

fn write_value_u32(encoder: &mut Encoder, value: &u32) {
    encoder.write_u32_le(*value);
}

fn read_value_u32(decoder: &mut Decoder) -> Result<u32, DecodeError> {
    decoder.read_u32_le()
}

fn write_value_u64(encoder: &mut Encoder, value: &u64) {
    encoder.write_u64_le(*value);
}

fn read_value_u64(decoder: &mut Decoder) -> Result<u64, DecodeError> {
    decoder.read_u64_le()
}

fn write_value_wide(encoder: &mut Encoder, value: &WideValue) {
    encoder.write_varint(value.len() as u64);
    for word in value {
        encoder.write_u32_le(*word);
    }
}

fn read_value_wide(decoder: &mut Decoder) -> Result<WideValue, DecodeError> {
    let words = decoder.read_varint()?;
    let mut value: WideValue = SmallVec::with_capacity(words as usize);
    for _ in 0..words {
        value.push(decoder.read_u32_le()?);
    }
    Ok(value)
}

const MAX_OUTPUTS_U32: usize = (32 - NON_OUTPUT_BITS) as usize;
const MAX_OUTPUTS_U64: usize = (64 - NON_OUTPUT_BITS) as usize;

compact_table!(
    TableU32,
    u32,
    TableId::U32,
    MAX_OUTPUTS_U32,
    make_u32_value,
    spend_u32,
    write_value_u32,
    read_value_u32
);

compact_table!(
    TableU64,
    u64,
    TableId::U64,
    MAX_OUTPUTS_U64,
    make_u64_value,
    spend_u64,
    write_value_u64,
    read_value_u64
);

/// Array-of-words table for transactions too wide for the fixed encodings.
#[derive(Default)]
pub struct TableWide {
    primary: HashMap<u32, WideValue>,
    collisions: HashMap<u32, CollisionSlot<WideValue>>,
}

impl IndexTable for TableWide {
    fn id(&self) -> TableId {
        TableId::Wide
    }

    fn fits(&self, output_count: usize) -> bool {
        output_count > 0
    }

    fn insert_primary(&mut self, key: u32, output_count: usize, batch_index: u32) {
        self.primary.insert(key, make_wide_value(output_count, batch_index));
    }

    fn insert_collision(&mut self, txid: Hash256, output_count: usize, batch_index: u32) {
        let key = truncated_key(&txid);
        self.collisions
            .entry(key)
            .or_default()
            .push((txid, make_wide_value(output_count, batch_index)));
    }

    fn contains_primary(&self, key: u32) -> bool {
        self.primary.contains_key(&key)
    }

    fn collision_counts(&self, key: u32) -> [u8; TABLE_COUNT] {
        self.primary
            .get(&key)
            .map(|value| meta_collision_counts(value[0] & META_MASK))
            .unwrap_or_default()
    }

    fn add_collision_flag(&mut self, key: u32, host: TableId) {
        if let Some(value) = self.primary.get_mut(&key) {
            let meta = meta_add_flag(value[0] & META_MASK, host);
            value[0] = (value[0] & !META_MASK) | meta;
        }
    }

    fn set_collision_counts(&mut self, key: u32, counts: [u8; TABLE_COUNT]) {
        if let Some(value) = self.primary.get_mut(&key) {
            let meta = meta_with_counts(value[0] & META_MASK, counts);
            value[0] = (value[0] & !META_MASK) | meta;
        }
    }

    fn spend_primary(&mut self, key: u32, vout: u32) -> Result<SpendStatus, SpendViolation> {
        match self.primary.get_mut(&key) {
            Some(value) => spend_wide(value, vout),
            None => Err(SpendViolation),
        }
    }

    fn remove_primary(&mut self, key: u32) {
        self.primary.remove(&key);
    }

    fn spend_collision(
        &mut self,
        key: u32,
        txid: &Hash256,
        vout: u32,
    ) -> Option<Result<SpendStatus, SpendViolation>> {
        let slot = self.collisions.get_mut(&key)?;
        let (_, value) = slot.iter_mut().find(|(hash, _)| hash == txid)?;
        Some(spend_wide(value, vout))
    }

    fn remove_collision(&mut self, key: u32, txid: &Hash256) {
        if let Some(slot) = self.collisions.get_mut(&key) {
            slot.retain(|(hash, _)| hash != txid);
            if slot.is_empty() {
                self.collisions.remove(&key);
            }
        }
    }

    fn promote_collision(&mut self, key: u32) -> bool {
        let Some(slot) = self.collisions.get_mut(&key) else {
            return false;
        };
        let Some(winner) = slot
            .iter()
            .enumerate()
            .min_by_key(|(_, (hash, _))| *hash)
            .map(|(position, _)| position)
        else {
            return false;
        };
        let (_, value) = slot.remove(winner);
        if slot.is_empty() {
            self.collisions.remove(&key);
        }
        self.primary.insert(key, value);
        true
    }

    fn metrics(&self) -> TableMetrics {
        TableMetrics {
            primary: self.primary.len(),
            collision: self.collisions.values().map(|slot| slot.len()).sum(),
        }
    }

    fn clear(&mut self) {
        self.primary.clear();
        self.collisions.clear();
    }

    fn write_snapshot(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();

        let mut primaries: Vec<_> = self.primary.iter().collect();
        primaries.sort_unstable_by_key(|(key, _)| **key);
        encoder.write_u32_le(primaries.len() as u32);
        for (key, value) in primaries {
            encoder.write_u32_le(*key);
            write_value_wide(&mut encoder, value);
        }

        let mut collisions: Vec<_> = self
            .collisions
            .values()
            .flat_map(|slot| slot.iter())
            .collect();
        collisions.sort_unstable_by_key(|(hash, _)| *hash);
        encoder.write_u32_le(collisions.len() as u32);
        for (hash, value) in collisions {
            encoder.write_hash_le(hash);
            write_value_wide(&mut encoder, value);
        }

        encoder.into_inner()
    }

    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.clear();
        let mut decoder = Decoder::new(bytes);

        let primary_count = decoder.read_u32_le()?;
        for _ in 0..primary_count {
            let key = decoder.read_u32_le()?;
            let value = read_value_wide(&mut decoder)?;
            self.primary.insert(key, value);
        }

        let collision_count = decoder.read_u32_le()?;
        for _ in 0..collision_count {
            let hash = decoder.read_hash_le()?;
            let value = read_value_wide(&mut decoder)?;
            self.collisions
                .entry(truncated_key(&hash))
                .or_default()
                .push((hash, value));
        }

        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(())
    }
}
