// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Chunk addressing.
//!
//! A [`ChunkKey`] is an ordered tuple of small integers
//! `(db, table, column, fragment[, varlen part])` identifying a contiguous
//! run of column values. The first two components form the table key, and
//! prefix ordering over keys is the tuple ordering, so range scans over a
//! `BTreeSet`/`BTreeMap` of keys implement prefix queries.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::LogicalType;

/// Chunk address. At most five components, stored inline.
pub type ChunkKey = SmallVec<[i32; 5]>;

pub const CHUNK_KEY_DB_IDX: usize = 0;
pub const CHUNK_KEY_TABLE_IDX: usize = 1;
pub const CHUNK_KEY_COLUMN_IDX: usize = 2;
pub const CHUNK_KEY_FRAGMENT_IDX: usize = 3;
pub const CHUNK_KEY_VARLEN_IDX: usize = 4;

/// Fifth key component of a variable-length data chunk.
pub const VARLEN_DATA_PART: i32 = 1;
/// Fifth key component of a variable-length offsets chunk.
pub const VARLEN_OFFSETS_PART: i32 = 2;

/// Returns the 2-element `(db, table)` prefix of a key.
pub fn get_table_key(key: &ChunkKey) -> ChunkKey {
    debug_assert!(has_table_prefix(key));
    ChunkKey::from_slice(&key[..2])
}

pub fn is_table_key(key: &ChunkKey) -> bool {
    key.len() == 2
}

pub fn has_table_prefix(key: &ChunkKey) -> bool {
    key.len() >= 2
}

/// A variable-length chunk carries a fifth component distinguishing its data
/// part from its offsets part.
pub fn is_varlen_key(key: &ChunkKey) -> bool {
    key.len() == 5
}

pub fn is_varlen_data_key(key: &ChunkKey) -> bool {
    is_varlen_key(key) && key[CHUNK_KEY_VARLEN_IDX] == VARLEN_DATA_PART
}

/// The offsets key paired with a varlen data key.
pub fn get_offsets_key(data_key: &ChunkKey) -> ChunkKey {
    debug_assert!(is_varlen_data_key(data_key));
    let mut key = data_key.clone();
    key[CHUNK_KEY_VARLEN_IDX] = VARLEN_OFFSETS_PART;
    key
}

/// Upper bound for a prefix range query: the prefix extended by `i32::MAX`.
/// All keys `k` with `prefix <= k < prefix ++ [i32::MAX]` match the prefix.
pub fn prefix_upper_bound(prefix: &ChunkKey) -> ChunkKey {
    let mut upper = prefix.clone();
    upper.push(i32::MAX);
    upper
}

pub fn show_chunk(key: &ChunkKey) -> String {
    use itertools::Itertools;
    format!("[{}]", key.iter().join(", "))
}

/// Per-chunk statistics kept alongside the chunk's type and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub min: crate::types::DataValue,
    pub max: crate::types::DataValue,
    pub has_nulls: bool,
}

impl ChunkStats {
    pub fn empty() -> Self {
        Self {
            min: crate::types::DataValue::Null,
            max: crate::types::DataValue::Null,
            has_nulls: false,
        }
    }
}

/// Metadata for one chunk. May exist without a materialized chunk buffer,
/// in which case the entry is metadata-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub logical_type: LogicalType,
    pub num_bytes: u64,
    pub num_elements: u64,
    pub stats: ChunkStats,
}

impl ChunkMetadata {
    pub fn new(
        logical_type: LogicalType,
        num_bytes: u64,
        num_elements: u64,
        stats: ChunkStats,
    ) -> Self {
        Self {
            logical_type,
            num_bytes,
            num_elements,
            stats,
        }
    }
}

/// Keys paired with their metadata, ordered by key.
pub type ChunkMetadataVector = Vec<(ChunkKey, ChunkMetadata)>;

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use smallvec::smallvec;

    use super::*;

    #[test]
    fn table_key_prefix() {
        let key: ChunkKey = smallvec![1, 2, 3, 4];
        assert_eq!(get_table_key(&key), smallvec![1, 2] as ChunkKey);
        assert!(!is_table_key(&key));
        assert!(is_table_key(&get_table_key(&key)));
        assert!(has_table_prefix(&key));
    }

    #[test]
    fn varlen_keys() {
        let data: ChunkKey = smallvec![1, 2, 3, 4, VARLEN_DATA_PART];
        let offsets: ChunkKey = smallvec![1, 2, 3, 4, VARLEN_OFFSETS_PART];
        assert!(is_varlen_key(&data));
        assert!(is_varlen_data_key(&data));
        assert!(!is_varlen_data_key(&offsets));
        assert_eq!(get_offsets_key(&data), offsets);

        let fixed: ChunkKey = smallvec![1, 2, 3, 4];
        assert!(!is_varlen_key(&fixed));
    }

    #[test]
    fn prefix_range_equals_filter() {
        let keys: Vec<ChunkKey> = vec![
            smallvec![1, 1, 1, 0],
            smallvec![1, 1, 2, 0],
            smallvec![1, 2, 1, 0],
            smallvec![1, 2, 1, 1],
            smallvec![2, 1, 1, 0],
        ];
        let set: BTreeSet<ChunkKey> = keys.iter().cloned().collect();

        let prefix: ChunkKey = smallvec![1, 2];
        let upper = prefix_upper_bound(&prefix);
        let ranged: Vec<_> = set.range(prefix.clone()..upper).cloned().collect();
        let filtered: Vec<_> = keys
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        assert_eq!(ranged, filtered);
        assert_eq!(ranged.len(), 2);
    }
}
