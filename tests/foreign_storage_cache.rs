// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! End-to-end tests of the foreign-storage disk cache: page budgets,
//! eviction, metadata invalidation and restart recovery.

use bytes::Bytes;
use foreignlight::chunk::{ChunkMetadata, ChunkMetadataVector, ChunkStats, VARLEN_DATA_PART};
use foreignlight::types::LogicalType;
use foreignlight::{ChunkBuffer, ChunkKey, DiskCacheConfig, ForeignStorageBuffer, ForeignStorageCache};
use smallvec::smallvec;

const PAGE_SIZE: u64 = 64;

/// One page per file, 64-byte pages: `size_limit` of `64 * n` allows `n`
/// pages per table.
fn config_with_pages(dir: &std::path::Path, pages: u64) -> DiskCacheConfig {
    let mut config = DiskCacheConfig::default_for_test(dir);
    config.size_limit = PAGE_SIZE * pages;
    config
}

fn chunk_of_pages(pages: u64) -> ForeignStorageBuffer {
    let num_bytes = PAGE_SIZE * pages;
    let metadata = ChunkMetadata::new(
        LogicalType::Int64,
        num_bytes,
        num_bytes / 8,
        ChunkStats::empty(),
    );
    ForeignStorageBuffer::with_data(Bytes::from(vec![0xAB; num_bytes as usize]), metadata)
}

fn key(column: i32, fragment: i32) -> ChunkKey {
    smallvec![1, 1, column, fragment]
}

#[test]
fn budget_enforcement_evicts_lru() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 10)).unwrap();
    assert_eq!(cache.get_max_pages_per_table(), 10);

    for column in 1..=11 {
        assert!(cache.cache_chunk(&key(column, 0), &chunk_of_pages(1)).unwrap());
    }

    assert_eq!(cache.get_num_cached_chunks(), 10);
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 10);
    assert!(cache.get_cached_chunk_if_exists(&key(1, 0)).is_none());
    for column in 2..=11 {
        assert!(
            cache.get_cached_chunk_if_exists(&key(column, 0)).is_some(),
            "chunk {column} should be resident"
        );
    }
}

#[test]
fn oversize_chunk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 4)).unwrap();

    assert!(!cache.cache_chunk(&key(1, 0), &chunk_of_pages(5)).unwrap());
    assert_eq!(cache.get_num_cached_chunks(), 0);
    assert_eq!(cache.get_num_cached_metadata(), 0);
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 0);

    // A chunk that fits exactly is fine.
    assert!(cache.cache_chunk(&key(1, 0), &chunk_of_pages(4)).unwrap());
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 4);
}

#[test]
fn metadata_invalidates_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 16)).unwrap();

    let chunk_key: ChunkKey = smallvec![1, 1, 7, 3];
    assert!(cache.cache_chunk(&chunk_key, &chunk_of_pages(2)).unwrap());
    assert!(cache.get_cached_chunk_if_exists(&chunk_key).is_some());
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 2);

    let metadata_vec: ChunkMetadataVector = vec![(
        chunk_key.clone(),
        ChunkMetadata::new(LogicalType::Int64, 0, 0, ChunkStats::empty()),
    )];
    cache.cache_metadata_vec(&metadata_vec).unwrap();

    assert!(cache.get_cached_chunk_if_exists(&chunk_key).is_none());
    assert!(cache.is_metadata_cached(&chunk_key));
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 0);

    // Re-caching the same metadata is idempotent on membership.
    cache.cache_metadata_vec(&metadata_vec).unwrap();
    assert_eq!(cache.get_num_cached_metadata(), 1);
}

#[test]
fn metadata_invalidates_paired_offsets_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 16)).unwrap();

    let data_key: ChunkKey = smallvec![1, 1, 2, 0, 1];
    let offsets_key: ChunkKey = smallvec![1, 1, 2, 0, 2];
    assert!(cache.cache_chunk(&data_key, &chunk_of_pages(2)).unwrap());
    assert!(cache.cache_chunk(&offsets_key, &chunk_of_pages(1)).unwrap());
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 3);

    let metadata_vec: ChunkMetadataVector = vec![(
        data_key.clone(),
        ChunkMetadata::new(LogicalType::String, 0, 0, ChunkStats::empty()),
    )];
    cache.cache_metadata_vec(&metadata_vec).unwrap();

    assert!(cache.get_cached_chunk_if_exists(&data_key).is_none());
    assert!(cache.get_cached_chunk_if_exists(&offsets_key).is_none());
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 0);
}

#[test]
fn lru_respects_promotion_on_hit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 3)).unwrap();

    for column in 1..=3 {
        assert!(cache.cache_chunk(&key(column, 0), &chunk_of_pages(1)).unwrap());
    }
    // Promote chunk 1, so chunk 2 is now the eviction victim.
    assert!(cache.get_cached_chunk_if_exists(&key(1, 0)).is_some());
    assert!(cache.cache_chunk(&key(4, 0), &chunk_of_pages(1)).unwrap());

    assert!(cache.get_cached_chunk_if_exists(&key(2, 0)).is_none());
    assert!(cache.get_cached_chunk_if_exists(&key(1, 0)).is_some());
}

#[test]
fn set_limit_is_idempotent_and_monotone() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 8)).unwrap();

    for column in 1..=6 {
        assert!(cache.cache_chunk(&key(column, 0), &chunk_of_pages(1)).unwrap());
    }

    cache.set_limit(PAGE_SIZE * 8).unwrap();
    assert_eq!(cache.get_num_cached_chunks(), 6);

    // Shrinking the limit evicts oldest-first until every table fits.
    cache.set_limit(PAGE_SIZE * 4).unwrap();
    assert_eq!(cache.get_max_pages_per_table(), 4);
    assert_eq!(cache.get_num_cached_chunks(), 4);
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 4);
    for column in 1..=2 {
        assert!(cache.get_cached_chunk_if_exists(&key(column, 0)).is_none());
    }

    cache.set_limit(PAGE_SIZE * 4).unwrap();
    assert_eq!(cache.get_num_cached_chunks(), 4);

    // Limits below one cache file are rejected.
    assert!(cache.set_limit(PAGE_SIZE - 1).is_err());
}

#[test]
fn per_table_budgets_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 2)).unwrap();

    let table_one: ChunkKey = smallvec![1, 1, 1, 0];
    let table_two: ChunkKey = smallvec![1, 2, 1, 0];
    assert!(cache.cache_chunk(&table_one, &chunk_of_pages(2)).unwrap());
    assert!(cache.cache_chunk(&table_two, &chunk_of_pages(2)).unwrap());

    // Both tables hold their full budget; neither evicted the other.
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 2);
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 2]), 2);
}

#[test]
fn clear_for_table_prefix_scopes_to_one_table() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 8)).unwrap();

    assert!(cache.cache_chunk(&smallvec![1, 1, 1, 0], &chunk_of_pages(1)).unwrap());
    assert!(cache.cache_chunk(&smallvec![1, 2, 1, 0], &chunk_of_pages(1)).unwrap());

    cache.clear_for_table_prefix(&smallvec![1, 1]);
    assert!(cache.get_cached_chunk_if_exists(&smallvec![1, 1, 1, 0]).is_none());
    assert!(!cache.is_metadata_cached(&smallvec![1, 1, 1, 0]));
    assert!(cache.get_cached_chunk_if_exists(&smallvec![1, 2, 1, 0]).is_some());

    cache.clear();
    assert_eq!(cache.get_num_cached_chunks(), 0);
    assert_eq!(cache.get_num_cached_metadata(), 0);
}

#[test]
fn restart_recovery_restores_tracker_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_pages(dir.path(), 8);
    let table_key: ChunkKey = smallvec![1, 1];

    {
        let cache = ForeignStorageCache::new(&config).unwrap();
        assert!(cache.cache_chunk(&key(1, 0), &chunk_of_pages(1)).unwrap());
        assert!(cache.cache_chunk(&key(2, 0), &chunk_of_pages(2)).unwrap());
    }

    let cache = ForeignStorageCache::new(&config).unwrap();
    assert!(!cache.has_cached_metadata_for_prefix(&table_key));

    let metadata_vec = cache.recover_cache_for_table(&table_key).unwrap();
    assert_eq!(metadata_vec.len(), 2);
    assert!(cache.has_cached_metadata_for_prefix(&table_key));
    assert_eq!(cache.get_num_cached_chunks(), 2);
    assert_eq!(cache.get_num_pages_for_table(&table_key), 3);

    let buffer = cache.get_cached_chunk_if_exists(&key(1, 0)).unwrap();
    assert_eq!(buffer.data().unwrap(), Bytes::from(vec![0xAB; PAGE_SIZE as usize]));
}

#[test]
fn recovery_skips_metadata_only_entries() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_pages(dir.path(), 8);
    let table_key: ChunkKey = smallvec![1, 1];

    {
        let cache = ForeignStorageCache::new(&config).unwrap();
        assert!(cache.cache_chunk(&key(1, 0), &chunk_of_pages(1)).unwrap());
        // Invalidate the chunk: only its metadata survives.
        let metadata_vec: ChunkMetadataVector = vec![(
            key(1, 0),
            ChunkMetadata::new(LogicalType::Int64, 0, 0, ChunkStats::empty()),
        )];
        cache.cache_metadata_vec(&metadata_vec).unwrap();
    }

    let cache = ForeignStorageCache::new(&config).unwrap();
    let metadata_vec = cache.recover_cache_for_table(&table_key).unwrap();
    assert_eq!(metadata_vec.len(), 1);
    assert_eq!(cache.get_num_cached_chunks(), 0);
    assert_eq!(cache.get_num_pages_for_table(&table_key), 0);
}

#[test]
fn chunk_buffers_for_caching_are_empty_handles() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ForeignStorageCache::new(&config_with_pages(dir.path(), 8)).unwrap();

    let data_key: ChunkKey = smallvec![1, 1, 2, 0, VARLEN_DATA_PART];
    let metadata_vec: ChunkMetadataVector = vec![(
        data_key.clone(),
        ChunkMetadata::new(LogicalType::String, 5, 1, ChunkStats::empty()),
    )];
    cache.cache_metadata_vec(&metadata_vec).unwrap();

    let offsets_key: ChunkKey = smallvec![1, 1, 2, 0, 2];
    let keys = vec![data_key.clone(), offsets_key.clone()];
    let buffers = cache.get_chunk_buffers_for_caching(&keys).unwrap();
    assert_eq!(buffers.len(), 2);
    for buffer in buffers.values() {
        assert_eq!(buffer.page_count(), 0);
        assert_eq!(buffer.size(), 0);
    }

    // Written in place, then registered.
    buffers[&data_key].write(Bytes::from_static(b"hello"));
    buffers[&offsets_key].write(Bytes::from_static(&[0, 0, 0, 0, 5, 0, 0, 0]));
    cache.cache_table_chunks(&keys).unwrap();

    assert_eq!(cache.get_num_cached_chunks(), 2);
    assert_eq!(cache.get_num_pages_for_table(&smallvec![1, 1]), 2);
    let resident = cache.get_cached_chunks_for_prefix(&smallvec![1, 1]);
    assert_eq!(resident, keys);
}
