// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use super::{get_keys_vec_from_table, BufferMgr, ForeignStorageMgr};
use crate::buffer::{ChunkBuffer, ChunkBufferMap};
use crate::cache::ForeignStorageCache;
use crate::catalog::CatalogRef;
use crate::chunk::{
    get_offsets_key, get_table_key, is_table_key, is_varlen_data_key, is_varlen_key, ChunkKey,
    ChunkMetadataVector, CHUNK_KEY_DB_IDX, CHUNK_KEY_FRAGMENT_IDX, CHUNK_KEY_TABLE_IDX,
};
use crate::error::{StorageResult, TracedStorageError};

/// Wrapper internals are serialized next to the table's cached chunks so a
/// restarted process can rebuild the wrapper in O(1).
pub const WRAPPER_METADATA_FILE_NAME: &str = "wrapper_metadata.json";

/// Wall-clock budget for one refresh call.
const MAX_REFRESH_TIME: Duration = Duration::from_secs(60 * 60);

/// Caching foreign storage manager: the uncached manager with the disk cache
/// underneath, plus the table refresh machinery.
pub struct CachingForeignStorageMgr {
    mgr: ForeignStorageMgr,
    disk_cache: Arc<ForeignStorageCache>,
    refresh_time_budget: Duration,
}

impl CachingForeignStorageMgr {
    pub fn new(catalog: CatalogRef, disk_cache: Arc<ForeignStorageCache>) -> Self {
        Self {
            mgr: ForeignStorageMgr::new(catalog),
            disk_cache,
            refresh_time_budget: MAX_REFRESH_TIME,
        }
    }

    /// Overrides the refresh wall-clock budget.
    pub fn with_refresh_time_budget(mut self, budget: Duration) -> Self {
        self.refresh_time_budget = budget;
        self
    }

    pub fn storage_mgr(&self) -> &ForeignStorageMgr {
        &self.mgr
    }

    pub fn disk_cache(&self) -> &Arc<ForeignStorageCache> {
        &self.disk_cache
    }

    /// Creates the table's wrapper if needed. A newly created wrapper is
    /// restored from its serialized internals when the cache already holds
    /// metadata for the table, and populated from scratch otherwise.
    pub fn create_or_recover_data_wrapper_if_not_exists(
        &self,
        chunk_key: &ChunkKey,
    ) -> StorageResult<()> {
        let table_key = get_table_key(chunk_key);
        if self.mgr.create_data_wrapper_if_not_exists(&table_key)? {
            if self.disk_cache.has_cached_metadata_for_prefix(&table_key) {
                let chunk_metadata = self.disk_cache.get_cached_metadata_vec_for_prefix(&table_key);
                self.recover_data_wrapper_from_disk(&table_key, &chunk_metadata)?;
            } else {
                self.mgr.data_wrapper(&table_key).populate_chunk_metadata()?;
            }
        }
        Ok(())
    }

    fn recover_data_wrapper_from_disk(
        &self,
        table_key: &ChunkKey,
        chunk_metadata: &ChunkMetadataVector,
    ) -> StorageResult<()> {
        let path = self
            .disk_cache
            .get_cache_directory_for_table_prefix(table_key)
            .join(WRAPPER_METADATA_FILE_NAME);
        self.mgr
            .data_wrapper(table_key)
            .restore_internals(&path, chunk_metadata)
    }

    /// Fetches fresh metadata from the table's wrapper and serializes the
    /// wrapper's internals into the table's cache directory. Does not touch
    /// the cached metadata set.
    fn fetch_metadata_from_source(&self, table_key: &ChunkKey) -> StorageResult<ChunkMetadataVector> {
        self.mgr.create_data_wrapper_if_not_exists(table_key)?;
        let chunk_metadata = self
            .mgr
            .data_wrapper(table_key)
            .populate_chunk_metadata()?;
        let directory = self.disk_cache.get_cache_directory_for_table_prefix(table_key);
        fs::create_dir_all(&directory)?;
        self.mgr
            .data_wrapper(table_key)
            .serialize_internals(&directory.join(WRAPPER_METADATA_FILE_NAME))?;
        Ok(chunk_metadata)
    }

    fn refresh_table_in_cache(&self, table_key: &ChunkKey) -> StorageResult<()> {
        assert!(is_table_key(table_key));

        // A table untouched since the last restart recovers its cached state
        // before it can be refreshed.
        if !self.disk_cache.has_cached_metadata_for_prefix(table_key) {
            self.disk_cache.recover_cache_for_table(table_key)?;
        }

        // Preserve which chunks were resident so they can be refreshed after
        // the clear.
        let old_chunk_keys = self.disk_cache.get_cached_chunks_for_prefix(table_key);

        let append_mode = self
            .mgr
            .catalog()
            .get_foreign_table(table_key[CHUNK_KEY_DB_IDX], table_key[CHUNK_KEY_TABLE_IDX])?
            .is_append_mode();

        if append_mode {
            self.refresh_append_table_in_cache(table_key, &old_chunk_keys)
        } else {
            self.refresh_non_append_table_in_cache(table_key, &old_chunk_keys)
        }
    }

    /// The highest fragment id present in cached metadata, or 0 when the
    /// table has none. Callers treat 0 as "start from the beginning", which
    /// conflates an empty cache with fragment 0.
    fn get_highest_cached_frag_id(&self, table_key: &ChunkKey) -> i32 {
        let mut last_frag_id = 0;
        if self.disk_cache.has_cached_metadata_for_prefix(table_key) {
            let cached_metadata = self.disk_cache.get_cached_metadata_vec_for_prefix(table_key);
            for (key, _) in &cached_metadata {
                last_frag_id = last_frag_id.max(key[CHUNK_KEY_FRAGMENT_IDX]);
            }
        }
        last_frag_id
    }

    fn refresh_append_table_in_cache(
        &self,
        table_key: &ChunkKey,
        old_chunk_keys: &[ChunkKey],
    ) -> StorageResult<()> {
        assert!(is_table_key(table_key));
        self.create_or_recover_data_wrapper_if_not_exists(table_key)?;
        let last_frag_id = self.get_highest_cached_frag_id(table_key);

        let storage_metadata = self.fetch_metadata_from_source(table_key)?;
        self.disk_cache
            .cache_metadata_with_frag_id_greater_or_equal_to(&storage_metadata, last_frag_id)
            .and_then(|_| self.refresh_chunks_in_cache_by_fragment(old_chunk_keys, last_frag_id))
            .map_err(TracedStorageError::post_eviction_refresh)
    }

    fn refresh_non_append_table_in_cache(
        &self,
        table_key: &ChunkKey,
        old_chunk_keys: &[ChunkKey],
    ) -> StorageResult<()> {
        assert!(is_table_key(table_key));
        // Getting metadata from storage can fail if the source is
        // unreachable, so the cache is only cleared once fresh data is in
        // hand; failing here leaves the cache unchanged.
        let storage_metadata = self.fetch_metadata_from_source(table_key)?;
        self.disk_cache.clear_for_table_prefix(table_key);
        self.disk_cache
            .cache_metadata_vec(&storage_metadata)
            .and_then(|_| self.refresh_chunks_in_cache_by_fragment(old_chunk_keys, 0))
            .map_err(TracedStorageError::post_eviction_refresh)
    }

    /// Re-materializes previously resident chunks, one fragment's batch at a
    /// time, stopping once the refresh time budget is spent. Committed
    /// fragments are never undone.
    fn refresh_chunks_in_cache_by_fragment(
        &self,
        old_chunk_keys: &[ChunkKey],
        start_frag_id: i32,
    ) -> StorageResult<()> {
        if old_chunk_keys.is_empty() {
            return Ok(());
        }
        let mut total_time = Duration::ZERO;
        let mut fragment_refresh_start_time = Instant::now();

        // Chunks arrive grouped by fragment; buffers are populated for all
        // applicable chunks of one fragment at a time.
        let optional_buffers = ChunkBufferMap::new();
        let mut chunk_keys_to_be_cached: Vec<ChunkKey> = vec![];
        let mut chunk_keys_in_fragment: Vec<ChunkKey> = vec![];
        let mut fragment_id = old_chunk_keys[0][CHUNK_KEY_FRAGMENT_IDX];
        let table_key = get_table_key(&old_chunk_keys[0]);

        for chunk_key in old_chunk_keys {
            if chunk_key[CHUNK_KEY_FRAGMENT_IDX] < start_frag_id {
                continue;
            }
            if !self.disk_cache.is_metadata_cached(chunk_key) {
                continue;
            }
            if chunk_key[CHUNK_KEY_FRAGMENT_IDX] != fragment_id {
                if !chunk_keys_in_fragment.is_empty() {
                    let required_buffers = self
                        .disk_cache
                        .get_chunk_buffers_for_caching(&chunk_keys_in_fragment)?;
                    self.mgr
                        .data_wrapper(&table_key)
                        .populate_chunk_buffers(&required_buffers, &optional_buffers)?;
                    chunk_keys_in_fragment.clear();
                }
                // Buffers for the last fragment's refreshable chunks are now
                // populated. Stop if the refresh budget is spent, otherwise
                // move on to the next fragment.
                total_time += fragment_refresh_start_time.elapsed();
                if total_time >= self.refresh_time_budget {
                    warn!(
                        "refresh time exceeded for table key {:?} after fragment id {}",
                        &table_key[..],
                        fragment_id
                    );
                    break;
                }
                fragment_refresh_start_time = Instant::now();
                fragment_id = chunk_key[CHUNK_KEY_FRAGMENT_IDX];
            }
            if is_varlen_key(chunk_key) {
                assert!(is_varlen_data_key(chunk_key));
                let offsets_key = get_offsets_key(chunk_key);
                chunk_keys_in_fragment.push(offsets_key.clone());
                chunk_keys_to_be_cached.push(offsets_key);
            }
            chunk_keys_in_fragment.push(chunk_key.clone());
            chunk_keys_to_be_cached.push(chunk_key.clone());
        }
        if !chunk_keys_in_fragment.is_empty() {
            let required_buffers = self
                .disk_cache
                .get_chunk_buffers_for_caching(&chunk_keys_in_fragment)?;
            self.mgr
                .data_wrapper(&table_key)
                .populate_chunk_buffers(&required_buffers, &optional_buffers)?;
        }
        if !chunk_keys_to_be_cached.is_empty() {
            self.disk_cache.cache_table_chunks(&chunk_keys_to_be_cached)?;
        }
        Ok(())
    }
}

impl BufferMgr for CachingForeignStorageMgr {
    fn fetch_buffer(
        &self,
        chunk_key: &ChunkKey,
        destination_buffer: &Arc<dyn ChunkBuffer>,
        num_bytes: Option<u64>,
    ) -> StorageResult<()> {
        assert!(!destination_buffer.is_dirty());

        if let Some(buffer) = self.disk_cache.get_cached_chunk_if_exists(chunk_key) {
            return buffer.copy_to(destination_buffer.as_ref(), num_bytes);
        }
        self.create_or_recover_data_wrapper_if_not_exists(chunk_key)?;

        let chunk_keys: Vec<ChunkKey> = get_keys_vec_from_table(self.mgr.catalog(), chunk_key)?
            .into_iter()
            .filter(|key| self.disk_cache.get_cached_chunk_if_exists(key).is_none())
            .collect();
        let optional_buffers = ChunkBufferMap::new();
        let required_buffers = self.disk_cache.get_chunk_buffers_for_caching(&chunk_keys)?;
        assert!(required_buffers.contains_key(chunk_key));
        self.mgr
            .data_wrapper(chunk_key)
            .populate_chunk_buffers(&required_buffers, &optional_buffers)?;
        self.disk_cache.cache_table_chunks(&chunk_keys)?;

        let buffer = &required_buffers[chunk_key];
        buffer.copy_to(destination_buffer.as_ref(), num_bytes)
    }

    /// Serves cached metadata when present; otherwise fetches from the
    /// wrapper, caches the result, and serializes the wrapper's internals to
    /// the table's cache directory.
    fn get_chunk_metadata_vec_for_prefix(
        &self,
        key_prefix: &ChunkKey,
    ) -> StorageResult<ChunkMetadataVector> {
        assert!(is_table_key(key_prefix));
        if self.disk_cache.has_cached_metadata_for_prefix(key_prefix) {
            return Ok(self.disk_cache.get_cached_metadata_vec_for_prefix(key_prefix));
        }
        let chunk_metadata = self.fetch_metadata_from_source(key_prefix)?;
        self.disk_cache.cache_metadata_vec(&chunk_metadata)?;
        Ok(chunk_metadata)
    }

    fn refresh_table(
        &self,
        table_key: &ChunkKey,
        evict_cached_entries: bool,
    ) -> StorageResult<()> {
        assert!(is_table_key(table_key));
        self.mgr.clear_temp_chunk_buffer_map_entries_for_table(table_key);
        if evict_cached_entries {
            // Wrapper metadata on disk goes away with the table directory.
            self.disk_cache.clear_for_table_prefix(table_key);
            Ok(())
        } else {
            self.refresh_table_in_cache(table_key)
        }
    }

    fn remove_table_related(&self, table_key: &ChunkKey) {
        self.mgr.remove_table_related(table_key);
    }
}
