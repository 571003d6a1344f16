// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Disk cache for foreign-storage chunks.
//!
//! Sits between the external-storage data wrappers and the query engine:
//! previously materialized column chunks are kept on local disk, evicted
//! per table under a bounded page budget, and recovered after a restart.

mod eviction;
mod page_store;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use eviction::{LruEvictionPolicy, TableEvictionTracker};
pub use page_store::{FileBuffer, PageFileStore};
use parking_lot::RwLock;

use crate::buffer::{ChunkBuffer, ChunkBufferMap};
use crate::chunk::{
    get_offsets_key, get_table_key, is_table_key, is_varlen_data_key, is_varlen_key,
    prefix_upper_bound, show_chunk, ChunkKey, ChunkMetadataVector, CHUNK_KEY_DB_IDX,
    CHUNK_KEY_FRAGMENT_IDX, CHUNK_KEY_TABLE_IDX,
};
use crate::error::{StorageError, StorageResult};
use crate::options::DiskCacheConfig;

/// Resident-chunk bookkeeping. Everything in here is guarded by the chunks
/// lock.
#[derive(Default)]
struct ChunkState {
    cached_chunks: BTreeSet<ChunkKey>,
    eviction_tracker_map: HashMap<ChunkKey, TableEvictionTracker>,
    max_pages_per_table: u64,
}

/// The foreign-storage disk cache.
///
/// Holds two shared/exclusive locks: one over the metadata set and one over
/// the resident-chunk state (resident set, eviction trackers, page budget).
/// When both are needed the metadata lock is acquired first.
pub struct ForeignStorageCache {
    store: PageFileStore,
    cached_metadata: RwLock<BTreeSet<ChunkKey>>,
    chunk_state: RwLock<ChunkState>,

    // Keeps track of how many times chunks or metadata were cached, for
    // testing purposes.
    num_chunks_added: AtomicUsize,
    num_metadata_added: AtomicUsize,
}

impl ForeignStorageCache {
    pub fn new(config: &DiskCacheConfig) -> StorageResult<Self> {
        let cache = Self {
            store: PageFileStore::open(config)?,
            cached_metadata: RwLock::new(BTreeSet::new()),
            chunk_state: RwLock::new(ChunkState::default()),
            num_chunks_added: AtomicUsize::new(0),
            num_metadata_added: AtomicUsize::new(0),
        };
        cache.set_limit(config.size_limit)?;
        Ok(cache)
    }

    /// Caches one chunk buffer. The buffer must be in sync with the external
    /// source. Evicts LRU victims from the chunk's table until it fits;
    /// returns `false` without caching anything when the chunk alone exceeds
    /// the per-table budget.
    pub fn cache_chunk(&self, key: &ChunkKey, buffer: &dyn ChunkBuffer) -> StorageResult<bool> {
        let mut metadata = self.cached_metadata.write();
        let mut state = self.chunk_state.write();
        assert!(!buffer.is_dirty(), "only clean buffers may be cached");

        create_tracker_if_none_exists(&mut state, &get_table_key(key));
        if !insert_chunk_into_eviction_alg(&mut state, &self.store, key, buffer.size()) {
            return Ok(false);
        }
        self.num_chunks_added.fetch_add(1, Ordering::Relaxed);
        self.store.put_buffer(key, buffer)?;
        self.store.checkpoint()?;
        metadata.insert(key.clone());
        Ok(true)
    }

    /// Registers chunks whose buffers were already written in place on the
    /// page-file store (the cache handed them out beforehand). All keys must
    /// belong to one table.
    pub fn cache_table_chunks(&self, chunk_keys: &[ChunkKey]) -> StorageResult<()> {
        let mut state = self.chunk_state.write();
        assert!(!chunk_keys.is_empty());

        let db_id = chunk_keys[0][CHUNK_KEY_DB_IDX];
        let table_id = chunk_keys[0][CHUNK_KEY_TABLE_IDX];
        let table_key: ChunkKey = ChunkKey::from_slice(&[db_id, table_id]);

        create_tracker_if_none_exists(&mut state, &table_key);
        for chunk_key in chunk_keys {
            assert_eq!(db_id, chunk_key[CHUNK_KEY_DB_IDX]);
            assert_eq!(table_id, chunk_key[CHUNK_KEY_TABLE_IDX]);
            let buffer = self.store.get_buffer(chunk_key)?;
            self.num_chunks_added.fetch_add(1, Ordering::Relaxed);
            insert_chunk_into_eviction_alg(&mut state, &self.store, chunk_key, buffer.size());
        }
        self.store.checkpoint_table(&table_key)
    }

    /// Lock-free negative lookup; on a hit the chunk is promoted to the
    /// most-recent LRU position.
    pub fn get_cached_chunk_if_exists(&self, key: &ChunkKey) -> Option<Arc<FileBuffer>> {
        {
            let state = self.chunk_state.read();
            if !state.cached_chunks.contains(key) {
                return None;
            }
        }
        let mut state = self.chunk_state.write();
        if let Some(tracker) = state.eviction_tracker_map.get_mut(&get_table_key(key)) {
            tracker.eviction_alg.touch_chunk(key);
        }
        self.store.get_buffer_if_exists(key)
    }

    pub fn is_metadata_cached(&self, key: &ChunkKey) -> bool {
        self.cached_metadata.read().contains(key)
    }

    /// Caches a metadata vector. New metadata invalidates any previously
    /// cached chunk for the same key, and for a variable-length data key the
    /// paired offsets chunk as well.
    pub fn cache_metadata_vec(&self, metadata_vec: &ChunkMetadataVector) -> StorageResult<()> {
        let mut metadata_set = self.cached_metadata.write();
        let mut state = self.chunk_state.write();
        for (chunk_key, metadata) in metadata_vec {
            metadata_set.insert(chunk_key.clone());

            let offsets_key = if is_varlen_key(chunk_key) {
                // For variable length chunks, metadata is associated with
                // the data chunk.
                assert!(is_varlen_data_key(chunk_key));
                Some(get_offsets_key(chunk_key))
            } else {
                None
            };

            let buffer = match self.store.get_buffer_if_exists(chunk_key) {
                Some(buffer) => buffer,
                None => self.store.create_buffer(chunk_key),
            };
            if let Some(offsets_key) = &offsets_key {
                if !self.store.is_buffer_on_device(offsets_key) {
                    self.store.create_buffer(offsets_key);
                }
            }

            buffer.set_metadata(metadata.clone());
            evict_then_erase_chunk_unlocked(&mut state, &self.store, chunk_key);
            if let Some(offsets_key) = &offsets_key {
                evict_then_erase_chunk_unlocked(&mut state, &self.store, offsets_key);
            }
            self.num_metadata_added.fetch_add(1, Ordering::Relaxed);
        }
        self.store.checkpoint()
    }

    /// Caches only the entries whose fragment id is at least `frag_id`. Used
    /// by append refresh to re-cache the last fragment and above.
    pub fn cache_metadata_with_frag_id_greater_or_equal_to(
        &self,
        metadata_vec: &ChunkMetadataVector,
        frag_id: i32,
    ) -> StorageResult<()> {
        let new_metadata_vec: ChunkMetadataVector = metadata_vec
            .iter()
            .filter(|(key, _)| key[CHUNK_KEY_FRAGMENT_IDX] >= frag_id)
            .cloned()
            .collect();
        self.cache_metadata_vec(&new_metadata_vec)
    }

    pub fn get_cached_metadata_vec_for_prefix(&self, prefix: &ChunkKey) -> ChunkMetadataVector {
        let metadata_set = self.cached_metadata.read();
        let upper = prefix_upper_bound(prefix);
        metadata_set
            .range(prefix.clone()..upper)
            .filter_map(|key| {
                let buffer = self.store.get_buffer_if_exists(key)?;
                buffer.metadata().map(|metadata| (key.clone(), metadata))
            })
            .collect()
    }

    pub fn has_cached_metadata_for_prefix(&self, prefix: &ChunkKey) -> bool {
        let metadata_set = self.cached_metadata.read();
        let upper = prefix_upper_bound(prefix);
        metadata_set.range(prefix.clone()..upper).next().is_some()
    }

    /// Resident chunk keys under a prefix, used by refresh to know which
    /// chunks were worth keeping.
    pub fn get_cached_chunks_for_prefix(&self, prefix: &ChunkKey) -> Vec<ChunkKey> {
        let state = self.chunk_state.read();
        let upper = prefix_upper_bound(prefix);
        state
            .cached_chunks
            .range(prefix.clone()..upper)
            .cloned()
            .collect()
    }

    /// Allocates empty store buffers for keys that are not yet resident,
    /// returning handles the data wrapper may write into.
    pub fn get_chunk_buffers_for_caching(
        &self,
        chunk_keys: &[ChunkKey],
    ) -> StorageResult<ChunkBufferMap> {
        let state = self.chunk_state.read();
        let mut chunk_buffer_map = ChunkBufferMap::new();
        for chunk_key in chunk_keys {
            assert!(
                !state.cached_chunks.contains(chunk_key),
                "chunk {} is already resident",
                show_chunk(chunk_key)
            );
            let buffer = self.store.get_buffer(chunk_key)?;
            buffer.reset_to_empty();
            debug_assert_eq!(buffer.page_count(), 0);
            chunk_buffer_map.insert(chunk_key.clone(), buffer as Arc<dyn ChunkBuffer>);
        }
        Ok(chunk_buffer_map)
    }

    /// Erases all resident chunks and metadata for one table and releases
    /// the table's cache directory.
    pub fn clear_for_table_prefix(&self, table_prefix: &ChunkKey) {
        assert!(is_table_key(table_prefix));
        let upper = prefix_upper_bound(table_prefix);
        {
            let mut state = self.chunk_state.write();
            let keys: Vec<_> = state
                .cached_chunks
                .range(table_prefix.clone()..upper.clone())
                .cloned()
                .collect();
            for key in keys {
                evict_then_erase_chunk_unlocked(&mut state, &self.store, &key);
            }
        }
        {
            let mut metadata_set = self.cached_metadata.write();
            let keys: Vec<_> = metadata_set
                .range(table_prefix.clone()..upper)
                .cloned()
                .collect();
            for key in keys {
                metadata_set.remove(&key);
            }
        }
        self.store.remove_table_related(table_prefix);
    }

    /// Clears the whole cache.
    pub fn clear(&self) {
        let mut table_keys = BTreeSet::new();
        {
            let mut state = self.chunk_state.write();
            let keys: Vec<_> = state.cached_chunks.iter().cloned().collect();
            for key in keys {
                evict_then_erase_chunk_unlocked(&mut state, &self.store, &key);
            }
        }
        {
            let mut metadata_set = self.cached_metadata.write();
            for key in metadata_set.iter() {
                table_keys.insert(get_table_key(key));
            }
            metadata_set.clear();
        }
        for table_key in &table_keys {
            self.store.remove_table_related(table_key);
        }
    }

    /// Re-derives the per-table page budget from a new byte limit and
    /// immediately evicts from every tracker until each fits. Limits below
    /// one cache file are rejected.
    pub fn set_limit(&self, limit: u64) -> StorageResult<()> {
        let mut state = self.chunk_state.write();
        let file_size = self.store.file_size();
        if limit < file_size {
            return Err(StorageError::CacheTooSmall {
                limit,
                minimum: file_size,
            }
            .into());
        }
        let max_num_files = limit.div_ceil(file_size);
        state.max_pages_per_table = max_num_files * self.store.pages_per_file();

        let table_keys: Vec<_> = state.eviction_tracker_map.keys().cloned().collect();
        for table_key in table_keys {
            loop {
                let max_pages = state.max_pages_per_table;
                let tracker = state
                    .eviction_tracker_map
                    .get_mut(&table_key)
                    .expect("tracker disappeared during set_limit");
                if tracker.num_pages <= max_pages {
                    break;
                }
                let Some(victim) = tracker.eviction_alg.evict_next_chunk() else {
                    break;
                };
                erase_chunk_unlocked(&mut state, &self.store, &victim);
            }
        }
        self.store.checkpoint()
    }

    /// Reloads one table's cached state after a restart: metadata entries
    /// from the page-file store are re-registered, and every entry whose
    /// on-disk buffer still holds pages is re-enrolled in the eviction
    /// tracker.
    pub fn recover_cache_for_table(
        &self,
        table_key: &ChunkKey,
    ) -> StorageResult<ChunkMetadataVector> {
        assert!(is_table_key(table_key));
        let mut metadata_set = self.cached_metadata.write();
        let mut state = self.chunk_state.write();

        create_tracker_if_none_exists(&mut state, table_key);
        let metadata_vec = self.store.get_chunk_metadata_vec_for_prefix(table_key);
        for (chunk_key, _) in &metadata_vec {
            metadata_set.insert(chunk_key.clone());
            // A chunk without pages was metadata-only and is not resident.
            let buffer = self.store.get_buffer(chunk_key)?;
            if buffer.page_count() > 0 {
                insert_chunk_into_eviction_alg(&mut state, &self.store, chunk_key, buffer.size());
            }
        }
        Ok(metadata_vec)
    }

    pub fn get_cache_directory_for_table_prefix(&self, table_prefix: &ChunkKey) -> PathBuf {
        assert!(table_prefix.len() >= 2);
        self.store.table_directory(&get_table_key(table_prefix))
    }

    pub fn page_store(&self) -> &PageFileStore {
        &self.store
    }

    // Exists for testing purposes.
    pub fn get_limit(&self) -> u64 {
        self.chunk_state.read().max_pages_per_table * self.store.page_size()
    }

    pub fn get_max_pages_per_table(&self) -> u64 {
        self.chunk_state.read().max_pages_per_table
    }

    pub fn get_num_cached_chunks(&self) -> usize {
        self.chunk_state.read().cached_chunks.len()
    }

    pub fn get_num_cached_metadata(&self) -> usize {
        self.cached_metadata.read().len()
    }

    pub fn get_num_chunks_added(&self) -> usize {
        self.num_chunks_added.load(Ordering::Relaxed)
    }

    pub fn get_num_metadata_added(&self) -> usize {
        self.num_metadata_added.load(Ordering::Relaxed)
    }

    pub fn get_num_pages_for_table(&self, table_key: &ChunkKey) -> u64 {
        self.chunk_state
            .read()
            .eviction_tracker_map
            .get(table_key)
            .map(|tracker| tracker.num_pages)
            .unwrap_or(0)
    }

    // Useful for debugging.
    pub fn dump_cached_chunk_entries(&self) -> String {
        let state = self.chunk_state.read();
        let mut out = String::from("Cached chunks:\n");
        for chunk_key in &state.cached_chunks {
            out += &format!("  {}\n", show_chunk(chunk_key));
        }
        out
    }

    pub fn dump_cached_metadata_entries(&self) -> String {
        let mut out = String::from("Cached chunk metadata:\n");
        for chunk_key in self.cached_metadata.read().iter() {
            out += &format!("  {}\n", show_chunk(chunk_key));
        }
        out
    }

    pub fn dump_eviction_queue(&self) -> String {
        let state = self.chunk_state.read();
        let mut out = String::new();
        for (table_key, tracker) in &state.eviction_tracker_map {
            out += &format!("queue for table key {}: ", show_chunk(table_key));
            out += &tracker.eviction_alg.dump_eviction_queue();
        }
        out
    }
}

// Unlocked helpers. Callers hold the chunks lock exclusively.

fn create_tracker_if_none_exists(state: &mut ChunkState, table_key: &ChunkKey) {
    assert!(is_table_key(table_key));
    state
        .eviction_tracker_map
        .entry(table_key.clone())
        .or_default();
}

/// Removes a chunk from the resident set and releases its pages. Assumes the
/// chunk has already been removed from the eviction queue.
fn erase_chunk_unlocked(state: &mut ChunkState, store: &PageFileStore, key: &ChunkKey) {
    if !state.cached_chunks.remove(key) {
        return;
    }
    if let Some(buffer) = store.get_buffer_if_exists(key) {
        let freed = buffer.free_chunk_pages();
        if let Some(tracker) = state.eviction_tracker_map.get_mut(&get_table_key(key)) {
            tracker.num_pages -= freed;
        }
    }
}

fn evict_then_erase_chunk_unlocked(state: &mut ChunkState, store: &PageFileStore, key: &ChunkKey) {
    let table_key = get_table_key(key);
    if let Some(tracker) = state.eviction_tracker_map.get_mut(&table_key) {
        tracker.eviction_alg.remove_chunk(key);
    }
    erase_chunk_unlocked(state, store, key);
}

/// Reserves pages for a chunk, evicting LRU victims from its table until it
/// fits, then registers it. Returns `false` when the chunk alone exceeds the
/// per-table budget.
fn insert_chunk_into_eviction_alg(
    state: &mut ChunkState,
    store: &PageFileStore,
    key: &ChunkKey,
    chunk_size: u64,
) -> bool {
    let page_size = store.page_size();
    let table_key = get_table_key(key);
    // number of pages for the chunk, rounded up
    let num_pages_for_chunk = chunk_size.div_ceil(page_size);
    if num_pages_for_chunk > state.max_pages_per_table {
        // Can't fit the chunk in the cache at all, so bail.
        return false;
    }
    loop {
        let tracker = state
            .eviction_tracker_map
            .get_mut(&table_key)
            .expect("eviction tracker must exist before insertion");
        if tracker.num_pages + num_pages_for_chunk <= state.max_pages_per_table {
            break;
        }
        let Some(victim) = tracker.eviction_alg.evict_next_chunk() else {
            break;
        };
        erase_chunk_unlocked(state, store, &victim);
    }

    let tracker = state
        .eviction_tracker_map
        .get_mut(&table_key)
        .expect("eviction tracker must exist before insertion");
    tracker.eviction_alg.touch_chunk(key);
    tracker.num_pages += num_pages_for_chunk;
    state.cached_chunks.insert(key.clone());
    true
}
