// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Storage manager facades over foreign tables.
//!
//! [`ForeignStorageMgr`] serves chunk fetches straight from the data
//! wrappers, parking sibling chunks of a fragment in a temporary buffer map
//! so one scan can satisfy several fetches. [`CachingForeignStorageMgr`]
//! layers the disk cache underneath and owns the refresh machinery.

mod caching;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub use caching::{CachingForeignStorageMgr, WRAPPER_METADATA_FILE_NAME};
use parking_lot::RwLock;

use crate::buffer::{ChunkBuffer, ChunkBufferMap, ForeignStorageBuffer};
use crate::catalog::CatalogRef;
use crate::chunk::{
    get_table_key, has_table_prefix, is_table_key, prefix_upper_bound, show_chunk, ChunkKey,
    ChunkMetadataVector, CHUNK_KEY_COLUMN_IDX, CHUNK_KEY_DB_IDX, CHUNK_KEY_FRAGMENT_IDX,
    CHUNK_KEY_TABLE_IDX, VARLEN_DATA_PART, VARLEN_OFFSETS_PART,
};
use crate::error::StorageResult;
use crate::wrapper::{CsvDataWrapper, DataWrapper, DataWrapperType, ProxyDataWrapper, ProxyHooks};

/// The chunk-fetch surface the query engine consumes. Only the fetch,
/// metadata, refresh and table-removal operations are reachable on the
/// foreign-storage facades; the allocator surface a buffer manager usually
/// carries is not.
pub trait BufferMgr {
    fn fetch_buffer(
        &self,
        chunk_key: &ChunkKey,
        destination_buffer: &Arc<dyn ChunkBuffer>,
        num_bytes: Option<u64>,
    ) -> StorageResult<()>;

    fn get_chunk_metadata_vec_for_prefix(
        &self,
        key_prefix: &ChunkKey,
    ) -> StorageResult<ChunkMetadataVector>;

    fn refresh_table(&self, table_key: &ChunkKey, evict_cached_entries: bool)
        -> StorageResult<()>;

    fn remove_table_related(&self, table_key: &ChunkKey);

    fn create_buffer(&self, _chunk_key: &ChunkKey) -> Arc<dyn ChunkBuffer> {
        unreachable!()
    }

    fn delete_buffer(&self, _chunk_key: &ChunkKey) {
        unreachable!()
    }

    fn is_buffer_on_device(&self, _chunk_key: &ChunkKey) -> bool {
        unreachable!()
    }

    fn checkpoint(&self) -> StorageResult<()> {
        unreachable!()
    }

    fn get_max_size(&self) -> u64 {
        unreachable!()
    }

    fn get_in_use_size(&self) -> u64 {
        unreachable!()
    }
}

/// Uncached foreign storage manager: a registry of per-table data wrappers
/// plus the temporary buffers fragments are materialized through.
pub struct ForeignStorageMgr {
    catalog: CatalogRef,
    data_wrapper_map: RwLock<HashMap<ChunkKey, Arc<DataWrapper>>>,
    temp_chunk_buffer_map: RwLock<BTreeMap<ChunkKey, Arc<ForeignStorageBuffer>>>,
}

impl ForeignStorageMgr {
    pub fn new(catalog: CatalogRef) -> Self {
        Self {
            catalog,
            data_wrapper_map: RwLock::new(HashMap::new()),
            temp_chunk_buffer_map: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn catalog(&self) -> &CatalogRef {
        &self.catalog
    }

    pub fn has_data_wrapper_for_chunk(&self, chunk_key: &ChunkKey) -> bool {
        assert!(has_table_prefix(chunk_key));
        let table_key = get_table_key(chunk_key);
        self.data_wrapper_map.read().contains_key(&table_key)
    }

    /// The wrapper serving a chunk's table. Panics if none has been created;
    /// callers go through [`create_data_wrapper_if_not_exists`](Self::create_data_wrapper_if_not_exists)
    /// first.
    pub fn data_wrapper(&self, chunk_key: &ChunkKey) -> Arc<DataWrapper> {
        let table_key = get_table_key(chunk_key);
        self.data_wrapper_map
            .read()
            .get(&table_key)
            .cloned()
            .unwrap_or_else(|| panic!("no data wrapper for table {}", show_chunk(&table_key)))
    }

    /// Lazily constructs the wrapper declared by the table's foreign server.
    /// Returns whether construction happened.
    pub fn create_data_wrapper_if_not_exists(&self, chunk_key: &ChunkKey) -> StorageResult<bool> {
        let mut data_wrapper_map = self.data_wrapper_map.write();
        let table_key = get_table_key(chunk_key);
        if data_wrapper_map.contains_key(&table_key) {
            return Ok(false);
        }
        let db_id = chunk_key[CHUNK_KEY_DB_IDX];
        let foreign_table = self
            .catalog
            .get_foreign_table(db_id, chunk_key[CHUNK_KEY_TABLE_IDX])?;

        let wrapper = match foreign_table.foreign_server.data_wrapper_type.as_str() {
            DataWrapperType::CSV => DataWrapper::Csv(CsvDataWrapper::new(db_id, foreign_table)),
            other => unreachable!("unsupported data wrapper type {other}"),
        };
        data_wrapper_map.insert(table_key, Arc::new(wrapper));
        Ok(true)
    }

    /// Testing hook: decorates the table's wrapper with a proxy that retains
    /// the real one.
    pub fn set_data_wrapper(&self, table_key: &ChunkKey, hooks: ProxyHooks) {
        assert!(is_table_key(table_key));
        let mut data_wrapper_map = self.data_wrapper_map.write();
        let parent = data_wrapper_map
            .get(table_key)
            .cloned()
            .unwrap_or_else(|| panic!("no data wrapper for table {}", show_chunk(table_key)));
        data_wrapper_map.insert(
            table_key.clone(),
            Arc::new(DataWrapper::Proxy(ProxyDataWrapper::new(parent, hooks))),
        );
    }

    pub fn is_data_wrapper_restored(&self, chunk_key: &ChunkKey) -> bool {
        if !self.has_data_wrapper_for_chunk(chunk_key) {
            return false;
        }
        self.data_wrapper(chunk_key).is_restored()
    }

    pub fn clear_temp_chunk_buffer_map_entries_for_table(&self, table_key: &ChunkKey) {
        assert!(is_table_key(table_key));
        let mut temp_map = self.temp_chunk_buffer_map.write();
        let upper = prefix_upper_bound(table_key);
        let keys: Vec<_> = temp_map
            .range(table_key.clone()..upper)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            temp_map.remove(&key);
        }
    }

    fn create_and_populate_data_wrapper_if_not_exists(
        &self,
        chunk_key: &ChunkKey,
    ) -> StorageResult<()> {
        let table_key = get_table_key(chunk_key);
        if self.create_data_wrapper_if_not_exists(&table_key)? {
            self.data_wrapper(&table_key).populate_chunk_metadata()?;
        }
        Ok(())
    }

    /// Temp-buffer fast path: a sibling fetch already materialized this
    /// chunk. Copies it out and drops the entry.
    fn fetch_buffer_if_temp_buffer_map_entry_exists(
        &self,
        chunk_key: &ChunkKey,
        destination_buffer: &Arc<dyn ChunkBuffer>,
        num_bytes: Option<u64>,
    ) -> StorageResult<bool> {
        let buffer = {
            let temp_map = self.temp_chunk_buffer_map.read();
            match temp_map.get(chunk_key) {
                Some(buffer) => buffer.clone(),
                None => return Ok(false),
            }
        };
        buffer.copy_to(destination_buffer.as_ref(), num_bytes)?;
        self.temp_chunk_buffer_map.write().remove(chunk_key);
        Ok(true)
    }

    fn allocate_temp_buffers_for_chunks(&self, chunk_keys: &BTreeSet<ChunkKey>) -> ChunkBufferMap {
        let mut chunk_buffer_map = ChunkBufferMap::new();
        let mut temp_map = self.temp_chunk_buffer_map.write();
        for chunk_key in chunk_keys {
            let buffer = Arc::new(ForeignStorageBuffer::new());
            temp_map.insert(chunk_key.clone(), buffer.clone());
            chunk_buffer_map.insert(chunk_key.clone(), buffer as Arc<dyn ChunkBuffer>);
        }
        chunk_buffer_map
    }
}

impl BufferMgr for ForeignStorageMgr {
    fn fetch_buffer(
        &self,
        chunk_key: &ChunkKey,
        destination_buffer: &Arc<dyn ChunkBuffer>,
        num_bytes: Option<u64>,
    ) -> StorageResult<()> {
        assert!(!destination_buffer.is_dirty());
        // Use a temp buffer if a sibling fetch has one mapped for this chunk.
        if self.fetch_buffer_if_temp_buffer_map_entry_exists(
            chunk_key,
            destination_buffer,
            num_bytes,
        )? {
            return Ok(());
        }
        self.create_and_populate_data_wrapper_if_not_exists(chunk_key)?;

        let mut chunk_keys = get_keys_set_from_table(&self.catalog, chunk_key)?;
        chunk_keys.remove(chunk_key);
        let optional_buffers = ChunkBufferMap::new();
        let mut required_buffers = self.allocate_temp_buffers_for_chunks(&chunk_keys);
        required_buffers.insert(chunk_key.clone(), destination_buffer.clone());
        // The wrapper writes directly into the destination buffer, so there
        // is nothing to copy afterwards.
        self.data_wrapper(chunk_key)
            .populate_chunk_buffers(&required_buffers, &optional_buffers)
    }

    fn get_chunk_metadata_vec_for_prefix(
        &self,
        key_prefix: &ChunkKey,
    ) -> StorageResult<ChunkMetadataVector> {
        assert!(is_table_key(key_prefix));
        self.create_data_wrapper_if_not_exists(key_prefix)?;
        self.data_wrapper(key_prefix).populate_chunk_metadata()
    }

    fn refresh_table(
        &self,
        _table_key: &ChunkKey,
        _evict_cached_entries: bool,
    ) -> StorageResult<()> {
        // Without a cache there is nothing to refresh.
        Ok(())
    }

    fn remove_table_related(&self, table_key: &ChunkKey) {
        {
            let mut data_wrapper_map = self.data_wrapper_map.write();
            data_wrapper_map.remove(table_key);
        }
        self.clear_temp_chunk_buffer_map_entries_for_table(table_key);
    }
}

/// All chunk keys the destination chunk's logical column contributes to its
/// fragment. Variable-length columns contribute a data key and an offsets
/// key.
pub fn get_keys_set_from_table(
    catalog: &CatalogRef,
    destination_chunk_key: &ChunkKey,
) -> StorageResult<BTreeSet<ChunkKey>> {
    Ok(get_keys_vec_from_table(catalog, destination_chunk_key)?
        .into_iter()
        .collect())
}

pub fn get_keys_vec_from_table(
    catalog: &CatalogRef,
    destination_chunk_key: &ChunkKey,
) -> StorageResult<Vec<ChunkKey>> {
    let db_id = destination_chunk_key[CHUNK_KEY_DB_IDX];
    let table_id = destination_chunk_key[CHUNK_KEY_TABLE_IDX];
    let destination_column_id = destination_chunk_key[CHUNK_KEY_COLUMN_IDX];
    let fragment_id = destination_chunk_key[CHUNK_KEY_FRAGMENT_IDX];
    let foreign_table = catalog.get_foreign_table(db_id, table_id)?;

    let column = foreign_table.get_logical_column(destination_column_id)?;
    let mut chunk_keys = vec![];
    if column.is_varlen() {
        chunk_keys.push(ChunkKey::from_slice(&[
            db_id,
            table_id,
            column.column_id,
            fragment_id,
            VARLEN_DATA_PART,
        ]));
        chunk_keys.push(ChunkKey::from_slice(&[
            db_id,
            table_id,
            column.column_id,
            fragment_id,
            VARLEN_OFFSETS_PART,
        ]));
    } else {
        chunk_keys.push(ChunkKey::from_slice(&[
            db_id,
            table_id,
            column.column_id,
            fragment_id,
        ]));
    }
    Ok(chunk_keys)
}
