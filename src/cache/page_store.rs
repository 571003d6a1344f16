// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Durable paged buffer store addressed by chunk key.
//!
//! One subdirectory per table under the cache root. Each chunk's bytes live
//! in their own data file; the per-table `chunk_metadata.json` manifest
//! records every buffer's key, size and encoder metadata and is rewritten
//! atomically on checkpoint. Buffer data is loaded back lazily after a
//! restart.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::buffer::ChunkBuffer;
use crate::chunk::{
    get_table_key, prefix_upper_bound, show_chunk, ChunkKey, ChunkMetadata, ChunkMetadataVector,
    CHUNK_KEY_COLUMN_IDX, CHUNK_KEY_FRAGMENT_IDX, CHUNK_KEY_VARLEN_IDX,
};
use crate::error::{StorageResult, TracedStorageError};
use crate::options::DiskCacheConfig;

const CHUNK_MANIFEST_FILE_NAME: &str = "chunk_metadata.json";

#[derive(Default)]
struct FileBufferState {
    /// Loaded contents. `None` with a non-zero size means the bytes are on
    /// disk and have not been read back yet.
    data: Option<Bytes>,
    size: u64,
    num_pages: u64,
    metadata: Option<ChunkMetadata>,
    dirty: bool,
}

/// A paged buffer backed by one data file inside its table's cache
/// directory.
pub struct FileBuffer {
    data_path: PathBuf,
    page_size: u64,
    state: Mutex<FileBufferState>,
}

impl FileBuffer {
    fn new(data_path: PathBuf, page_size: u64) -> Self {
        Self {
            data_path,
            page_size,
            state: Mutex::new(FileBufferState::default()),
        }
    }

    fn recovered(
        data_path: PathBuf,
        page_size: u64,
        size: u64,
        metadata: Option<ChunkMetadata>,
    ) -> Self {
        let num_pages = pages_for(size, page_size);
        Self {
            data_path,
            page_size,
            state: Mutex::new(FileBufferState {
                data: None,
                size,
                num_pages,
                metadata,
                dirty: false,
            }),
        }
    }

    /// Releases all pages of the chunk, removing its data file, and returns
    /// how many pages were freed. Encoder metadata survives: the buffer
    /// becomes a metadata-only entry.
    pub fn free_chunk_pages(&self) -> u64 {
        let mut state = self.state.lock();
        let freed = state.num_pages;
        state.data = None;
        state.size = 0;
        state.num_pages = 0;
        state.dirty = false;
        drop(state);
        let _ = fs::remove_file(&self.data_path);
        freed
    }

    /// Writes the data file if the buffer is dirty and syncs it.
    fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        if state.size > 0 {
            // A dirty buffer without loaded data only had its metadata
            // touched; the bytes on disk are already current.
            if let Some(data) = state.data.clone() {
                let mut file = fs::File::create(&self.data_path)?;
                file.write_all(&data)?;
                file.sync_data()?;
            }
        } else {
            let _ = fs::remove_file(&self.data_path);
        }
        state.dirty = false;
        Ok(())
    }
}

impl ChunkBuffer for FileBuffer {
    fn write(&self, data: Bytes) {
        let mut state = self.state.lock();
        state.size = data.len() as u64;
        state.num_pages = pages_for(state.size, self.page_size);
        state.data = Some(data);
        state.dirty = true;
    }

    fn data(&self) -> StorageResult<Bytes> {
        let mut state = self.state.lock();
        if state.data.is_none() && state.size > 0 {
            let bytes = fs::read(&self.data_path)?;
            state.data = Some(Bytes::from(bytes));
        }
        Ok(state.data.clone().unwrap_or_default())
    }

    fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn set_metadata(&self, metadata: ChunkMetadata) {
        let mut state = self.state.lock();
        state.metadata = Some(metadata);
        state.dirty = true;
    }

    fn metadata(&self) -> Option<ChunkMetadata> {
        self.state.lock().metadata.clone()
    }

    fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    fn set_clean(&self) {
        self.state.lock().dirty = false;
    }

    fn reset_to_empty(&self) {
        let mut state = self.state.lock();
        state.data = None;
        state.size = 0;
        state.num_pages = 0;
        state.metadata = None;
        state.dirty = false;
        drop(state);
        let _ = fs::remove_file(&self.data_path);
    }

    fn page_count(&self) -> u64 {
        self.state.lock().num_pages
    }
}

/// One line of a table's chunk manifest.
#[derive(Serialize, Deserialize)]
struct ChunkManifestEntry {
    key: ChunkKey,
    size: u64,
    metadata: Option<ChunkMetadata>,
}

/// Durable store mapping chunk keys to paged buffers.
pub struct PageFileStore {
    base_path: PathBuf,
    page_size: u64,
    pages_per_file: u64,
    buffers: RwLock<BTreeMap<ChunkKey, Arc<FileBuffer>>>,
}

impl PageFileStore {
    /// Opens the store, creating the cache directory if needed and
    /// re-indexing any table directories left behind by a previous process.
    pub fn open(config: &DiskCacheConfig) -> StorageResult<Self> {
        validate_path(&config.path)?;

        let mut table_dirs = vec![];
        for entry in fs::read_dir(&config.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                table_dirs.push(entry.path());
            }
        }

        let mut buffers = BTreeMap::new();
        if config.num_reader_threads > 1 && table_dirs.len() > 1 {
            let threads = config.num_reader_threads.min(table_dirs.len());
            let per_thread = table_dirs.len().div_ceil(threads);
            let page_size = config.page_size;
            let results = std::thread::scope(|s| {
                table_dirs
                    .chunks(per_thread)
                    .map(|dirs| {
                        s.spawn(move || {
                            dirs.iter()
                                .map(|dir| load_table_dir(dir, page_size))
                                .collect::<StorageResult<Vec<_>>>()
                        })
                    })
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|handle| handle.join().expect("reader thread panicked"))
                    .collect::<Vec<_>>()
            });
            for result in results {
                for entries in result? {
                    buffers.extend(entries);
                }
            }
        } else {
            for dir in &table_dirs {
                buffers.extend(load_table_dir(dir, config.page_size)?);
            }
        }

        Ok(Self {
            base_path: config.path.clone(),
            page_size: config.page_size,
            pages_per_file: config.pages_per_file,
            buffers: RwLock::new(buffers),
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn pages_per_file(&self) -> u64 {
        self.pages_per_file
    }

    /// Bytes of one cache file, the minimum viable cache size.
    pub fn file_size(&self) -> u64 {
        self.page_size * self.pages_per_file
    }

    /// Directory holding the table's data files and sidecar manifests.
    pub fn table_directory(&self, table_key: &ChunkKey) -> PathBuf {
        self.base_path
            .join(format!("table_{}_{}", table_key[0], table_key[1]))
    }

    /// Creates an empty buffer for `key`. The key must not already have one.
    pub fn create_buffer(&self, key: &ChunkKey) -> Arc<FileBuffer> {
        let mut buffers = self.buffers.write();
        assert!(
            !buffers.contains_key(key),
            "buffer already exists for chunk {}",
            show_chunk(key)
        );
        let buffer = Arc::new(FileBuffer::new(self.data_path_of(key), self.page_size));
        buffers.insert(key.clone(), buffer.clone());
        buffer
    }

    /// Copies `source` into the buffer for `key`, creating it if needed.
    pub fn put_buffer(&self, key: &ChunkKey, source: &dyn ChunkBuffer) -> StorageResult<()> {
        let buffer = match self.get_buffer_if_exists(key) {
            Some(buffer) => buffer,
            None => self.create_buffer(key),
        };
        buffer.write(source.data()?);
        if let Some(metadata) = source.metadata() {
            buffer.set_metadata(metadata);
        }
        Ok(())
    }

    pub fn get_buffer(&self, key: &ChunkKey) -> StorageResult<Arc<FileBuffer>> {
        self.get_buffer_if_exists(key)
            .ok_or_else(|| TracedStorageError::not_found("chunk buffer", show_chunk(key)))
    }

    pub fn get_buffer_if_exists(&self, key: &ChunkKey) -> Option<Arc<FileBuffer>> {
        self.buffers.read().get(key).cloned()
    }

    pub fn is_buffer_on_device(&self, key: &ChunkKey) -> bool {
        self.buffers.read().contains_key(key)
    }

    /// Drops the buffer and its data file. No-op if absent.
    pub fn delete_buffer(&self, key: &ChunkKey) {
        if let Some(buffer) = self.buffers.write().remove(key) {
            buffer.free_chunk_pages();
        }
    }

    /// Metadata for every buffer under `prefix` that has been imprinted with
    /// encoder metadata.
    pub fn get_chunk_metadata_vec_for_prefix(&self, prefix: &ChunkKey) -> ChunkMetadataVector {
        let upper = prefix_upper_bound(prefix);
        self.buffers
            .read()
            .range(prefix.clone()..upper)
            .filter_map(|(key, buffer)| buffer.metadata().map(|meta| (key.clone(), meta)))
            .collect()
    }

    /// Drops every buffer of the table and removes its directory.
    pub fn remove_table_related(&self, table_key: &ChunkKey) {
        let upper = prefix_upper_bound(table_key);
        let mut buffers = self.buffers.write();
        let keys: Vec<_> = buffers
            .range(table_key.clone()..upper)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            buffers.remove(&key);
        }
        drop(buffers);
        let _ = fs::remove_dir_all(self.table_directory(table_key));
    }

    /// Durability fence: writes out all dirty buffers and rewrites every
    /// table's chunk manifest.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let table_keys: Vec<_> = {
            let buffers = self.buffers.read();
            let mut tables: Vec<ChunkKey> = buffers.keys().map(get_table_key).collect();
            tables.dedup();
            tables
        };
        for table_key in table_keys {
            self.checkpoint_table(&table_key)?;
        }
        Ok(())
    }

    /// Checkpoint scoped to one table.
    pub fn checkpoint_table(&self, table_key: &ChunkKey) -> StorageResult<()> {
        let upper = prefix_upper_bound(table_key);
        let entries: Vec<(ChunkKey, Arc<FileBuffer>)> = self
            .buffers
            .read()
            .range(table_key.clone()..upper)
            .map(|(key, buffer)| (key.clone(), buffer.clone()))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let directory = self.table_directory(table_key);
        fs::create_dir_all(&directory)?;
        let mut manifest = Vec::with_capacity(entries.len());
        for (key, buffer) in &entries {
            buffer.flush()?;
            manifest.push(ChunkManifestEntry {
                key: key.clone(),
                size: buffer.size(),
                metadata: buffer.metadata(),
            });
        }

        // Write-then-rename so a crash mid-checkpoint leaves the previous
        // manifest intact.
        let manifest_path = directory.join(CHUNK_MANIFEST_FILE_NAME);
        let tmp_path = directory.join(format!("{}.tmp", CHUNK_MANIFEST_FILE_NAME));
        let mut file = fs::File::create(&tmp_path)?;
        serde_json::to_writer(&mut file, &manifest)?;
        file.sync_data()?;
        fs::rename(&tmp_path, &manifest_path)?;
        Ok(())
    }

    fn data_path_of(&self, key: &ChunkKey) -> PathBuf {
        let mut name = format!(
            "chunk_{}_{}",
            key[CHUNK_KEY_COLUMN_IDX], key[CHUNK_KEY_FRAGMENT_IDX]
        );
        if key.len() > CHUNK_KEY_VARLEN_IDX {
            name.push_str(&format!("_{}", key[CHUNK_KEY_VARLEN_IDX]));
        }
        name.push_str(".bin");
        self.table_directory(&get_table_key(key)).join(name)
    }
}

fn pages_for(size: u64, page_size: u64) -> u64 {
    size.div_ceil(page_size)
}

fn load_table_dir(
    directory: &Path,
    page_size: u64,
) -> StorageResult<Vec<(ChunkKey, Arc<FileBuffer>)>> {
    let manifest_path = directory.join(CHUNK_MANIFEST_FILE_NAME);
    if !manifest_path.exists() {
        return Ok(vec![]);
    }
    let contents = fs::read_to_string(&manifest_path)?;
    let manifest: Vec<ChunkManifestEntry> = serde_json::from_str(&contents)?;

    let mut entries = Vec::with_capacity(manifest.len());
    for entry in manifest {
        let mut data_name = format!(
            "chunk_{}_{}",
            entry.key[CHUNK_KEY_COLUMN_IDX], entry.key[CHUNK_KEY_FRAGMENT_IDX]
        );
        if entry.key.len() > CHUNK_KEY_VARLEN_IDX {
            data_name.push_str(&format!("_{}", entry.key[CHUNK_KEY_VARLEN_IDX]));
        }
        data_name.push_str(".bin");
        let buffer = FileBuffer::recovered(
            directory.join(data_name),
            page_size,
            entry.size,
            entry.metadata,
        );
        entries.push((entry.key, Arc::new(buffer)));
    }
    Ok(entries)
}

fn validate_path(base_path: &Path) -> StorageResult<()> {
    if base_path.exists() {
        if !base_path.is_dir() {
            return Err(TracedStorageError::decode(format!(
                "cache path {:?} is not a directory",
                base_path
            )));
        }
    } else {
        fs::create_dir_all(base_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::buffer::ForeignStorageBuffer;
    use crate::chunk::ChunkStats;
    use crate::types::LogicalType;

    fn test_metadata(num_bytes: u64) -> ChunkMetadata {
        ChunkMetadata::new(LogicalType::Int32, num_bytes, num_bytes / 4, ChunkStats::empty())
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let store = PageFileStore::open(&config).unwrap();

        let key: ChunkKey = smallvec![1, 1, 2, 0];
        let source = ForeignStorageBuffer::with_data(Bytes::from(vec![7u8; 100]), test_metadata(100));
        store.put_buffer(&key, &source).unwrap();

        let buffer = store.get_buffer(&key).unwrap();
        assert_eq!(buffer.size(), 100);
        // 100 bytes over 64-byte pages
        assert_eq!(buffer.page_count(), 2);
        assert_eq!(buffer.data().unwrap(), source.data().unwrap());
    }

    #[test]
    fn checkpoint_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let key: ChunkKey = smallvec![1, 1, 2, 0];
        {
            let store = PageFileStore::open(&config).unwrap();
            let source =
                ForeignStorageBuffer::with_data(Bytes::from(vec![9u8; 64]), test_metadata(64));
            store.put_buffer(&key, &source).unwrap();
            store.checkpoint().unwrap();
        }

        let store = PageFileStore::open(&config).unwrap();
        let buffer = store.get_buffer(&key).unwrap();
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.page_count(), 1);
        assert_eq!(buffer.data().unwrap(), Bytes::from(vec![9u8; 64]));
        let metadata = store.get_chunk_metadata_vec_for_prefix(&smallvec![1, 1]);
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].1, test_metadata(64));
    }

    #[test]
    fn uncheckpointed_writes_are_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let key: ChunkKey = smallvec![1, 1, 2, 0];
        {
            let store = PageFileStore::open(&config).unwrap();
            let source =
                ForeignStorageBuffer::with_data(Bytes::from(vec![9u8; 64]), test_metadata(64));
            store.put_buffer(&key, &source).unwrap();
            // no checkpoint
        }
        let store = PageFileStore::open(&config).unwrap();
        assert!(!store.is_buffer_on_device(&key));
    }

    #[test]
    fn free_chunk_pages_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let store = PageFileStore::open(&config).unwrap();
        let key: ChunkKey = smallvec![1, 1, 2, 0];
        let source = ForeignStorageBuffer::with_data(Bytes::from(vec![1u8; 65]), test_metadata(65));
        store.put_buffer(&key, &source).unwrap();
        store.checkpoint().unwrap();

        let buffer = store.get_buffer(&key).unwrap();
        assert_eq!(buffer.free_chunk_pages(), 2);
        assert_eq!(buffer.page_count(), 0);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.metadata().is_some());
        assert_eq!(buffer.free_chunk_pages(), 0);
    }

    #[test]
    fn delete_buffer_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let store = PageFileStore::open(&config).unwrap();
        let key: ChunkKey = smallvec![1, 1, 2, 0];
        let source = ForeignStorageBuffer::with_data(Bytes::from(vec![1u8; 10]), test_metadata(10));
        store.put_buffer(&key, &source).unwrap();
        store.checkpoint().unwrap();

        store.delete_buffer(&key);
        assert!(!store.is_buffer_on_device(&key));
        assert!(store.get_buffer_if_exists(&key).is_none());
        store.delete_buffer(&key);
    }

    #[test]
    fn remove_table_related_drops_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskCacheConfig::default_for_test(dir.path());
        let store = PageFileStore::open(&config).unwrap();
        let key: ChunkKey = smallvec![1, 1, 2, 0];
        let source = ForeignStorageBuffer::with_data(Bytes::from(vec![1u8; 10]), test_metadata(10));
        store.put_buffer(&key, &source).unwrap();
        store.checkpoint().unwrap();
        let table_key: ChunkKey = smallvec![1, 1];
        assert!(store.table_directory(&table_key).exists());

        store.remove_table_related(&table_key);
        assert!(!store.is_buffer_on_device(&key));
        assert!(!store.table_directory(&table_key).exists());
    }
}
