// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Data wrappers: per-table readers over external files.
//!
//! A wrapper can enumerate chunk metadata for its table, materialize chunks
//! into buffers it was handed, and persist its internal bookkeeping so a
//! restarted process can skip the initial scan. Wrappers are a closed set of
//! variants; the proxy variant decorates a real wrapper for tests.

use std::path::Path;

pub use self::csv::{CsvDataWrapper, FileRegion};
pub use self::proxy::{ProxyDataWrapper, ProxyHooks};
use crate::buffer::ChunkBufferMap;
use crate::chunk::ChunkMetadataVector;
use crate::error::StorageResult;

mod csv;
mod proxy;

/// Names of the supported data wrapper variants, as declared on a foreign
/// server.
pub struct DataWrapperType;

impl DataWrapperType {
    pub const CSV: &'static str = "CSV";
}

pub enum DataWrapper {
    Csv(CsvDataWrapper),
    Proxy(ProxyDataWrapper),
}

impl DataWrapper {
    /// Chunk metadata for all chunks of the wrapper's table, scanned from
    /// the external source.
    pub fn populate_chunk_metadata(&self) -> StorageResult<ChunkMetadataVector> {
        match self {
            DataWrapper::Csv(wrapper) => wrapper.populate_chunk_metadata(),
            DataWrapper::Proxy(proxy) => proxy.populate_chunk_metadata(),
        }
    }

    /// Fills the pre-allocated buffers in `required_buffers`, all of which
    /// must belong to one fragment. `optional_buffers` may be populated when
    /// the wrapper scans through their data anyway.
    pub fn populate_chunk_buffers(
        &self,
        required_buffers: &ChunkBufferMap,
        optional_buffers: &ChunkBufferMap,
    ) -> StorageResult<()> {
        match self {
            DataWrapper::Csv(wrapper) => {
                wrapper.populate_chunk_buffers(required_buffers, optional_buffers)
            }
            DataWrapper::Proxy(proxy) => {
                proxy.populate_chunk_buffers(required_buffers, optional_buffers)
            }
        }
    }

    /// Writes the wrapper's internal bookkeeping to `path`.
    pub fn serialize_internals(&self, path: &Path) -> StorageResult<()> {
        match self {
            DataWrapper::Csv(wrapper) => wrapper.serialize_internals(path),
            DataWrapper::Proxy(proxy) => proxy.serialize_internals(path),
        }
    }

    /// Restores internal bookkeeping from a file written by
    /// [`serialize_internals`](Self::serialize_internals), given the chunk
    /// metadata recovered from disk.
    pub fn restore_internals(
        &self,
        path: &Path,
        chunk_metadata: &ChunkMetadataVector,
    ) -> StorageResult<()> {
        match self {
            DataWrapper::Csv(wrapper) => wrapper.restore_internals(path, chunk_metadata),
            DataWrapper::Proxy(proxy) => proxy.restore_internals(path, chunk_metadata),
        }
    }

    // For testing: was this wrapper restored from disk?
    pub fn is_restored(&self) -> bool {
        match self {
            DataWrapper::Csv(wrapper) => wrapper.is_restored(),
            DataWrapper::Proxy(proxy) => proxy.is_restored(),
        }
    }
}
