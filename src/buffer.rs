// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Chunk buffer abstraction.
//!
//! Data wrappers materialize chunks into buffers they did not allocate:
//! in-memory scratch buffers on the uncached fetch path, durable page-file
//! buffers when the disk cache hands them out. [`ChunkBuffer`] is the seam
//! both sides share.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::chunk::{ChunkKey, ChunkMetadata};
use crate::error::StorageResult;

pub trait ChunkBuffer: Send + Sync {
    /// Replaces the buffer contents and marks it dirty.
    fn write(&self, data: Bytes);

    /// Current contents of the buffer.
    fn data(&self) -> StorageResult<Bytes>;

    fn size(&self) -> u64;

    /// Imprints encoder metadata and marks the buffer dirty.
    fn set_metadata(&self, metadata: ChunkMetadata);

    fn metadata(&self) -> Option<ChunkMetadata>;

    fn is_dirty(&self) -> bool;

    fn set_clean(&self);

    /// Drops contents and metadata, leaving an empty buffer.
    fn reset_to_empty(&self);

    /// Pages held by the buffer. Only page-file buffers occupy pages.
    fn page_count(&self) -> u64 {
        0
    }

    /// Copies contents and metadata into `destination`. `num_bytes` bounds
    /// the copy; `None` copies everything. The destination ends up clean.
    fn copy_to(&self, destination: &dyn ChunkBuffer, num_bytes: Option<u64>) -> StorageResult<()> {
        let mut data = self.data()?;
        if let Some(n) = num_bytes {
            data.truncate(n as usize);
        }
        destination.write(data);
        if let Some(metadata) = self.metadata() {
            destination.set_metadata(metadata);
        }
        destination.set_clean();
        Ok(())
    }
}

/// Buffers handed to a data wrapper, keyed by the chunk each must hold.
pub type ChunkBufferMap = BTreeMap<ChunkKey, Arc<dyn ChunkBuffer>>;

#[derive(Default)]
struct BufferState {
    data: Bytes,
    metadata: Option<ChunkMetadata>,
    dirty: bool,
}

/// In-memory chunk buffer, used for temporary buffers on the uncached fetch
/// path and as the destination of a fetch.
#[derive(Default)]
pub struct ForeignStorageBuffer {
    state: Mutex<BufferState>,
}

impl ForeignStorageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clean buffer pre-filled with `data` and `metadata`.
    pub fn with_data(data: Bytes, metadata: ChunkMetadata) -> Self {
        let buffer = Self::new();
        buffer.write(data);
        buffer.set_metadata(metadata);
        buffer.set_clean();
        buffer
    }
}

impl ChunkBuffer for ForeignStorageBuffer {
    fn write(&self, data: Bytes) {
        let mut state = self.state.lock();
        state.data = data;
        state.dirty = true;
    }

    fn data(&self) -> StorageResult<Bytes> {
        Ok(self.state.lock().data.clone())
    }

    fn size(&self) -> u64 {
        self.state.lock().data.len() as u64
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
        state.data = Bytes::new();
        state.metadata = None;
        state.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStats;
    use crate::types::LogicalType;

    #[test]
    fn copy_to_bounded() {
        let metadata = ChunkMetadata::new(LogicalType::Int32, 8, 2, ChunkStats::empty());
        let source =
            ForeignStorageBuffer::with_data(Bytes::from_static(b"\x01\x02\x03\x04"), metadata);
        let destination = ForeignStorageBuffer::new();

        source.copy_to(&destination, Some(2)).unwrap();
        assert_eq!(destination.data().unwrap().as_ref(), b"\x01\x02");
        assert!(!destination.is_dirty());
        assert!(destination.metadata().is_some());

        source.copy_to(&destination, None).unwrap();
        assert_eq!(destination.size(), 4);
    }
}
