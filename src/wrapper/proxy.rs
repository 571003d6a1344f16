// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::Path;
use std::sync::Arc;

use super::DataWrapper;
use crate::buffer::ChunkBufferMap;
use crate::chunk::ChunkMetadataVector;
use crate::error::StorageResult;

type Hook = Box<dyn Fn() -> StorageResult<()> + Send + Sync>;

/// Hooks run before delegating to the real wrapper. A hook that fails makes
/// the proxied operation fail, which is how tests simulate an unreachable
/// external source.
#[derive(Default)]
pub struct ProxyHooks {
    pub on_populate_chunk_metadata: Option<Hook>,
    pub on_populate_chunk_buffers: Option<Hook>,
}

/// Testing decorator over a real wrapper. Retains the wrapped wrapper so its
/// internal bookkeeping keeps accumulating through the proxy.
pub struct ProxyDataWrapper {
    parent: Arc<DataWrapper>,
    hooks: ProxyHooks,
}

impl ProxyDataWrapper {
    pub fn new(parent: Arc<DataWrapper>, hooks: ProxyHooks) -> Self {
        Self { parent, hooks }
    }

    pub fn parent(&self) -> &Arc<DataWrapper> {
        &self.parent
    }

    pub fn populate_chunk_metadata(&self) -> StorageResult<ChunkMetadataVector> {
        if let Some(hook) = &self.hooks.on_populate_chunk_metadata {
            hook()?;
        }
        self.parent.populate_chunk_metadata()
    }

    pub fn populate_chunk_buffers(
        &self,
        required_buffers: &ChunkBufferMap,
        optional_buffers: &ChunkBufferMap,
    ) -> StorageResult<()> {
        if let Some(hook) = &self.hooks.on_populate_chunk_buffers {
            hook()?;
        }
        self.parent
            .populate_chunk_buffers(required_buffers, optional_buffers)
    }

    pub fn serialize_internals(&self, path: &Path) -> StorageResult<()> {
        self.parent.serialize_internals(path)
    }

    pub fn restore_internals(
        &self,
        path: &Path,
        chunk_metadata: &ChunkMetadataVector,
    ) -> StorageResult<()> {
        self.parent.restore_internals(path, chunk_metadata)
    }

    pub fn is_restored(&self) -> bool {
        self.parent.is_restored()
    }
}
