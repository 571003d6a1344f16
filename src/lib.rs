// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Foreign-storage caching layer.
//!
//! Tables whose authoritative data lives in external files are exposed as
//! chunk-addressed storage: a per-table data wrapper scans the external
//! source, a disk cache keeps materialized chunks under a bounded page
//! budget across restarts, and a refresh state machine reconciles the cache
//! with the source under append and replace policies.

#![deny(unused_must_use)]

pub mod buffer;
pub mod cache;
pub mod catalog;
pub mod chunk;
pub mod error;
pub mod manager;
pub mod options;
pub mod refresh;
pub mod types;
pub mod wrapper;

pub use self::buffer::{ChunkBuffer, ChunkBufferMap, ForeignStorageBuffer};
pub use self::cache::ForeignStorageCache;
pub use self::chunk::{ChunkKey, ChunkMetadata, ChunkMetadataVector};
pub use self::error::{StorageError, StorageResult, TracedStorageError};
pub use self::manager::{BufferMgr, CachingForeignStorageMgr, ForeignStorageMgr};
pub use self::options::DiskCacheConfig;
