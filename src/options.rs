// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

/// Default page size: 2 MiB.
pub const DEFAULT_PAGE_SIZE: u64 = 2 * 1024 * 1024;
/// Default number of pages per cache file.
pub const DEFAULT_PAGES_PER_FILE: u64 = 256;
/// Default cache size limit: 20 GiB.
pub const DEFAULT_SIZE_LIMIT: u64 = 21474836480;

/// Options for the foreign-storage disk cache.
#[derive(Clone, Debug)]
pub struct DiskCacheConfig {
    /// Directory holding the per-table cache subdirectories.
    pub path: PathBuf,
    /// Maximum number of chunk bytes per table before eviction.
    pub size_limit: u64,
    /// Page size in bytes. Every cached buffer consumes an integral number
    /// of pages.
    pub page_size: u64,
    /// Pages per cache file. The minimum viable cache size is
    /// `page_size * pages_per_file`.
    pub pages_per_file: u64,
    /// Threads used to re-index table directories on startup. Zero means
    /// sequential.
    pub num_reader_threads: usize,
}

impl DiskCacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_limit: DEFAULT_SIZE_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            pages_per_file: DEFAULT_PAGES_PER_FILE,
            num_reader_threads: 0,
        }
    }

    /// Small pages and one page per file, so tests can exercise eviction
    /// with a handful of bytes.
    pub fn default_for_test(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_limit: 1024,
            page_size: 64,
            pages_per_file: 1,
            num_reader_threads: 0,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.page_size * self.pages_per_file
    }
}
