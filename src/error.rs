// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use thiserror::Error;

// This toolchain's std does not expose `std::error::Error::provide` as a
// stable API, so a field literally typed `std::backtrace::Backtrace` would
// make thiserror's derive emit a `provide()` method gated behind the
// unstable `error_generic_member_access` feature. Wrapping it avoids that
// derive path (the wrapper's type name doesn't match thiserror's detection)
// while keeping the same captured backtrace and rendering.
struct CapturedBacktrace(std::backtrace::Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        CapturedBacktrace(std::backtrace::Backtrace::capture())
    }
}

impl std::fmt::Display for CapturedBacktrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid foreign table option: {0}")]
    InvalidOption(String),
    #[error("could not create cache with size {limit}, minimum cache size is {minimum}")]
    CacheTooSmall { limit: u64, minimum: u64 },
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] Box<csv::Error>),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("foreign storage wrapper error: {0}")]
    DataWrapper(String),
    #[error("refresh failed after cache eviction: {0}")]
    PostEvictionRefresh(#[source] Box<TracedStorageError>),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedStorageError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedStorageError {
        StorageError::JsonDecode(e).into()
    }
}

impl From<csv::Error> for TracedStorageError {
    #[inline]
    fn from(e: csv::Error) -> TracedStorageError {
        StorageError::Csv(e.into()).into()
    }
}

/// [`StorageError`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedStorageError {
    source: StorageError,
    backtrace: CapturedBacktrace,
}

impl From<StorageError> for TracedStorageError {
    fn from(source: StorageError) -> Self {
        TracedStorageError {
            source,
            backtrace: CapturedBacktrace::capture(),
        }
    }
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedStorageError {
    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        StorageError::NotFound(ty, item.to_string()).into()
    }

    pub fn invalid_option(message: impl ToString) -> Self {
        StorageError::InvalidOption(message.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn data_wrapper(message: impl ToString) -> Self {
        StorageError::DataWrapper(message.to_string()).into()
    }

    pub fn post_eviction_refresh(cause: TracedStorageError) -> Self {
        StorageError::PostEvictionRefresh(Box::new(cause)).into()
    }

    /// The error that caused a post-eviction refresh failure, or the error
    /// itself for any other kind.
    pub fn into_original(self) -> TracedStorageError {
        match self.source {
            StorageError::PostEvictionRefresh(original) => *original,
            _ => self,
        }
    }

    pub fn is_post_eviction_refresh(&self) -> bool {
        matches!(self.source, StorageError::PostEvictionRefresh(_))
    }

    pub fn source_error(&self) -> &StorageError {
        &self.source
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
