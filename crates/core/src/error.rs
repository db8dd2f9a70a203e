//! Error types for the partition store
//!
//! One `thiserror` hierarchy shared by every crate in the workspace.
//! Allocation pressure surfaces as `OutOfMemory` and is handled by retry
//! (mutation merge) or by dropping the cache (invalidation); I/O and
//! corruption come from the page cache path.

use std::io;
use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Error hierarchy for the partition store.
#[derive(Debug, Error)]
pub enum Error {
    /// An allocation could not be satisfied even after eviction.
    #[error("out of memory: {context}")]
    OutOfMemory {
        /// What was being allocated.
        context: &'static str,
    },

    /// A read attempted to use a phase older than the previous snapshot.
    #[error("attempted to read from retired phase {phase} (current={current})")]
    RetiredPhase {
        /// The phase the read started at.
        phase: u64,
        /// The current phase of the underlying source.
        current: u64,
    },

    /// I/O failure from the backing file of a page cache.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The backing data ended or made no sense mid-parse.
    #[error("corrupt index data: {context}")]
    Corruption {
        /// Where the parse failed.
        context: String,
    },

    /// A cache-only read needed a page that was not resident.
    #[error("data not cached")]
    NotCached,

    /// Direct population found the partition already cached.
    #[error("cache already contains an entry for the populated key")]
    AlreadyCached,
}

impl Error {
    /// Shorthand for a corruption error.
    pub fn corruption(context: impl Into<String>) -> Error {
        Error::Corruption {
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
