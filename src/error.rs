//! Error types for cache operations

use std::io;
use std::path::PathBuf;

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by the cache, paged files and cursors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Underlying channel I/O failed. Dirty state is preserved so the
    /// operation can be retried.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation on a closed cache.
    #[error("cache is closed")]
    CacheClosed,

    /// The requested file page size does not fit the cache page size.
    #[error("file page size {requested} out of range (1..={max})")]
    PageSizeOutOfRange {
        /// Requested file page size.
        requested: usize,
        /// Cache page size, the upper bound.
        max: usize,
    },

    /// A file was re-mapped with a different page size.
    #[error("file already mapped with page size {existing}, requested {requested}")]
    PageSizeConflict {
        /// Page size of the existing mapping.
        existing: usize,
        /// Page size of the rejected request.
        requested: usize,
    },

    /// Invalid cursor flag combination.
    #[error("invalid cursor flags: {0}")]
    InvalidFlags(&'static str),

    /// The file has no current mapping.
    #[error("file is not mapped: {0}")]
    NotMapped(PathBuf),

    /// The last reference to a mapping cannot be released while cursors
    /// are still open against it.
    #[error("mapping has live cursors")]
    CursorsStillOpen,

    /// No unpinned frame became available within the configured wait.
    #[error("no evictable frame available")]
    OutOfFrames,
}

impl CacheError {
    /// Whether this error is an argument error (as opposed to state or
    /// I/O).
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            CacheError::PageSizeOutOfRange { .. }
                | CacheError::PageSizeConflict { .. }
                | CacheError::InvalidFlags(_)
        )
    }
}
