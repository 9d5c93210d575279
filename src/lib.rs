//! oxipager - A shared, fixed-capacity paged file cache
//!
//! oxipager mediates byte-oriented access to files organized into
//! fixed-size pages. Clients map files into the cache and read or write
//! records through cursors that pin pages in memory; the cache faults
//! pages in on demand, keeps them resident up to a configured budget,
//! evicts cold pages with a clock policy, and flushes dirty pages back
//! durably.
//!
//! # Features
//!
//! - Fixed frame pool shared by any number of mapped files
//! - Optimistic shared readers: writers are never excluded, torn reads
//!   are detected by a per-frame seqlock and retried
//! - Demand faulting with clock eviction and write-back of dirty victims
//! - Durable per-file and whole-cache flush
//! - Pluggable file system (physical and in-memory implementations ship
//!   in-tree)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxipager::{CacheConfig, IoFlags, PageCache};
//!
//! let cache = PageCache::new(fs, CacheConfig::new(1024, 8192));
//! let file = cache.map(path, 8192)?;
//!
//! let mut cursor = file.io(0, IoFlags::SHARED_LOCK)?;
//! while cursor.next()? {
//!     let mut record = [0u8; 64];
//!     loop {
//!         cursor.get_bytes(&mut record);
//!         if !cursor.retry() {
//!             break;
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fs;
pub mod monitor;

mod fault;
mod frame;
mod page_io;
mod pool;
mod table;

// Re-exports for convenience
pub use cache::{PageCache, PagedFile};
pub use config::{CacheConfig, OxipagerConfig};
pub use cursor::{IoFlags, PageCursor, UNBOUND_PAGE_ID};
pub use error::{CacheError, Result};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Default cache page size in bytes
    pub const DEFAULT_PAGE_SIZE: usize = 8192;

    /// Default number of frames in the pool
    pub const DEFAULT_MAX_PAGES: usize = 1024;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::cache::{PageCache, PagedFile};
    pub use crate::config::CacheConfig;
    pub use crate::cursor::{IoFlags, PageCursor, UNBOUND_PAGE_ID};
    pub use crate::error::{CacheError, Result};
    pub use crate::fs::{FileSystem, OpenMode, StoreChannel};
    pub use crate::monitor::{CacheMonitor, NullMonitor};
}
