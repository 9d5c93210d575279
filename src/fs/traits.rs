//! File-system traits
//!
//! These are the only seams through which the cache performs I/O.

use std::io;
use std::path::Path;
use std::sync::Arc;

/// How a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; opening a missing file fails.
    Read,
    /// Read-write; the file is created if missing.
    ReadWrite,
}

/// A file opened for positional I/O.
///
/// Implementations serialize their own access; all methods take `&self`
/// and may be called from any thread.
pub trait StoreChannel: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; `0` means end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset`, extending the file as needed.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Force written data to durable storage. `metadata` also forces
    /// file metadata.
    fn force(&self, metadata: bool) -> io::Result<()>;

    /// Close the channel. Later operations fail; closing twice is a no-op.
    fn close(&self) -> io::Result<()>;
}

/// Opens files as [`StoreChannel`]s.
pub trait FileSystem: Send + Sync {
    /// Open `path` in the given mode.
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn StoreChannel>>;
}

pub(crate) fn closed_channel_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "channel is closed")
}
