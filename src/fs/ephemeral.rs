//! Ephemeral in-memory file system
//!
//! Keeps every file as a byte vector and counts channel opens, closes,
//! reads, writes and forces, so tests can assert on the cache's exact
//! interaction with its backing store.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::traits::{closed_channel_error, FileSystem, OpenMode, StoreChannel};

#[derive(Default)]
struct FileData {
    bytes: Mutex<Vec<u8>>,
    open_channels: AtomicUsize,
    reads: AtomicU64,
    writes: AtomicU64,
    forces: AtomicU64,
    closes: AtomicU64,
}

/// In-memory [`FileSystem`] for tests. Cloning shares the same store.
#[derive(Default, Clone)]
pub struct EphemeralFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Arc<FileData>>>>,
}

impl EphemeralFileSystem {
    /// Create an empty in-memory file system.
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self, path: &Path) -> Option<Arc<FileData>> {
        self.files.lock().get(path).cloned()
    }

    /// Number of channels currently open across all files.
    pub fn open_channel_count(&self) -> usize {
        self.files
            .lock()
            .values()
            .map(|d| d.open_channels.load(Ordering::Acquire))
            .sum()
    }

    /// Panic if any channel is still open.
    pub fn assert_no_open_files(&self) {
        let open = self.open_channel_count();
        assert_eq!(open, 0, "{open} channel(s) still open");
    }

    /// Reads issued against `path` since creation.
    pub fn read_count(&self, path: &Path) -> u64 {
        self.data(path).map_or(0, |d| d.reads.load(Ordering::Acquire))
    }

    /// Writes issued against `path` since creation.
    pub fn write_count(&self, path: &Path) -> u64 {
        self.data(path).map_or(0, |d| d.writes.load(Ordering::Acquire))
    }

    /// Forces issued against `path` since creation.
    pub fn force_count(&self, path: &Path) -> u64 {
        self.data(path).map_or(0, |d| d.forces.load(Ordering::Acquire))
    }

    /// Channel closes issued against `path` since creation.
    pub fn close_count(&self, path: &Path) -> u64 {
        self.data(path).map_or(0, |d| d.closes.load(Ordering::Acquire))
    }
}

impl FileSystem for EphemeralFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn StoreChannel>> {
        let data = {
            let mut files = self.files.lock();
            match files.get(path) {
                Some(data) => data.clone(),
                None if mode == OpenMode::ReadWrite => {
                    let data = Arc::new(FileData::default());
                    files.insert(path.to_path_buf(), data.clone());
                    data
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no such file: {}", path.display()),
                    ));
                }
            }
        };
        data.open_channels.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(EphemeralChannel {
            data,
            writable: mode == OpenMode::ReadWrite,
            closed: AtomicBool::new(false),
        }))
    }
}

struct EphemeralChannel {
    data: Arc<FileData>,
    writable: bool,
    closed: AtomicBool,
}

impl EphemeralChannel {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(closed_channel_error())
        } else {
            Ok(())
        }
    }
}

impl StoreChannel for EphemeralChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.check_open()?;
        self.data.reads.fetch_add(1, Ordering::AcqRel);
        let bytes = self.data.bytes.lock();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "channel is read-only",
            ));
        }
        self.data.writes.fetch_add(1, Ordering::AcqRel);
        let mut bytes = self.data.bytes.lock();
        let end = offset as usize + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        self.check_open()?;
        Ok(self.data.bytes.lock().len() as u64)
    }

    fn force(&self, _metadata: bool) -> io::Result<()> {
        self.check_open()?;
        self.data.forces.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.data.closes.fetch_add(1, Ordering::AcqRel);
            self.data.open_channels.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl Drop for EphemeralChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
