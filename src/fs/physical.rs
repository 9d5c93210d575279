//! Physical file system
//!
//! Channels over `std::fs::File` with mutex-serialized positional I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::traits::{closed_channel_error, FileSystem, OpenMode, StoreChannel};

/// [`FileSystem`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalFileSystem;

impl PhysicalFileSystem {
    /// Create a physical file system handle.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for PhysicalFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn StoreChannel>> {
        let writable = mode == OpenMode::ReadWrite;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        Ok(Arc::new(PhysicalChannel {
            file: Mutex::new(Some(file)),
            writable,
        }))
    }
}

struct PhysicalChannel {
    file: Mutex<Option<File>>,
    writable: bool,
}

impl PhysicalChannel {
    fn with_file<R>(&self, f: impl FnOnce(&mut File) -> io::Result<R>) -> io::Result<R> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(closed_channel_error()),
        }
    }
}

impl StoreChannel for PhysicalChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read(buf)
        })
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "channel is read-only",
            ));
        }
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)
        })
    }

    fn size(&self) -> io::Result<u64> {
        self.with_file(|file| file.metadata().map(|m| m.len()))
    }

    fn force(&self, metadata: bool) -> io::Result<()> {
        self.with_file(|file| {
            if metadata {
                file.sync_all()
            } else {
                file.sync_data()
            }
        })
    }

    fn close(&self) -> io::Result<()> {
        // Dropping the handle closes it; a second close is a no-op.
        self.file.lock().take();
        Ok(())
    }
}
