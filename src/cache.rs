//! The page cache and its file mappings
//!
//! [`PageCache`] owns a fixed pool of frames and a table of file mappings.
//! Mapping the same file again shares one channel, one translation table
//! and one high-water mark; the mapping goes away when the last reference
//! is unmapped. All binding bookkeeping is guarded by one cache latch; the
//! pin and eviction machinery that runs under it lives in `fault`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::CacheConfig;
use crate::cursor::{IoFlags, PageCursor};
use crate::error::{CacheError, Result};
use crate::fault;
use crate::frame::FrameMeta;
use crate::fs::{FileSystem, OpenMode};
use crate::monitor::{CacheMonitor, NullMonitor};
use crate::page_io::PageIo;
use crate::pool::FramePool;
use crate::table::PageTable;

/// One mapped file's shared record.
pub(crate) struct Mapping {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    pub(crate) io: PageIo,
    /// Highest known file-page count (high-water mark + 1). Grows when a
    /// write cursor extends the file; never shrinks while mapped.
    pub(crate) page_count: AtomicU64,
    /// Cursors currently open against this mapping.
    pub(crate) cursors: AtomicU32,
    /// Set once the mapping has been torn down; outstanding handles and
    /// cursors fail from then on.
    pub(crate) closed: AtomicBool,
}

impl Mapping {
    pub(crate) fn file_page_size(&self) -> usize {
        self.io.file_page_size()
    }
}

pub(crate) struct MappingSlot {
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) refs: u32,
    /// An unmap is tearing this mapping down; blocks new maps and cursors
    /// of the same file until it finishes or fails.
    pub(crate) closing: bool,
}

/// Latch-guarded cache bookkeeping.
pub(crate) struct CacheState {
    pub(crate) closed: bool,
    pub(crate) mappings: HashMap<PathBuf, MappingSlot>,
    pub(crate) tables: HashMap<u64, PageTable>,
    pub(crate) meta: Vec<FrameMeta>,
    pub(crate) clock_hand: usize,
    next_mapping_id: u64,
}

pub(crate) struct CacheInner {
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) pool: FramePool,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) cond: Condvar,
    pub(crate) monitor: Arc<dyn CacheMonitor>,
    pub(crate) victim_wait: Duration,
}

/// A shared, fixed-capacity page cache over a file system.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<CacheInner>,
}

/// Handle to one mapped file, obtained from [`PageCache::map`].
pub struct PagedFile {
    inner: Arc<CacheInner>,
    pub(crate) mapping: Arc<Mapping>,
}

impl PageCache {
    /// Create a cache with the default [`NullMonitor`].
    pub fn new(fs: Arc<dyn FileSystem>, config: CacheConfig) -> Self {
        Self::with_monitor(fs, config, Arc::new(NullMonitor))
    }

    /// Create a cache that reports page traffic to `monitor`.
    pub fn with_monitor(
        fs: Arc<dyn FileSystem>,
        config: CacheConfig,
        monitor: Arc<dyn CacheMonitor>,
    ) -> Self {
        let pool = FramePool::new(config.max_pages, config.page_size);
        let meta = (0..config.max_pages).map(|_| FrameMeta::new()).collect();
        Self {
            inner: Arc::new(CacheInner {
                fs,
                pool,
                state: Mutex::new(CacheState {
                    closed: false,
                    mappings: HashMap::new(),
                    tables: HashMap::new(),
                    meta,
                    clock_hand: 0,
                    next_mapping_id: 0,
                }),
                cond: Condvar::new(),
                monitor,
                victim_wait: config.victim_wait,
            }),
        }
    }

    /// Cache page size in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.pool.page_size()
    }

    /// Number of frames in the pool.
    pub fn max_pages(&self) -> usize {
        self.inner.pool.len()
    }

    /// Map `path` into the cache with the given file page size.
    ///
    /// Mapping an already-mapped file shares the existing mapping and must
    /// request the same page size. The file is opened read-write and
    /// created if missing.
    pub fn map(&self, path: &Path, file_page_size: usize) -> Result<PagedFile> {
        let max = self.inner.pool.page_size();
        if file_page_size == 0 || file_page_size > max {
            return Err(CacheError::PageSizeOutOfRange {
                requested: file_page_size,
                max,
            });
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(CacheError::CacheClosed);
        }
        // A concurrent unmap of the same file is committing; wait it out.
        while state
            .mappings
            .get(path)
            .is_some_and(|slot| slot.closing)
        {
            self.inner.cond.wait(&mut state);
            if state.closed {
                return Err(CacheError::CacheClosed);
            }
        }

        if let Some(slot) = state.mappings.get_mut(path) {
            let existing = slot.mapping.file_page_size();
            if existing != file_page_size {
                return Err(CacheError::PageSizeConflict {
                    existing,
                    requested: file_page_size,
                });
            }
            slot.refs += 1;
            return Ok(PagedFile {
                inner: self.inner.clone(),
                mapping: slot.mapping.clone(),
            });
        }

        let channel = self.inner.fs.open(path, OpenMode::ReadWrite)?;
        let size = channel.size()?;
        let page_count = size.div_ceil(file_page_size as u64);
        let id = state.next_mapping_id;
        state.next_mapping_id += 1;

        let mapping = Arc::new(Mapping {
            id,
            path: path.to_path_buf(),
            io: PageIo::new(channel, file_page_size),
            page_count: AtomicU64::new(page_count),
            cursors: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });
        state.tables.insert(id, PageTable::new());
        state.mappings.insert(
            path.to_path_buf(),
            MappingSlot {
                mapping: mapping.clone(),
                refs: 1,
                closing: false,
            },
        );
        tracing::debug!(
            file = %path.display(),
            file_page_size,
            page_count,
            "mapped file"
        );

        Ok(PagedFile {
            inner: self.inner.clone(),
            mapping,
        })
    }

    /// Release one reference to the mapping of `path`.
    ///
    /// Dropping the last reference flushes the mapping, releases its
    /// frames and closes the channel; it is rejected with
    /// [`CacheError::CursorsStillOpen`] while cursors remain open.
    pub fn unmap(&self, path: &Path) -> Result<()> {
        let mapping = {
            let mut state = self.inner.state.lock();
            let slot = state
                .mappings
                .get_mut(path)
                .filter(|slot| !slot.closing)
                .ok_or_else(|| CacheError::NotMapped(path.to_path_buf()))?;
            if slot.refs > 1 {
                slot.refs -= 1;
                return Ok(());
            }
            if slot.mapping.cursors.load(Ordering::SeqCst) > 0 {
                return Err(CacheError::CursorsStillOpen);
            }
            slot.closing = true;
            slot.mapping.clone()
        };

        if let Err(e) = fault::flush_mapping(&self.inner, &mapping) {
            // The mapping stays intact so the flush can be retried.
            let mut state = self.inner.state.lock();
            if let Some(slot) = state.mappings.get_mut(path) {
                slot.closing = false;
            }
            self.inner.cond.notify_all();
            return Err(e);
        }

        {
            let mut state = self.inner.state.lock();
            mapping.closed.store(true, Ordering::SeqCst);
            fault::release_mapping_frames(&self.inner, &mut state, &mapping);
            state.tables.remove(&mapping.id);
            state.mappings.remove(path);
        }
        self.inner.cond.notify_all();
        tracing::debug!(file = %path.display(), "unmapped file");
        mapping.io.channel().close()?;
        Ok(())
    }

    /// Flush every mapped file: write back all dirty frames and force the
    /// channels to durable storage.
    pub fn flush(&self) -> Result<()> {
        let mappings = self.collect_mappings()?;
        for mapping in &mappings {
            fault::flush_mapping(&self.inner, mapping)?;
        }
        Ok(())
    }

    /// Flush and close every mapping, then close the cache.
    ///
    /// Mappings are torn down even if references remain outstanding;
    /// errors are collected best-effort and the first one is returned
    /// after all mappings have been attempted. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mappings = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state
                .mappings
                .values()
                .map(|slot| slot.mapping.clone())
                .collect::<Vec<_>>()
        };

        let mut first_err: Option<CacheError> = None;
        for mapping in &mappings {
            if let Err(e) = fault::flush_mapping(&self.inner, mapping) {
                tracing::warn!(
                    file = %mapping.path.display(),
                    error = %e,
                    "flush failed during cache close"
                );
                first_err.get_or_insert(e);
            }
            {
                let mut state = self.inner.state.lock();
                mapping.closed.store(true, Ordering::SeqCst);
                fault::release_mapping_frames(&self.inner, &mut state, mapping);
                state.tables.remove(&mapping.id);
                state.mappings.remove(&mapping.path);
            }
            if let Err(e) = mapping.io.channel().close() {
                first_err.get_or_insert(e.into());
            }
        }
        self.inner.cond.notify_all();
        tracing::debug!(mappings = mappings.len(), "cache closed");
        first_err.map_or(Ok(()), Err)
    }

    fn collect_mappings(&self) -> Result<Vec<Arc<Mapping>>> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(CacheError::CacheClosed);
        }
        Ok(state
            .mappings
            .values()
            .filter(|slot| !slot.closing)
            .map(|slot| slot.mapping.clone())
            .collect())
    }
}

impl PagedFile {
    /// Open a cursor over this file's pages starting at `start_page`.
    ///
    /// Exactly one of [`IoFlags::SHARED_LOCK`] and
    /// [`IoFlags::EXCLUSIVE_LOCK`] must be set, optionally combined with
    /// [`IoFlags::NO_GROW`] and [`IoFlags::NO_FAULT`]. A shared lock
    /// implies `NO_GROW`.
    pub fn io(&self, start_page: u64, flags: IoFlags) -> Result<PageCursor> {
        let shared = flags.contains(IoFlags::SHARED_LOCK);
        let exclusive = flags.contains(IoFlags::EXCLUSIVE_LOCK);
        if shared == exclusive {
            return Err(CacheError::InvalidFlags(
                "exactly one of SHARED_LOCK and EXCLUSIVE_LOCK must be set",
            ));
        }

        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(CacheError::CacheClosed);
            }
            let live = state
                .mappings
                .get(&self.mapping.path)
                .is_some_and(|slot| !slot.closing && slot.mapping.id == self.mapping.id);
            if !live {
                return Err(CacheError::NotMapped(self.mapping.path.clone()));
            }
            self.mapping.cursors.fetch_add(1, Ordering::SeqCst);
        }

        Ok(PageCursor::new(
            self.inner.clone(),
            self.mapping.clone(),
            start_page,
            exclusive,
            flags.contains(IoFlags::NO_GROW) || shared,
            flags.contains(IoFlags::NO_FAULT),
        ))
    }

    /// Write back this file's dirty frames and force the channel.
    pub fn flush(&self) -> Result<()> {
        if self.inner.state.lock().closed || self.mapping.closed.load(Ordering::SeqCst) {
            return Err(CacheError::CacheClosed);
        }
        fault::flush_mapping(&self.inner, &self.mapping)
    }

    /// File page size of this mapping.
    pub fn file_page_size(&self) -> usize {
        self.mapping.file_page_size()
    }

    /// Number of file pages currently known to this mapping.
    pub fn page_count(&self) -> u64 {
        self.mapping.page_count.load(Ordering::Acquire)
    }

    /// The mapped path.
    pub fn path(&self) -> &Path {
        &self.mapping.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::EphemeralFileSystem;

    fn small_cache(fs: &EphemeralFileSystem) -> PageCache {
        PageCache::new(Arc::new(fs.clone()), CacheConfig::new(8, 32))
    }

    #[test]
    fn test_map_and_unmap() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let path = Path::new("a");

        let file = cache.map(path, 16).unwrap();
        assert_eq!(file.file_page_size(), 16);
        assert_eq!(file.page_count(), 0);
        drop(file);

        cache.unmap(path).unwrap();
        fs.assert_no_open_files();
    }

    #[test]
    fn test_map_shares_channel() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let path = Path::new("a");

        let _f1 = cache.map(path, 16).unwrap();
        let _f2 = cache.map(path, 16).unwrap();
        assert_eq!(fs.open_channel_count(), 1);

        cache.unmap(path).unwrap();
        assert_eq!(fs.open_channel_count(), 1);
        cache.unmap(path).unwrap();
        fs.assert_no_open_files();
        assert_eq!(fs.close_count(path), 1);
    }

    #[test]
    fn test_map_page_size_bounds() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let path = Path::new("a");

        assert!(cache.map(path, 32).is_ok()); // equal to cache page size
        assert!(matches!(
            cache.map(Path::new("b"), 33),
            Err(CacheError::PageSizeOutOfRange { requested: 33, max: 32 })
        ));
        assert!(matches!(
            cache.map(Path::new("c"), 0),
            Err(CacheError::PageSizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_remap_size_conflict() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let path = Path::new("a");

        cache.map(path, 16).unwrap();
        assert!(matches!(
            cache.map(path, 8),
            Err(CacheError::PageSizeConflict {
                existing: 16,
                requested: 8
            })
        ));
    }

    #[test]
    fn test_unmap_unknown_file() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        assert!(matches!(
            cache.unmap(Path::new("ghost")),
            Err(CacheError::NotMapped(_))
        ));
    }

    #[test]
    fn test_closed_cache_rejects_operations() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let file = cache.map(Path::new("a"), 16).unwrap();

        cache.close().unwrap();
        cache.close().unwrap(); // idempotent

        assert!(matches!(
            cache.map(Path::new("b"), 16),
            Err(CacheError::CacheClosed)
        ));
        assert!(matches!(cache.flush(), Err(CacheError::CacheClosed)));
        assert!(matches!(
            file.io(0, IoFlags::SHARED_LOCK),
            Err(CacheError::CacheClosed)
        ));
        assert!(matches!(file.flush(), Err(CacheError::CacheClosed)));
        fs.assert_no_open_files();
    }

    #[test]
    fn test_io_flag_validation() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let file = cache.map(Path::new("a"), 16).unwrap();

        assert!(matches!(
            file.io(0, IoFlags::empty()),
            Err(CacheError::InvalidFlags(_))
        ));
        assert!(matches!(
            file.io(0, IoFlags::NO_FAULT),
            Err(CacheError::InvalidFlags(_))
        ));
        assert!(matches!(
            file.io(0, IoFlags::SHARED_LOCK | IoFlags::EXCLUSIVE_LOCK),
            Err(CacheError::InvalidFlags(_))
        ));
        assert!(file.io(0, IoFlags::SHARED_LOCK).is_ok());
        assert!(file
            .io(0, IoFlags::EXCLUSIVE_LOCK | IoFlags::NO_GROW | IoFlags::NO_FAULT)
            .is_ok());
    }

    #[test]
    fn test_unmap_with_live_cursor_rejected() {
        let fs = EphemeralFileSystem::new();
        let cache = small_cache(&fs);
        let path = Path::new("a");
        let file = cache.map(path, 16).unwrap();

        let cursor = file.io(0, IoFlags::EXCLUSIVE_LOCK).unwrap();
        assert!(matches!(
            cache.unmap(path),
            Err(CacheError::CursorsStillOpen)
        ));

        drop(cursor);
        cache.unmap(path).unwrap();
        fs.assert_no_open_files();
    }

    #[test]
    fn test_page_count_from_file_size() {
        let fs = EphemeralFileSystem::new();
        {
            use crate::fs::{FileSystem, OpenMode};
            let channel = fs.open(Path::new("a"), OpenMode::ReadWrite).unwrap();
            channel.write_all_at(&[1u8; 40], 0).unwrap(); // 2.5 pages of 16
            channel.close().unwrap();
        }
        let cache = small_cache(&fs);
        let file = cache.map(Path::new("a"), 16).unwrap();
        assert_eq!(file.page_count(), 3);
    }
}
