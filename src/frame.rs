//! Page frames and their metadata
//!
//! A frame is one cache-page-sized buffer plus the bookkeeping the cache
//! needs to fault, pin, evict and flush it. The payload and its seqlock
//! version counter are accessed without the cache latch; everything else
//! lives in [`FrameMeta`] and is only touched while the latch is held.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::Mapping;
use crate::constants::CACHE_LINE_BYTES;

/// Index of a frame within the pool.
pub(crate) type FrameId = u32;

// ============ Payload buffer ============

/// Cache-line-aligned page buffer.
struct PageBuffer {
    ptr: NonNull<u8>,
    size: usize,
}

impl PageBuffer {
    fn zeroed(size: usize) -> Self {
        assert!(size > 0);
        let layout = Layout::from_size_align(size, CACHE_LINE_BYTES)
            .expect("page size produces a valid layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("page buffer allocation failed");
        Self { ptr, size }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, CACHE_LINE_BYTES)
            .expect("page size produces a valid layout");
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// ============ Frame payload ============

/// A frame's byte buffer together with its seqlock version counter.
///
/// The version is even while the payload is stable and odd while an
/// exclusive pinner has a mutation window open. Readers snapshot the
/// version at the start of a read window and call [`changed_since`] at the
/// end; a torn read is reported when the snapshot was odd or the version
/// moved.
///
/// [`changed_since`]: FramePayload::changed_since
pub(crate) struct FramePayload {
    buf: UnsafeCell<PageBuffer>,
    version: AtomicU64,
}

// SAFETY: concurrent access to the buffer is governed by the pin protocol;
// racy byte access goes through volatile reads/writes and is validated by
// the version counter.
unsafe impl Send for FramePayload {}
unsafe impl Sync for FramePayload {}

impl FramePayload {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            buf: UnsafeCell::new(PageBuffer::zeroed(page_size)),
            version: AtomicU64::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        // SAFETY: `size` is immutable after construction.
        unsafe { (*self.buf.get()).size }
    }

    fn base(&self) -> *mut u8 {
        // SAFETY: the buffer pointer is immutable after construction.
        unsafe { (*self.buf.get()).ptr.as_ptr() }
    }

    /// Current version, suitable as a read-window snapshot.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Open a mutation window: version becomes odd.
    #[inline]
    pub(crate) fn begin_mutation(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Close a mutation window: version becomes even again.
    #[inline]
    pub(crate) fn end_mutation(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Mark a rebind to a different page. Keeps the version even.
    #[inline]
    pub(crate) fn bump_rebound(&self) {
        self.version.fetch_add(2, Ordering::Release);
    }

    /// Whether a read window that started at `snapshot` may have observed
    /// torn data. Orders after the caller's byte reads.
    #[inline]
    pub(crate) fn changed_since(&self, snapshot: u64) -> bool {
        fence(Ordering::Acquire);
        snapshot & 1 == 1 || self.version.load(Ordering::Relaxed) != snapshot
    }

    /// Copy bytes out of the payload. May race with a concurrent exclusive
    /// writer; the caller validates the window with [`changed_since`].
    ///
    /// [`changed_since`]: FramePayload::changed_since
    pub(crate) fn read_racy(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len(), "page read out of bounds");
        let base = self.base();
        for (i, b) in dst.iter_mut().enumerate() {
            // SAFETY: in bounds per the assert; volatile tolerates the
            // deliberate race with an exclusive writer.
            *b = unsafe { base.add(offset + i).read_volatile() };
        }
    }

    /// Copy bytes into the payload. Only the frame's exclusive pinner may
    /// call this, inside an open mutation window.
    pub(crate) fn write_racy(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len(), "page write out of bounds");
        let base = self.base();
        for (i, b) in src.iter().enumerate() {
            // SAFETY: in bounds per the assert; the exclusive slot keeps
            // this the only writer.
            unsafe { base.add(offset + i).write_volatile(*b) };
        }
    }

    pub(crate) fn read_byte_racy(&self, offset: usize) -> u8 {
        assert!(offset < self.len(), "page read out of bounds");
        // SAFETY: in bounds per the assert.
        unsafe { self.base().add(offset).read_volatile() }
    }

    pub(crate) fn write_byte_racy(&self, offset: usize, value: u8) {
        assert!(offset < self.len(), "page write out of bounds");
        // SAFETY: in bounds per the assert; caller holds the exclusive slot.
        unsafe { self.base().add(offset).write_volatile(value) };
    }

    /// Zero the whole payload.
    ///
    /// # Safety
    /// The caller must own the frame for I/O: state `Loading` or `Evicting`,
    /// with no pins other than the engine's own pre-pin.
    pub(crate) unsafe fn fill_zero(&self) {
        std::ptr::write_bytes(self.base(), 0, self.len());
    }

    /// Mutable view for faulting page contents in.
    ///
    /// # Safety
    /// Same contract as [`fill_zero`](FramePayload::fill_zero): the frame
    /// must be in state `Loading` and invisible to readers.
    pub(crate) unsafe fn io_slice_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base(), self.len())
    }

    /// Shared view for writing page contents back out.
    ///
    /// # Safety
    /// The caller must hold the frame's exclusive slot or have it in state
    /// `Evicting`, so no mutation can overlap the read.
    pub(crate) unsafe fn io_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base(), self.len())
    }
}

// ============ Frame metadata ============

/// Lifecycle of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameState {
    /// Not bound to any page.
    Free,
    /// Bound, contents being faulted in.
    Loading,
    /// Bound with valid contents.
    Loaded,
    /// Bound, dirty contents being written back before reuse.
    Evicting,
}

/// The (mapping, file-page) pair a frame currently holds.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) page_index: u64,
}

/// Latch-guarded frame bookkeeping.
pub(crate) struct FrameMeta {
    pub(crate) state: FrameState,
    pub(crate) pin_count: u32,
    /// Exclusive slot: at most one writer (or flusher) at a time.
    pub(crate) exclusive: bool,
    pub(crate) dirty: bool,
    /// Writeback failed; not a victim candidate until the owning mapping
    /// flushes successfully.
    pub(crate) poisoned: bool,
    /// Clock reference bit.
    pub(crate) usage: bool,
    pub(crate) binding: Option<Binding>,
}

impl FrameMeta {
    pub(crate) fn new() -> Self {
        Self {
            state: FrameState::Free,
            pin_count: 0,
            exclusive: false,
            dirty: false,
            poisoned: false,
            usage: false,
            binding: None,
        }
    }

    /// Whether the eviction clock may pick this frame.
    pub(crate) fn is_victim_candidate(&self) -> bool {
        matches!(self.state, FrameState::Free | FrameState::Loaded)
            && self.pin_count == 0
            && !self.poisoned
    }

    pub(crate) fn bound_to(&self, mapping_id: u64) -> Option<u64> {
        self.binding
            .as_ref()
            .filter(|b| b.mapping.id == mapping_id)
            .map(|b| b.page_index)
    }
}
