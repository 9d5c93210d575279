//! Page cursors
//!
//! A cursor iterates the pages of one mapping in one access mode, pinning
//! exactly one frame between a successful advance and the next advance,
//! rewind or close. Byte access on a shared cursor is optimistic: every
//! read window is framed by a `loop { read; if !retry() { break } }` and
//! rereads whenever it overlapped a writer.

use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::{CacheInner, Mapping};
use crate::error::Result;
use crate::fault;
use crate::frame::FrameId;

/// Page id reported by a cursor with no current page: before the first
/// advance, after `rewind`, and after an advance returned `false`.
pub const UNBOUND_PAGE_ID: u64 = u64::MAX;

/// Access-mode flags for [`PagedFile::io`](crate::PagedFile::io).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoFlags(u32);

impl IoFlags {
    /// Reader cursor; tolerates concurrent writers via
    /// [`PageCursor::retry`]. Implies [`NO_GROW`](IoFlags::NO_GROW).
    pub const SHARED_LOCK: IoFlags = IoFlags(1);
    /// Writer cursor; may extend the file.
    pub const EXCLUSIVE_LOCK: IoFlags = IoFlags(1 << 1);
    /// Advancing past the last file page yields `false` instead of
    /// growing the file.
    pub const NO_GROW: IoFlags = IoFlags(1 << 2);
    /// Pages not already resident are not faulted in; the advance
    /// succeeds with an unbound position and byte access is a no-op.
    pub const NO_FAULT: IoFlags = IoFlags(1 << 3);

    /// No flags set.
    pub const fn empty() -> IoFlags {
        IoFlags(0)
    }

    /// Whether all flags in `other` are set in `self`.
    pub const fn contains(self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for IoFlags {
    type Output = IoFlags;

    fn bitor(self, rhs: IoFlags) -> IoFlags {
        IoFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: IoFlags) {
        self.0 |= rhs.0;
    }
}

/// Cursor over the pages of one [`PagedFile`](crate::PagedFile).
///
/// Dropping the cursor closes it.
pub struct PageCursor {
    inner: Arc<CacheInner>,
    mapping: Arc<Mapping>,
    exclusive: bool,
    no_grow: bool,
    no_fault: bool,
    start_page: u64,
    next_page: u64,
    current_page: u64,
    frame: Option<FrameId>,
    offset: usize,
    /// Offset at the start of the current read window; `retry` rewinds
    /// to it.
    window_offset: usize,
    /// Seqlock snapshot for the current read window (shared cursors).
    snapshot: u64,
    closed: bool,
}

impl PageCursor {
    pub(crate) fn new(
        inner: Arc<CacheInner>,
        mapping: Arc<Mapping>,
        start_page: u64,
        exclusive: bool,
        no_grow: bool,
        no_fault: bool,
    ) -> Self {
        Self {
            inner,
            mapping,
            exclusive,
            no_grow,
            no_fault,
            start_page,
            next_page: start_page,
            current_page: UNBOUND_PAGE_ID,
            frame: None,
            offset: 0,
            window_offset: 0,
            snapshot: 0,
            closed: false,
        }
    }

    /// Advance to the next page in sequence, starting from the cursor's
    /// start page. Returns `false` past the last file page when the
    /// cursor cannot grow the file.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        let target = self.next_page;
        self.advance(target)
    }

    /// Position the cursor at `page_index` explicitly. A later [`next`]
    /// continues from the page after it.
    ///
    /// [`next`]: PageCursor::next
    pub fn next_to(&mut self, page_index: u64) -> Result<bool> {
        self.advance(page_index)
    }

    fn advance(&mut self, page: u64) -> Result<bool> {
        assert!(!self.closed, "cursor is closed");
        self.unpin_current();
        self.current_page = UNBOUND_PAGE_ID;

        if self.no_grow && page >= self.mapping.page_count.load(Ordering::Acquire) {
            self.next_page = page;
            return Ok(false);
        }

        match fault::pin_page(
            &self.inner,
            &self.mapping,
            page,
            self.exclusive,
            self.no_fault,
        ) {
            Ok(frame) => self.frame = frame,
            Err(e) => return Err(e),
        }

        self.current_page = page;
        self.next_page = page + 1;
        self.offset = 0;
        self.window_offset = 0;
        if !self.exclusive {
            if let Some(fid) = self.frame {
                self.snapshot = self.inner.pool.payload(fid).version();
            }
        }
        Ok(true)
    }

    /// Forget the current position; the next [`next`] starts over from
    /// the cursor's start page.
    ///
    /// [`next`]: PageCursor::next
    pub fn rewind(&mut self) {
        assert!(!self.closed, "cursor is closed");
        self.unpin_current();
        self.next_page = self.start_page;
        self.current_page = UNBOUND_PAGE_ID;
        self.offset = 0;
        self.window_offset = 0;
    }

    /// The current file-page index, or [`UNBOUND_PAGE_ID`].
    pub fn current_page_id(&self) -> u64 {
        self.current_page
    }

    /// Current byte offset within the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Set the byte offset within the page.
    pub fn set_offset(&mut self, offset: usize) {
        assert!(
            offset <= self.inner.pool.page_size(),
            "cursor offset out of bounds"
        );
        self.offset = offset;
    }

    /// Read one byte at the current offset and advance it.
    pub fn get_byte(&mut self) -> u8 {
        let off = self.offset;
        assert!(off < self.inner.pool.page_size(), "cursor offset out of bounds");
        self.offset = off + 1;
        match self.frame {
            Some(fid) => self.inner.pool.payload(fid).read_byte_racy(off),
            None => 0,
        }
    }

    /// Write one byte at the current offset and advance it.
    pub fn put_byte(&mut self, value: u8) {
        assert!(self.exclusive, "write through a shared cursor");
        let off = self.offset;
        assert!(off < self.inner.pool.page_size(), "cursor offset out of bounds");
        self.offset = off + 1;
        if let Some(fid) = self.frame {
            self.inner.pool.payload(fid).write_byte_racy(off, value);
        }
    }

    /// Fill `data` from the page at the current offset and advance it.
    pub fn get_bytes(&mut self, data: &mut [u8]) {
        let off = self.offset;
        assert!(
            off + data.len() <= self.inner.pool.page_size(),
            "cursor offset out of bounds"
        );
        self.offset = off + data.len();
        if let Some(fid) = self.frame {
            self.inner.pool.payload(fid).read_racy(off, data);
        }
    }

    /// Write `data` to the page at the current offset and advance it.
    pub fn put_bytes(&mut self, data: &[u8]) {
        assert!(self.exclusive, "write through a shared cursor");
        let off = self.offset;
        assert!(
            off + data.len() <= self.inner.pool.page_size(),
            "cursor offset out of bounds"
        );
        self.offset = off + data.len();
        if let Some(fid) = self.frame {
            self.inner.pool.payload(fid).write_racy(off, data);
        }
    }

    /// End the current read window.
    ///
    /// For shared cursors: `true` when the window overlapped a writer, in
    /// which case the offset is rewound to the window start and the caller
    /// rereads. `false` commits the window and starts the next one at the
    /// current offset. Exclusive cursors always get `false`.
    pub fn retry(&mut self) -> bool {
        if self.exclusive {
            return false;
        }
        let Some(fid) = self.frame else {
            return false;
        };
        let payload = self.inner.pool.payload(fid);
        if payload.changed_since(self.snapshot) {
            self.offset = self.window_offset;
            self.snapshot = payload.version();
            true
        } else {
            self.window_offset = self.offset;
            false
        }
    }

    /// Unpin and release the cursor. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.unpin_current();
        self.current_page = UNBOUND_PAGE_ID;
        self.mapping.cursors.fetch_sub(1, Ordering::SeqCst);
        self.closed = true;
    }

    fn unpin_current(&mut self) {
        if let Some(fid) = self.frame.take() {
            fault::unpin_page(&self.inner, fid, self.exclusive);
        }
    }
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        self.close();
    }
}
