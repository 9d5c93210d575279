//! Per-mapping page I/O adapter
//!
//! Translates a file-page index into a byte offset on the backing channel
//! and moves exactly one page at a time. Short reads at end of file
//! zero-fill the remainder of the cache page.

use std::io;
use std::sync::Arc;

use crate::fs::StoreChannel;

/// Reads and writes single pages of one mapping.
pub(crate) struct PageIo {
    channel: Arc<dyn StoreChannel>,
    file_page_size: usize,
}

impl PageIo {
    pub(crate) fn new(channel: Arc<dyn StoreChannel>, file_page_size: usize) -> Self {
        assert!(file_page_size > 0);
        Self {
            channel,
            file_page_size,
        }
    }

    #[inline]
    pub(crate) fn file_page_size(&self) -> usize {
        self.file_page_size
    }

    #[inline]
    pub(crate) fn channel(&self) -> &Arc<dyn StoreChannel> {
        &self.channel
    }

    #[inline]
    fn offset_of(&self, page_index: u64) -> u64 {
        page_index * self.file_page_size as u64
    }

    /// Read the file page at `page_index` into the front of `buf`,
    /// zero-filling everything the file did not provide. `buf` is a full
    /// cache page and may be larger than the file page.
    pub(crate) fn read_page(&self, page_index: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert!(buf.len() >= self.file_page_size);
        let offset = self.offset_of(page_index);
        let mut filled = 0;
        while filled < self.file_page_size {
            let n = self
                .channel
                .read_at(&mut buf[filled..self.file_page_size], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Write exactly one file page from the front of `buf` at
    /// `page_index`, extending the file as needed.
    pub(crate) fn write_page(&self, page_index: u64, buf: &[u8]) -> io::Result<()> {
        debug_assert!(buf.len() >= self.file_page_size);
        self.channel
            .write_all_at(&buf[..self.file_page_size], self.offset_of(page_index))
    }
}
