//! Shared helpers for the paged-file-cache integration tests.
//!
//! The standard workload is a file of fixed-size records with generated,
//! verifiable contents, served through a small cache so that eviction is
//! constantly exercised.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use oxipager::fs::{EphemeralFileSystem, FileSystem, OpenMode};
use oxipager::{CacheConfig, PageCache, PageCursor};

pub const RECORD_SIZE: usize = 9;
pub const RECORD_COUNT: u64 = 1060;
pub const MAX_PAGES: usize = 20;
pub const CACHE_PAGE_SIZE: usize = 20;
pub const FILE_PAGE_SIZE: usize = 18;
pub const RECORDS_PER_PAGE: u64 = (FILE_PAGE_SIZE / RECORD_SIZE) as u64;

/// Deterministic record contents: a big-endian `i32` of `id + 1`, then
/// its incrementing low bytes up to the record size.
pub fn record_for_id(id: u64) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    let mut x = (id + 1) as i32;
    buf[..4].copy_from_slice(&x.to_be_bytes());
    for b in &mut buf[4..] {
        x += 1;
        *b = (x & 0xFF) as u8;
    }
    buf
}

/// Seed `path` with `record_count` generated records through a plain
/// channel, bypassing the cache.
pub fn generate_file_with_records(fs: &EphemeralFileSystem, path: &Path, record_count: u64) {
    let channel = fs.open(path, OpenMode::ReadWrite).unwrap();
    for id in 0..record_count {
        channel
            .write_all_at(&record_for_id(id), id * RECORD_SIZE as u64)
            .unwrap();
    }
    channel.close().unwrap();
}

/// The standard small cache: 20 frames of 20 bytes over 18-byte file
/// pages.
pub fn standard_cache(fs: &EphemeralFileSystem) -> PageCache {
    PageCache::new(
        Arc::new(fs.clone()),
        CacheConfig::new(MAX_PAGES, CACHE_PAGE_SIZE),
    )
}

/// Check every record on the cursor's current page against the
/// generator, doing the retry loop per record.
pub fn verify_records_match(cursor: &mut PageCursor) {
    let page_id = cursor.current_page_id();
    for i in 0..RECORDS_PER_PAGE {
        let record_id = page_id * RECORDS_PER_PAGE + i;
        let expected = record_for_id(record_id);
        let mut actual = [0u8; RECORD_SIZE];
        loop {
            cursor.get_bytes(&mut actual);
            if !cursor.retry() {
                break;
            }
        }
        assert_eq!(actual, expected, "record {record_id} on page {page_id}");
    }
}

/// Write the generated records for the cursor's current page.
pub fn write_records(cursor: &mut PageCursor) {
    let page_id = cursor.current_page_id();
    for i in 0..RECORDS_PER_PAGE {
        let record_id = page_id * RECORDS_PER_PAGE + i;
        cursor.put_bytes(&record_for_id(record_id));
    }
}

/// Read `record_count` records from `path` through a fresh read-only
/// channel and check them against the generator.
pub fn verify_file_externally(fs: &EphemeralFileSystem, path: &Path, record_count: u64) {
    let channel = fs.open(path, OpenMode::Read).unwrap();
    let mut actual = [0u8; RECORD_SIZE];
    for id in 0..record_count {
        let n = channel
            .read_at(&mut actual, id * RECORD_SIZE as u64)
            .unwrap();
        assert_eq!(n, RECORD_SIZE, "short read at record {id}");
        assert_eq!(actual, record_for_id(id), "record {id}");
    }
    channel.close().unwrap();
}

/// Small xorshift generator for test randomness.
pub struct TestRng(u64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `[lo, hi)`.
    pub fn in_range(&mut self, lo: u64, hi: u64) -> u64 {
        lo + self.next_u64() % (hi - lo)
    }
}
