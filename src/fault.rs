//! Pin, fault and eviction engine
//!
//! Everything here runs under the cache latch, dropping it only around
//! channel I/O. The per-frame state machine keeps concurrent cursors
//! honest: a frame mid-`Loading` or mid-`Evicting` is invisible to pins,
//! a pinned frame is never a victim, and a dirty frame is written back
//! through its own mapping's channel before it can be reused.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::MutexGuard;

use crate::cache::{CacheInner, CacheState, Mapping};
use crate::error::{CacheError, Result};
use crate::frame::{Binding, FrameId, FrameState};
use crate::pool;

/// Pin the frame holding `(mapping, page_index)`, faulting it in on a
/// miss.
///
/// Returns `Ok(None)` only for `no_fault` accesses to a page that is not
/// resident. An exclusive pin opens the frame's seqlock mutation window
/// and marks the frame dirty; it also raises the mapping's high-water
/// mark when the pin extends the file.
pub(crate) fn pin_page(
    inner: &CacheInner,
    mapping: &Arc<Mapping>,
    page_index: u64,
    exclusive: bool,
    no_fault: bool,
) -> Result<Option<FrameId>> {
    let deadline = Instant::now() + inner.victim_wait;
    let mut state = inner.state.lock();
    loop {
        if state.closed {
            return Err(CacheError::CacheClosed);
        }
        if mapping.closed.load(Ordering::SeqCst) {
            return Err(CacheError::NotMapped(mapping.path.clone()));
        }

        let hit = state
            .tables
            .get(&mapping.id)
            .and_then(|table| table.get(page_index));
        if let Some(fid) = hit {
            match state.meta[fid as usize].state {
                FrameState::Loading | FrameState::Evicting => {
                    if no_fault {
                        return Ok(None);
                    }
                    inner.cond.wait(&mut state);
                    continue;
                }
                FrameState::Loaded => {
                    if exclusive && state.meta[fid as usize].exclusive {
                        inner.cond.wait(&mut state);
                        continue;
                    }
                    let meta = &mut state.meta[fid as usize];
                    meta.pin_count += 1;
                    meta.usage = true;
                    if exclusive {
                        meta.exclusive = true;
                        meta.dirty = true;
                        inner.pool.payload(fid).begin_mutation();
                        mapping.page_count.fetch_max(page_index + 1, Ordering::AcqRel);
                    }
                    return Ok(Some(fid));
                }
                FrameState::Free => unreachable!("bound frame cannot be free"),
            }
        }

        if no_fault {
            return Ok(None);
        }

        let victim = {
            let s = &mut *state;
            pool::select_victim(&mut s.meta, &mut s.clock_hand)
        };
        let Some(victim) = victim else {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    file = %mapping.path.display(),
                    page_index,
                    "no evictable frame within the victim wait bound"
                );
                return Err(CacheError::OutOfFrames);
            }
            let _ = inner.cond.wait_for(&mut state, deadline - now);
            continue;
        };

        // A dirty victim is written back first, then the claim is dropped
        // and the search restarted: the target page may have been faulted
        // by another thread while the latch was released.
        if state.meta[victim as usize].dirty {
            write_back_victim(inner, &mut state, victim)?;
            inner.cond.notify_all();
            continue;
        }

        // Clean victim: unbind, rebind and start loading under one latch
        // hold.
        if let Some(old) = state.meta[victim as usize].binding.take() {
            if let Some(table) = state.tables.get_mut(&old.mapping.id) {
                table.remove(old.page_index);
            }
            inner.monitor.evict(&old.mapping.path, old.page_index);
        }
        {
            let meta = &mut state.meta[victim as usize];
            meta.binding = Some(Binding {
                mapping: mapping.clone(),
                page_index,
            });
            meta.state = FrameState::Loading;
            meta.pin_count = 1;
            meta.exclusive = exclusive;
            meta.dirty = exclusive;
            meta.poisoned = false;
            meta.usage = true;
        }
        state
            .tables
            .get_mut(&mapping.id)
            .expect("live mapping has a table")
            .insert(page_index, victim);

        let within = page_index < mapping.page_count.load(Ordering::Acquire);
        let payload = inner.pool.payload(victim);
        let loaded = MutexGuard::unlocked(&mut state, || {
            payload.bump_rebound();
            if within {
                // SAFETY: the frame is `Loading`; no other thread touches
                // the payload until it becomes `Loaded`.
                mapping.io.read_page(page_index, unsafe { payload.io_slice_mut() })
            } else {
                // Past the high-water mark there is nothing to read.
                // SAFETY: as above.
                unsafe { payload.fill_zero() };
                Ok(())
            }
        });

        match loaded {
            Ok(()) => {
                state.meta[victim as usize].state = FrameState::Loaded;
                if exclusive {
                    payload.begin_mutation();
                    mapping.page_count.fetch_max(page_index + 1, Ordering::AcqRel);
                }
                inner.monitor.page_in(&mapping.path, page_index);
                inner.cond.notify_all();
                return Ok(Some(victim));
            }
            Err(e) => {
                tracing::warn!(
                    file = %mapping.path.display(),
                    page_index,
                    error = %e,
                    "page fault failed"
                );
                let meta = &mut state.meta[victim as usize];
                meta.binding = None;
                meta.state = FrameState::Free;
                meta.pin_count = 0;
                meta.exclusive = false;
                meta.dirty = false;
                if let Some(table) = state.tables.get_mut(&mapping.id) {
                    table.remove(page_index);
                }
                inner.cond.notify_all();
                return Err(e.into());
            }
        }
    }
}

/// Write a dirty, unpinned victim back through its owning mapping.
/// Failure poisons the frame: it keeps its dirty contents and is skipped
/// by the clock until the mapping flushes successfully.
fn write_back_victim(
    inner: &CacheInner,
    state: &mut MutexGuard<'_, CacheState>,
    victim: FrameId,
) -> Result<()> {
    let binding = state.meta[victim as usize]
        .binding
        .clone()
        .expect("dirty frame is bound");
    state.meta[victim as usize].state = FrameState::Evicting;

    let payload = inner.pool.payload(victim);
    let written = MutexGuard::unlocked(state, || {
        // SAFETY: the frame is `Evicting` with no pins; the payload is
        // stable for the duration of the write.
        binding
            .mapping
            .io
            .write_page(binding.page_index, unsafe { payload.io_slice() })
    });

    let meta = &mut state.meta[victim as usize];
    meta.state = FrameState::Loaded;
    match written {
        Ok(()) => {
            meta.dirty = false;
            inner
                .monitor
                .page_out(&binding.mapping.path, binding.page_index);
            Ok(())
        }
        Err(e) => {
            meta.poisoned = true;
            inner.cond.notify_all();
            tracing::warn!(
                file = %binding.mapping.path.display(),
                page_index = binding.page_index,
                error = %e,
                "eviction writeback failed; frame poisoned"
            );
            Err(e.into())
        }
    }
}

/// Release one pin. Closes the seqlock mutation window for exclusive
/// pins, and frees the frame outright when its mapping has been torn
/// down.
pub(crate) fn unpin_page(inner: &CacheInner, fid: FrameId, exclusive: bool) {
    if exclusive {
        inner.pool.payload(fid).end_mutation();
    }
    let mut state = inner.state.lock();
    let meta = &mut state.meta[fid as usize];
    debug_assert!(meta.pin_count > 0, "unpin without a pin");
    meta.pin_count -= 1;
    if exclusive {
        meta.exclusive = false;
    }
    let orphaned = meta.pin_count == 0
        && meta
            .binding
            .as_ref()
            .is_some_and(|b| b.mapping.closed.load(Ordering::SeqCst));
    if orphaned {
        meta.binding = None;
        meta.state = FrameState::Free;
        meta.dirty = false;
        meta.poisoned = false;
        meta.usage = false;
    }
    drop(state);
    inner.cond.notify_all();
}

/// Write back every dirty frame of `mapping` and force its channel.
///
/// Each frame is copied out under the frame's exclusive slot, so the
/// writeback never races a writer cursor; waiting writers resume once
/// their frame is flushed. The first I/O error aborts (dirty state is
/// preserved for a retry); success also clears poisoning.
pub(crate) fn flush_mapping(inner: &CacheInner, mapping: &Arc<Mapping>) -> Result<()> {
    inner.monitor.flush_begin(&mapping.path);
    tracing::debug!(file = %mapping.path.display(), "flush start");

    let mut state = inner.state.lock();
    for fid in 0..state.meta.len() {
        let page_index = loop {
            let meta = &state.meta[fid];
            let Some(page) = meta.bound_to(mapping.id) else {
                break None;
            };
            if !meta.dirty {
                break None;
            }
            if meta.state == FrameState::Loaded && !meta.exclusive {
                break Some(page);
            }
            // Mid-fault, mid-eviction or held by a writer: wait it out.
            inner.cond.wait(&mut state);
        };
        let Some(page_index) = page_index else {
            continue;
        };

        {
            let meta = &mut state.meta[fid];
            meta.exclusive = true;
            meta.pin_count += 1;
        }
        let payload = inner.pool.payload(fid as FrameId);
        let written = MutexGuard::unlocked(&mut state, || {
            // SAFETY: the exclusive slot is held; nothing mutates the
            // payload during the write.
            mapping.io.write_page(page_index, unsafe { payload.io_slice() })
        });
        {
            let meta = &mut state.meta[fid];
            meta.exclusive = false;
            meta.pin_count -= 1;
            if written.is_ok() {
                meta.dirty = false;
                meta.poisoned = false;
            }
        }
        inner.cond.notify_all();
        match written {
            Ok(()) => inner.monitor.page_out(&mapping.path, page_index),
            Err(e) => {
                tracing::warn!(
                    file = %mapping.path.display(),
                    page_index,
                    error = %e,
                    "flush writeback failed"
                );
                return Err(e.into());
            }
        }
    }
    drop(state);

    mapping.io.channel().force(false)?;
    inner.monitor.flush_end(&mapping.path);
    tracing::debug!(file = %mapping.path.display(), "flush done");
    Ok(())
}

/// Unbind every frame of a torn-down mapping.
///
/// Waits for in-flight loads and evictions of the mapping's pages to
/// settle first; frames still pinned by live cursors stay bound and are
/// freed on their final unpin via the mapping's closed flag.
pub(crate) fn release_mapping_frames(
    inner: &CacheInner,
    state: &mut MutexGuard<'_, CacheState>,
    mapping: &Arc<Mapping>,
) {
    loop {
        let busy = state.meta.iter().any(|m| {
            m.bound_to(mapping.id).is_some()
                && matches!(m.state, FrameState::Loading | FrameState::Evicting)
        });
        if !busy {
            break;
        }
        inner.cond.wait(state);
    }
    for meta in state.meta.iter_mut() {
        if meta.bound_to(mapping.id).is_none() || meta.pin_count > 0 {
            continue;
        }
        meta.binding = None;
        meta.state = FrameState::Free;
        meta.dirty = false;
        meta.poisoned = false;
        meta.usage = false;
    }
}
