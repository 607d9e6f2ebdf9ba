// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Registry of guest buffers.
//!
//! The manager guarantees that any guest page is mirrored by at most one
//! buffer. Requests for a range that overlaps several buffers coalesce them
//! into one covering buffer; the old buffers' delegates are linked into the
//! new one so views taken earlier keep working.
//!
//! Lookups go through a page-granular [`SegmentTable`] first and fall back to
//! a search over the buffers sorted by guest address.
//!
//! The registry lock is held while overlapping buffers are locked, so a
//! thread must not call into the manager while holding a buffer lock that
//! another manager caller may be waiting for. GPU executions satisfy this by
//! locking every buffer under their own [`ContextTag`].

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mirage_common::{DeviceSize, GuestBuffer, GuestSpan};

use crate::buffer::{BackingImmutability, Buffer, BufferResult, DirtyState};
use crate::buffer_view::{BufferView, DelegateArena};
use crate::context_lock::ContextTag;
use crate::gpu_context::GpuDevice;
use crate::segment_table::SegmentTable;

/// A buffer locked under an execution tag for as long as this is alive.
///
/// Only the first usage under a tag actually takes the lock, so only the
/// first usage releases it again on drop.
pub struct LockedBuffer {
    buffer: Arc<Buffer>,
    first_usage: bool,
}

impl LockedBuffer {
    pub fn new(buffer: Arc<Buffer>, tag: ContextTag) -> Self {
        let first_usage = buffer.lock_with_tag(tag);
        Self {
            buffer,
            first_usage,
        }
    }

    /// False if the buffer was already locked under the same tag.
    pub fn is_first_usage(&self) -> bool {
        self.first_usage
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl Deref for LockedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if self.first_usage {
            self.buffer.unlock();
        }
    }
}

impl std::fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("buffer", &self.buffer.id())
            .field("first_usage", &self.first_usage)
            .finish()
    }
}

struct ManagerInner {
    table: SegmentTable<Arc<Buffer>>,
    /// Registered buffers, sorted by guest start address. They never
    /// overlap.
    mappings: Vec<Arc<Buffer>>,
}

impl ManagerInner {
    fn insert(&mut self, buffer: Arc<Buffer>) {
        let span = registered_span(&buffer);
        self.table.set(span.addr, span.end(), Some(buffer.clone()));
        let index = self
            .mappings
            .partition_point(|b| registered_span(b).addr < span.addr);
        self.mappings.insert(index, buffer);
    }

    fn remove(&mut self, buffer: &Arc<Buffer>) {
        let span = registered_span(buffer);
        self.table.set(span.addr, span.end(), None);
        self.mappings.retain(|b| !Arc::ptr_eq(b, buffer));
    }
}

fn registered_span(buffer: &Buffer) -> GuestSpan {
    buffer.guest_span().unwrap_or(GuestSpan::new(0, 0))
}

pub struct BufferManager {
    device: Arc<GpuDevice>,
    arena: Arc<DelegateArena>,
    inner: Mutex<ManagerInner>,
    next_id: AtomicUsize,
}

impl BufferManager {
    pub fn new(device: Arc<GpuDevice>) -> Self {
        Self {
            device,
            arena: Arc::new(DelegateArena::new()),
            inner: Mutex::new(ManagerInner {
                table: SegmentTable::new(),
                mappings: Vec::new(),
            }),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn arena(&self) -> &Arc<DelegateArena> {
        &self.arena
    }

    /// Number of registered guest buffers.
    pub fn buffer_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Lock every registered buffer overlapping `range` under `tag`, in
    /// guest address order.
    pub fn lookup(&self, range: GuestSpan, tag: ContextTag) -> Vec<LockedBuffer> {
        let inner = self.inner.lock();
        Self::lookup_locked(&inner, range, tag)
    }

    fn lookup_locked(inner: &ManagerInner, range: GuestSpan, tag: ContextTag) -> Vec<LockedBuffer> {
        if let Some(buffer) = inner.table.get(range.addr) {
            if registered_span(buffer).contains(&range) {
                return vec![LockedBuffer::new(buffer.clone(), tag)];
            }
        }

        let first = inner
            .mappings
            .partition_point(|b| registered_span(b).end() <= range.addr);
        inner.mappings[first..]
            .iter()
            .take_while(|b| registered_span(b).addr < range.end())
            .map(|b| LockedBuffer::new(b.clone(), tag))
            .collect()
    }

    /// A view of `guest_mapping`, creating or coalescing buffers as needed.
    ///
    /// Buffers are created over the page-aligned hull of the mapping. If any
    /// coalesced buffer was already locked under `tag`, the new buffer is
    /// handed to `attach` still locked, so the caller's execution keeps it
    /// locked until it ends.
    pub fn find_or_create(
        &self,
        guest_mapping: GuestSpan,
        tag: ContextTag,
        attach: &mut dyn FnMut(LockedBuffer),
    ) -> BufferResult<BufferView> {
        let aligned = guest_mapping.page_aligned();
        let mut inner = self.inner.lock();

        let overlaps = Self::lookup_locked(&inner, aligned, tag);
        if let [only] = overlaps.as_slice() {
            let span = registered_span(only);
            if span.contains(&aligned) {
                return Ok(self.get_view(only.buffer(), guest_mapping.addr - span.addr, guest_mapping.size));
            }
        }

        if overlaps.is_empty() {
            let buffer = LockedBuffer::new(self.create_guest_buffer(aligned)?, tag);
            buffer.buffer().setup_guest_mappings()?;
            inner.insert(buffer.buffer().clone());
            return Ok(self.get_view(buffer.buffer(), guest_mapping.addr - aligned.addr, guest_mapping.size));
        }

        let buffer = self.coalesce_buffers(aligned, &overlaps, tag)?;
        let buffer_span = registered_span(&buffer);
        let view = self.get_view(
            buffer.buffer(),
            guest_mapping.addr - buffer_span.addr,
            guest_mapping.size,
        );
        let new_buffer = buffer.buffer().clone();

        if overlaps.iter().any(|overlap| !overlap.is_first_usage()) {
            attach(buffer);
        } else {
            drop(buffer);
        }

        for overlap in &overlaps {
            inner.remove(overlap.buffer());
            overlap.invalidate();
        }
        inner.insert(new_buffer);

        log::debug!(
            "buffer manager: coalesced {} buffers into {} over {}",
            overlaps.len(),
            view.buffer().id(),
            buffer_span
        );
        Ok(view)
    }

    /// Merge `sources` and `range` into a single new buffer, returned locked
    /// under `tag`. Sources are left registered.
    fn coalesce_buffers(
        &self,
        range: GuestSpan,
        sources: &[LockedBuffer],
        tag: ContextTag,
    ) -> BufferResult<LockedBuffer> {
        let mut first_cycle = None;
        for (index, source) in sources.iter().enumerate() {
            // Their backings are copied below and must be stable.
            if source.dirty_state() == DirtyState::GpuDirty || source.all_cpu_backing_writes_blocked() {
                source.wait_on_fence();
            }

            // Cycles cannot be chained here without knowing their order, so
            // only one may survive.
            let cycle = source.cycle();
            if index == 0 {
                first_cycle = cycle;
            } else if !same_cycle(&cycle, &first_cycle) {
                source.wait_on_fence();
            }
        }

        let mut lowest = range.addr;
        let mut highest = range.end();
        for source in sources {
            let span = registered_span(source);
            lowest = lowest.min(span.addr);
            highest = highest.max(span.end());
        }

        // Lock before the traps are armed so no guest fault can touch the
        // buffer before it is ready.
        let buffer = LockedBuffer::new(
            self.create_guest_buffer(GuestSpan::from_range(lowest, highest))?,
            tag,
        );
        let merged: Vec<(&Buffer, DeviceSize, bool)> = sources
            .iter()
            .map(|source| {
                let offset: DeviceSize = registered_span(source).addr - lowest;
                (&**source, offset, source.is_first_usage())
            })
            .collect();
        buffer.buffer().coalesce_from(first_cycle, &merged)?;
        for &(source, offset, _) in &merged {
            self.arena.link(source.delegate(), buffer.delegate(), offset);
        }

        if buffer.backing_immutability() != BackingImmutability::None {
            log::trace!(
                "buffer manager: coalesced buffer {} inherits {:?}",
                buffer.id(),
                buffer.backing_immutability()
            );
        }
        Ok(buffer)
    }

    fn create_guest_buffer(&self, span: GuestSpan) -> BufferResult<Arc<Buffer>> {
        let delegate = self.arena.reserve();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(Buffer::new_guest(
            self.device.clone(),
            id,
            GuestBuffer::contiguous(span),
            delegate,
        )?);
        self.arena.bind(delegate, &buffer);
        Ok(buffer)
    }

    /// Create an unregistered buffer with no guest memory behind it.
    pub fn allocate_host_buffer(&self, size: DeviceSize) -> BufferResult<Arc<Buffer>> {
        let delegate = self.arena.reserve();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(Buffer::new_host(self.device.clone(), id, size, delegate)?);
        self.arena.bind(delegate, &buffer);
        Ok(buffer)
    }

    /// A view of `[offset, offset + size)` of `buffer`.
    pub fn get_view(&self, buffer: &Arc<Buffer>, offset: DeviceSize, size: DeviceSize) -> BufferView {
        BufferView::new(self.arena.clone(), buffer.delegate(), offset, size)
    }

    /// A view of `mapping` if `buffer` mirrors all of it.
    pub fn try_get_view(&self, buffer: &Arc<Buffer>, mapping: GuestSpan) -> Option<BufferView> {
        let span = buffer.guest_span()?;
        if !span.contains(&mapping) {
            return None;
        }
        Some(self.get_view(buffer, mapping.addr - span.addr, mapping.size))
    }
}

fn same_cycle<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_context::testing::{TestGpu, GUEST_BASE};

    fn span(offset: u64, size: u64) -> GuestSpan {
        GuestSpan::new(GUEST_BASE + offset, size)
    }

    #[test]
    fn test_create_aligns_to_pages() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let view = manager
            .find_or_create(span(0x1010, 0x20), ContextTag::NONE, &mut |_| {})
            .unwrap();

        assert_eq!(view.offset(), 0x10);
        assert_eq!(view.size(), 0x20);
        let buffer = view.buffer();
        assert_eq!(buffer.guest_span(), Some(span(0x1000, 0x1000)));
        assert_eq!(buffer.dirty_state(), DirtyState::CpuDirty);
        assert_eq!(manager.buffer_count(), 1);
    }

    #[test]
    fn test_contained_range_reuses_buffer() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let first = manager
            .find_or_create(span(0, 0x2000), ContextTag::NONE, &mut |_| {})
            .unwrap();
        let second = manager
            .find_or_create(span(0x1800, 0x100), ContextTag::NONE, &mut |_| {})
            .unwrap();

        assert!(Arc::ptr_eq(&first.buffer(), &second.buffer()));
        assert_eq!(second.offset(), 0x1800);
        assert_eq!(manager.buffer_count(), 1);
    }

    #[test]
    fn test_lookup_finds_overlaps_in_order() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        for offset in [0x0, 0x2000, 0x5000] {
            manager
                .find_or_create(span(offset, 0x1000), ContextTag::NONE, &mut |_| {})
                .unwrap();
        }

        let found = manager.lookup(span(0x800, 0x2000), ContextTag::NONE);
        let starts: Vec<_> = found
            .iter()
            .map(|b| b.guest_span().map(|s| s.addr - GUEST_BASE))
            .collect();
        assert_eq!(starts, vec![Some(0x0), Some(0x2000)]);
        assert!(manager.lookup(span(0x3000, 0x2000), ContextTag::NONE).is_empty());
    }

    #[test]
    fn test_coalesce_adjacent_buffers() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        gpu.memory.write_host(GUEST_BASE, &[0x11; 0x1000]).unwrap();
        gpu.memory.write_host(GUEST_BASE + 0x1000, &[0x22; 0x1000]).unwrap();

        let a = manager
            .find_or_create(span(0x10, 0x20), ContextTag::NONE, &mut |_| {})
            .unwrap();
        let b = manager
            .find_or_create(span(0x1010, 0x20), ContextTag::NONE, &mut |_| {})
            .unwrap();
        let old = a.buffer();
        let storage = b.format_view(1);
        assert_eq!(storage.offset(), 0x10);

        let merged = manager
            .find_or_create(span(0x800, 0x1000), ContextTag::NONE, &mut |_| {})
            .unwrap();
        assert_eq!(manager.buffer_count(), 1);
        assert_eq!(merged.offset(), 0x800);

        // Old views follow the merge.
        assert!(Arc::ptr_eq(&a.buffer(), &merged.buffer()));
        assert!(Arc::ptr_eq(&b.buffer(), &merged.buffer()));
        assert_eq!(a.offset(), 0x10);
        assert_eq!(b.offset(), 0x1010);
        assert_eq!(storage.offset(), 0x1010);
        assert!(old.guest().is_none());

        let buffer = merged.buffer();
        buffer.lock();
        let mut data = [0u8; 2];
        b.read(true, &mut || {}, &mut data, 0);
        assert_eq!(data, [0x22, 0x22]);
        a.read(true, &mut || {}, &mut data, 0);
        assert_eq!(data, [0x11, 0x11]);
        assert_eq!(buffer.dirty_state(), DirtyState::Clean);
        buffer.unlock();
    }

    #[test]
    fn test_coalesce_keeps_gpu_written_data() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let a = manager
            .find_or_create(span(0, 0x1000), ContextTag::NONE, &mut |_| {})
            .unwrap();
        {
            let buffer = a.buffer();
            buffer.lock();
            buffer.mark_gpu_dirty();
            buffer.backing().write(0x40, &[0xAB; 4]);
            buffer.unlock();
        }

        let merged = manager
            .find_or_create(span(0, 0x2000), ContextTag::NONE, &mut |_| {})
            .unwrap();
        let buffer = merged.buffer();
        buffer.lock();
        let mut data = [0u8; 4];
        merged.read(true, &mut || {}, &mut data, 0x40);
        assert_eq!(data, [0xAB; 4]);
        buffer.unlock();
    }

    #[test]
    fn test_coalesce_attaches_when_already_locked() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let tag = ContextTag::allocate();

        let a = manager
            .find_or_create(span(0, 0x1000), tag, &mut |_| {})
            .unwrap();
        // Held by the execution, as an attached buffer would be.
        let held = LockedBuffer::new(a.buffer(), tag);
        assert!(held.is_first_usage());

        let mut attached = Vec::new();
        let merged = manager
            .find_or_create(span(0x800, 0x1000), tag, &mut |buffer| attached.push(buffer))
            .unwrap();
        assert_eq!(attached.len(), 1);
        assert!(Arc::ptr_eq(attached[0].buffer(), &merged.buffer()));
        assert!(merged.buffer().is_locked_by_current_thread());

        drop(attached);
        drop(held);
        assert!(!merged.buffer().is_locked_by_current_thread());
    }

    #[test]
    fn test_coalesce_takes_over_used_gpu_dirty_source() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let tag = ContextTag::allocate();

        let a = manager
            .find_or_create(span(0x2000, 0x1000), tag, &mut |_| {})
            .unwrap();
        let held = LockedBuffer::new(a.buffer(), tag);
        held.mark_gpu_dirty();
        held.backing().write(0x40, &[0xAB; 4]);
        let storage = a.format_view(1);

        let mut attached = Vec::new();
        let merged = manager
            .find_or_create(span(0x1000, 0x1800), tag, &mut |buffer| attached.push(buffer))
            .unwrap();
        let hull = merged.buffer();
        assert!(!Arc::ptr_eq(&hull, held.buffer()));
        assert_eq!(hull.dirty_state(), DirtyState::GpuDirty);
        assert!(hull.all_cpu_backing_writes_blocked());
        assert_eq!(hull.backing().read_vec(0x1040, 4), vec![0xAB; 4]);
        assert_eq!(storage.offset(), 0x1000);

        drop(attached);
        drop(held);
        let mut data = [0u8; 4];
        gpu.memory.read(GUEST_BASE + 0x2040, &mut data).unwrap();
        assert_eq!(data, [0xAB; 4]);
        assert_eq!(hull.dirty_state(), DirtyState::Clean);
    }

    #[test]
    fn test_try_get_view() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let view = manager
            .find_or_create(span(0x1000, 0x1000), ContextTag::NONE, &mut |_| {})
            .unwrap();
        let buffer = view.buffer();

        let inner = manager.try_get_view(&buffer, span(0x1100, 0x10)).unwrap();
        assert_eq!(inner.offset(), 0x100);
        assert!(manager.try_get_view(&buffer, span(0x1F00, 0x200)).is_none());

        let host = manager.allocate_host_buffer(0x100).unwrap();
        assert!(manager.try_get_view(&host, span(0, 0x10)).is_none());
    }
}
