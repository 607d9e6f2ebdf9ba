// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stable handles into buffers that survive buffer recreation.
//!
//! Every buffer owns a delegate slot in a shared [`DelegateArena`]. Views
//! refer to a delegate rather than to the buffer itself; when buffers are
//! coalesced, the superseded buffers' delegates are linked to the new
//! buffer's delegate with an offset, so existing views transparently follow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use mirage_common::DeviceSize;

use crate::buffer::Buffer;
use crate::context_lock::ContextTag;
use crate::fence_cycle::FenceCycle;
use crate::megabuffer::{BufferBinding, MegaBufferAllocator};

/// Index of a delegate slot in a [`DelegateArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelegateId(usize);

enum DelegateLink {
    /// Reserved, not yet bound to a buffer.
    Unbound,
    Direct(Weak<Buffer>),
    Redirect {
        target: DelegateId,
        offset: DeviceSize,
    },
}

/// Arena of buffer delegates. Slots are never freed.
#[derive(Default)]
pub struct DelegateArena {
    slots: RwLock<Vec<DelegateLink>>,
}

impl DelegateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reserve(&self) -> DelegateId {
        let mut slots = self.slots.write();
        slots.push(DelegateLink::Unbound);
        DelegateId(slots.len() - 1)
    }

    pub(crate) fn bind(&self, id: DelegateId, buffer: &Arc<Buffer>) {
        self.slots.write()[id.0] = DelegateLink::Direct(Arc::downgrade(buffer));
    }

    /// Redirect `id` to `target`, `offset` bytes in.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already linked.
    pub(crate) fn link(&self, id: DelegateId, target: DelegateId, offset: DeviceSize) {
        let mut slots = self.slots.write();
        if let DelegateLink::Redirect { .. } = slots[id.0] {
            log::error!("delegate {:?}: already linked", id);
            panic!("cannot link a buffer delegate that is already linked");
        }
        slots[id.0] = DelegateLink::Redirect { target, offset };
    }

    /// Follow the chain from `id` to the authoritative buffer. Returns it
    /// with the accumulated offset.
    ///
    /// # Panics
    ///
    /// Panics if the chain ends at a destroyed or unbound buffer.
    pub fn resolve(&self, id: DelegateId) -> (Arc<Buffer>, DeviceSize) {
        let slots = self.slots.read();
        let mut current = id;
        let mut offset = 0;
        loop {
            match &slots[current.0] {
                DelegateLink::Direct(buffer) => match buffer.upgrade() {
                    Some(buffer) => return (buffer, offset),
                    None => panic!("delegate {id:?} refers to a destroyed buffer"),
                },
                DelegateLink::Redirect {
                    target,
                    offset: link_offset,
                } => {
                    offset += link_offset;
                    current = *target;
                }
                DelegateLink::Unbound => panic!("delegate {id:?} used before being bound"),
            }
        }
    }

    /// Point `id` directly at the end of its chain. Returns the end and the
    /// accumulated offset.
    pub fn compress(&self, id: DelegateId) -> (DelegateId, DeviceSize) {
        let mut slots = self.slots.write();
        let mut current = id;
        let mut offset = 0;
        while let DelegateLink::Redirect {
            target,
            offset: link_offset,
        } = slots[current.0]
        {
            offset += link_offset;
            current = target;
        }
        if current != id {
            slots[id.0] = DelegateLink::Redirect {
                target: current,
                offset,
            };
        }
        (current, offset)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cached description of a formatted view into a buffer. Shared so holders
/// keep a valid offset after the buffer is coalesced into a larger one.
#[derive(Debug)]
pub struct BufferViewStorage {
    offset: AtomicU64,
    size: DeviceSize,
    format: u32,
}

impl BufferViewStorage {
    pub(crate) fn new(offset: DeviceSize, size: DeviceSize, format: u32) -> Self {
        Self {
            offset: AtomicU64::new(offset),
            size,
            format,
        }
    }

    pub fn offset(&self) -> DeviceSize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub(crate) fn shift(&self, delta: DeviceSize) {
        self.offset.fetch_add(delta, Ordering::AcqRel);
    }
}

/// A range of a buffer, addressed through its delegate.
#[derive(Clone)]
pub struct BufferView {
    arena: Arc<DelegateArena>,
    delegate: DelegateId,
    offset: DeviceSize,
    size: DeviceSize,
}

impl BufferView {
    pub(crate) fn new(
        arena: Arc<DelegateArena>,
        delegate: DelegateId,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Self {
        Self {
            arena,
            delegate,
            offset,
            size,
        }
    }

    /// The buffer currently backing this view.
    pub fn buffer(&self) -> Arc<Buffer> {
        self.arena.resolve(self.delegate).0
    }

    /// Offset of the view within [`BufferView::buffer`].
    pub fn offset(&self) -> DeviceSize {
        self.resolved().1
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn delegate(&self) -> DelegateId {
        self.delegate
    }

    /// Collapse the delegate chain so later lookups are a single hop.
    pub fn resolve_delegate(&mut self) {
        let (target, offset) = self.arena.compress(self.delegate);
        self.delegate = target;
        self.offset += offset;
    }

    /// Bind the view straight from the buffer's backing.
    pub fn binding(&self) -> BufferBinding {
        let (buffer, offset) = self.resolved();
        BufferBinding {
            buffer: Some(buffer.backing().clone()),
            offset,
            size: self.size,
        }
    }

    /// See [`Buffer::read`]. `read_offset` is relative to the view.
    pub fn read(
        &self,
        is_first_usage: bool,
        flush_host: &mut dyn FnMut(),
        data: &mut [u8],
        read_offset: DeviceSize,
    ) {
        let (buffer, offset) = self.resolved();
        buffer.read(is_first_usage, flush_host, data, offset + read_offset);
    }

    /// See [`Buffer::write`]. `write_offset` is relative to the view.
    pub fn write(
        &self,
        data: &[u8],
        write_offset: DeviceSize,
        gpu_copy: Option<&mut dyn FnMut()>,
    ) -> bool {
        let (buffer, offset) = self.resolved();
        buffer.write(data, offset + write_offset, gpu_copy)
    }

    /// Copy the whole of `src` into this view.
    ///
    /// # Panics
    ///
    /// Panics if the views differ in size.
    pub fn copy_from(&self, src: &BufferView, gpu_copy: &mut dyn FnMut()) {
        if src.size != self.size {
            log::error!("buffer view: copy size mismatch {:#X} != {:#X}", src.size, self.size);
            panic!("copy size mismatch");
        }
        let (dst_buffer, dst_offset) = self.resolved();
        let (src_buffer, src_offset) = src.resolved();
        dst_buffer.copy_from(dst_offset, &src_buffer, src_offset, self.size, gpu_copy);
    }

    /// Try to stage the view's contents in a megabuffer for `cycle`.
    /// Returns an empty binding if the view should be bound from the
    /// buffer's backing instead.
    pub fn try_mega_buffer(
        &self,
        cycle: &Arc<FenceCycle>,
        allocator: &mut MegaBufferAllocator,
        execution: ContextTag,
        size_override: Option<DeviceSize>,
    ) -> BufferBinding {
        let (buffer, offset) = self.resolved();
        buffer.try_mega_buffer_view(
            cycle,
            allocator,
            execution,
            offset,
            size_override.unwrap_or(self.size),
        )
    }

    /// Up-to-date contents of the view for reading on the host.
    pub fn read_only_backing_span(
        &self,
        is_first_usage: bool,
        flush_host: &mut dyn FnMut(),
    ) -> Vec<u8> {
        let (buffer, offset) = self.resolved();
        buffer.read_only_backing_span(is_first_usage, flush_host, offset, self.size)
    }

    /// Shared storage for a formatted view over this range.
    pub fn format_view(&self, format: u32) -> Arc<BufferViewStorage> {
        let (buffer, offset) = self.resolved();
        buffer.view_storage(offset, self.size, format)
    }

    fn resolved(&self) -> (Arc<Buffer>, DeviceSize) {
        let (buffer, offset) = self.arena.resolve(self.delegate);
        (buffer, offset + self.offset)
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("delegate", &self.delegate)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBuffer;
    use crate::gpu_context::testing::TestGpu;

    #[test]
    fn test_chain_resolves_with_accumulated_offset() {
        let gpu = TestGpu::new();
        let arena = gpu.context.buffer.arena().clone();
        let buffer = gpu.context.buffer.allocate_host_buffer(0x100).unwrap();

        let middle = arena.reserve();
        let leaf = arena.reserve();
        arena.link(middle, buffer.delegate(), 0x20);
        arena.link(leaf, middle, 0x10);

        let (resolved, offset) = arena.resolve(leaf);
        assert!(Arc::ptr_eq(&resolved, &buffer));
        assert_eq!(offset, 0x30);
    }

    #[test]
    fn test_compress_shortcuts_chain() {
        let gpu = TestGpu::new();
        let arena = gpu.context.buffer.arena().clone();
        let buffer = gpu.context.buffer.allocate_host_buffer(0x100).unwrap();

        let a = arena.reserve();
        let b = arena.reserve();
        let c = arena.reserve();
        arena.link(a, buffer.delegate(), 0x8);
        arena.link(b, a, 0x8);
        arena.link(c, b, 0x8);

        assert_eq!(arena.compress(c), (buffer.delegate(), 0x18));
        assert_eq!(arena.resolve(c).1, 0x18);

        let mut view = BufferView::new(arena.clone(), c, 0x4, 0x10);
        view.resolve_delegate();
        assert_eq!(view.delegate(), buffer.delegate());
        assert_eq!(view.offset(), 0x1C);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn test_double_link_panics() {
        let arena = DelegateArena::new();
        let a = arena.reserve();
        let b = arena.reserve();
        let c = arena.reserve();
        arena.link(a, b, 0);
        arena.link(a, c, 0);
    }

    #[test]
    #[should_panic(expected = "copy size mismatch")]
    fn test_copy_size_mismatch_panics() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let buffer = manager.allocate_host_buffer(0x100).unwrap();
        let big = manager.get_view(&buffer, 0, 0x20);
        let small = manager.get_view(&buffer, 0x40, 0x10);
        big.copy_from(&small, &mut || {});
    }

    #[test]
    fn test_binding_uses_backing() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let buffer = manager.allocate_host_buffer(0x100).unwrap();
        let view = manager.get_view(&buffer, 0x40, 0x10);

        let binding = view.binding();
        assert!(binding.is_valid());
        assert_eq!(binding.offset, 0x40);
        assert_eq!(binding.size, 0x10);
        assert_eq!(
            binding.buffer.as_ref().map(|b| b.handle()),
            Some(buffer.backing().handle())
        );
    }

    #[test]
    fn test_format_view_is_shared() {
        let gpu = TestGpu::new();
        let manager = &gpu.context.buffer;
        let buffer = manager.allocate_host_buffer(0x100).unwrap();
        let view = manager.get_view(&buffer, 0x40, 0x10);

        let first = view.format_view(7);
        let second = view.format_view(7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.offset(), 0x40);
        assert_eq!(first.format(), 7);
        assert!(!Arc::ptr_eq(&first, &view.format_view(8)));
    }
}
