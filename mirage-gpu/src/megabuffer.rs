// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Megabuffers: bump allocation of short-lived staging data in large pooled
//! GPU buffers.
//!
//! Small buffer contents are copied into a chunk and bound from there, so a
//! frequently updated buffer never has to wait on its own backing. A chunk is
//! recycled as a whole once the last cycle that allocated from it signals.
//! The first page of every chunk is never handed out, so offset 0 means "no
//! allocation".

use std::sync::Arc;

use mirage_common::memory::MappedMemory;
use mirage_common::{align_up, DeviceSize, PAGE_SIZE_U64};

use crate::backend::{BackendResult, GpuBackend, HostBuffer};
use crate::fence_cycle::FenceCycle;

/// A fixed-size GPU buffer with a free-region cursor.
pub struct MegaBufferChunk {
    cycle: Option<Arc<FenceCycle>>,
    backing: Arc<dyn HostBuffer>,
    free_offset: DeviceSize,
}

impl MegaBufferChunk {
    fn new(backend: &dyn GpuBackend, size: DeviceSize) -> BackendResult<Self> {
        Ok(Self {
            cycle: None,
            backing: backend.allocate_buffer(size)?,
            free_offset: PAGE_SIZE_U64,
        })
    }

    /// Reclaim the chunk if the last cycle that used it has signalled.
    pub fn try_reset(&mut self) -> bool {
        if let Some(cycle) = &self.cycle {
            if !cycle.poll_quick() {
                return false;
            }
            self.cycle = None;
        }
        self.free_offset = PAGE_SIZE_U64;
        true
    }

    pub fn backing(&self) -> &Arc<dyn HostBuffer> {
        &self.backing
    }

    /// Carve `size` bytes out of the free region for use by `cycle`.
    /// Returns the offset, or `None` if the chunk is too full.
    pub fn allocate(
        &mut self,
        cycle: &Arc<FenceCycle>,
        size: DeviceSize,
        page_align: bool,
    ) -> Option<DeviceSize> {
        if page_align {
            self.free_offset = align_up(self.free_offset, PAGE_SIZE_U64);
        }

        if self.free_offset + size > self.backing.size() {
            return None;
        }

        let same_cycle = self
            .cycle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, cycle));
        if !same_cycle {
            // The chunk is only free once every user has finished.
            cycle.chain_cycle(self.cycle.as_ref());
            self.cycle = Some(cycle.clone());
        }

        let offset = self.free_offset;
        self.free_offset += size;
        Some(offset)
    }
}

/// A region of a megabuffer chunk. An offset of 0 is an invalid allocation.
#[derive(Clone, Default)]
pub struct MegaBufferAllocation {
    pub buffer: Option<Arc<dyn HostBuffer>>,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

impl MegaBufferAllocation {
    pub fn is_valid(&self) -> bool {
        self.offset != 0
    }
}

impl std::fmt::Debug for MegaBufferAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegaBufferAllocation")
            .field("buffer", &self.buffer.as_ref().map(|b| b.handle()))
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Where a consumer should bind buffer data from: either a buffer's own
/// backing or a megabuffer allocation. The default binding is empty.
#[derive(Clone, Default)]
pub struct BufferBinding {
    pub buffer: Option<Arc<dyn HostBuffer>>,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

impl BufferBinding {
    pub fn is_valid(&self) -> bool {
        self.buffer.is_some()
    }
}

impl From<MegaBufferAllocation> for BufferBinding {
    fn from(allocation: MegaBufferAllocation) -> Self {
        if !allocation.is_valid() {
            return Self::default();
        }
        Self {
            buffer: allocation.buffer,
            offset: allocation.offset,
            size: allocation.size,
        }
    }
}

impl std::fmt::Debug for BufferBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferBinding")
            .field("buffer", &self.buffer.as_ref().map(|b| b.handle()))
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Pool of megabuffer chunks. Not internally synchronized.
pub struct MegaBufferAllocator {
    backend: Arc<dyn GpuBackend>,
    chunk_size: DeviceSize,
    chunks: Vec<MegaBufferChunk>,
    active: usize,
}

impl MegaBufferAllocator {
    pub fn new(backend: Arc<dyn GpuBackend>, chunk_size: DeviceSize) -> BackendResult<Self> {
        let first = MegaBufferChunk::new(backend.as_ref(), chunk_size)?;
        log::debug!("megabuffer: chunk size {:#X}", chunk_size);
        Ok(Self {
            backend,
            chunk_size,
            chunks: vec![first],
            active: 0,
        })
    }

    pub fn chunk_size(&self) -> DeviceSize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Largest allocation a chunk can hold; the first page of every chunk
    /// is reserved.
    pub fn max_allocation(&self) -> DeviceSize {
        self.chunk_size.saturating_sub(PAGE_SIZE_U64)
    }

    /// Allocate `size` bytes for use by `cycle`.
    ///
    /// # Panics
    ///
    /// Panics if no chunk can hold the allocation, including a freshly
    /// created one.
    pub fn allocate(
        &mut self,
        cycle: &Arc<FenceCycle>,
        size: DeviceSize,
        page_align: bool,
    ) -> MegaBufferAllocation {
        if let Some(allocation) = self.allocate_from(self.active, cycle, size, page_align) {
            return allocation;
        }

        self.active = match self.chunks.iter_mut().position(|chunk| chunk.try_reset()) {
            Some(index) => index,
            None => match MegaBufferChunk::new(self.backend.as_ref(), self.chunk_size) {
                Ok(chunk) => {
                    self.chunks.push(chunk);
                    log::debug!("megabuffer: grew to {} chunks", self.chunks.len());
                    self.chunks.len() - 1
                }
                Err(e) => {
                    log::error!("megabuffer: failed to allocate a chunk: {}", e);
                    panic!("failed to allocate a megabuffer chunk: {e}");
                }
            },
        };

        match self.allocate_from(self.active, cycle, size, page_align) {
            Some(allocation) => allocation,
            None => {
                log::error!("megabuffer: failed to allocate space for size {:#X}", size);
                panic!("failed to allocate megabuffer space for size: {size:#X}");
            }
        }
    }

    /// Allocate space for `data` and copy it in.
    pub fn push(&mut self, cycle: &Arc<FenceCycle>, data: &[u8], page_align: bool) -> MegaBufferAllocation {
        let allocation = self.allocate(cycle, data.len() as DeviceSize, page_align);
        if let Some(buffer) = &allocation.buffer {
            buffer.write(allocation.offset, data);
        }
        allocation
    }

    fn allocate_from(
        &mut self,
        index: usize,
        cycle: &Arc<FenceCycle>,
        size: DeviceSize,
        page_align: bool,
    ) -> Option<MegaBufferAllocation> {
        let chunk = &mut self.chunks[index];
        let offset = chunk.allocate(cycle, size, page_align)?;
        Some(MegaBufferAllocation {
            buffer: Some(chunk.backing.clone()),
            offset,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftBackend;

    fn cycle(backend: &SoftBackend) -> Arc<FenceCycle> {
        FenceCycle::new(
            backend.create_fence(false).unwrap(),
            backend.create_semaphore().unwrap(),
            false,
        )
        .unwrap()
    }

    fn allocator(chunk_size: DeviceSize) -> (Arc<SoftBackend>, MegaBufferAllocator) {
        let backend = Arc::new(SoftBackend::new());
        let allocator = MegaBufferAllocator::new(backend.clone(), chunk_size).unwrap();
        (backend, allocator)
    }

    #[test]
    fn test_first_page_is_reserved() {
        let (backend, mut allocator) = allocator(0x4000);
        let cycle = cycle(&backend);
        let allocation = allocator.allocate(&cycle, 0x10, false);
        assert!(allocation.is_valid());
        assert_eq!(allocation.offset, PAGE_SIZE_U64);

        let next = allocator.allocate(&cycle, 0x10, true);
        assert_eq!(next.offset, 2 * PAGE_SIZE_U64);
    }

    #[test]
    fn test_max_allocation_fills_chunk() {
        let (backend, mut allocator) = allocator(0x4000);
        let cycle = cycle(&backend);
        assert_eq!(allocator.max_allocation(), 0x3000);
        let size = allocator.max_allocation();
        let allocation = allocator.allocate(&cycle, size, true);
        assert_eq!(allocation.offset + allocation.size, 0x4000);
        assert_eq!(allocator.chunk_count(), 1);
    }

    #[test]
    fn test_push_copies_data() {
        let (backend, mut allocator) = allocator(0x4000);
        let cycle = cycle(&backend);
        let allocation = allocator.push(&cycle, &[1, 2, 3, 4], false);
        let buffer = allocation.buffer.as_ref().unwrap();
        assert_eq!(buffer.read_vec(allocation.offset, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_busy_chunk_is_not_reused() {
        let (backend, mut allocator) = allocator(0x3000);
        let first = cycle(&backend);
        allocator.allocate(&first, 0x2000, false);

        let second = cycle(&backend);
        let allocation = allocator.allocate(&second, 0x2000, false);
        assert!(allocation.is_valid());
        assert_eq!(allocator.chunk_count(), 2);
    }

    #[test]
    fn test_signalled_chunk_is_recycled() {
        let (backend, mut allocator) = allocator(0x3000);
        let first = cycle(&backend);
        allocator.allocate(&first, 0x2000, false);
        first.cancel();

        let second = cycle(&backend);
        let allocation = allocator.allocate(&second, 0x2000, false);
        assert_eq!(allocation.offset, PAGE_SIZE_U64);
        assert_eq!(allocator.chunk_count(), 1);
    }

    #[test]
    fn test_new_user_chains_previous_cycle() {
        let (backend, mut allocator) = allocator(0x4000);
        let first = cycle(&backend);
        let second = cycle(&backend);
        allocator.allocate(&first, 0x10, false);
        allocator.allocate(&second, 0x10, false);

        // `second` now waits on `first`: it cannot be observed signalled
        // through a full poll until `first` is.
        assert!(!second.poll());
        first.cancel();
        second.cancel();
        assert!(second.poll());
    }

    #[test]
    #[should_panic(expected = "failed to allocate megabuffer space")]
    fn test_oversized_allocation_panics() {
        let (backend, mut allocator) = allocator(0x2000);
        let cycle = cycle(&backend);
        allocator.allocate(&cycle, 0x2000, false);
    }

    #[test]
    fn test_binding_from_invalid_allocation_is_empty() {
        let binding = BufferBinding::from(MegaBufferAllocation::default());
        assert!(!binding.is_valid());
    }
}
