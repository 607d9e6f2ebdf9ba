// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest-mirrored GPU buffers.
//!
//! A [`Buffer`] keeps two copies of a guest memory range: the mirror, which
//! aliases guest memory, and the backing, which the GPU reads and writes.
//! Which copy is authoritative is tracked by [`DirtyState`]:
//!
//! - `Clean`: both copies are identical.
//! - `CpuDirty`: the guest wrote through the mirror; the backing is stale.
//! - `GpuDirty`: the GPU wrote the backing; the mirror is stale and paged out.
//!
//! Transitions are driven lazily by page traps on the guest range and by
//! the GPU layer locking and using the buffer. Two locks guard a buffer:
//! the ownership lock ([`Buffer::lock`]), held by whoever is using the
//! buffer, and an internal state lock that serializes every dirty-state
//! transition, including those made from trap handlers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use mirage_common::memory::{copy_mapped, MappedMemory, TrapHandle, TrapHandler};
use mirage_common::{DeviceSize, GuestBuffer, GuestMemoryError, GuestSpan, PAGE_SIZE_U64};

use crate::backend::{BackendError, HostBuffer};
use crate::buffer_view::{BufferViewStorage, DelegateId};
use crate::context_lock::{ContextLock, ContextTag};
use crate::fence_cycle::FenceCycle;
use crate::gpu_context::GpuDevice;
use crate::megabuffer::{BufferBinding, MegaBufferAllocation, MegaBufferAllocator};

/// Sequence number every buffer starts with.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// Sequence number from which a buffer counts as frequently synced and may
/// be megabuffered without ever having had an inline update.
pub const FREQUENTLY_SYNCED_THRESHOLD: u64 = 6;

/// Views larger than this are never megabuffered (256 KiB).
pub const MEGA_BUFFERING_DISABLE_THRESHOLD: DeviceSize = 256 * 1024;

/// Smallest megabuffer chunk that still fits any megabufferable view at an
/// unaligned offset next to the reserved first page.
pub const MIN_MEGABUFFER_CHUNK_SIZE: DeviceSize =
    MEGA_BUFFERING_DISABLE_THRESHOLD + 2 * PAGE_SIZE_U64;

/// Number of non-context locks after which a buffer is frequently locked.
pub const FREQUENTLY_LOCKED_THRESHOLD: u32 = 2;

const MEGA_BUFFER_TABLE_MAX_ENTRIES: u64 = 0x500;
const MEGA_BUFFER_TABLE_SHIFT_MIN: u32 = 8;

const FAST_READBACK_WAIT_COUNT_THRESHOLD: u32 = 6;
const FAST_READBACK_WAIT_TIME_THRESHOLD: Duration = Duration::from_millis(250);

/// Errors creating a buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),

    #[error("empty guest mapping at {0}")]
    EmptyMapping(GuestSpan),
}

/// Result alias for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    Clean,
    CpuDirty,
    GpuDirty,
}

/// How much the CPU may write to the backing directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackingImmutability {
    None,
    /// The GPU reads the backing in sequence: sequenced writes must go
    /// through the GPU, synchronization may still write directly.
    SequencedWrites,
    /// No CPU writes to the backing at all.
    AllWrites,
}

struct BufferState {
    guest: Option<GuestBuffer>,
    trap: Option<TrapHandle>,
    dirty: DirtyState,
    immutability: BackingImmutability,
    cycle: Option<Arc<FenceCycle>>,
    current_execution_gpu_dirty: bool,
    sequence_number: u64,
    ever_had_inline_update: bool,

    mega_buffer_table_shift: u32,
    mega_buffer_table: Vec<MegaBufferAllocation>,
    mega_buffer_table_validity: Vec<u64>,
    mega_buffer_table_used: bool,
    unified_mega_buffer_enabled: bool,
    unified_mega_buffer: MegaBufferAllocation,
    mega_buffer_view_accumulated_size: DeviceSize,
    last_execution_tag: ContextTag,
}

impl BufferState {
    fn new(guest: Option<GuestBuffer>, size: DeviceSize) -> Self {
        let dirty = if guest.is_some() {
            DirtyState::CpuDirty
        } else {
            DirtyState::Clean
        };

        let shift = mega_buffer_table_shift(size);
        let entries = (size >> shift) as usize;
        Self {
            guest,
            trap: None,
            dirty,
            immutability: BackingImmutability::None,
            cycle: None,
            current_execution_gpu_dirty: false,
            sequence_number: INITIAL_SEQUENCE_NUMBER,
            ever_had_inline_update: false,
            mega_buffer_table_shift: shift,
            mega_buffer_table: vec![MegaBufferAllocation::default(); entries],
            mega_buffer_table_validity: vec![0; entries.div_ceil(64)],
            mega_buffer_table_used: false,
            unified_mega_buffer_enabled: false,
            unified_mega_buffer: MegaBufferAllocation::default(),
            mega_buffer_view_accumulated_size: 0,
            last_execution_tag: ContextTag::NONE,
        }
    }

    fn sequenced_writes_blocked(&self) -> bool {
        self.immutability >= BackingImmutability::SequencedWrites
    }

    fn all_writes_blocked(&self) -> bool {
        self.immutability == BackingImmutability::AllWrites
    }

    fn reset_mega_buffer_state(&mut self) {
        if self.mega_buffer_table_used {
            self.mega_buffer_table_validity.fill(0);
        }
        self.mega_buffer_table_used = false;
        self.mega_buffer_view_accumulated_size = 0;
        self.unified_mega_buffer = MegaBufferAllocation::default();
    }

    /// Bump the sequence: cached megabuffer copies are now stale.
    fn advance_sequence(&mut self) {
        self.reset_mega_buffer_state();
        self.sequence_number += 1;
    }

    fn entry_valid(&self, index: usize) -> bool {
        self.mega_buffer_table_validity[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_entry_valid(&mut self, index: usize) {
        self.mega_buffer_table_validity[index / 64] |= 1 << (index % 64);
    }

    fn wait_on_fence(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            cycle.wait();
        }
    }

    fn poll_fence(&mut self) -> bool {
        let signalled = match &self.cycle {
            None => return true,
            Some(cycle) => cycle.poll(),
        };
        if signalled {
            self.cycle = None;
        }
        signalled
    }
}

/// Table shift such that the table has at most 0x500 entries, and entries
/// are at least 256 bytes.
fn mega_buffer_table_shift(size: DeviceSize) -> u32 {
    let per_entry = (size / MEGA_BUFFER_TABLE_MAX_ENTRIES).saturating_sub(1);
    let bit_width = u64::BITS - per_entry.leading_zeros();
    bit_width.max(MEGA_BUFFER_TABLE_SHIFT_MIN)
}

pub struct Buffer {
    id: usize,
    device: Arc<GpuDevice>,
    /// Guest range the buffer was created over; kept after invalidation.
    span: Option<GuestSpan>,
    lock: ContextLock,
    state: Mutex<BufferState>,
    backing: Arc<dyn HostBuffer>,
    mirror: Option<Arc<dyn MappedMemory>>,
    delegate: DelegateId,
    views: Mutex<Vec<Arc<BufferViewStorage>>>,

    guest_wait_counter: AtomicU32,
    guest_wait_time_ns: AtomicU64,
    cpu_lock_counter: AtomicU32,
}

impl Buffer {
    /// Create a buffer mirroring `guest`. It starts CPU dirty; traps are
    /// armed by [`Buffer::setup_guest_mappings`].
    pub(crate) fn new_guest(
        device: Arc<GpuDevice>,
        id: usize,
        guest: GuestBuffer,
        delegate: DelegateId,
    ) -> BufferResult<Self> {
        if guest.size() == 0 {
            return Err(BufferError::EmptyMapping(guest.hull()));
        }
        let mirror = device.memory.create_mirror(&guest)?;
        let backing = device.backend.allocate_buffer(mirror.size())?;
        log::debug!("buffer {}: created over {}", id, guest.hull());
        Ok(Self::with_parts(
            device,
            id,
            Some(guest),
            backing,
            Some(mirror),
            delegate,
        ))
    }

    /// Create a buffer with no guest memory behind it. It is always clean.
    pub(crate) fn new_host(
        device: Arc<GpuDevice>,
        id: usize,
        size: DeviceSize,
        delegate: DelegateId,
    ) -> BufferResult<Self> {
        let backing = device.backend.allocate_buffer(size)?;
        log::trace!("buffer {}: created host-only, {:#X} bytes", id, size);
        Ok(Self::with_parts(device, id, None, backing, None, delegate))
    }

    fn with_parts(
        device: Arc<GpuDevice>,
        id: usize,
        guest: Option<GuestBuffer>,
        backing: Arc<dyn HostBuffer>,
        mirror: Option<Arc<dyn MappedMemory>>,
        delegate: DelegateId,
    ) -> Self {
        let size = backing.size();
        Self {
            id,
            device,
            span: guest.as_ref().map(GuestBuffer::hull),
            lock: ContextLock::new(),
            state: Mutex::new(BufferState::new(guest, size)),
            backing,
            mirror,
            delegate,
            views: Mutex::new(Vec::new()),
            guest_wait_counter: AtomicU32::new(0),
            guest_wait_time_ns: AtomicU64::new(0),
            cpu_lock_counter: AtomicU32::new(0),
        }
    }

    /// Register the buffer's page trap with guest memory. The trap starts
    /// disarmed.
    pub fn setup_guest_mappings(self: &Arc<Self>) -> BufferResult<()> {
        let mut state = self.state.lock();
        self.setup_guest_mappings_locked(&mut state)
    }

    fn setup_guest_mappings_locked(self: &Arc<Self>, state: &mut BufferState) -> BufferResult<()> {
        let Some(guest) = state.guest.clone() else {
            return Ok(());
        };

        let handler: Arc<dyn TrapHandler> = self.clone();
        let trap = self
            .device
            .memory
            .create_trap(&guest, Arc::downgrade(&handler))?;
        state.trap = Some(trap);
        Ok(())
    }

    // ── Accessors ──

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn delegate(&self) -> DelegateId {
        self.delegate
    }

    pub fn backing(&self) -> &Arc<dyn HostBuffer> {
        &self.backing
    }

    pub fn size(&self) -> DeviceSize {
        self.backing.size()
    }

    /// Guest range the buffer was created over, `None` for host-only
    /// buffers.
    pub fn guest_span(&self) -> Option<GuestSpan> {
        self.span
    }

    /// The guest mapping, `None` for host-only or invalidated buffers.
    pub fn guest(&self) -> Option<GuestBuffer> {
        self.state.lock().guest.clone()
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.state.lock().dirty
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.lock().sequence_number
    }

    pub fn ever_had_inline_update(&self) -> bool {
        self.state.lock().ever_had_inline_update
    }

    pub fn backing_immutability(&self) -> BackingImmutability {
        self.state.lock().immutability
    }

    pub fn sequenced_cpu_backing_writes_blocked(&self) -> bool {
        self.state.lock().sequenced_writes_blocked()
    }

    pub fn all_cpu_backing_writes_blocked(&self) -> bool {
        self.state.lock().all_writes_blocked()
    }

    /// Whether the buffer was marked GPU dirty since it was last unlocked.
    pub fn is_current_execution_gpu_dirty(&self) -> bool {
        self.state.lock().current_execution_gpu_dirty
    }

    /// Whether the buffer is often locked outside of GPU executions.
    pub fn frequently_locked(&self) -> bool {
        self.cpu_lock_counter.load(Ordering::Relaxed) >= FREQUENTLY_LOCKED_THRESHOLD
    }

    pub fn frequently_synced(&self) -> bool {
        self.sequence_number() >= FREQUENTLY_SYNCED_THRESHOLD
    }

    /// Number of times a guest access had to wait on the GPU.
    pub fn guest_wait_count(&self) -> u32 {
        self.guest_wait_counter.load(Ordering::Relaxed)
    }

    /// The cycle of the last GPU work using the buffer, if not yet known
    /// to be complete.
    pub fn cycle(&self) -> Option<Arc<FenceCycle>> {
        self.state.lock().cycle.clone()
    }

    // ── Locking ──

    /// Acquire the ownership lock.
    pub fn lock(&self) {
        self.lock.lock();
        self.cpu_lock_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        if self.lock.try_lock() {
            self.cpu_lock_counter.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Lock on behalf of the execution `tag`. Returns `false` without
    /// locking if the buffer is already locked under `tag`.
    pub fn lock_with_tag(&self, tag: ContextTag) -> bool {
        self.lock.lock_with_tag(tag)
    }

    /// Release the ownership lock. Releasing the outermost level also lifts
    /// any backing write blocks.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        self.unlock_locked(&mut state);
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        self.lock.is_held_by_current_thread()
    }

    pub fn lock_tag(&self) -> ContextTag {
        self.lock.tag()
    }

    fn unlock_locked(&self, state: &mut BufferState) {
        if self.lock.held_depth() == 1 {
            state.immutability = BackingImmutability::None;
            state.current_execution_gpu_dirty = false;
        }
        self.lock.unlock();
    }

    fn assert_locked(&self) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "buffer {} used without holding its lock",
            self.id
        );
    }

    // ── Backing immutability ──

    /// The GPU is about to read the backing in sequence with CPU writes.
    pub fn block_sequenced_cpu_backing_writes(&self) {
        let mut state = self.state.lock();
        if state.immutability == BackingImmutability::None {
            state.immutability = BackingImmutability::SequencedWrites;
        }
    }

    /// The GPU is about to write the backing.
    pub fn block_all_cpu_backing_writes(&self) {
        self.state.lock().immutability = BackingImmutability::AllWrites;
    }

    pub fn allow_all_backing_writes(&self) {
        self.state.lock().immutability = BackingImmutability::None;
    }

    // ── Fences ──

    /// Make `cycle` the buffer's latest GPU usage. The previous cycle is
    /// chained onto it.
    pub fn update_cycle(&self, cycle: &Arc<FenceCycle>) {
        let mut state = self.state.lock();
        if state
            .cycle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, cycle))
        {
            return;
        }
        cycle.chain_cycle(state.cycle.as_ref());
        state.cycle = Some(cycle.clone());
    }

    /// Block until the latest GPU usage has completed.
    pub fn wait_on_fence(&self) {
        self.state.lock().wait_on_fence();
    }

    /// Whether the latest GPU usage has completed, without blocking.
    pub fn poll_fence(&self) -> bool {
        self.state.lock().poll_fence()
    }

    /// Detach the buffer from guest memory. Any later synchronization is a
    /// no-op.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if let Some(trap) = state.trap.take() {
            self.device.memory.delete_trap(trap);
        }
        state.guest = None;
    }

    // ── Synchronization ──

    /// Copy a CPU-dirty mirror into the backing. Unless `skip_trap`, guest
    /// writes are trapped again first so none can slip past the copy.
    pub fn synchronize_host(&self, skip_trap: bool) {
        let mut state = self.state.lock();
        self.synchronize_host_locked(&mut state, skip_trap);
    }

    /// Copy a GPU-dirty backing into the mirror.
    ///
    /// Returns `false` if the buffer has no guest memory, or if
    /// `non_blocking` is set and the GPU has not finished with the buffer.
    pub fn synchronize_guest(&self, skip_trap: bool, non_blocking: bool) -> bool {
        let mut state = self.state.lock();
        self.synchronize_guest_locked(&mut state, skip_trap, non_blocking)
    }

    /// Synchronize the guest, first flushing the caller's pending GPU work
    /// if the buffer was already used in it.
    pub fn synchronize_guest_immediate(&self, is_first_usage: bool, flush_host: &mut dyn FnMut()) {
        // The flush may call back into this buffer.
        if !is_first_usage {
            flush_host();
        }
        let mut state = self.state.lock();
        self.synchronize_guest_locked(&mut state, false, false);
    }

    /// The GPU is about to write the buffer: make the backing authoritative,
    /// trap all guest accesses and page the mirror out.
    pub fn mark_gpu_dirty(&self) {
        self.assert_locked();
        let mut state = self.state.lock();
        self.mark_gpu_dirty_locked(&mut state);
    }

    // ── Access ──

    /// Read `data.len()` bytes at `offset` from the buffer.
    pub fn read(
        &self,
        is_first_usage: bool,
        flush_host: &mut dyn FnMut(),
        data: &mut [u8],
        offset: DeviceSize,
    ) {
        self.assert_locked();
        let _state = self.lock_guest_synchronized(is_first_usage, flush_host);
        self.read_mirror(offset, data);
    }

    /// Write `data` at `offset` as a sequenced update.
    ///
    /// When the backing cannot be written directly, `gpu_copy` is called to
    /// perform the write on the GPU instead. It runs with the buffer's state
    /// locked and must not call back into this buffer. Without a callback,
    /// returns `true` to ask the caller to repeat the write with one.
    pub fn write(
        &self,
        data: &[u8],
        offset: DeviceSize,
        gpu_copy: Option<&mut dyn FnMut()>,
    ) -> bool {
        self.assert_locked();
        let mut state = self.state.lock();
        state.advance_sequence();
        state.ever_had_inline_update = true;

        if state.dirty == DirtyState::GpuDirty {
            return match gpu_copy {
                Some(gpu_copy) => {
                    gpu_copy();
                    false
                }
                None => true,
            };
        }

        if state.dirty == DirtyState::CpuDirty && state.sequenced_writes_blocked() {
            // Sequence the write after the contents the GPU already saw.
            self.synchronize_host_locked(&mut state, false);
        }

        self.write_mirror(offset, data);

        if state.dirty == DirtyState::CpuDirty && !state.sequenced_writes_blocked() {
            // The next host synchronization picks the write up.
            return false;
        }

        if !state.sequenced_writes_blocked() && state.poll_fence() {
            self.backing.write(offset, data);
            false
        } else {
            match gpu_copy {
                Some(gpu_copy) => {
                    gpu_copy();
                    false
                }
                None => true,
            }
        }
    }

    /// Copy `size` bytes from `src` at `src_offset` to `dst_offset`. `src`
    /// may be this buffer.
    pub fn copy_from(
        &self,
        dst_offset: DeviceSize,
        src: &Buffer,
        src_offset: DeviceSize,
        size: DeviceSize,
        gpu_copy: &mut dyn FnMut(),
    ) {
        self.assert_locked();
        src.assert_locked();

        if std::ptr::eq(self, src) {
            let mut state = self.state.lock();
            self.copy_from_locked(&mut state, None, dst_offset, src, src_offset, size, gpu_copy);
            return;
        }

        let (mut dst_state, src_state) = if self.id <= src.id {
            let dst_state = self.state.lock();
            (dst_state, src.state.lock())
        } else {
            let src_state = src.state.lock();
            (self.state.lock(), src_state)
        };
        self.copy_from_locked(
            &mut dst_state,
            Some(src_state.dirty),
            dst_offset,
            src,
            src_offset,
            size,
            gpu_copy,
        );
    }

    /// Up-to-date contents of `[offset, offset + size)` for host reads.
    pub fn read_only_backing_span(
        &self,
        is_first_usage: bool,
        flush_host: &mut dyn FnMut(),
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Vec<u8> {
        let _state = self.lock_guest_synchronized(is_first_usage, flush_host);
        let mut data = vec![0u8; size as usize];
        self.read_mirror(offset, &mut data);
        data
    }

    /// Contents of a host-only buffer's backing.
    ///
    /// # Panics
    ///
    /// Panics for guest-backed buffers, whose backing may be stale.
    pub fn backing_span(&self) -> Vec<u8> {
        assert!(
            self.mirror.is_none(),
            "backing span of guest buffer {} requested",
            self.id
        );
        self.backing.read_vec(0, self.backing.size())
    }

    /// Shared view storage for `[offset, offset + size)` in `format`.
    pub fn view_storage(&self, offset: DeviceSize, size: DeviceSize, format: u32) -> Arc<BufferViewStorage> {
        let mut views = self.views.lock();
        if let Some(existing) = views
            .iter()
            .find(|v| v.offset() == offset && v.size() == size && v.format() == format)
        {
            return existing.clone();
        }
        let storage = Arc::new(BufferViewStorage::new(offset, size, format));
        views.push(storage.clone());
        storage
    }

    // ── Megabuffering ──

    /// Stage `[offset, offset + size)` in a megabuffer for `cycle`, reusing
    /// copies made earlier in the same execution while the contents are
    /// unchanged. Returns an empty binding when the buffer should be bound
    /// directly.
    pub fn try_mega_buffer_view(
        &self,
        cycle: &Arc<FenceCycle>,
        allocator: &mut MegaBufferAllocator,
        execution: ContextTag,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> BufferBinding {
        let Some(mirror) = &self.mirror else {
            return BufferBinding::default();
        };
        let mut state = self.state.lock();

        if (!state.ever_had_inline_update && state.sequence_number < FREQUENTLY_SYNCED_THRESHOLD)
            || size > allocator.max_allocation()
        {
            return BufferBinding::default();
        }

        // The GPU will change the contents, so no copy can be taken ahead.
        if state.dirty == DirtyState::GpuDirty {
            return BufferBinding::default();
        }

        if execution != state.last_execution_tag {
            state.reset_mega_buffer_state();
            state.last_execution_tag = execution;
        }

        let mirror_size = mirror.size();
        if state.unified_mega_buffer_enabled
            || (state.mega_buffer_view_accumulated_size > mirror_size / 2
                && mirror_size <= allocator.max_allocation())
        {
            if !state.unified_mega_buffer.is_valid() {
                let contents = mirror.read_vec(0, mirror_size);
                state.unified_mega_buffer = allocator.push(cycle, &contents, true);
                state.unified_mega_buffer_enabled = true;
                log::trace!("buffer {}: megabuffering unified", self.id);
            }
            return BufferBinding {
                buffer: state.unified_mega_buffer.buffer.clone(),
                offset: state.unified_mega_buffer.offset + offset,
                size,
            };
        }

        if size > MEGA_BUFFERING_DISABLE_THRESHOLD {
            state.mega_buffer_view_accumulated_size += size;
            return BufferBinding::default();
        }

        let shift = state.mega_buffer_table_shift;
        let index = (offset >> shift) as usize;
        let entry_offset = (index as DeviceSize) << shift;
        let entry_view_offset = offset - entry_offset;
        if index >= state.mega_buffer_table.len() {
            return BufferBinding::default();
        }

        let cached_size = state.mega_buffer_table[index].size;
        if !state.entry_valid(index) || cached_size < entry_view_offset + size {
            // Grow to the largest size seen so later views reuse the entry.
            let region = (entry_view_offset + size)
                .max(cached_size)
                .min(mirror_size - entry_offset);
            if region > allocator.max_allocation() {
                return BufferBinding::default();
            }
            let contents = mirror.read_vec(entry_offset, region);
            state.mega_buffer_table[index] = allocator.push(cycle, &contents, true);
            state.set_entry_valid(index);
            state.mega_buffer_view_accumulated_size += region;
            state.mega_buffer_table_used = true;
        }

        let allocation = &state.mega_buffer_table[index];
        BufferBinding {
            buffer: allocation.buffer.clone(),
            offset: allocation.offset + entry_view_offset,
            size,
        }
    }

    // ── Coalescing hooks ──

    /// Set up this buffer as the union of `sources`, each given with its
    /// offset in this buffer and whether it is in its first usage.
    ///
    /// The caller holds the ownership lock of this buffer and of every
    /// source. This buffer's state lock is then held from arming its traps
    /// until every source is absorbed, so no guest fault observes it half
    /// merged. Source states are locked after it.
    pub(crate) fn coalesce_from(
        self: &Arc<Self>,
        cycle: Option<Arc<FenceCycle>>,
        sources: &[(&Buffer, DeviceSize, bool)],
    ) -> BufferResult<()> {
        self.assert_locked();
        let mut state = self.state.lock();
        self.setup_guest_mappings_locked(&mut state)?;
        // Sources need not cover the whole range.
        self.synchronize_host_locked(&mut state, false);
        state.cycle = cycle;
        for &(src, offset, src_first_usage) in sources {
            src.assert_locked();
            self.absorb_locked(&mut state, src, offset, src_first_usage);
        }
        drop(state);

        for &(src, offset, _) in sources {
            let src_views = std::mem::take(&mut *src.views.lock());
            for view in &src_views {
                view.shift(offset);
            }
            self.views.lock().extend(src_views);
        }
        Ok(())
    }

    fn absorb_locked(
        &self,
        state: &mut BufferState,
        src: &Buffer,
        offset: DeviceSize,
        src_first_usage: bool,
    ) {
        let src_state = src.state.lock();

        if state.immutability == BackingImmutability::None
            && src_state.immutability != BackingImmutability::None
        {
            state.immutability = src_state.immutability;
        } else if src_state.immutability == BackingImmutability::AllWrites {
            state.immutability = BackingImmutability::AllWrites;
        }
        state.ever_had_inline_update |= src_state.ever_had_inline_update;

        let src_size = src.backing.size();
        if src_state.dirty == DirtyState::GpuDirty {
            if src_first_usage && state.dirty != DirtyState::GpuDirty {
                // The source's GPU work has completed, refresh the guest copy.
                if let Some(mirror) = &self.mirror {
                    copy_mapped(mirror.as_ref(), offset, src.backing.as_ref(), 0, src_size);
                }
            } else {
                self.mark_gpu_dirty_locked(state);
            }
            copy_mapped(self.backing.as_ref(), offset, src.backing.as_ref(), 0, src_size);
        } else if src_state.all_writes_blocked() {
            if src_state.dirty == DirtyState::CpuDirty {
                log::error!(
                    "buffer {}: CPU dirty source {} has all backing writes blocked",
                    self.id,
                    src.id
                );
            }
            copy_mapped(self.backing.as_ref(), offset, src.backing.as_ref(), 0, src_size);
        }
    }


    // ── Internal helpers ──

    fn read_mirror(&self, offset: DeviceSize, data: &mut [u8]) {
        match &self.mirror {
            Some(mirror) => mirror.read(offset, data),
            None => self.backing.read(offset, data),
        }
    }

    fn write_mirror(&self, offset: DeviceSize, data: &[u8]) {
        if let Some(mirror) = &self.mirror {
            mirror.write(offset, data);
        }
    }

    fn synchronize_host_locked(&self, state: &mut BufferState, skip_trap: bool) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        if state.guest.is_none() || state.dirty != DirtyState::CpuDirty {
            return;
        }

        state.dirty = DirtyState::Clean;
        state.wait_on_fence();
        state.advance_sequence();

        if !skip_trap {
            if let Some(trap) = state.trap {
                self.device.memory.trap_regions(trap, true);
            }
        }

        copy_mapped(self.backing.as_ref(), 0, mirror.as_ref(), 0, mirror.size());
        log::trace!("buffer {}: synchronized host", self.id);
    }

    fn synchronize_guest_locked(
        &self,
        state: &mut BufferState,
        skip_trap: bool,
        non_blocking: bool,
    ) -> bool {
        let Some(mirror) = &self.mirror else {
            return false;
        };
        if state.guest.is_none() {
            return false;
        }
        if state.dirty != DirtyState::GpuDirty {
            return true;
        }
        if non_blocking && !state.poll_fence() {
            return false;
        }

        state.wait_on_fence();
        copy_mapped(mirror.as_ref(), 0, self.backing.as_ref(), 0, mirror.size());
        state.dirty = DirtyState::Clean;

        if !skip_trap {
            if let Some(trap) = state.trap {
                self.device.memory.trap_regions(trap, true);
            }
        }
        log::trace!("buffer {}: synchronized guest", self.id);
        true
    }

    /// Lock the state with the mirror up to date. Work recorded against the
    /// buffer in the current batch must be submitted before its fence can be
    /// waited on, so `flush_host` runs first, outside the state lock, as it
    /// may call back into this buffer.
    fn lock_guest_synchronized(
        &self,
        is_first_usage: bool,
        flush_host: &mut dyn FnMut(),
    ) -> MutexGuard<'_, BufferState> {
        let mut state = self.state.lock();
        if state.dirty == DirtyState::GpuDirty && !is_first_usage {
            drop(state);
            flush_host();
            state = self.state.lock();
        }
        if state.dirty == DirtyState::GpuDirty {
            self.synchronize_guest_locked(&mut state, false, false);
        }
        state
    }

    fn mark_gpu_dirty_locked(&self, state: &mut BufferState) {
        if state.guest.is_none() {
            return;
        }
        state.current_execution_gpu_dirty = true;
        if state.dirty == DirtyState::GpuDirty {
            return;
        }

        // Trap before synchronizing, which skips trapping.
        if let Some(trap) = state.trap {
            self.device.memory.trap_regions(trap, false);
        }

        if state.dirty == DirtyState::CpuDirty {
            self.synchronize_host_locked(state, true);
        }

        if let Some(trap) = state.trap {
            self.device.memory.page_out(trap);
        }

        state.dirty = DirtyState::GpuDirty;
        state.immutability = BackingImmutability::AllWrites;
        state.advance_sequence();
        log::trace!("buffer {}: marked GPU dirty", self.id);
    }

    /// `src_dirty` is `None` when copying within this buffer.
    #[allow(clippy::too_many_arguments)]
    fn copy_from_locked(
        &self,
        state: &mut BufferState,
        src_dirty: Option<DirtyState>,
        dst_offset: DeviceSize,
        src: &Buffer,
        src_offset: DeviceSize,
        size: DeviceSize,
        gpu_copy: &mut dyn FnMut(),
    ) {
        state.advance_sequence();
        state.ever_had_inline_update = true;

        if state.dirty == DirtyState::CpuDirty && state.sequenced_writes_blocked() {
            self.synchronize_host_locked(state, false);
        }

        let src_dirty = src_dirty.unwrap_or(state.dirty);

        if state.dirty != DirtyState::GpuDirty && src_dirty != DirtyState::GpuDirty {
            let mut data = vec![0u8; size as usize];
            src.read_mirror(src_offset, &mut data);
            self.write_mirror(dst_offset, &data);

            if state.dirty == DirtyState::CpuDirty && !state.sequenced_writes_blocked() {
                return;
            }

            if !state.sequenced_writes_blocked() && state.poll_fence() {
                self.backing.write(dst_offset, &data);
            } else {
                gpu_copy();
            }
        } else {
            self.mark_gpu_dirty_locked(state);
            gpu_copy();
        }
    }
}

impl TrapHandler for Buffer {
    fn on_pre_access(&self) {
        {
            let state = self.state.lock();
            if !state.all_writes_blocked() && state.dirty != DirtyState::GpuDirty {
                return;
            }
        }

        // Wait out every GPU usage so the fault handlers can make progress.
        let mut wait_cycle: Option<Arc<FenceCycle>> = None;
        loop {
            if let Some(cycle) = &wait_cycle {
                let timed = self.guest_wait_counter.load(Ordering::Relaxed)
                    > FAST_READBACK_WAIT_COUNT_THRESHOLD;
                let start = timed.then(Instant::now);
                cycle.wait();
                if let Some(start) = start {
                    self.guest_wait_time_ns
                        .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                }
                self.guest_wait_counter.fetch_add(1, Ordering::Relaxed);
            }

            self.lock();
            let mut state = self.state.lock();
            let waited_current = match (&wait_cycle, &state.cycle) {
                (Some(waited), Some(current)) => Arc::ptr_eq(waited, current),
                _ => false,
            };
            if waited_current {
                state.cycle = None;
                wait_cycle = None;
            } else {
                wait_cycle = state.cycle.clone();
            }
            self.unlock_locked(&mut state);
            drop(state);

            if wait_cycle.is_none() {
                break;
            }
        }
    }

    fn on_read_fault(&self) -> bool {
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };
        if state.dirty != DirtyState::GpuDirty {
            return true;
        }

        if !self.try_lock() {
            return false;
        }
        let handled = if state.cycle.is_some() {
            false
        } else {
            // Guest memory lowers the trap itself.
            self.synchronize_guest_locked(&mut state, true, false);
            true
        };
        self.unlock_locked(&mut state);
        handled
    }

    fn on_write_fault(&self) -> bool {
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };

        if !state.all_writes_blocked() && state.dirty != DirtyState::GpuDirty {
            state.dirty = DirtyState::CpuDirty;
            return true;
        }

        let settings = &self.device.settings;
        let waited = Duration::from_nanos(self.guest_wait_time_ns.load(Ordering::Relaxed));
        if waited > FAST_READBACK_WAIT_TIME_THRESHOLD && settings.enable_fast_gpu_readback {
            // Read back without waiting: possibly stale, but never blocks the guest.
            if let Some(mirror) = &self.mirror {
                copy_mapped(mirror.as_ref(), 0, self.backing.as_ref(), 0, mirror.size());
            }
            state.dirty = if settings.enable_fast_readback_writes {
                DirtyState::CpuDirty
            } else {
                DirtyState::Clean
            };
            return true;
        }

        if !self.try_lock() {
            return false;
        }
        let handled = if state.cycle.is_some() {
            false
        } else {
            // The guest may write anywhere in the page, assume the mirror
            // ends up dirty.
            self.synchronize_guest_locked(&mut state, true, false);
            state.dirty = DirtyState::CpuDirty;
            true
        };
        self.unlock_locked(&mut state);
        handled
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(trap) = state.trap.take() {
            self.device.memory.delete_trap(trap);
        }

        let mut state = std::mem::replace(state, BufferState::new(None, 0));
        self.synchronize_guest_locked(&mut state, true, false);
        state.wait_on_fence();
        log::trace!("buffer {}: destroyed", self.id);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.backing.size())
            .field("delegate", &self.delegate)
            .finish()
    }
}
