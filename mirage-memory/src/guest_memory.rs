// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software guest memory.
//!
//! A window of guest address space `[base, base + size)` backed by an
//! anonymous mmap. Host mirrors alias the same bytes, so writes through a
//! mirror are immediately visible to the guest and vice versa. Page traps
//! are emulated: guest accesses made through [`SoftGuestMemory::read`] and
//! [`SoftGuestMemory::write`] consult the trap map page by page and run the
//! registered handlers before touching memory, the way a host fault handler
//! would on a protected page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use mirage_common::memory::{
    GuestMemory, MappedMemory, TrapHandle, TrapHandler, TrapProtection,
};
use mirage_common::{
    align_down, align_up, DeviceSize, GuestBuffer, GuestMemoryError, GuestMemoryResult,
    GuestSpan, VAddr, PAGE_SHIFT, PAGE_SIZE_U64,
};

use crate::trap_map::{FaultOutcome, MemoryPermission, TrapMap};

// ---------------------------------------------------------------------------
// Backing arena
// ---------------------------------------------------------------------------

type Arena = Arc<RwLock<MmapMut>>;

/// A linear host mapping over one or more guest spans of the arena.
pub struct SoftMirror {
    arena: Arena,
    /// `(arena offset, length)` of each span, in mirror order.
    segments: Vec<(usize, usize)>,
    size: DeviceSize,
}

impl SoftMirror {
    /// Walk the segments overlapping `[offset, offset + len)`, yielding
    /// `(arena offset, position in caller buffer, length)`.
    fn for_each_segment(&self, offset: DeviceSize, len: usize, mut f: impl FnMut(usize, usize, usize)) {
        assert!(
            offset + len as u64 <= self.size,
            "mirror access [{:#X}..+{:#X}) exceeds mirror size {:#X}",
            offset,
            len,
            self.size
        );

        let mut remaining = len;
        let mut position = 0usize;
        let mut cursor = offset as usize;
        for &(arena_offset, segment_len) in &self.segments {
            if remaining == 0 {
                break;
            }
            if cursor >= segment_len {
                cursor -= segment_len;
                continue;
            }
            let chunk = remaining.min(segment_len - cursor);
            f(arena_offset + cursor, position, chunk);
            position += chunk;
            remaining -= chunk;
            cursor = 0;
        }
    }
}

impl MappedMemory for SoftMirror {
    fn size(&self) -> DeviceSize {
        self.size
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) {
        let map = self.arena.read();
        self.for_each_segment(offset, dst.len(), |at, pos, len| {
            dst[pos..pos + len].copy_from_slice(&map[at..at + len]);
        });
    }

    fn write(&self, offset: DeviceSize, src: &[u8]) {
        let mut map = self.arena.write();
        self.for_each_segment(offset, src.len(), |at, pos, len| {
            map[at..at + len].copy_from_slice(&src[pos..pos + len]);
        });
    }
}

// ---------------------------------------------------------------------------
// SoftGuestMemory
// ---------------------------------------------------------------------------

/// Guest memory with emulated page traps.
pub struct SoftGuestMemory {
    base: VAddr,
    size: u64,
    arena: Arena,
    traps: Mutex<TrapMap>,
    read_faults: AtomicU64,
    write_faults: AtomicU64,
}

impl SoftGuestMemory {
    /// Create a zero-filled guest window of `size` bytes at `base`.
    pub fn new(base: VAddr, size: u64) -> GuestMemoryResult<Self> {
        if size == 0 {
            return Err(GuestMemoryError::Empty);
        }
        let map = MmapMut::map_anon(size as usize)?;
        log::debug!(
            "guest memory: mapped {:#X} bytes at {:#018X}",
            size,
            base
        );
        Ok(Self {
            base,
            size,
            arena: Arc::new(RwLock::new(map)),
            traps: Mutex::new(TrapMap::default()),
            read_faults: AtomicU64::new(0),
            write_faults: AtomicU64::new(0),
        })
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of `(read, write)` accesses that hit a trap.
    pub fn fault_counts(&self) -> (u64, u64) {
        (
            self.read_faults.load(Ordering::Relaxed),
            self.write_faults.load(Ordering::Relaxed),
        )
    }

    /// Number of live traps.
    pub fn trap_count(&self) -> usize {
        self.traps.lock().len()
    }

    /// Effective permission of the page containing `addr`.
    pub fn page_permission(&self, addr: VAddr) -> MemoryPermission {
        self.traps.lock().protection_of_page(addr >> PAGE_SHIFT).into()
    }

    /// Guest read: faults on read-write trapped pages.
    pub fn read(&self, addr: VAddr, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let start = self.arena_offset(addr, dst.len() as u64)?;
        let mut done = 0usize;
        while done < dst.len() {
            let va = addr + done as u64;
            let chunk = page_chunk(va, dst.len() - done);
            let at = start + done;
            self.access_page(va, false, || {
                let map = self.arena.read();
                dst[done..done + chunk].copy_from_slice(&map[at..at + chunk]);
            });
            done += chunk;
        }
        Ok(())
    }

    /// Guest write: faults on any trapped page.
    pub fn write(&self, addr: VAddr, src: &[u8]) -> GuestMemoryResult<()> {
        let start = self.arena_offset(addr, src.len() as u64)?;
        let mut done = 0usize;
        while done < src.len() {
            let va = addr + done as u64;
            let chunk = page_chunk(va, src.len() - done);
            let at = start + done;
            self.access_page(va, true, || {
                let mut map = self.arena.write();
                map[at..at + chunk].copy_from_slice(&src[done..done + chunk]);
            });
            done += chunk;
        }
        Ok(())
    }

    /// Host-side read that bypasses traps.
    pub fn read_host(&self, addr: VAddr, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let at = self.arena_offset(addr, dst.len() as u64)?;
        let map = self.arena.read();
        dst.copy_from_slice(&map[at..at + dst.len()]);
        Ok(())
    }

    /// Host-side write that bypasses traps.
    pub fn write_host(&self, addr: VAddr, src: &[u8]) -> GuestMemoryResult<()> {
        let at = self.arena_offset(addr, src.len() as u64)?;
        let mut map = self.arena.write();
        map[at..at + src.len()].copy_from_slice(src);
        Ok(())
    }

    // ── Internal helpers ──

    fn arena_offset(&self, addr: VAddr, len: u64) -> GuestMemoryResult<usize> {
        if addr < self.base || addr + len > self.base + self.size {
            return Err(GuestMemoryError::OutOfRange(addr, len));
        }
        Ok((addr - self.base) as usize)
    }

    fn check_buffer(&self, guest: &GuestBuffer) -> GuestMemoryResult<()> {
        for span in guest.spans() {
            self.arena_offset(span.addr, span.size)?;
        }
        Ok(())
    }

    /// Service traps on the page containing `addr`, then run `access` with
    /// the trap lock held so no trap can be re-armed mid-access.
    fn access_page(&self, addr: VAddr, write: bool, access: impl FnOnce()) {
        let page = addr >> PAGE_SHIFT;
        let mut faulted = false;
        let mut pre_access: Option<Arc<dyn TrapHandler>> = None;
        loop {
            if let Some(handler) = pre_access.take() {
                handler.on_pre_access();
            }

            let mut held = Vec::new();
            let mut traps = self.traps.lock();
            let protection = traps.protection_of_page(page);
            let faults = if write {
                protection != TrapProtection::None
            } else {
                protection == TrapProtection::ReadWrite
            };
            if faults && !faulted {
                faulted = true;
                let counter = if write { &self.write_faults } else { &self.read_faults };
                counter.fetch_add(1, Ordering::Relaxed);
            }

            match traps.service_fault(page, write, &mut held) {
                FaultOutcome::Allowed => {
                    access();
                    drop(traps);
                    return;
                }
                FaultOutcome::Retry(handler) => {
                    drop(traps);
                    pre_access = Some(handler);
                }
            }
        }
    }
}

impl GuestMemory for SoftGuestMemory {
    fn create_mirror(&self, guest: &GuestBuffer) -> GuestMemoryResult<Arc<dyn MappedMemory>> {
        self.check_buffer(guest)?;
        let segments = guest
            .spans()
            .iter()
            .map(|s| ((s.addr - self.base) as usize, s.size as usize))
            .collect();
        Ok(Arc::new(SoftMirror {
            arena: self.arena.clone(),
            segments,
            size: guest.size(),
        }))
    }

    fn create_trap(
        &self,
        guest: &GuestBuffer,
        handler: Weak<dyn TrapHandler>,
    ) -> GuestMemoryResult<TrapHandle> {
        self.check_buffer(guest)?;
        let handle = self.traps.lock().insert(guest.spans().to_vec(), handler);
        log::trace!("guest memory: created trap {:?} over {}", handle, guest.hull());
        Ok(handle)
    }

    fn trap_regions(&self, handle: TrapHandle, write_only: bool) {
        let mut traps = self.traps.lock();
        match traps.get_mut(handle) {
            Some(entry) => {
                entry.protection = if write_only {
                    TrapProtection::WriteOnly
                } else {
                    TrapProtection::ReadWrite
                };
            }
            None => log::warn!("guest memory: trap_regions on unknown trap {:?}", handle),
        }
    }

    fn remove_trap(&self, handle: TrapHandle) {
        let mut traps = self.traps.lock();
        if let Some(entry) = traps.get_mut(handle) {
            entry.protection = TrapProtection::None;
        }
    }

    fn delete_trap(&self, handle: TrapHandle) {
        let removed = self.traps.lock().remove(handle);
        if removed.is_none() {
            log::warn!("guest memory: delete_trap on unknown trap {:?}", handle);
        }
    }

    fn page_out(&self, handle: TrapHandle) {
        let regions: Vec<GuestSpan> = match self.traps.lock().get(handle) {
            Some(entry) => entry.regions.clone(),
            None => return,
        };

        let mut map = self.arena.write();
        for region in regions {
            let start = align_up(region.addr, PAGE_SIZE_U64);
            let end = align_down(region.end(), PAGE_SIZE_U64);
            if start >= end {
                continue;
            }
            let at = (start - self.base) as usize;
            let len = (end - start) as usize;
            map[at..at + len].fill(0);
        }
    }
}

/// Bytes from `addr` up to the next page boundary, capped at `remaining`.
fn page_chunk(addr: VAddr, remaining: usize) -> usize {
    let page_end = align_down(addr, PAGE_SIZE_U64) + PAGE_SIZE_U64;
    remaining.min((page_end - addr) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const BASE: VAddr = 0x1_0000_0000;

    fn memory() -> SoftGuestMemory {
        SoftGuestMemory::new(BASE, 0x10_0000).unwrap()
    }

    struct FlagHandler {
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl TrapHandler for FlagHandler {
        fn on_pre_access(&self) {}

        fn on_read_fault(&self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_write_fault(&self) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_read_write_roundtrip() {
        let mem = memory();
        mem.write(BASE + 0xFF0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20])
            .unwrap();
        let mut buf = [0u8; 20];
        mem.read(BASE + 0xFF0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[19], 20);
    }

    #[test]
    fn test_out_of_range() {
        let mem = memory();
        let mut buf = [0u8; 4];
        assert!(matches!(
            mem.read(BASE - 4, &mut buf),
            Err(GuestMemoryError::OutOfRange(..))
        ));
        assert!(mem.write(BASE + 0x10_0000 - 2, &buf).is_err());
    }

    #[test]
    fn test_mirror_aliases_guest() {
        let mem = memory();
        let guest = GuestBuffer::new(vec![
            GuestSpan::new(BASE + 0x1800, 0x800),
            GuestSpan::new(BASE + 0x8000, 0x1000),
        ])
        .unwrap();
        let mirror = mem.create_mirror(&guest).unwrap();
        assert_eq!(mirror.size(), 0x1800);

        // Write across the join between the two spans.
        mirror.write(0x7FE, &[0xAA, 0xBB, 0xCC, 0xDD]);

        let mut buf = [0u8; 2];
        mem.read_host(BASE + 0x1FFE, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
        mem.read_host(BASE + 0x8000, &mut buf).unwrap();
        assert_eq!(buf, [0xCC, 0xDD]);

        mem.write_host(BASE + 0x8002, &[0xEE]).unwrap();
        let data = mirror.read_vec(0x800, 4);
        assert_eq!(data, vec![0xCC, 0xDD, 0xEE, 0x00]);
    }

    #[test]
    fn test_traps_fire_once_per_arming() {
        let mem = memory();
        let handler = Arc::new(FlagHandler {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        });
        let dyn_handler: Arc<dyn TrapHandler> = handler.clone();
        let guest = GuestBuffer::contiguous(GuestSpan::new(BASE + 0x2000, 0x2000));
        let trap = mem.create_trap(&guest, Arc::downgrade(&dyn_handler)).unwrap();
        assert_eq!(mem.page_permission(BASE + 0x2000), MemoryPermission::READ_WRITE);

        mem.trap_regions(trap, false);
        assert_eq!(mem.page_permission(BASE + 0x3000), MemoryPermission::NONE);

        let mut buf = [0u8; 8];
        mem.read(BASE + 0x2000, &mut buf).unwrap();
        mem.read(BASE + 0x2100, &mut buf).unwrap();
        assert_eq!(handler.reads.load(Ordering::SeqCst), 1);
        assert_eq!(mem.page_permission(BASE + 0x2000), MemoryPermission::READ);

        mem.write(BASE + 0x2000, &buf).unwrap();
        mem.write(BASE + 0x2008, &buf).unwrap();
        assert_eq!(handler.writes.load(Ordering::SeqCst), 1);
        assert_eq!(mem.page_permission(BASE + 0x2000), MemoryPermission::READ_WRITE);
        assert_eq!(mem.fault_counts(), (1, 1));

        mem.delete_trap(trap);
        assert_eq!(mem.trap_count(), 0);
    }

    #[test]
    fn test_page_out_zeroes_covered_pages_only() {
        let mem = memory();
        mem.write_host(BASE + 0x1FF0, &[0x11; 0x2020]).unwrap();

        let handler: Arc<dyn TrapHandler> = Arc::new(FlagHandler {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        });
        let guest = GuestBuffer::contiguous(GuestSpan::new(BASE + 0x1FF0, 0x2020));
        let trap = mem.create_trap(&guest, Arc::downgrade(&handler)).unwrap();
        mem.page_out(trap);

        let mut byte = [0u8; 1];
        // Partially covered head and tail pages survive.
        mem.read_host(BASE + 0x1FF0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x11);
        mem.read_host(BASE + 0x4000, &mut byte).unwrap();
        assert_eq!(byte[0], 0x11);
        // Fully covered pages are discarded.
        mem.read_host(BASE + 0x2000, &mut byte).unwrap();
        assert_eq!(byte[0], 0);
        mem.read_host(BASE + 0x3FFF, &mut byte).unwrap();
        assert_eq!(byte[0], 0);
    }
}
