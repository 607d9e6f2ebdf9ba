// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interfaces to the guest memory subsystem.
//!
//! The GPU layer never touches guest memory directly. It asks the guest
//! memory implementation for a linear host mirror of a [`GuestBuffer`] and
//! for page traps over the same spans, and is called back through
//! [`TrapHandler`] when the guest touches trapped pages.

use std::sync::{Arc, Weak};

use crate::error::GuestMemoryResult;
use crate::types::{DeviceSize, GuestBuffer};

/// Linear host-side view of some memory, addressed by byte offset.
///
/// Implementations must tolerate concurrent readers and writers; callers
/// provide any ordering they need.
pub trait MappedMemory: Send + Sync {
    /// Size of the mapping in bytes.
    fn size(&self) -> DeviceSize;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn read(&self, offset: DeviceSize, dst: &mut [u8]);

    /// Copy `src` into the mapping starting at `offset`.
    fn write(&self, offset: DeviceSize, src: &[u8]);

    /// Read `size` bytes at `offset` into a new vector.
    fn read_vec(&self, offset: DeviceSize, size: DeviceSize) -> Vec<u8> {
        let mut data = vec![0u8; size as usize];
        self.read(offset, &mut data);
        data
    }
}

/// Copy `size` bytes between two mappings.
pub fn copy_mapped(
    dst: &dyn MappedMemory,
    dst_offset: DeviceSize,
    src: &dyn MappedMemory,
    src_offset: DeviceSize,
    size: DeviceSize,
) {
    if size == 0 {
        return;
    }
    let data = src.read_vec(src_offset, size);
    dst.write(dst_offset, &data);
}

/// Protection level of a trap, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TrapProtection {
    /// No accesses fault.
    #[default]
    None,
    /// Writes fault, reads pass.
    WriteOnly,
    /// Reads and writes fault.
    ReadWrite,
}

/// Opaque handle to a trap registered with [`GuestMemory::create_trap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapHandle(pub u64);

/// Callbacks invoked when the guest touches trapped pages.
///
/// The read and write callbacks run with the guest memory's trap lock held
/// and must not block; returning `false` makes the guest memory release the
/// lock, call [`TrapHandler::on_pre_access`] (which may block) and retry.
pub trait TrapHandler: Send + Sync {
    /// Block until the resource can service a fault without contention.
    fn on_pre_access(&self);

    /// A trapped page was read. Returns `false` to request a retry.
    fn on_read_fault(&self) -> bool;

    /// A trapped page was written. Returns `false` to request a retry.
    fn on_write_fault(&self) -> bool;
}

/// The guest memory subsystem as seen by the GPU layer.
pub trait GuestMemory: Send + Sync {
    /// Create a linear host mapping aliasing the spans of `guest`.
    fn create_mirror(&self, guest: &GuestBuffer) -> GuestMemoryResult<Arc<dyn MappedMemory>>;

    /// Register a trap over the spans of `guest`. The trap starts with
    /// [`TrapProtection::None`]. A dead `handler` allows every access.
    fn create_trap(
        &self,
        guest: &GuestBuffer,
        handler: Weak<dyn TrapHandler>,
    ) -> GuestMemoryResult<TrapHandle>;

    /// Arm the trap: write-only or read-write protection.
    fn trap_regions(&self, handle: TrapHandle, write_only: bool);

    /// Disarm the trap without deleting it.
    fn remove_trap(&self, handle: TrapHandle);

    /// Disarm and forget the trap.
    fn delete_trap(&self, handle: TrapHandle);

    /// Discard the guest contents of pages fully covered by the trap.
    fn page_out(&self, handle: TrapHandle);
}
