// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software implementation of the guest memory interfaces: an anonymous
//! mapping standing in for guest RAM, host mirrors aliasing it, and an
//! emulated page-trap manager.

pub mod guest_memory;
pub mod trap_map;

pub use guest_memory::{SoftGuestMemory, SoftMirror};
pub use trap_map::MemoryPermission;
