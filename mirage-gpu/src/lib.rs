// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU buffer coherence layer for mirage.
//!
//! Keeps host GPU buffers coherent with the guest memory they mirror, using
//! page traps to catch guest accesses and fence cycles to track GPU work.

pub mod backend;
pub mod buffer;
pub mod buffer_manager;
pub mod buffer_view;
pub mod command_scheduler;
pub mod context_lock;
pub mod fence_cycle;
pub mod gpu_context;
pub mod megabuffer;
pub mod segment_table;

pub use buffer::{BackingImmutability, Buffer, BufferError, BufferResult, DirtyState};
pub use buffer_manager::{BufferManager, LockedBuffer};
pub use buffer_view::{BufferView, BufferViewStorage, DelegateArena, DelegateId};
pub use command_scheduler::{ActiveCommandBuffer, CommandScheduler, SchedulerError};
pub use context_lock::{ContextLock, ContextTag};
pub use fence_cycle::FenceCycle;
pub use gpu_context::{GpuContext, GpuContextError, GpuDevice};
pub use megabuffer::{BufferBinding, MegaBufferAllocation, MegaBufferAllocator};
