// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host GPU backend abstraction.
//!
//! The buffer layer needs a small slice of a GPU API: host-visible buffers,
//! binary semaphores, fences, command buffers that can copy and inline-update
//! buffers, and a queue to submit them to. [`SoftBackend`] executes all of it
//! on a worker thread; the Vulkan backend maps it onto `ash`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use mirage_common::memory::MappedMemory;
use mirage_common::DeviceSize;

pub mod soft_backend;
#[cfg(feature = "vulkan")]
pub mod vulkan_backend;

pub use soft_backend::SoftBackend;
#[cfg(feature = "vulkan")]
pub use vulkan_backend::VulkanBackend;

/// Raw handle of a backend buffer, stable for the buffer's lifetime.
pub type BufferHandle = u64;

/// Errors returned by backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("out of device memory allocating {0:#X} bytes")]
    OutOfMemory(DeviceSize),

    #[error("device lost")]
    DeviceLost,

    #[error("submission queue is closed")]
    QueueClosed,

    #[error("command buffer used in the wrong state: {0}")]
    InvalidState(&'static str),

    #[error("object does not belong to the {0} backend")]
    ForeignObject(&'static str),

    #[error("backend initialization failed: {0}")]
    Initialization(String),

    #[error("driver error: {0}")]
    Driver(String),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

bitflags! {
    /// Pipeline stages a semaphore wait blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE  = 0x0001;
        const TRANSFER     = 0x1000;
        const ALL_COMMANDS = 0x1_0000;
    }
}

/// A host-visible GPU buffer, persistently mapped.
pub trait HostBuffer: MappedMemory {
    fn handle(&self) -> BufferHandle;
}

/// A binary fence signalled by the queue when a submission completes.
pub trait HostFence: Send + Sync {
    fn handle(&self) -> u64;

    /// Return the fence to the unsignalled state.
    fn reset(&self) -> BackendResult<()>;

    /// Block until signalled. `Ok(false)` means the timeout expired.
    fn wait(&self, timeout: Option<Duration>) -> BackendResult<bool>;

    fn is_signalled(&self) -> BackendResult<bool>;

    fn as_any(&self) -> &dyn Any;
}

/// A binary semaphore used to order submissions on the GPU.
pub trait HostSemaphore: Send + Sync {
    fn handle(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

/// A recordable command buffer.
pub trait CommandBuffer: Send {
    fn begin(&mut self) -> BackendResult<()>;
    fn end(&mut self) -> BackendResult<()>;
    fn reset(&mut self) -> BackendResult<()>;

    fn copy_buffer(
        &mut self,
        src: &Arc<dyn HostBuffer>,
        src_offset: DeviceSize,
        dst: &Arc<dyn HostBuffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
    );

    fn update_buffer(&mut self, dst: &Arc<dyn HostBuffer>, dst_offset: DeviceSize, data: &[u8]);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Allocator of command buffers. Pools are used from a single thread.
pub trait CommandPool: Send {
    fn allocate(&mut self) -> BackendResult<Box<dyn CommandBuffer>>;
}

/// A semaphore wait attached to a submission.
pub type SemaphoreWait = (Arc<dyn HostSemaphore>, PipelineStage);

/// Trait for GPU backends.
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &str;

    fn allocate_buffer(&self, size: DeviceSize) -> BackendResult<Arc<dyn HostBuffer>>;

    fn create_fence(&self, signalled: bool) -> BackendResult<Arc<dyn HostFence>>;

    fn create_semaphore(&self) -> BackendResult<Arc<dyn HostSemaphore>>;

    fn create_command_pool(&self) -> BackendResult<Box<dyn CommandPool>>;

    /// Submit a recorded command buffer. Callers serialize submissions.
    fn submit(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        waits: &[SemaphoreWait],
        signals: &[Arc<dyn HostSemaphore>],
        fence: &Arc<dyn HostFence>,
    ) -> BackendResult<()>;
}
