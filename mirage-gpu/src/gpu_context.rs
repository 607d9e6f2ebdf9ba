// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Central GPU context.
//!
//! Owns the command scheduler, the buffer manager and the megabuffer
//! allocator, and shares the backend, guest memory and settings with every
//! buffer through [`GpuDevice`].

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use mirage_common::memory::GuestMemory;
use mirage_common::settings::Settings;

use crate::backend::{BackendError, GpuBackend};
use crate::buffer::MIN_MEGABUFFER_CHUNK_SIZE;
use crate::buffer_manager::BufferManager;
use crate::command_scheduler::{CommandScheduler, SchedulerError};
use crate::megabuffer::MegaBufferAllocator;

#[derive(Debug, Error)]
pub enum GpuContextError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("megabuffer chunk size {0:#X} is below the minimum of {1:#X}")]
    ChunkTooSmall(u64, u64),
}

/// What every buffer needs to reach: the host GPU, guest memory and the
/// settings in effect.
pub struct GpuDevice {
    pub backend: Arc<dyn GpuBackend>,
    pub memory: Arc<dyn GuestMemory>,
    pub settings: Settings,
}

pub struct GpuContext {
    pub device: Arc<GpuDevice>,
    pub scheduler: CommandScheduler,
    pub buffer: BufferManager,
    /// Only used from GPU executions, which must hold this lock while
    /// staging data.
    pub megabuffer: Mutex<MegaBufferAllocator>,
}

impl GpuContext {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        memory: Arc<dyn GuestMemory>,
        settings: Settings,
    ) -> Result<Self, GpuContextError> {
        if settings.megabuffer_chunk_size < MIN_MEGABUFFER_CHUNK_SIZE {
            return Err(GpuContextError::ChunkTooSmall(
                settings.megabuffer_chunk_size,
                MIN_MEGABUFFER_CHUNK_SIZE,
            ));
        }
        let scheduler = CommandScheduler::new(backend.clone(), settings.fence_cycle_queue_depth)?;
        let megabuffer = MegaBufferAllocator::new(backend.clone(), settings.megabuffer_chunk_size)?;
        log::info!(
            "GpuContext: {} backend, megabuffer chunks of {:#X} bytes",
            backend.name(),
            settings.megabuffer_chunk_size
        );

        let device = Arc::new(GpuDevice {
            backend,
            memory,
            settings,
        });
        Ok(Self {
            buffer: BufferManager::new(device.clone()),
            device,
            scheduler,
            megabuffer: Mutex::new(megabuffer),
        })
    }
}
