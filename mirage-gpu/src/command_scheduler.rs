// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command buffer allocation, submission and completion tracking.
//!
//! Each submitting thread gets its own command pool. A pool's slots are
//! recycled once their previous submission has signalled. Every submission
//! is pushed onto a bounded queue drained by a waiter thread, which waits on
//! the cycles in submission order so their dependencies are released even if
//! nobody else waits on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::backend::{
    BackendError, CommandBuffer, CommandPool, GpuBackend, HostFence, HostSemaphore,
    PipelineStage, SemaphoreWait,
};
use crate::fence_cycle::FenceCycle;

/// Errors returned by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("cycle waiter thread has stopped")]
    WaiterStopped,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

struct CommandBufferSlot {
    /// Set while the slot is handed out for recording.
    active: AtomicBool,
    command_buffer: Mutex<Box<dyn CommandBuffer>>,
    fence: Arc<dyn HostFence>,
    semaphore: Arc<dyn HostSemaphore>,
    /// Latest cycle on the fence; all waits go through it.
    cycle: Mutex<Arc<FenceCycle>>,
}

impl CommandBufferSlot {
    fn new(backend: &dyn GpuBackend, command_buffer: Box<dyn CommandBuffer>) -> SchedulerResult<Self> {
        let fence = backend.create_fence(false)?;
        let semaphore = backend.create_semaphore()?;
        let cycle = FenceCycle::new(fence.clone(), semaphore.clone(), false)?;
        Ok(Self {
            active: AtomicBool::new(true),
            command_buffer: Mutex::new(command_buffer),
            fence,
            semaphore,
            cycle: Mutex::new(cycle),
        })
    }
}

struct ThreadCommandPool {
    pool: Box<dyn CommandPool>,
    slots: Vec<Arc<CommandBufferSlot>>,
}

/// A command buffer slot handed out for recording. Dropping it returns the
/// slot to its pool.
pub struct ActiveCommandBuffer {
    slot: Arc<CommandBufferSlot>,
}

impl ActiveCommandBuffer {
    pub fn fence(&self) -> &Arc<dyn HostFence> {
        &self.slot.fence
    }

    pub fn semaphore(&self) -> &Arc<dyn HostSemaphore> {
        &self.slot.semaphore
    }

    /// The cycle the next submission of this buffer will signal.
    pub fn fence_cycle(&self) -> Arc<FenceCycle> {
        self.slot.cycle.lock().clone()
    }

    pub fn command_buffer(&self) -> MutexGuard<'_, Box<dyn CommandBuffer>> {
        self.slot.command_buffer.lock()
    }

    /// Wait for the current cycle, start a new one and reset the buffer.
    pub fn reset(&self) -> SchedulerResult<Arc<FenceCycle>> {
        let mut cycle = self.slot.cycle.lock();
        cycle.wait();
        *cycle = cycle.next()?;
        self.slot.command_buffer.lock().reset()?;
        Ok(cycle.clone())
    }
}

impl Drop for ActiveCommandBuffer {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::Release);
    }
}

pub struct CommandScheduler {
    backend: Arc<dyn GpuBackend>,
    pools: Mutex<HashMap<ThreadId, Arc<Mutex<ThreadCommandPool>>>>,
    /// Serializes queue submission.
    queue_lock: Mutex<()>,
    cycle_queue: Mutex<Option<Sender<Arc<FenceCycle>>>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    /// Create a scheduler whose waiter queue holds up to `queue_depth`
    /// in-flight cycles before submission blocks.
    pub fn new(backend: Arc<dyn GpuBackend>, queue_depth: usize) -> SchedulerResult<Self> {
        let (sender, receiver) = bounded::<Arc<FenceCycle>>(queue_depth.max(1));
        let waiter = std::thread::Builder::new()
            .name("mirage-cycle-waiter".into())
            .spawn(move || {
                for cycle in receiver {
                    cycle.wait();
                }
                log::trace!("scheduler: cycle waiter exiting");
            })
            .map_err(|e| {
                log::error!("scheduler: failed to spawn cycle waiter: {}", e);
                SchedulerError::WaiterStopped
            })?;

        log::debug!(
            "scheduler: started on the {} backend (queue depth {})",
            backend.name(),
            queue_depth
        );

        Ok(Self {
            backend,
            pools: Mutex::new(HashMap::new()),
            queue_lock: Mutex::new(()),
            cycle_queue: Mutex::new(Some(sender)),
            waiter: Mutex::new(Some(waiter)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Hand out a slot from the calling thread's pool, recycling one whose
    /// previous submission has signalled if possible.
    pub fn allocate_command_buffer(&self) -> SchedulerResult<ActiveCommandBuffer> {
        let pool = self.thread_pool()?;
        let mut pool = pool.lock();

        for slot in &pool.slots {
            if slot.active.swap(true, Ordering::AcqRel) {
                continue;
            }

            let mut cycle = slot.cycle.lock();
            if cycle.poll_quick() {
                let next = match cycle.next() {
                    Ok(next) => next,
                    Err(e) => {
                        slot.active.store(false, Ordering::Release);
                        return Err(e.into());
                    }
                };
                *cycle = next;
                drop(cycle);
                if let Err(e) = slot.command_buffer.lock().reset() {
                    slot.active.store(false, Ordering::Release);
                    return Err(e.into());
                }
                return Ok(ActiveCommandBuffer { slot: slot.clone() });
            }
            drop(cycle);
            slot.active.store(false, Ordering::Release);
        }

        let command_buffer = pool.pool.allocate()?;
        let slot = Arc::new(CommandBufferSlot::new(self.backend.as_ref(), command_buffer)?);
        pool.slots.push(slot.clone());
        log::trace!("scheduler: allocated command buffer slot {}", pool.slots.len());
        Ok(ActiveCommandBuffer { slot })
    }

    /// Submit a recorded command buffer for `cycle`.
    ///
    /// The cycle's semaphore is always signalled. If the slot's previous
    /// signal was never consumed, a top-of-pipe wait on it is added first to
    /// unsignal it.
    pub fn submit_command_buffer(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        cycle: &Arc<FenceCycle>,
        wait_semaphores: &[Arc<dyn HostSemaphore>],
        signal_semaphores: &[Arc<dyn HostSemaphore>],
    ) -> SchedulerResult<()> {
        let mut waits: Vec<SemaphoreWait> = wait_semaphores
            .iter()
            .map(|s| (s.clone(), PipelineStage::ALL_COMMANDS))
            .collect();
        if cycle.semaphore_submit_wait() {
            waits.push((cycle.semaphore().clone(), PipelineStage::TOP_OF_PIPE));
        }

        let mut signals = signal_semaphores.to_vec();
        signals.push(cycle.semaphore().clone());

        {
            let _queue = self.queue_lock.lock();
            if let Err(e) = self.backend.submit(command_buffer, &waits, &signals, cycle.fence()) {
                if matches!(e, BackendError::DeviceLost) {
                    log::error!("scheduler: device lost during submission");
                }
                return Err(e.into());
            }
        }

        cycle.notify_submitted();

        let queue = self.cycle_queue.lock();
        match queue.as_ref() {
            Some(sender) => sender
                .send(cycle.clone())
                .map_err(|_| SchedulerError::WaiterStopped),
            None => Err(SchedulerError::WaiterStopped),
        }
    }

    /// Record and submit a command buffer, returning the cycle it signals.
    ///
    /// The cycle is cancelled if recording or submission fails.
    pub fn submit<F>(
        &self,
        record: F,
        wait_semaphores: &[Arc<dyn HostSemaphore>],
        signal_semaphores: &[Arc<dyn HostSemaphore>],
    ) -> SchedulerResult<Arc<FenceCycle>>
    where
        F: FnOnce(&mut dyn CommandBuffer),
    {
        let active = self.allocate_command_buffer()?;
        let cycle = active.fence_cycle();

        let result = (|| {
            let mut command_buffer = active.command_buffer();
            command_buffer.begin()?;
            record(&mut **command_buffer);
            command_buffer.end()?;
            self.submit_command_buffer(
                &mut **command_buffer,
                &cycle,
                wait_semaphores,
                signal_semaphores,
            )
        })();

        match result {
            Ok(()) => Ok(cycle),
            Err(e) => {
                log::warn!("scheduler: submission failed: {}", e);
                cycle.cancel();
                Err(e)
            }
        }
    }

    // ── Internal helpers ──

    fn thread_pool(&self) -> SchedulerResult<Arc<Mutex<ThreadCommandPool>>> {
        let id = std::thread::current().id();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&id) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(Mutex::new(ThreadCommandPool {
            pool: self.backend.create_command_pool()?,
            slots: Vec::new(),
        }));
        pools.insert(id, pool.clone());
        log::debug!("scheduler: created command pool for thread {:?}", id);
        Ok(pool)
    }
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        self.cycle_queue.lock().take();
        if let Some(waiter) = self.waiter.lock().take() {
            if waiter.join().is_err() {
                log::error!("scheduler: cycle waiter panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftBackend;
    use mirage_common::memory::MappedMemory;
    use std::time::Duration;

    fn scheduler() -> (Arc<SoftBackend>, CommandScheduler) {
        let backend = Arc::new(SoftBackend::new());
        let scheduler = CommandScheduler::new(backend.clone(), 8).unwrap();
        (backend, scheduler)
    }

    #[test]
    fn test_submit_runs_recorded_commands() {
        let (backend, scheduler) = scheduler();
        let buffer = backend.allocate_buffer(0x100).unwrap();

        let cycle = scheduler
            .submit(|cmd| cmd.update_buffer(&buffer, 0x8, &[9, 8, 7]), &[], &[])
            .unwrap();
        cycle.wait();
        assert_eq!(buffer.read_vec(0x8, 3), vec![9, 8, 7]);
    }

    #[test]
    fn test_slot_reused_after_signal() {
        let (backend, scheduler) = scheduler();

        let first = scheduler.submit(|_| {}, &[], &[]).unwrap();
        first.wait();
        let second = scheduler.submit(|_| {}, &[], &[]).unwrap();
        second.wait();

        // The recycled slot waits on its own semaphore to unsignal it.
        assert!(Arc::ptr_eq(first.fence(), second.fence()));
        assert!(second.semaphore_submit_wait());
        assert_eq!(backend.completed_submissions(), 2);
    }

    #[test]
    fn test_busy_slot_gets_new_buffer() {
        let (backend, scheduler) = scheduler();
        backend.pause();

        let first = scheduler.submit(|_| {}, &[], &[]).unwrap();
        let second = scheduler.submit(|_| {}, &[], &[]).unwrap();
        assert!(!Arc::ptr_eq(first.fence(), second.fence()));

        backend.resume();
        second.wait();
        first.wait();
    }

    #[test]
    fn test_active_slot_not_handed_out_twice() {
        let (_backend, scheduler) = scheduler();
        let cycle = scheduler.submit(|_| {}, &[], &[]).unwrap();
        cycle.wait();

        let a = scheduler.allocate_command_buffer().unwrap();
        let b = scheduler.allocate_command_buffer().unwrap();
        assert!(!Arc::ptr_eq(a.fence(), b.fence()));
    }

    #[test]
    fn test_active_buffer_reset_starts_new_cycle() {
        let (_backend, scheduler) = scheduler();
        let active = scheduler.allocate_command_buffer().unwrap();
        let cycle = active.fence_cycle();
        {
            let mut cmd = active.command_buffer();
            cmd.begin().unwrap();
            cmd.end().unwrap();
            scheduler
                .submit_command_buffer(&mut **cmd, &cycle, &[], &[])
                .unwrap();
        }

        let next = active.reset().unwrap();
        assert!(cycle.is_signalled());
        assert!(!Arc::ptr_eq(&cycle, &next));
        assert!(!next.is_signalled());
    }

    #[test]
    fn test_failed_recording_cancels_cycle() {
        let (_backend, scheduler) = scheduler();

        // Ending a buffer twice is rejected by the backend.
        let result = scheduler.submit(
            |cmd| {
                cmd.end().unwrap();
            },
            &[],
            &[],
        );
        assert!(matches!(
            result,
            Err(SchedulerError::Backend(BackendError::InvalidState(_)))
        ));

        // The cancelled cycle lets the slot be recycled, and its never
        // signalled semaphore is not waited on.
        let active = scheduler.allocate_command_buffer().unwrap();
        assert!(!active.fence_cycle().semaphore_submit_wait());
        let pools = scheduler.pools.lock();
        let pool = pools.values().next().unwrap().lock();
        assert_eq!(pool.slots.len(), 1);
    }

    #[test]
    fn test_waiter_releases_dependencies() {
        let (_backend, scheduler) = scheduler();
        let marker = Arc::new(());
        let cycle = scheduler.submit(|_| {}, &[], &[]).unwrap();
        cycle.attach_object(marker.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&marker) > 1 {
            assert!(std::time::Instant::now() < deadline, "waiter never released dependency");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pools_are_per_thread() {
        let (_backend, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    let cycle = scheduler.submit(|_| {}, &[], &[]).unwrap();
                    cycle.wait();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(scheduler.pools.lock().len(), 3);
    }
}
