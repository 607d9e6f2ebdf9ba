// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software GPU backend.
//!
//! Buffers live in host memory and a single queue thread executes submitted
//! command buffers in order, honouring semaphore waits and signalling fences
//! on completion. The queue can be paused so callers can observe work that
//! is submitted but not yet complete.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use mirage_common::memory::MappedMemory;
use mirage_common::DeviceSize;

use super::{
    BackendError, BackendResult, BufferHandle, CommandBuffer, CommandPool, GpuBackend,
    HostBuffer, HostFence, HostSemaphore, SemaphoreWait,
};

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

pub struct SoftBuffer {
    handle: BufferHandle,
    data: RwLock<Vec<u8>>,
}

impl MappedMemory for SoftBuffer {
    fn size(&self) -> DeviceSize {
        self.data.read().len() as DeviceSize
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) {
        let data = self.data.read();
        let at = offset as usize;
        dst.copy_from_slice(&data[at..at + dst.len()]);
    }

    fn write(&self, offset: DeviceSize, src: &[u8]) {
        let mut data = self.data.write();
        let at = offset as usize;
        data[at..at + src.len()].copy_from_slice(src);
    }
}

impl HostBuffer for SoftBuffer {
    fn handle(&self) -> BufferHandle {
        self.handle
    }
}

/// A boolean flag with blocking waiters, shared by fences and semaphores.
struct Signal {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new(signalled: bool) -> Self {
        Self {
            signalled: Mutex::new(signalled),
            condvar: Condvar::new(),
        }
    }

    fn set(&self, value: bool) {
        let mut signalled = self.signalled.lock();
        *signalled = value;
        if value {
            self.condvar.notify_all();
        }
    }

    fn get(&self) -> bool {
        *self.signalled.lock()
    }

    /// Wait for the flag, optionally clearing it. Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>, consume: bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signalled = self.signalled.lock();
        while !*signalled {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut signalled, deadline).timed_out() && !*signalled {
                        return false;
                    }
                }
                None => self.condvar.wait(&mut signalled),
            }
        }
        if consume {
            *signalled = false;
        }
        true
    }
}

pub struct SoftFence {
    handle: u64,
    signal: Signal,
}

impl HostFence for SoftFence {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn reset(&self) -> BackendResult<()> {
        self.signal.set(false);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> BackendResult<bool> {
        Ok(self.signal.wait(timeout, false))
    }

    fn is_signalled(&self) -> BackendResult<bool> {
        Ok(self.signal.get())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SoftSemaphore {
    handle: u64,
    signal: Signal,
}

impl SoftSemaphore {
    pub fn is_signalled(&self) -> bool {
        self.signal.get()
    }
}

impl HostSemaphore for SoftSemaphore {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Command {
    Copy {
        src: Arc<dyn HostBuffer>,
        src_offset: DeviceSize,
        dst: Arc<dyn HostBuffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
    },
    Update {
        dst: Arc<dyn HostBuffer>,
        dst_offset: DeviceSize,
        data: Vec<u8>,
    },
}

impl Command {
    fn execute(self) {
        match self {
            Command::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let data = src.read_vec(src_offset, size);
                dst.write(dst_offset, &data);
            }
            Command::Update {
                dst,
                dst_offset,
                data,
            } => dst.write(dst_offset, &data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Pending,
}

pub struct SoftCommandBuffer {
    state: RecordState,
    commands: Vec<Command>,
}

impl SoftCommandBuffer {
    /// Number of commands recorded since the last reset.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandBuffer for SoftCommandBuffer {
    fn begin(&mut self) -> BackendResult<()> {
        if self.state == RecordState::Pending {
            return Err(BackendError::InvalidState("begin on a pending command buffer"));
        }
        self.commands.clear();
        self.state = RecordState::Recording;
        Ok(())
    }

    fn end(&mut self) -> BackendResult<()> {
        if self.state != RecordState::Recording {
            return Err(BackendError::InvalidState("end without begin"));
        }
        self.state = RecordState::Executable;
        Ok(())
    }

    fn reset(&mut self) -> BackendResult<()> {
        self.commands.clear();
        self.state = RecordState::Initial;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: &Arc<dyn HostBuffer>,
        src_offset: DeviceSize,
        dst: &Arc<dyn HostBuffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) {
        self.commands.push(Command::Copy {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
    }

    fn update_buffer(&mut self, dst: &Arc<dyn HostBuffer>, dst_offset: DeviceSize, data: &[u8]) {
        self.commands.push(Command::Update {
            dst: dst.clone(),
            dst_offset,
            data: data.to_vec(),
        });
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct SoftCommandPool;

impl CommandPool for SoftCommandPool {
    fn allocate(&mut self) -> BackendResult<Box<dyn CommandBuffer>> {
        Ok(Box::new(SoftCommandBuffer {
            state: RecordState::Initial,
            commands: Vec::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Job {
    waits: Vec<Arc<dyn HostSemaphore>>,
    commands: Vec<Command>,
    signals: Vec<Arc<dyn HostSemaphore>>,
    fence: Arc<dyn HostFence>,
}

fn soft_semaphore(semaphore: &Arc<dyn HostSemaphore>) -> BackendResult<&SoftSemaphore> {
    semaphore
        .as_any()
        .downcast_ref::<SoftSemaphore>()
        .ok_or(BackendError::ForeignObject("soft"))
}

fn soft_fence(fence: &Arc<dyn HostFence>) -> BackendResult<&SoftFence> {
    fence
        .as_any()
        .downcast_ref::<SoftFence>()
        .ok_or(BackendError::ForeignObject("soft"))
}

/// Pause gate for the queue thread.
struct Gate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.condvar.wait(&mut paused);
        }
    }
}

/// A GPU that executes command buffers on a host thread.
pub struct SoftBackend {
    next_handle: AtomicU64,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    gate: Arc<Gate>,
    completed: Arc<AtomicU64>,
}

impl SoftBackend {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let gate = Arc::new(Gate {
            paused: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let completed = Arc::new(AtomicU64::new(0));

        let worker = {
            let gate = gate.clone();
            let completed = completed.clone();
            std::thread::Builder::new()
                .name("mirage-soft-queue".into())
                .spawn(move || {
                    for job in receiver {
                        gate.wait_while_paused();
                        Self::execute(job);
                        completed.fetch_add(1, Ordering::Release);
                    }
                    log::trace!("soft backend: queue thread exiting");
                })
                .ok()
        };
        if worker.is_none() {
            log::error!("soft backend: failed to spawn queue thread");
        }

        Self {
            next_handle: AtomicU64::new(1),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(worker),
            gate,
            completed,
        }
    }

    /// Stop the queue from starting new submissions.
    pub fn pause(&self) {
        *self.gate.paused.lock() = true;
    }

    /// Let the queue continue.
    pub fn resume(&self) {
        *self.gate.paused.lock() = false;
        self.gate.condvar.notify_all();
    }

    /// Number of submissions that have finished executing.
    pub fn completed_submissions(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn execute(job: Job) {
        // Objects were type-checked at submission.
        for semaphore in &job.waits {
            if let Ok(semaphore) = soft_semaphore(semaphore) {
                semaphore.signal.wait(None, true);
            }
        }
        for command in job.commands {
            command.execute();
        }
        for semaphore in &job.signals {
            if let Ok(semaphore) = soft_semaphore(semaphore) {
                if semaphore.is_signalled() {
                    log::warn!(
                        "soft backend: semaphore {} signalled while already signalled",
                        semaphore.handle
                    );
                }
                semaphore.signal.set(true);
            }
        }
        if let Ok(fence) = soft_fence(&job.fence) {
            fence.signal.set(true);
        }
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftBackend {
    fn drop(&mut self) {
        self.resume();
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl GpuBackend for SoftBackend {
    fn name(&self) -> &str {
        "soft"
    }

    fn allocate_buffer(&self, size: DeviceSize) -> BackendResult<Arc<dyn HostBuffer>> {
        let len = usize::try_from(size).map_err(|_| BackendError::OutOfMemory(size))?;
        Ok(Arc::new(SoftBuffer {
            handle: self.next_handle(),
            data: RwLock::new(vec![0u8; len]),
        }))
    }

    fn create_fence(&self, signalled: bool) -> BackendResult<Arc<dyn HostFence>> {
        Ok(Arc::new(SoftFence {
            handle: self.next_handle(),
            signal: Signal::new(signalled),
        }))
    }

    fn create_semaphore(&self) -> BackendResult<Arc<dyn HostSemaphore>> {
        Ok(Arc::new(SoftSemaphore {
            handle: self.next_handle(),
            signal: Signal::new(false),
        }))
    }

    fn create_command_pool(&self) -> BackendResult<Box<dyn CommandPool>> {
        Ok(Box::new(SoftCommandPool))
    }

    fn submit(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        waits: &[SemaphoreWait],
        signals: &[Arc<dyn HostSemaphore>],
        fence: &Arc<dyn HostFence>,
    ) -> BackendResult<()> {
        let command_buffer = command_buffer
            .as_any_mut()
            .downcast_mut::<SoftCommandBuffer>()
            .ok_or(BackendError::ForeignObject("soft"))?;
        if command_buffer.state != RecordState::Executable {
            return Err(BackendError::InvalidState("submit of a command buffer that is not executable"));
        }
        for (semaphore, _) in waits {
            soft_semaphore(semaphore)?;
        }
        for semaphore in signals {
            soft_semaphore(semaphore)?;
        }
        soft_fence(fence)?;

        let job = Job {
            waits: waits.iter().map(|(s, _)| s.clone()).collect(),
            commands: std::mem::take(&mut command_buffer.commands),
            signals: signals.to_vec(),
            fence: fence.clone(),
        };
        command_buffer.state = RecordState::Pending;

        let sender = self.sender.lock();
        sender
            .as_ref()
            .ok_or(BackendError::QueueClosed)?
            .send(job)
            .map_err(|_| BackendError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PipelineStage;

    #[test]
    fn test_submit_executes_in_order() {
        let backend = SoftBackend::new();
        let src = backend.allocate_buffer(0x100).unwrap();
        let dst = backend.allocate_buffer(0x100).unwrap();
        let fence = backend.create_fence(false).unwrap();

        let mut pool = backend.create_command_pool().unwrap();
        let mut cmd = pool.allocate().unwrap();
        cmd.begin().unwrap();
        cmd.update_buffer(&src, 0x10, &[1, 2, 3, 4]);
        cmd.copy_buffer(&src, 0x10, &dst, 0x20, 4);
        cmd.end().unwrap();
        backend.submit(cmd.as_mut(), &[], &[], &fence).unwrap();

        assert!(fence.wait(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(dst.read_vec(0x20, 4), vec![1, 2, 3, 4]);
        assert_eq!(backend.completed_submissions(), 1);
    }

    #[test]
    fn test_pause_holds_fence() {
        let backend = SoftBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let mut pool = backend.create_command_pool().unwrap();
        let mut cmd = pool.allocate().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();

        backend.pause();
        backend.submit(cmd.as_mut(), &[], &[], &fence).unwrap();
        assert!(!fence.wait(Some(Duration::from_millis(20))).unwrap());
        assert!(!fence.is_signalled().unwrap());

        backend.resume();
        assert!(fence.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn test_semaphore_orders_submissions() {
        let backend = SoftBackend::new();
        let semaphore = backend.create_semaphore().unwrap();
        let first = backend.create_fence(false).unwrap();
        let second = backend.create_fence(false).unwrap();
        let mut pool = backend.create_command_pool().unwrap();

        let mut a = pool.allocate().unwrap();
        a.begin().unwrap();
        a.end().unwrap();
        backend.submit(a.as_mut(), &[], &[semaphore.clone()], &first).unwrap();

        let mut b = pool.allocate().unwrap();
        b.begin().unwrap();
        b.end().unwrap();
        backend
            .submit(b.as_mut(), &[(semaphore.clone(), PipelineStage::TOP_OF_PIPE)], &[], &second)
            .unwrap();

        assert!(second.wait(Some(Duration::from_secs(5))).unwrap());
        assert!(first.is_signalled().unwrap());
        let soft = semaphore.as_any().downcast_ref::<SoftSemaphore>().unwrap();
        assert!(!soft.is_signalled(), "wait should consume the signal");
    }

    #[test]
    fn test_submit_requires_executable() {
        let backend = SoftBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let mut pool = backend.create_command_pool().unwrap();
        let mut cmd = pool.allocate().unwrap();
        cmd.begin().unwrap();
        assert!(matches!(
            backend.submit(cmd.as_mut(), &[], &[], &fence),
            Err(BackendError::InvalidState(_))
        ));
    }
}
