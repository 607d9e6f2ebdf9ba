// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vulkan backend using ash.
//!
//! Headless: a single queue, no surface. Every buffer is allocated from
//! host-visible, host-coherent memory and stays mapped for its lifetime, so
//! the CPU side of the buffer layer reads and writes backings directly.

use std::any::Any;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use mirage_common::memory::MappedMemory;
use mirage_common::DeviceSize;

use super::{
    BackendError, BackendResult, BufferHandle, CommandBuffer, CommandPool, GpuBackend,
    HostBuffer, HostFence, HostSemaphore, PipelineStage, SemaphoreWait,
};

/// Largest inline update `vkCmdUpdateBuffer` accepts.
const MAX_INLINE_UPDATE_SIZE: usize = 0x10000;

fn driver_error(what: &str, result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => BackendError::Driver(format!("{what}: {other:?}")),
    }
}

struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    fn new() -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::Initialization(format!("failed to load Vulkan: {e}")))?;

        let app_name = CStr::from_bytes_with_nul(b"mirage\0")
            .map_err(|e| BackendError::Initialization(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| BackendError::Initialization(format!("instance creation: {e}")))?;

        let (physical_device, queue_family_index) = match unsafe { Self::select_physical_device(&instance) } {
            Some(selected) => selected,
            None => {
                unsafe { instance.destroy_instance(None) };
                return Err(BackendError::Initialization("no device with a transfer queue".into()));
            }
        };

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
        log::info!(
            "Vulkan: selected {:?} ({:?}), queue family {}",
            device_name,
            props.device_type,
            queue_family_index
        );

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();
        let device_info =
            vk::DeviceCreateInfo::builder().queue_create_infos(std::slice::from_ref(&queue_info));
        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(BackendError::Initialization(format!("device creation: {e}")));
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            _entry: entry,
            instance,
            device,
            queue,
            queue_family_index,
            memory_properties,
        })
    }

    /// Prefer a discrete GPU; any queue family with graphics, compute or
    /// transfer support can run buffer copies.
    unsafe fn select_physical_device(instance: &ash::Instance) -> Option<(vk::PhysicalDevice, u32)> {
        let devices = instance.enumerate_physical_devices().ok()?;
        let mut best: Option<(vk::PhysicalDevice, u32, bool)> = None;
        for physical_device in devices {
            let families = instance.get_physical_device_queue_family_properties(physical_device);
            let Some(index) = families.iter().position(|family| {
                family.queue_count > 0
                    && family.queue_flags.intersects(
                        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    )
            }) else {
                continue;
            };
            let discrete = instance.get_physical_device_properties(physical_device).device_type
                == vk::PhysicalDeviceType::DISCRETE_GPU;
            if best.map_or(true, |(_, _, best_discrete)| discrete && !best_discrete) {
                best = Some((physical_device, index as u32, discrete));
            }
        }
        best.map(|(device, index, _)| (device, index))
    }

    fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    fn allocate_buffer(self: &Arc<Self>, size: DeviceSize) -> BackendResult<Arc<VulkanBuffer>> {
        let info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| driver_error("buffer creation", e))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let Some(memory_type) = self.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) else {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(BackendError::OutOfMemory(size));
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(match e {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        BackendError::OutOfMemory(size)
                    }
                    other => driver_error("memory allocation", other),
                });
            }
        };

        let mapped = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };
        let mapped = match mapped {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(e) => {
                unsafe {
                    self.device.destroy_buffer(buffer, None);
                    self.device.free_memory(memory, None);
                }
                return Err(driver_error("memory mapping", e));
            }
        };

        Ok(Arc::new(VulkanBuffer {
            device: self.clone(),
            buffer,
            memory,
            mapped: MappedPtr(mapped),
            size,
        }))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Vulkan: device_wait_idle failed on shutdown: {:?}", e);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

struct MappedPtr(*mut u8);

// The mapping is valid for the lifetime of the owning buffer and all
// accesses are bounds-checked byte copies.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

pub struct VulkanBuffer {
    device: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: MappedPtr,
    size: DeviceSize,
}

impl MappedMemory for VulkanBuffer {
    fn size(&self) -> DeviceSize {
        self.size
    }

    fn read(&self, offset: DeviceSize, dst: &mut [u8]) {
        assert!(offset + dst.len() as DeviceSize <= self.size, "read past end of buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.0.add(offset as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write(&self, offset: DeviceSize, src: &[u8]) {
        assert!(offset + src.len() as DeviceSize <= self.size, "write past end of buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.mapped.0.add(offset as usize), src.len());
        }
    }
}

impl HostBuffer for VulkanBuffer {
    fn handle(&self) -> BufferHandle {
        self.buffer.as_raw()
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.unmap_memory(self.memory);
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

pub struct VulkanFence {
    device: Arc<VulkanDevice>,
    fence: vk::Fence,
}

impl HostFence for VulkanFence {
    fn handle(&self) -> u64 {
        self.fence.as_raw()
    }

    fn reset(&self) -> BackendResult<()> {
        unsafe { self.device.device.reset_fences(&[self.fence]) }.map_err(|e| driver_error("fence reset", e))
    }

    fn wait(&self, timeout: Option<Duration>) -> BackendResult<bool> {
        let nanos = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);
        loop {
            match unsafe { self.device.device.wait_for_fences(&[self.fence], true, nanos) } {
                Ok(()) => return Ok(true),
                Err(vk::Result::TIMEOUT) if timeout.is_some() => return Ok(false),
                // Some drivers return spuriously from infinite waits.
                Err(vk::Result::TIMEOUT) | Err(vk::Result::ERROR_INITIALIZATION_FAILED) => continue,
                Err(e) => return Err(driver_error("fence wait", e)),
            }
        }
    }

    fn is_signalled(&self) -> BackendResult<bool> {
        unsafe { self.device.device.get_fence_status(self.fence) }.map_err(|e| driver_error("fence status", e))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.fence, None) };
    }
}

pub struct VulkanSemaphore {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
}

impl HostSemaphore for VulkanSemaphore {
    fn handle(&self) -> u64 {
        self.semaphore.as_raw()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

// ---------------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------------

/// The command pool, freed once its last command buffer is gone. Pool
/// operations need external synchronization.
struct PoolHandle {
    device: Arc<VulkanDevice>,
    pool: Mutex<vk::CommandPool>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(*self.pool.get_mut(), None) };
    }
}

pub struct VulkanCommandPool {
    handle: Arc<PoolHandle>,
}

impl CommandPool for VulkanCommandPool {
    fn allocate(&mut self) -> BackendResult<Box<dyn CommandBuffer>> {
        let pool = self.handle.pool.lock();
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.handle.device.device.allocate_command_buffers(&info) }
            .map_err(|e| driver_error("command buffer allocation", e))?;
        let Some(&buffer) = buffers.first() else {
            return Err(BackendError::Driver("no command buffer allocated".into()));
        };
        drop(pool);

        Ok(Box::new(VulkanCommandBuffer {
            pool: self.handle.clone(),
            buffer,
            recording: false,
            staging: Vec::new(),
            error: None,
        }))
    }
}

pub struct VulkanCommandBuffer {
    pool: Arc<PoolHandle>,
    buffer: vk::CommandBuffer,
    recording: bool,
    /// Staging for unaligned updates, alive until the buffer is re-recorded.
    staging: Vec<Arc<VulkanBuffer>>,
    /// First recording failure; reported by `end`.
    error: Option<BackendError>,
}

impl VulkanCommandBuffer {
    fn device(&self) -> &ash::Device {
        &self.pool.device.device
    }

    /// Order every transfer so far before the next one.
    fn transfer_barrier(&self, dst_stage: vk::PipelineStageFlags, dst_access: vk::AccessFlags) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.buffer,
                vk::PipelineStageFlags::TRANSFER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn record_copy(&self, src: vk::Buffer, src_offset: DeviceSize, dst: vk::Buffer, dst_offset: DeviceSize, size: DeviceSize) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe { self.device().cmd_copy_buffer(self.buffer, src, dst, &[region]) };
        self.transfer_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
        );
    }
}

impl CommandBuffer for VulkanCommandBuffer {
    fn begin(&mut self) -> BackendResult<()> {
        self.staging.clear();
        self.error = None;
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(self.buffer, &info) }
            .map_err(|e| driver_error("begin command buffer", e))?;
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::InvalidState("end without begin"));
        }
        // Make transfer results visible to host reads after the fence.
        self.transfer_barrier(vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_READ);
        unsafe { self.device().end_command_buffer(self.buffer) }.map_err(|e| driver_error("end command buffer", e))?;
        self.recording = false;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn reset(&mut self) -> BackendResult<()> {
        self.staging.clear();
        self.recording = false;
        unsafe {
            self.device()
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| driver_error("reset command buffer", e))
    }

    fn copy_buffer(
        &mut self,
        src: &Arc<dyn HostBuffer>,
        src_offset: DeviceSize,
        dst: &Arc<dyn HostBuffer>,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) {
        if size == 0 {
            return;
        }
        self.record_copy(
            vk::Buffer::from_raw(src.handle()),
            src_offset,
            vk::Buffer::from_raw(dst.handle()),
            dst_offset,
            size,
        );
    }

    fn update_buffer(&mut self, dst: &Arc<dyn HostBuffer>, dst_offset: DeviceSize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let dst_buffer = vk::Buffer::from_raw(dst.handle());

        if dst_offset % 4 != 0 || data.len() % 4 != 0 {
            // Inline updates must be dword aligned; go through a staging copy.
            match self.pool.device.allocate_buffer(data.len() as DeviceSize) {
                Ok(staging) => {
                    staging.write(0, data);
                    self.record_copy(staging.buffer, 0, dst_buffer, dst_offset, data.len() as DeviceSize);
                    self.staging.push(staging);
                }
                Err(e) => {
                    log::error!("Vulkan: staging allocation for update failed: {}", e);
                    self.error.get_or_insert(e);
                }
            }
            return;
        }

        let mut offset = dst_offset;
        for chunk in data.chunks(MAX_INLINE_UPDATE_SIZE) {
            unsafe { self.device().cmd_update_buffer(self.buffer, dst_buffer, offset, chunk) };
            offset += chunk.len() as DeviceSize;
        }
        self.transfer_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
        );
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        let pool = self.pool.pool.lock();
        unsafe { self.pool.device.device.free_command_buffers(*pool, &[self.buffer]) };
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
}

impl VulkanBackend {
    pub fn new() -> BackendResult<Self> {
        Ok(Self {
            device: Arc::new(VulkanDevice::new()?),
        })
    }
}

fn vulkan_semaphore(semaphore: &Arc<dyn HostSemaphore>) -> BackendResult<vk::Semaphore> {
    semaphore
        .as_any()
        .downcast_ref::<VulkanSemaphore>()
        .map(|s| s.semaphore)
        .ok_or(BackendError::ForeignObject("vulkan"))
}

fn stage_flags(stage: PipelineStage) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    if stage.contains(PipelineStage::TOP_OF_PIPE) {
        flags |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stage.contains(PipelineStage::TRANSFER) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if stage.contains(PipelineStage::ALL_COMMANDS) {
        flags |= vk::PipelineStageFlags::ALL_COMMANDS;
    }
    flags
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn allocate_buffer(&self, size: DeviceSize) -> BackendResult<Arc<dyn HostBuffer>> {
        let buffer: Arc<dyn HostBuffer> = self.device.allocate_buffer(size)?;
        Ok(buffer)
    }

    fn create_fence(&self, signalled: bool) -> BackendResult<Arc<dyn HostFence>> {
        let flags = if signalled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.device.create_fence(&info, None) }
            .map_err(|e| driver_error("fence creation", e))?;
        Ok(Arc::new(VulkanFence {
            device: self.device.clone(),
            fence,
        }))
    }

    fn create_semaphore(&self) -> BackendResult<Arc<dyn HostSemaphore>> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.device.create_semaphore(&info, None) }
            .map_err(|e| driver_error("semaphore creation", e))?;
        Ok(Arc::new(VulkanSemaphore {
            device: self.device.clone(),
            semaphore,
        }))
    }

    fn create_command_pool(&self) -> BackendResult<Box<dyn CommandPool>> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.device.create_command_pool(&info, None) }
            .map_err(|e| driver_error("command pool creation", e))?;
        Ok(Box::new(VulkanCommandPool {
            handle: Arc::new(PoolHandle {
                device: self.device.clone(),
                pool: Mutex::new(pool),
            }),
        }))
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
            .downcast_mut::<VulkanCommandBuffer>()
            .ok_or(BackendError::ForeignObject("vulkan"))?;
        let fence = fence
            .as_any()
            .downcast_ref::<VulkanFence>()
            .ok_or(BackendError::ForeignObject("vulkan"))?;

        let wait_semaphores = waits
            .iter()
            .map(|(semaphore, _)| vulkan_semaphore(semaphore))
            .collect::<BackendResult<Vec<_>>>()?;
        let wait_stages: Vec<_> = waits.iter().map(|(_, stage)| stage_flags(*stage)).collect();
        let signal_semaphores = signals
            .iter()
            .map(vulkan_semaphore)
            .collect::<BackendResult<Vec<_>>>()?;
        let command_buffers = [command_buffer.buffer];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            self.device
                .device
                .queue_submit(self.device.queue, &[submit], fence.fence)
        }
        .map_err(|e| driver_error("queue submit", e))
    }
}
