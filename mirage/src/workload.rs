// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Coherence stress workload.
//!
//! Guest threads hammer a window of trapped guest memory while the calling
//! thread plays GPU executions against the same range through the buffer
//! manager. Every guest region is split into two pages:
//!
//! * the guest page holds one 8-byte slot per guest thread, written and read
//!   back by that thread only;
//! * the GPU page is only ever written whole with a single fill byte, by
//!   inline updates or by GPU-side writes.
//!
//! Any read that observes a slot other than the last value written, or a GPU
//! page that isn't uniform, is a coherence violation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use mirage_common::types::{GuestSpan, PAGE_SIZE, PAGE_SIZE_U64};
use mirage_common::VAddr;
use mirage_gpu::backend::HostBuffer;
use mirage_gpu::{ContextTag, GpuContext, LockedBuffer};
use mirage_memory::SoftGuestMemory;

/// Bytes of guest memory per region: a guest page and a GPU page.
pub const REGION_SIZE: u64 = 2 * PAGE_SIZE_U64;

/// Bytes guest threads sample from a GPU page.
const SAMPLE_SIZE: usize = 16;

const OPS_PER_EXECUTION: usize = 4;

/// Workload shape, from the command line.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadParams {
    pub guest_threads: usize,
    pub executions: u64,
    pub regions: u64,
    pub seed: u64,
}

/// Counters reported once the workload finishes.
#[derive(Debug, Default)]
pub struct WorkloadStats {
    pub executions: u64,
    pub inline_updates: u64,
    pub gpu_writes: u64,
    pub megabuffer_hits: u64,
    pub megabuffer_misses: u64,
    pub readbacks: u64,
    pub coalesce_requests: u64,
    pub guest_accesses: u64,
    pub violations: u64,
}

/// Small xorshift generator; the workload only needs cheap, seedable noise.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound.max(1)
    }
}

fn is_uniform(data: &[u8]) -> bool {
    data.windows(2).all(|w| w[0] == w[1])
}

fn guest_page(base: VAddr, region: u64) -> VAddr {
    base + region * REGION_SIZE
}

fn gpu_page(base: VAddr, region: u64) -> VAddr {
    guest_page(base, region) + PAGE_SIZE_U64
}

/// Run the workload to completion. Fails if any coherence violation was
/// observed.
pub fn run(context: &GpuContext, memory: &Arc<SoftGuestMemory>, params: WorkloadParams) -> Result<WorkloadStats> {
    if params.guest_threads * 8 > PAGE_SIZE {
        bail!("at most {} guest threads fit in a guest page", PAGE_SIZE / 8);
    }
    if params.regions * REGION_SIZE > memory.size() {
        bail!(
            "{} regions need {:#X} bytes of guest memory, only {:#X} mapped",
            params.regions,
            params.regions * REGION_SIZE,
            memory.size()
        );
    }

    info!(
        "Workload: {} guest threads, {} executions over {} regions",
        params.guest_threads, params.executions, params.regions
    );

    let stop = AtomicBool::new(false);
    let guest_accesses = AtomicU64::new(0);
    let guest_violations = AtomicU64::new(0);

    let mut stats = std::thread::scope(|scope| -> Result<WorkloadStats> {
        let mut guests = Vec::with_capacity(params.guest_threads);
        for index in 0..params.guest_threads {
            let memory = memory.clone();
            let stop = &stop;
            let accesses = &guest_accesses;
            let violations = &guest_violations;
            let spawned = std::thread::Builder::new()
                .name(format!("guest-{}", index))
                .spawn_scoped(scope, move || {
                    guest_thread(&memory, index, params, stop, accesses, violations)
                });
            match spawned {
                Ok(handle) => guests.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::Release);
                    return Err(e).context("failed to spawn guest thread");
                }
            }
        }

        let result = GpuThread::new(context, memory.base(), params).and_then(|mut gpu| {
            for execution in 0..params.executions {
                gpu.run_execution(execution)?;
            }
            Ok(gpu.stats)
        });
        stop.store(true, Ordering::Release);

        for guest in guests {
            match guest.join() {
                Ok(r) => r?,
                Err(_) => bail!("guest thread panicked"),
            }
        }
        result
    })?;

    stats.guest_accesses = guest_accesses.load(Ordering::Relaxed);
    stats.violations += guest_violations.load(Ordering::Relaxed);
    report(context, memory, &stats);

    if stats.violations > 0 {
        bail!("{} coherence violations observed", stats.violations);
    }
    Ok(stats)
}

fn report(context: &GpuContext, memory: &SoftGuestMemory, stats: &WorkloadStats) {
    let (read_faults, write_faults) = memory.fault_counts();
    info!(
        "Executions: {} (inline updates {}, GPU writes {}, readbacks {}, coalesce requests {})",
        stats.executions, stats.inline_updates, stats.gpu_writes, stats.readbacks, stats.coalesce_requests
    );
    info!(
        "Megabuffer: {} hits, {} misses, {} chunks",
        stats.megabuffer_hits,
        stats.megabuffer_misses,
        context.megabuffer.lock().chunk_count()
    );
    info!(
        "Guest: {} accesses, {} read faults, {} write faults, {} live traps",
        stats.guest_accesses,
        read_faults,
        write_faults,
        memory.trap_count()
    );
    info!("Buffers: {} registered", context.buffer.buffer_count());
    if stats.violations > 0 {
        warn!("Coherence violations: {}", stats.violations);
    }
}

fn guest_thread(
    memory: &SoftGuestMemory,
    index: usize,
    params: WorkloadParams,
    stop: &AtomicBool,
    accesses: &AtomicU64,
    violations: &AtomicU64,
) -> Result<()> {
    let mut rng = XorShift::new(params.seed ^ ((index as u64 + 1) << 32));
    let base = memory.base();
    let mut counter = (index as u64) << 48;

    while !stop.load(Ordering::Acquire) {
        let region = rng.below(params.regions);

        counter += 1;
        let slot = guest_page(base, region) + index as u64 * 8;
        memory
            .write(slot, &counter.to_le_bytes())
            .with_context(|| format!("guest write at {:#X}", slot))?;
        let mut readback = [0u8; 8];
        memory
            .read(slot, &mut readback)
            .with_context(|| format!("guest read at {:#X}", slot))?;
        if u64::from_le_bytes(readback) != counter {
            warn!(
                "guest-{}: slot {:#X} read {:#X}, wrote {:#X}",
                index,
                slot,
                u64::from_le_bytes(readback),
                counter
            );
            violations.fetch_add(1, Ordering::Relaxed);
        }

        let sample = gpu_page(base, region) + rng.below((PAGE_SIZE - SAMPLE_SIZE) as u64);
        let mut data = [0u8; SAMPLE_SIZE];
        memory
            .read(sample, &mut data)
            .with_context(|| format!("guest read at {:#X}", sample))?;
        if !is_uniform(&data) {
            warn!("guest-{}: torn GPU page read at {:#X}: {:02X?}", index, sample, data);
            violations.fetch_add(1, Ordering::Relaxed);
        }

        accesses.fetch_add(2, Ordering::Relaxed);
    }
    Ok(())
}

/// Plays GPU executions from the calling thread.
struct GpuThread<'a> {
    context: &'a GpuContext,
    base: VAddr,
    params: WorkloadParams,
    rng: XorShift,
    /// Destination of GPU-side reads.
    scratch: Arc<dyn HostBuffer>,
    stats: WorkloadStats,
}

impl<'a> GpuThread<'a> {
    fn new(context: &'a GpuContext, base: VAddr, params: WorkloadParams) -> Result<Self> {
        let scratch = context
            .device
            .backend
            .allocate_buffer(PAGE_SIZE_U64)
            .context("failed to allocate scratch buffer")?;
        Ok(Self {
            context,
            base,
            params,
            rng: XorShift::new(params.seed),
            scratch,
            stats: WorkloadStats::default(),
        })
    }

    /// One execution: lock the buffers it touches under a fresh tag, record
    /// its commands, submit them and hand the cycle to every buffer used.
    fn run_execution(&mut self, index: u64) -> Result<()> {
        let context = self.context;
        let tag = ContextTag::allocate();
        let active = context.scheduler.allocate_command_buffer()?;
        let cycle = active.fence_cycle();
        let fill = (index % 255) as u8 + 1;

        let mut held: Vec<LockedBuffer> = Vec::new();
        let recorded = (|| -> Result<()> {
            active.command_buffer().begin()?;

            for _ in 0..OPS_PER_EXECUTION {
                let region = self.rng.below(self.params.regions);
                let op = self.rng.below(5);

                // Commands are recorded against backings directly, so buffers
                // are only merged before anything has been recorded.
                let span = if op == 4 && held.is_empty() && region + 1 < self.params.regions {
                    // Straddles into the next region's guest page.
                    GuestSpan::new(gpu_page(self.base, region) + PAGE_SIZE_U64 / 2, PAGE_SIZE_U64)
                } else {
                    GuestSpan::new(gpu_page(self.base, region), PAGE_SIZE_U64)
                };

                let view = context
                    .buffer
                    .find_or_create(span, tag, &mut |buffer| held.push(buffer))?;
                let locked = LockedBuffer::new(view.buffer(), tag);
                let first_usage = locked.is_first_usage();
                if first_usage {
                    // Pick up pending guest writes before the GPU sees the backing.
                    locked.synchronize_host(false);
                    held.push(locked);
                }
                let buffer = view.buffer();

                match op {
                    0 => {
                        let data = vec![fill; PAGE_SIZE];
                        let backing = buffer.backing().clone();
                        let offset = view.offset();
                        let mut gpu_copy =
                            || active.command_buffer().update_buffer(&backing, offset, &data);
                        view.write(&data, 0, Some(&mut gpu_copy));
                        self.stats.inline_updates += 1;
                    }
                    1 => {
                        buffer.mark_gpu_dirty();
                        let data = vec![fill; PAGE_SIZE];
                        active
                            .command_buffer()
                            .update_buffer(buffer.backing(), view.offset(), &data);
                        self.stats.gpu_writes += 1;
                    }
                    2 => {
                        let binding = {
                            let mut allocator = context.megabuffer.lock();
                            view.try_mega_buffer(&cycle, &mut allocator, tag, None)
                        };
                        let binding = if binding.is_valid() {
                            self.stats.megabuffer_hits += 1;
                            binding
                        } else {
                            self.stats.megabuffer_misses += 1;
                            buffer.block_sequenced_cpu_backing_writes();
                            view.binding()
                        };
                        if let Some(src) = &binding.buffer {
                            active.command_buffer().copy_buffer(
                                src,
                                binding.offset,
                                &self.scratch,
                                0,
                                binding.size.min(PAGE_SIZE_U64),
                            );
                        }
                    }
                    3 if first_usage => {
                        let data = view.read_only_backing_span(true, &mut || {});
                        if !is_uniform(&data) {
                            warn!("execution {}: torn GPU page readback at {}", index, span);
                            self.stats.violations += 1;
                        }
                        self.stats.readbacks += 1;
                    }
                    3 => {}
                    _ => self.stats.coalesce_requests += 1,
                }
            }

            let mut command_buffer = active.command_buffer();
            command_buffer.end()?;
            context
                .scheduler
                .submit_command_buffer(&mut **command_buffer, &cycle, &[], &[])?;
            Ok(())
        })();

        if let Err(e) = recorded {
            cycle.cancel();
            return Err(e).with_context(|| format!("execution {} failed", index));
        }

        for locked in &held {
            locked.update_cycle(&cycle);
            cycle.attach_object(locked.buffer().clone());
        }
        debug!(
            "execution {}: {} buffers, {} registered",
            index,
            held.len(),
            context.buffer.buffer_count()
        );
        drop(held);

        self.stats.executions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_common::settings::Settings;
    use mirage_gpu::backend::SoftBackend;

    fn context(regions: u64) -> (GpuContext, Arc<SoftGuestMemory>) {
        let memory = Arc::new(SoftGuestMemory::new(0x2000_0000, regions * REGION_SIZE).unwrap());
        let settings = Settings {
            megabuffer_chunk_size: 0x8_0000,
            fence_cycle_queue_depth: 32,
            ..Settings::default()
        };
        let context = GpuContext::new(Arc::new(SoftBackend::new()), memory.clone(), settings).unwrap();
        (context, memory)
    }

    #[test]
    fn test_xorshift_is_seeded() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        for _ in 0..16 {
            assert_eq!(a.next(), b.next());
        }
        assert!(XorShift::new(0).next() != 0);
        assert!(XorShift::new(3).below(10) < 10);
    }

    #[test]
    fn test_is_uniform() {
        assert!(is_uniform(&[]));
        assert!(is_uniform(&[5; 16]));
        assert!(!is_uniform(&[5, 5, 6]));
    }

    #[test]
    fn test_gpu_only_workload() {
        let (context, memory) = context(4);
        let params = WorkloadParams {
            guest_threads: 0,
            executions: 32,
            regions: 4,
            seed: 1,
        };
        let stats = run(&context, &memory, params).unwrap();
        assert_eq!(stats.executions, 32);
        assert_eq!(stats.violations, 0);
        assert!(context.buffer.buffer_count() >= 1);
    }

    #[test]
    fn test_concurrent_workload_is_coherent() {
        let (context, memory) = context(8);
        let params = WorkloadParams {
            guest_threads: 3,
            executions: 64,
            regions: 8,
            seed: 0x5eed,
        };
        let stats = run(&context, &memory, params).unwrap();
        assert_eq!(stats.violations, 0);
    }

    #[test]
    fn test_rejects_oversized_layout() {
        let (context, memory) = context(2);
        let params = WorkloadParams {
            guest_threads: 1,
            executions: 1,
            regions: 3,
            seed: 1,
        };
        assert!(run(&context, &memory, params).is_err());
    }
}
