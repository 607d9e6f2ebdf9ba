// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use mirage_common::settings::BackendKind;
use mirage_gpu::backend::{GpuBackend, SoftBackend};
use mirage_gpu::GpuContext;
use mirage_memory::SoftGuestMemory;

use workload::{WorkloadParams, REGION_SIZE};

/// Base of the guest window the workload runs against.
const GUEST_BASE: u64 = 0x8000_0000;

/// mirage - GPU buffer coherence workload
#[derive(Parser, Debug)]
#[command(name = "mirage", version, about = "Drives guest and GPU traffic through the mirage buffer layer")]
struct Args {
    /// Path to config file (default: auto-detect mirage.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// GPU backend to use, overriding the config (soft or vulkan)
    #[arg(long)]
    backend: Option<String>,

    /// Number of guest threads accessing memory concurrently
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Number of GPU executions to run
    #[arg(long, default_value_t = 500)]
    executions: u64,

    /// Number of two-page guest regions
    #[arg(long, default_value_t = 64)]
    regions: u64,

    /// Seed for the access pattern
    #[arg(long, default_value_t = 0x6d69_7261_6765)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(backend) = &args.backend {
        settings.backend = BackendKind::from_str_or_default(backend);
    }

    // Initialize logging
    let log_level = if args.verbose || settings.use_debug_logging {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("mirage - GPU buffer coherence workload");
    info!("======================================");
    info!("GPU backend: {:?}", settings.backend);

    let backend = create_backend(settings.backend)?;
    let memory = Arc::new(
        SoftGuestMemory::new(GUEST_BASE, args.regions * REGION_SIZE)
            .context("Failed to map guest memory")?,
    );
    let context = GpuContext::new(backend, memory.clone(), settings)
        .context("Failed to create GPU context")?;

    let params = WorkloadParams {
        guest_threads: args.threads,
        executions: args.executions,
        regions: args.regions,
        seed: args.seed,
    };
    let stats = workload::run(&context, &memory, params)?;

    info!(
        "Completed {} executions and {} guest accesses without coherence violations",
        stats.executions, stats.guest_accesses
    );
    Ok(())
}

fn create_backend(kind: BackendKind) -> Result<Arc<dyn GpuBackend>> {
    match kind {
        BackendKind::Soft => Ok(Arc::new(SoftBackend::new())),
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => {
            let backend = mirage_gpu::backend::VulkanBackend::new()
                .context("Failed to initialize the Vulkan backend")?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "vulkan"))]
        BackendKind::Vulkan => {
            log::warn!("Built without Vulkan support, falling back to the soft backend");
            Ok(Arc::new(SoftBackend::new()))
        }
    }
}
