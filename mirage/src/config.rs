// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use mirage_common::settings::{parse_bool_or, BackendKind, Settings};
use std::path::PathBuf;

/// Locate mirage.ini.
pub fn find_config_path() -> Option<PathBuf> {
    // XDG_CONFIG_HOME/mirage/mirage.ini
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("mirage").join("mirage.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/mirage/mirage.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("mirage")
            .join("mirage.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from mirage.ini, falling back to defaults for anything
/// missing or malformed.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No mirage config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    apply_config(&conf, &mut settings);
    settings
}

fn apply_config(conf: &Ini, settings: &mut Settings) {
    // [Gpu]
    if let Some(section) = conf.section(Some("Gpu")) {
        if let Some(backend) = section.get("backend") {
            settings.backend = BackendKind::from_str_or_default(backend);
            debug!("GPU backend: {:?}", settings.backend);
        }
        if let Some(size) = section.get("megabuffer_chunk_size") {
            match parse_size(size) {
                Some(size) if size > 0 => settings.megabuffer_chunk_size = size,
                _ => warn!("Ignoring invalid megabuffer_chunk_size: {}", size),
            }
        }
        if let Some(depth) = section.get("fence_cycle_queue_depth") {
            match depth.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => settings.fence_cycle_queue_depth = depth,
                _ => warn!("Ignoring invalid fence_cycle_queue_depth: {}", depth),
            }
        }
    }

    // [Hacks]
    if let Some(section) = conf.section(Some("Hacks")) {
        if let Some(v) = section.get("enable_fast_gpu_readback") {
            settings.enable_fast_gpu_readback = parse_bool_or(v, settings.enable_fast_gpu_readback);
        }
        if let Some(v) = section.get("enable_fast_readback_writes") {
            settings.enable_fast_readback_writes =
                parse_bool_or(v, settings.enable_fast_readback_writes);
        }
        debug!(
            "Fast readback: {}, writes: {}",
            settings.enable_fast_gpu_readback, settings.enable_fast_readback_writes
        );
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        if let Some(v) = section.get("use_debug_logging") {
            settings.use_debug_logging = parse_bool_or(v, settings.use_debug_logging);
        }
    }
}

/// Parse a byte count given in decimal or `0x` hex.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
