// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Size in bytes of a single megabuffer chunk (25 MiB).
pub const DEFAULT_MEGABUFFER_CHUNK_SIZE: u64 = 25 * 1024 * 1024;

/// Number of fence cycles the scheduler's waiter queue can hold.
pub const DEFAULT_FENCE_CYCLE_QUEUE_DEPTH: usize = 256;

/// Global settings, populated from the config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Gpu
    pub backend: BackendKind,
    pub megabuffer_chunk_size: u64,
    pub fence_cycle_queue_depth: usize,

    // Hacks
    pub enable_fast_gpu_readback: bool,
    pub enable_fast_readback_writes: bool,

    // Debug
    pub use_debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Soft,
            megabuffer_chunk_size: DEFAULT_MEGABUFFER_CHUNK_SIZE,
            fence_cycle_queue_depth: DEFAULT_FENCE_CYCLE_QUEUE_DEPTH,
            enable_fast_gpu_readback: false,
            enable_fast_readback_writes: false,
            use_debug_logging: false,
        }
    }
}

/// Which GPU backend executes submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Soft,
    Vulkan,
}

impl BackendKind {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "soft" | "software" => Self::Soft,
            "1" | "vulkan" => Self::Vulkan,
            _ => Self::Soft,
        }
    }
}

/// Parse an INI-style boolean ("true"/"1"), falling back to `default`.
pub fn parse_bool_or(s: &str, default: bool) -> bool {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!(BackendKind::from_str_or_default("vulkan"), BackendKind::Vulkan);
        assert_eq!(BackendKind::from_str_or_default(" 1 "), BackendKind::Vulkan);
        assert_eq!(BackendKind::from_str_or_default("Soft"), BackendKind::Soft);
        assert_eq!(BackendKind::from_str_or_default("opengl"), BackendKind::Soft);
    }

    #[test]
    fn test_fast_readback_disabled_by_default() {
        let settings = Settings::default();
        assert!(!settings.enable_fast_gpu_readback);
        assert!(!settings.enable_fast_readback_writes);
        assert_eq!(settings.megabuffer_chunk_size, 25 * 1024 * 1024);
    }

    #[test]
    fn test_parse_bool_or() {
        assert!(parse_bool_or("true", false));
        assert!(!parse_bool_or("0", true));
        assert!(parse_bool_or("garbage", true));
    }
}
