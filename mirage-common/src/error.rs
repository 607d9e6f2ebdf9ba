// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::types::VAddr;

/// Errors raised by a guest memory implementation.
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    #[error("range [0x{0:016X}..+0x{1:X}) is outside guest memory")]
    OutOfRange(VAddr, u64),

    #[error("guest buffer spans must be page-aligned at their joins")]
    MisalignedSpans,

    #[error("guest buffer has no spans")]
    Empty,

    #[error("failed to create guest memory mapping: {0}")]
    MmapFailed(#[from] std::io::Error),
}

/// Result alias for guest memory operations.
pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;
