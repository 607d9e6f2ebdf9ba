// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod error;
pub mod memory;
pub mod settings;
pub mod types;

pub use error::{GuestMemoryError, GuestMemoryResult};
pub use types::*;
