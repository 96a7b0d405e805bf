// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kestrel Microkernel - Core Kernel Module
//!
//! This module contains the scheduling and synchronization core.

// Re-export commonly used types
pub use crate::kapi::types::*;

// Architecture module
pub mod arch;

// Core kernel modules
pub mod debug;
pub mod mp;
pub mod object;
pub mod percpu;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod syscalls;
pub mod thread;
pub mod timer;
pub mod usercopy;

#[cfg(test)]
pub mod tests;

use sched::Kernel;

/// Global kernel instance, created on first use.
static KERNEL: spin::Once<Kernel> = spin::Once::new();

/// Get the global kernel instance.
pub fn kernel() -> &'static Kernel {
    KERNEL.call_once(Kernel::new)
}

/// Kernel initialization
///
/// Called once from the platform entry point after the boot core has a
/// stack and exception vectors.
pub fn init() {
    let _ = kernel();
    crate::log_info!("Kestrel scheduling core initialized ({} cores)", MAX_CORES);
}
