// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture Layer
//!
//! Thin wrappers over the pieces of machine state the scheduling core
//! needs: the local interrupt mask, the core number, and the idle/relax
//! instructions. On AArch64 these hit the real system registers; on any
//! other target (host builds, unit tests) they fall back to no-ops so the
//! core stays testable off-device.

use crate::kapi::types::CpuId;

#[cfg(target_arch = "aarch64")]
pub mod arm64;

/// Saved local interrupt state, returned by [`interrupts_save_disable`].
#[derive(Debug, Clone, Copy)]
pub struct InterruptState {
    pub(crate) enabled: bool,
}

#[cfg(target_arch = "aarch64")]
pub use arm64::{current_cpu_num, idle_wait, interrupts_disabled, interrupts_restore, interrupts_save_disable};

#[cfg(not(target_arch = "aarch64"))]
mod host {
    use super::InterruptState;
    use crate::kapi::types::CpuId;

    pub fn interrupts_save_disable() -> InterruptState {
        InterruptState { enabled: false }
    }

    pub fn interrupts_restore(_state: InterruptState) {}

    pub fn interrupts_disabled() -> bool {
        true
    }

    pub fn current_cpu_num() -> CpuId {
        0
    }

    pub fn idle_wait() {
        core::hint::spin_loop();
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub use host::{current_cpu_num, idle_wait, interrupts_disabled, interrupts_restore, interrupts_save_disable};

/// Pause inside a spin loop.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Ask the interrupt controller to deliver a reschedule interrupt to
/// `target`. The GIC driver lives in the platform layer; the scheduling
/// core only latches the request (see `kernel::mp`) and calls this hook so
/// an online core is kicked out of WFI promptly.
#[inline(always)]
pub fn send_reschedule_ipi(target: CpuId) {
    #[cfg(target_arch = "aarch64")]
    arm64::send_reschedule_ipi(target);

    #[cfg(not(target_arch = "aarch64"))]
    let _ = target;
}
