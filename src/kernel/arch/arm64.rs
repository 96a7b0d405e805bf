// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! AArch64 Architecture Support
//!
//! DAIF manipulation for the scheduler lock's interrupt discipline, MPIDR
//! decoding for the core number, and WFI for the idle loop.

use super::InterruptState;
use crate::kapi::types::CpuId;

use aarch64_cpu::asm;
use aarch64_cpu::registers::MPIDR_EL1;
use aarch64_cpu::registers::Readable;

use core::sync::atomic::{compiler_fence, Ordering};

/// Disable regular interrupts on this core, returning the prior state.
#[inline(always)]
pub fn interrupts_save_disable() -> InterruptState {
    let enabled = !interrupts_disabled();
    // SAFETY: privileged MSR instruction for interrupt control
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        compiler_fence(Ordering::SeqCst);
    }
    InterruptState { enabled }
}

/// Restore the interrupt state saved by [`interrupts_save_disable`].
#[inline(always)]
pub fn interrupts_restore(state: InterruptState) {
    if state.enabled {
        // SAFETY: privileged MSR instruction for interrupt control
        unsafe {
            compiler_fence(Ordering::SeqCst);
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
        }
    }
}

/// Check if regular interrupts are masked on this core.
#[inline(always)]
pub fn interrupts_disabled() -> bool {
    let state: u64;
    // SAFETY: reading the interrupt state register
    unsafe {
        core::arch::asm!(
            "mrs {}, daif",
            out(reg) state,
            options(nomem, nostack, preserves_flags)
        );
    }
    (state & (1 << 7)) != 0
}

/// Core number from the affinity register.
#[inline(always)]
pub fn current_cpu_num() -> CpuId {
    (MPIDR_EL1.get() & 0xff) as CpuId
}

/// Wait for an interrupt in the idle loop.
#[inline(always)]
pub fn idle_wait() {
    asm::wfi();
}

/// Reschedule-IPI delivery hook. The SGI number and distributor access are
/// owned by the platform's GIC driver, registered here at boot.
pub fn send_reschedule_ipi(target: CpuId) {
    if let Some(f) = IPI_HOOK.get() {
        f(target);
    }
}

static IPI_HOOK: spin::Once<fn(CpuId)> = spin::Once::new();

/// Register the platform's IPI delivery function. May only be called once.
pub fn set_ipi_hook(f: fn(CpuId)) {
    IPI_HOOK.call_once(|| f);
}
