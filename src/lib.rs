// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kestrel Microkernel - Scheduling and Synchronization Core
//!
//! This crate implements the scheduling heart of the Kestrel microkernel
//! for a four-core ARM64 machine: the per-core scheduler, the thread state
//! machine, the cross-core rescheduling protocol, and the synchronization
//! primitives (light lock, condition variable, address arbiter) on which
//! all higher-level IPC is built.
//!
//! The platform layers (boot, interrupt controller, secure monitor) link
//! against this crate and drive it through the `kernel::syscalls` surface
//! and the timer/IPI entry points.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// ABI-level types shared with user-mode library code
pub mod kapi;

// Kernel modules
pub mod kernel;
