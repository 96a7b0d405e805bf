// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! System Call Surface
//!
//! The kernel ABI consumed by user-mode library code. Argument validation
//! (alignment, address ranges, handle counts, enum values) happens here,
//! before any lock is taken; the operations themselves live with their
//! subsystems.

pub mod sync;

pub use crate::kernel::sched::Outcome;
