// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization Primitives
//!
//! The user-facing synchronization core: the generic wait/notify protocol,
//! the basic signalable event, the light lock with priority inheritance,
//! the process-wide condition variable, and the address arbiter.

pub mod address_arbiter;
pub mod condvar;
pub mod event;
pub mod light_lock;
pub mod spin;
pub mod wait_object;

pub use light_lock::LightLock;
pub use spin::{SpinMutex, SpinMutexGuard};
