// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Objects
//!
//! The handle-table collaborator interface and the resource-limit gate.

pub mod handle;
pub mod resource_limit;

pub use handle::{HandleTable, KObject, HANDLE_WAIT_MASK};
pub use resource_limit::{ResourceKind, ResourceLimit};
