// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kestrel common types shared across the kernel/user boundary

pub mod types;
pub mod errors;

// Type aliases for the C-level ABI surface
pub use types::Status as kx_status_t;
pub use types::VAddr as vaddr_t;

// Re-export common types
pub use types::*;
pub use types::err::*;
pub use errors::*;
