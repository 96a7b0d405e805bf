// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Event Objects
//!
//! The basic signalable object: sticky once signaled until explicitly
//! cleared, waited on through the synchronization-object protocol. The
//! higher IPC layers (ports, sessions) build on the same protocol; the
//! event is the form of it this core owns.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use crate::kernel::sched::KernelState;

use crate::log_trace;

impl KernelState {
    /// Create an unsignaled event.
    pub fn create_event(&mut self) -> ObjId {
        let id = self.objects.create();
        log_trace!("created event {}", id);
        id
    }

    /// Signal an event, waking all current waiters. The event stays
    /// signaled until cleared, so later waits complete immediately.
    pub fn signal_event(&mut self, acting: CpuId, id: ObjId) -> Result {
        match self.objects.get_mut(id) {
            Some(obj) => obj.signaled = true,
            None => return Err(KX_ERR_BAD_HANDLE),
        }
        self.notify_available(acting, id, KX_OK);
        Ok(())
    }

    /// Reset an event to unsignaled.
    pub fn clear_event(&mut self, id: ObjId) -> Result {
        match self.objects.get_mut(id) {
            Some(obj) => {
                obj.signaled = false;
                Ok(())
            }
            None => Err(KX_ERR_BAD_HANDLE),
        }
    }

    /// Read an event's signal state.
    pub fn event_signaled(&self, id: ObjId) -> Result<bool> {
        self.objects.get(id).map(|o| o.is_signaled()).ok_or(KX_ERR_BAD_HANDLE)
    }
}
