// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Handle Table
//!
//! The narrow handle-to-object lookup the synchronization core consumes.
//! Handle allocation policy, rights and per-process tables belong to the
//! capability layer; here a handle resolves to a thread or a signalable
//! object, nothing more.

use crate::kapi::types::*;
use alloc::collections::BTreeMap;

/// Bit set in a user mutex word while any thread is parked on it. Handle
/// values are allocated below this bit so the two never collide.
pub const HANDLE_WAIT_MASK: u32 = 0x4000_0000;

/// Kernel object a handle can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KObject {
    Thread(Tid),
    Sync(ObjId),
}

/// Handle table.
pub struct HandleTable {
    entries: BTreeMap<Handle, KObject>,
    next: u32,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
        }
    }

    /// Install an object, returning its handle.
    pub fn add(&mut self, obj: KObject) -> Handle {
        let handle = self.next;
        self.next = (self.next + 1) & (HANDLE_WAIT_MASK - 1);
        if self.next == 0 {
            self.next = 1;
        }
        self.entries.insert(handle, obj);
        handle
    }

    /// Resolve a handle.
    pub fn get(&self, handle: Handle) -> Option<KObject> {
        self.entries.get(&handle).copied()
    }

    /// Resolve a handle that must name a thread.
    pub fn get_thread(&self, handle: Handle) -> Option<Tid> {
        match self.get(handle) {
            Some(KObject::Thread(tid)) => Some(tid),
            _ => None,
        }
    }

    /// Resolve a handle that must name a signalable object.
    pub fn get_sync(&self, handle: Handle) -> Option<ObjId> {
        match self.get(handle) {
            Some(KObject::Sync(oid)) => Some(oid),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<KObject> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
