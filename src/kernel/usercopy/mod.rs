// Copyright 2025 The Kestrel Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! User Memory Access
//!
//! Every touch of user-visible memory by the synchronization core goes
//! through this interface: addresses are range- and alignment-checked
//! before any lock is taken, and an access fault inside the window comes
//! back as a status code for the caller, never a kernel panic. The
//! read-modify-write helpers are atomic with respect to other arbiter and
//! condition-variable operations because they run under the scheduler
//! lock with interrupts masked.
//!
//! The page-table walker itself belongs to the memory manager; this
//! module holds the narrow access surface plus a flat backing used by the
//! host harness and boot-time selftests.

use crate::kapi::types::*;
use crate::kapi::types::err::*;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

/// Reject kernel-reserved or misaligned addresses before taking locks.
pub fn validate_user_address(addr: VAddr, align: usize) -> Result {
    if addr == 0 || addr >= USER_ADDRESS_TOP {
        return Err(KX_ERR_INVALID_ADDRESS);
    }
    if addr & (align - 1) != 0 {
        return Err(KX_ERR_INVALID_ADDRESS);
    }
    Ok(())
}

/// Page-table-checked access to the current address space.
pub trait UserMemory {
    fn read32(&self, addr: VAddr) -> Result<u32>;
    fn write32(&mut self, addr: VAddr, value: u32) -> Result;
    fn read64(&self, addr: VAddr) -> Result<u64>;
}

/// ============================================================================
/// Flat Backing
/// ============================================================================

const PAGE_SIZE: usize = 0x1000;

/// Page-granular flat user memory. Unmapped pages fault with
/// `KX_ERR_INVALID_CURRENT_MEMORY`, the same way a real translation
/// failure would surface.
pub struct FlatUserSpace {
    pages: BTreeMap<VAddr, Vec<u8>>,
}

impl FlatUserSpace {
    pub fn new() -> Self {
        Self { pages: BTreeMap::new() }
    }

    /// Map zeroed pages covering `[addr, addr + len)`.
    pub fn map(&mut self, addr: VAddr, len: usize) {
        let first = addr & !(PAGE_SIZE - 1);
        let last = (addr + len.max(1) - 1) & !(PAGE_SIZE - 1);
        let mut page = first;
        loop {
            self.pages.entry(page).or_insert_with(|| vec![0; PAGE_SIZE]);
            if page == last {
                break;
            }
            page += PAGE_SIZE;
        }
    }

    fn slot(&self, addr: VAddr, len: usize) -> Result<(VAddr, usize)> {
        let page = addr & !(PAGE_SIZE - 1);
        let offset = addr & (PAGE_SIZE - 1);
        // Naturally aligned accesses never straddle a page.
        if offset + len > PAGE_SIZE || !self.pages.contains_key(&page) {
            return Err(KX_ERR_INVALID_CURRENT_MEMORY);
        }
        Ok((page, offset))
    }
}

impl Default for FlatUserSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl UserMemory for FlatUserSpace {
    fn read32(&self, addr: VAddr) -> Result<u32> {
        let (page, off) = self.slot(addr, 4)?;
        let bytes = &self.pages[&page][off..off + 4];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write32(&mut self, addr: VAddr, value: u32) -> Result {
        let (page, off) = self.slot(addr, 4)?;
        let bytes = self.pages.get_mut(&page).ok_or(KX_ERR_INVALID_CURRENT_MEMORY)?;
        bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read64(&self, addr: VAddr) -> Result<u64> {
        let (page, off) = self.slot(addr, 8)?;
        let bytes = &self.pages[&page][off..off + 8];
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }
}

// ============================================================================
// Tests
// ============================================================================
