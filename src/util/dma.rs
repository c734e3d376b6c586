//! DMA-able buffer model.
//!
//! Real deployments hand out pinned huge-page memory with stable virtual
//! addresses; registration maps and wire SGLs are all keyed by those
//! addresses. This module models the same contract in process memory: every
//! [`DmaBuf`] owns its bytes and carries a unique virtual base address
//! assigned from a process-wide address space, so address arithmetic done
//! by SGL parsing and memory translation behaves exactly like it would over
//! pinned memory.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Allocation granularity of the simulated address space.
const DMA_ALIGNMENT: u64 = 4096;

/// First address handed out by the allocator. Non-zero so that a zero
/// address can keep meaning "no buffer".
const DMA_SPACE_BASE: u64 = 0x1_0000_0000;

lazy_static::lazy_static! {
    static ref NEXT_VADDR: Mutex<u64> = Mutex::new(DMA_SPACE_BASE);
}

fn assign_vaddr(len: usize) -> u64 {
    let mut next = NEXT_VADDR.lock();
    let base = *next;
    let span = (len as u64 + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1);
    *next += span.max(DMA_ALIGNMENT);
    base
}

/// A contiguous byte region with a stable virtual address.
///
/// Cloning is cheap and shares the underlying storage, mirroring how many
/// queue structures can reference the same pinned allocation.
#[derive(Clone)]
pub struct DmaBuf {
    base: u64,
    mem: Arc<RwLock<Vec<u8>>>,
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaBuf {
    /// Allocate a zeroed buffer and assign it a fresh virtual address.
    pub fn alloc(len: usize) -> Self {
        Self {
            base: assign_vaddr(len),
            mem: Arc::new(RwLock::new(vec![0u8; len])),
        }
    }

    /// Allocate a zeroed buffer at a caller-chosen virtual address.
    ///
    /// Used by tests that need wire-visible addresses with exact values.
    pub fn alloc_at(base: u64, len: usize) -> Result<Self> {
        if base == 0 {
            return Err(Error::invalid("DMA buffer address may not be zero"));
        }
        Ok(Self {
            base,
            mem: Arc::new(RwLock::new(vec![0u8; len])),
        })
    }

    /// The virtual base address of this buffer.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.mem.read().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `addr .. addr + len` falls entirely inside this buffer.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base && addr + len as u64 <= self.base + self.len() as u64
    }

    /// Read `out.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let mem = self.mem.read();
        out.copy_from_slice(&mem[offset..offset + out.len()]);
    }

    /// Write `data` starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut mem = self.mem.write();
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy out a sub-range as an owned vector.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mem = self.mem.read();
        mem[offset..offset + len].to_vec()
    }

    /// Run `f` over an immutable window of the buffer.
    pub fn with<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let mem = self.mem.read();
        f(&mem[offset..offset + len])
    }

    /// Run `f` over a mutable window of the buffer.
    pub fn with_mut<R>(&self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut mem = self.mem.write();
        f(&mut mem[offset..offset + len])
    }

    /// Zero the whole buffer.
    pub fn zero(&self) {
        let mut mem = self.mem.write();
        mem.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_assigns_distinct_addresses() {
        let a = DmaBuf::alloc(64);
        let b = DmaBuf::alloc(64);
        assert_ne!(a.base(), b.base());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let buf = DmaBuf::alloc(32);
        buf.write_at(4, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        buf.read_at(4, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_alloc_at_fixed_address() {
        let buf = DmaBuf::alloc_at(0xDDDD, 4096).unwrap();
        assert_eq!(buf.base(), 0xDDDD);
        assert!(buf.contains(0xDDDD + 100, 10));
        assert!(!buf.contains(0xDDDD, 4097));
        assert!(DmaBuf::alloc_at(0, 16).is_err());
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = DmaBuf::alloc(16);
        let b = a.clone();
        a.write_at(0, &[0xAB]);
        assert_eq!(b.to_vec(0, 1), vec![0xAB]);
    }
}
