//! Process-wide memory registration map.
//!
//! One map instance exists per protection domain and is shared by every
//! queue pair bound to that domain, with reference counting deciding when
//! the registrations are torn down. Payload buffers register once and are
//! then translated to `(lkey, rkey)` pairs whenever a work request needs
//! them. A translation never spans two regions: if the registered range
//! covers fewer bytes than requested, the lookup fails.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rdma::verbs::{AccessFlags, Mr, Pd};
use crate::util::dma::DmaBuf;

/// A user-installed hook that supplies remote keys instead of registering
/// memory regions with the device.
pub type GetRkeyHook = Arc<dyn Fn(u64, usize) -> u32 + Send + Sync>;

/// The `(lkey, rkey)` pair a translated address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Local key
    pub lkey: u32,
    /// Remote key
    pub rkey: u32,
}

struct Region {
    addr: u64,
    len: usize,
    /// The registered region, unless a hook supplied the key directly.
    mr: Option<Mr>,
    /// Hook-provided key (lkey == rkey in that mode).
    raw_key: Option<u32>,
}

impl Region {
    fn translation(&self) -> Translation {
        match (&self.mr, self.raw_key) {
            (Some(mr), _) => Translation {
                lkey: mr.lkey,
                rkey: mr.rkey,
            },
            (None, Some(key)) => Translation {
                lkey: key,
                rkey: key,
            },
            (None, None) => unreachable!("region with neither MR nor raw key"),
        }
    }
}

struct MemMapInner {
    pd: Pd,
    hook: Option<GetRkeyHook>,
    regions: RwLock<Vec<Region>>,
    refs: AtomicUsize,
}

/// The shared per-protection-domain registration map.
#[derive(Clone)]
pub struct MemMap {
    inner: Arc<MemMapInner>,
}

impl std::fmt::Debug for MemMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemMap")
            .field("pd", &self.inner.pd.id())
            .field("regions", &self.inner.regions.read().len())
            .field("refs", &self.inner.refs.load(Ordering::Relaxed))
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref MR_MAPS: DashMap<u32, MemMap> = DashMap::new();
}

impl MemMap {
    /// Get the shared map for `pd`, creating it on first use.
    ///
    /// Every call bumps the reference count; pair it with [`MemMap::release`].
    pub fn for_pd(pd: &Pd, hook: Option<GetRkeyHook>) -> MemMap {
        let entry = MR_MAPS.entry(pd.id()).or_insert_with(|| MemMap {
            inner: Arc::new(MemMapInner {
                pd: pd.clone(),
                hook,
                regions: RwLock::new(Vec::new()),
                refs: AtomicUsize::new(0),
            }),
        });
        let map = entry.clone();
        map.inner.refs.fetch_add(1, Ordering::AcqRel);
        map
    }

    /// Drop one reference. The last release deregisters every region and
    /// removes the map from the process-wide registry.
    pub fn release(&self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let device = self.inner.pd.device().clone();
            let mut regions = self.inner.regions.write();
            for region in regions.drain(..) {
                if let Some(mr) = region.mr {
                    device.dereg_mr(&mr);
                }
            }
            MR_MAPS.remove(&self.inner.pd.id());
            debug!(pd = self.inner.pd.id(), "released memory map");
        }
    }

    /// Current reference count; used by teardown sanity checks.
    pub fn refs(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Register a buffer so its address range can be translated.
    ///
    /// Without a hook the range is registered with the device for local
    /// write plus remote read and write. With a hook the caller-provided
    /// key is stored instead, and ranges adjacent to an existing one that
    /// resolve to the same key collapse into it.
    pub fn register(&self, buf: &DmaBuf) -> Result<()> {
        let addr = buf.base();
        let len = buf.len();
        let mut regions = self.inner.regions.write();

        if regions
            .iter()
            .any(|r| addr < r.addr + r.len as u64 && r.addr < addr + len as u64)
        {
            return Err(Error::invalid(format!(
                "range {:#x}+{} overlaps an existing registration",
                addr, len
            )));
        }

        if let Some(hook) = &self.inner.hook {
            let key = hook(addr, len);
            if let Some(prev) = regions
                .iter_mut()
                .find(|r| r.raw_key == Some(key) && r.addr + r.len as u64 == addr)
            {
                // Contiguous range with an identical translation collapses.
                prev.len += len;
                return Ok(());
            }
            regions.push(Region {
                addr,
                len,
                mr: None,
                raw_key: Some(key),
            });
            return Ok(());
        }

        let mr = self.inner.pd.device().reg_mr(
            &self.inner.pd,
            buf.clone(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        );
        regions.push(Region {
            addr,
            len,
            mr: Some(mr),
            raw_key: None,
        });
        Ok(())
    }

    /// Remove the registration that starts at `addr`.
    pub fn unregister(&self, addr: u64) -> Result<()> {
        let mut regions = self.inner.regions.write();
        let idx = regions
            .iter()
            .position(|r| r.addr == addr)
            .ok_or_else(|| Error::not_found(format!("no registration at {:#x}", addr)))?;
        let region = regions.remove(idx);
        if let Some(mr) = region.mr {
            self.inner.pd.device().dereg_mr(&mr);
        }
        Ok(())
    }

    /// Translate `addr .. addr + len` to its keys.
    ///
    /// Fails with a not-found error when the range is unregistered or when
    /// the registered region covers fewer bytes than requested.
    pub fn translate(&self, addr: u64, len: usize) -> Result<Translation> {
        let regions = self.inner.regions.read();
        for region in regions.iter() {
            if addr >= region.addr && addr < region.addr + region.len as u64 {
                let real = (region.addr + region.len as u64 - addr) as usize;
                if real < len {
                    return Err(Error::not_found(format!(
                        "buffer {:#x}+{} split over multiple memory regions",
                        addr, len
                    )));
                }
                return Ok(region.translation());
            }
        }
        Err(Error::not_found(format!("no translation for {:#x}", addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::verbs::{Device, DeviceAttr};

    #[test]
    fn test_map_shared_per_pd_and_refcounted() {
        let device = Device::new("mem0", DeviceAttr::default());
        let pd = device.alloc_pd();

        let a = MemMap::for_pd(&pd, None);
        let b = MemMap::for_pd(&pd, None);
        assert_eq!(a.refs(), 2);

        let buf = DmaBuf::alloc(4096);
        a.register(&buf).unwrap();
        // Visible through the other handle: it is the same map.
        assert!(b.translate(buf.base(), 4096).is_ok());

        b.release();
        assert_eq!(a.refs(), 1);
        a.release();

        // A fresh acquire starts empty.
        let c = MemMap::for_pd(&pd, None);
        assert!(c.translate(buf.base(), 16).is_err());
        c.release();
    }

    #[test]
    fn test_translate_no_span() {
        let device = Device::new("mem1", DeviceAttr::default());
        let pd = device.alloc_pd();
        let map = MemMap::for_pd(&pd, None);

        let buf = DmaBuf::alloc(4096);
        map.register(&buf).unwrap();
        let t = map.translate(buf.base() + 100, 1000).unwrap();
        assert_eq!(t.lkey, t.rkey);
        assert!(map.translate(buf.base() + 4000, 200).is_err());
        map.release();
    }

    #[test]
    fn test_hook_supplies_keys_and_collapses_adjacent() {
        let device = Device::new("mem2", DeviceAttr::default());
        let pd = device.alloc_pd();
        let hook: GetRkeyHook = Arc::new(|_addr, _len| 0x77);
        let map = MemMap::for_pd(&pd, Some(hook));

        let a = DmaBuf::alloc_at(0x8000_0000, 4096).unwrap();
        let b = DmaBuf::alloc_at(0x8000_1000, 4096).unwrap();
        map.register(&a).unwrap();
        map.register(&b).unwrap();

        // The two adjacent ranges with the same key collapsed: a lookup
        // spanning the seam succeeds.
        let t = map.translate(0x8000_0800, 4096).unwrap();
        assert_eq!(t.rkey, 0x77);
        map.release();
    }

    #[test]
    fn test_overlapping_registration_rejected() {
        let device = Device::new("mem3", DeviceAttr::default());
        let pd = device.alloc_pd();
        let map = MemMap::for_pd(&pd, None);
        let a = DmaBuf::alloc_at(0x9000_0000, 8192).unwrap();
        let b = DmaBuf::alloc_at(0x9000_1000, 4096).unwrap();
        map.register(&a).unwrap();
        assert!(map.register(&b).is_err());
        map.release();
    }
}
