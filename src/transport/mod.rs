//! Pluggable transport registry and shared resource pools.
//!
//! Transports register by name at process init; creation validates the
//! process-wide option block, instantiates the named transport, and
//! attaches the shared data-buffer pool. The pools here are bounded
//! multi-producer free lists: a shared pool of `io_unit_size` buffers with
//! bounded per-poll-group caches in front of it, and an object pool
//! bounding the data work-request records the target can have in flight.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{RdmaOpts, TransportOpts};
use crate::error::{Error, Result};
use crate::proto::{MAX_SGL_DESCRIPTORS, NVME_CMD_SIZE};
use crate::util::dma::DmaBuf;

/// NVMe-oF controller capabilities a transport contributes.
#[derive(Debug, Clone, Copy)]
pub struct ControllerData {
    /// I/O command capsule size in 16-byte units
    pub ioccsz: u32,
    /// In-capsule data offset in 16-byte units
    pub icdoff: u16,
    /// Maximum SGL data-block descriptors per command
    pub msdbd: u8,
}

impl Default for ControllerData {
    fn default() -> Self {
        Self {
            ioccsz: (NVME_CMD_SIZE / 16) as u32,
            icdoff: 0,
            msdbd: MAX_SGL_DESCRIPTORS as u8,
        }
    }
}

/// One discovery log page entry describing a listener.
#[derive(Debug, Clone)]
pub struct DiscoveryLogEntry {
    /// Transport type string
    pub trtype: &'static str,
    /// Listen address
    pub traddr: String,
    /// Listen service id (port)
    pub trsvcid: String,
    /// RDMA queue pair service type
    pub qptype: &'static str,
    /// RDMA provider type
    pub prtype: &'static str,
    /// RDMA connection management service
    pub cms: &'static str,
}

/// The capability surface every fabric transport exposes.
///
/// Poll groups are owned values driven by their poll-group threads and
/// live on the concrete transport type; this trait carries the shared
/// control-plane surface the registry can hand out uniformly.
pub trait FabricTransport: Send + Sync + std::fmt::Debug {
    /// The registered transport name.
    fn name(&self) -> &'static str;

    /// The validated process-wide options.
    fn opts(&self) -> TransportOpts;

    /// Begin listening on an address.
    fn listen(&self, addr: &str) -> Result<()>;

    /// Stop listening on an address.
    fn stop_listen(&self, addr: &str) -> Result<()>;

    /// Drive the connection acceptor and event channel once.
    fn accept_poll(&self) -> usize;

    /// Contribute transport-specific controller capabilities.
    fn cdata_init(&self, cdata: &mut ControllerData);

    /// Describe a listener for the discovery log.
    fn listener_discover(&self, addr: &str) -> Option<DiscoveryLogEntry>;

    /// Dump the transport-specific options as JSON.
    fn dump_opts(&self) -> serde_json::Value;
}

/// Factory that builds a transport from validated options. The factory
/// allocates the transport's devices and buffer pool itself, since the
/// final I/O unit size depends on the device's SGE budget.
pub type TransportFactory =
    Arc<dyn Fn(TransportOpts, RdmaOpts) -> Result<Arc<dyn FabricTransport>> + Send + Sync>;

lazy_static::lazy_static! {
    static ref TRANSPORTS: DashMap<&'static str, TransportFactory> = DashMap::new();
}

/// Register a transport under `name`. Later registrations of the same
/// name replace earlier ones.
pub fn register_transport(name: &'static str, factory: TransportFactory) {
    TRANSPORTS.insert(name, factory);
    debug!(name, "registered transport");
}

/// Create a registered transport.
///
/// Validates and clamps `opts` and decodes the transport-specific JSON
/// (when provided) before calling into the factory.
pub fn create_transport(
    name: &str,
    mut opts: TransportOpts,
    specific_json: Option<&str>,
) -> Result<Arc<dyn FabricTransport>> {
    let factory = TRANSPORTS
        .get(name)
        .map(|f| f.clone())
        .ok_or_else(|| Error::not_found(format!("transport type '{}' unavailable", name)))?;

    opts.validate()?;

    let rdma_opts = match specific_json {
        Some(raw) => RdmaOpts::from_json(raw)?,
        None => RdmaOpts::default(),
    };

    info!(
        name,
        max_queue_depth = opts.max_queue_depth,
        max_io_size = opts.max_io_size,
        io_unit_size = opts.io_unit_size,
        in_capsule_data_size = opts.in_capsule_data_size,
        num_shared_buffers = opts.num_shared_buffers,
        "creating transport"
    );
    factory(opts, rdma_opts)
}

struct BufferPoolInner {
    unit: usize,
    queue: ArrayQueue<DmaBuf>,
    total: usize,
    all: Vec<DmaBuf>,
}

/// Bounded multi-producer free list of `io_unit_size` data buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("unit", &self.inner.unit)
            .field("free", &self.inner.queue.len())
            .field("total", &self.inner.total)
            .finish()
    }
}

impl BufferPool {
    /// Allocate a pool of `count` buffers of `unit` bytes each.
    pub fn new(count: usize, unit: usize) -> Self {
        let queue = ArrayQueue::new(count.max(1));
        let mut all = Vec::with_capacity(count);
        for _ in 0..count {
            let buf = DmaBuf::alloc(unit);
            all.push(buf.clone());
            let _ = queue.push(buf);
        }
        Self {
            inner: Arc::new(BufferPoolInner {
                unit,
                queue,
                total: count,
                all,
            }),
        }
    }

    /// Every buffer the pool owns, circulating or free. Used to register
    /// the pool memory with a device at transport creation.
    pub fn buffers(&self) -> &[DmaBuf] {
        &self.inner.all
    }

    /// Buffer size of this pool.
    pub fn unit(&self) -> usize {
        self.inner.unit
    }

    /// Buffers currently free.
    pub fn count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Total buffers owned by the pool.
    pub fn total(&self) -> usize {
        self.inner.total
    }

    /// Take one buffer.
    pub fn get(&self) -> Option<DmaBuf> {
        self.inner.queue.pop()
    }

    /// Take `n` buffers, all or nothing.
    pub fn get_bulk(&self, n: usize) -> Option<Vec<DmaBuf>> {
        let mut bufs = Vec::with_capacity(n);
        for _ in 0..n {
            match self.inner.queue.pop() {
                Some(buf) => bufs.push(buf),
                None => {
                    for buf in bufs {
                        let _ = self.inner.queue.push(buf);
                    }
                    return None;
                }
            }
        }
        Some(bufs)
    }

    /// Return a buffer to the pool.
    pub fn put(&self, buf: DmaBuf) {
        let _ = self.inner.queue.push(buf);
    }
}

/// A per-poll-group cache in front of the shared buffer pool.
///
/// Releases refill the cache up to its reservation before spilling back
/// to the shared pool; acquisitions drain the cache before touching it.
#[derive(Debug)]
pub struct BufCache {
    pool: BufferPool,
    cache: Vec<DmaBuf>,
    capacity: usize,
}

impl BufCache {
    /// Reserve up to `capacity` buffers out of `pool` for this cache.
    ///
    /// When the pool cannot supply the reservation the capacity is
    /// clamped down to what it could.
    pub fn new(pool: BufferPool, capacity: usize) -> Self {
        let mut cache = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match pool.get() {
                Some(buf) => cache.push(buf),
                None => break,
            }
        }
        if cache.len() < capacity {
            warn!(
                requested = capacity,
                reserved = cache.len(),
                "buffer cache reservation clamped, shared pool too small"
            );
        }
        let capacity = cache.len();
        Self {
            pool,
            cache,
            capacity,
        }
    }

    /// The clamped reservation size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers sitting in the cache right now.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Take `n` buffers, cache first, then the shared pool; all or
    /// nothing.
    pub fn get_bulk(&mut self, n: usize) -> Option<Vec<DmaBuf>> {
        let mut bufs = Vec::with_capacity(n);
        while bufs.len() < n {
            if let Some(buf) = self.cache.pop() {
                bufs.push(buf);
            } else {
                break;
            }
        }
        let missing = n - bufs.len();
        if missing > 0 {
            match self.pool.get_bulk(missing) {
                Some(more) => bufs.extend(more),
                None => {
                    // Roll everything back.
                    for buf in bufs {
                        self.put(buf);
                    }
                    return None;
                }
            }
        }
        Some(bufs)
    }

    /// Return one buffer: to the cache while it is under its reservation,
    /// to the shared pool afterwards.
    pub fn put(&mut self, buf: DmaBuf) {
        if self.cache.len() < self.capacity {
            self.cache.push(buf);
        } else {
            self.pool.put(buf);
        }
    }
}

impl Drop for BufCache {
    fn drop(&mut self) {
        // The reservation flows back to the shared pool with the group.
        for buf in self.cache.drain(..) {
            self.pool.put(buf);
        }
    }
}

/// Bounded pool of reusable objects (data work-request records).
pub struct ObjectPool<T> {
    queue: ArrayQueue<T>,
}

impl<T: Default> ObjectPool<T> {
    /// Build a pool holding `count` default-initialized objects.
    pub fn new(count: usize) -> Self {
        let queue = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = queue.push(T::default());
        }
        Self { queue }
    }
}

impl<T> ObjectPool<T> {
    /// Take one object.
    pub fn get(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Take `n` objects, all or nothing.
    pub fn get_bulk(&self, n: usize) -> Option<Vec<T>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.queue.pop() {
                Some(obj) => out.push(obj),
                None => {
                    for obj in out {
                        let _ = self.queue.push(obj);
                    }
                    return None;
                }
            }
        }
        Some(out)
    }

    /// Return an object to the pool.
    pub fn put(&self, obj: T) {
        let _ = self.queue.push(obj);
    }

    /// Objects currently free.
    pub fn count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_bulk_all_or_nothing() {
        let pool = BufferPool::new(4, 4096);
        assert_eq!(pool.count(), 4);
        assert!(pool.get_bulk(5).is_none());
        assert_eq!(pool.count(), 4);
        let bufs = pool.get_bulk(3).unwrap();
        assert_eq!(pool.count(), 1);
        for buf in bufs {
            pool.put(buf);
        }
        assert_eq!(pool.count(), 4);
    }

    #[test]
    fn test_buf_cache_reservation_and_spill() {
        let pool = BufferPool::new(8, 4096);
        let mut cache = BufCache::new(pool.clone(), 2);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(pool.count(), 6);

        // Draining the cache falls through to the shared pool.
        let bufs = cache.get_bulk(4).unwrap();
        assert_eq!(cache.cached(), 0);
        assert_eq!(pool.count(), 4);

        // Releases refill the cache to its reservation, then spill.
        for buf in bufs {
            cache.put(buf);
        }
        assert_eq!(cache.cached(), 2);
        assert_eq!(pool.count(), 6);
    }

    #[test]
    fn test_buf_cache_clamps_to_pool() {
        let pool = BufferPool::new(4, 4096);
        let _ = pool.get_bulk(3).unwrap();
        let cache = BufCache::new(pool, 8);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_object_pool() {
        let pool: ObjectPool<u64> = ObjectPool::new(2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_registry_unknown_transport() {
        let err = create_transport("no-such", TransportOpts::default(), None).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::NotFound);
    }
}
