//! The RDMA target transport.
//!
//! Owns the device, the listener set, the connection-event channel, and
//! the connection scheduler that spreads new queue pairs across poll
//! groups. Poll groups themselves are owned values driven by their own
//! threads; the transport hands each group the queue pairs the scheduler
//! assigned to it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::json;
use tracing::{info, warn};

use crate::backend::BlockDevice;
use crate::config::{RdmaOpts, TransportOpts};
use crate::error::{Error, Result};
use crate::proto::MAX_SGL_DESCRIPTORS;
use crate::rdma::cm::{CmEvent, CmEventChannel, CmListener};
use crate::rdma::verbs::{Device, DeviceAttr};
use crate::target::listener::handle_connect_request;
use crate::target::poll_group::{ConnSched, NewQpair, PollGroup, TargetCtx};
use crate::transport::{
    register_transport, BufferPool, ControllerData, DiscoveryLogEntry, FabricTransport,
};

/// The transport's registered name.
pub const TRANSPORT_NAME: &str = "RDMA";

/// The RDMA target transport.
pub struct RdmaTargetTransport {
    ctx: Arc<TargetCtx>,
    /// Serializes listener changes, device discovery, scheduler updates,
    /// and connection-event processing.
    lock: ReentrantMutex<()>,
    channel: CmEventChannel,
    listeners: Mutex<HashMap<String, CmListener>>,
    sched: Mutex<ConnSched>,
    pending: Mutex<HashMap<usize, VecDeque<NewQpair>>>,
    /// Listen addresses whose queue pairs must be disconnected after an
    /// address change; poll-group drivers drain this.
    addr_changes: Mutex<Vec<String>>,
    next_group_id: AtomicUsize,
}

impl std::fmt::Debug for RdmaTargetTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaTargetTransport").finish()
    }
}

impl RdmaTargetTransport {
    /// Create the transport: open the device, size the I/O unit to its
    /// SGE budget, build the shared pools, and set up the event channel.
    pub fn new(
        mut opts: TransportOpts,
        rdma_opts: RdmaOpts,
        backend: Arc<dyn BlockDevice>,
    ) -> Result<Arc<Self>> {
        let device = Device::new("tempest0", DeviceAttr::default());
        opts.adjust_io_unit_for_device(device.attr().max_sge.min(MAX_SGL_DESCRIPTORS as u32));

        let pool = BufferPool::new(opts.num_shared_buffers as usize, opts.io_unit_size as usize);
        info!(
            max_queue_depth = opts.max_queue_depth,
            max_io_size = opts.max_io_size,
            io_unit_size = opts.io_unit_size,
            num_cqe = rdma_opts.num_cqe,
            max_srq_depth = rdma_opts.max_srq_depth,
            no_srq = rdma_opts.no_srq,
            no_wr_batching = rdma_opts.no_wr_batching,
            acceptor_backlog = rdma_opts.acceptor_backlog,
            "RDMA transport init"
        );

        let ctx = TargetCtx::new(opts, rdma_opts, device, backend, pool)?;
        Ok(Arc::new(Self {
            ctx,
            lock: ReentrantMutex::new(()),
            channel: CmEventChannel::new(),
            listeners: Mutex::new(HashMap::new()),
            sched: Mutex::new(ConnSched::default()),
            pending: Mutex::new(HashMap::new()),
            addr_changes: Mutex::new(Vec::new()),
            next_group_id: AtomicUsize::new(0),
        }))
    }

    /// The shared target context.
    pub fn ctx(&self) -> &Arc<TargetCtx> {
        &self.ctx
    }

    /// Create a poll group and register it with the connection scheduler.
    pub fn create_poll_group(&self) -> PollGroup {
        let _guard = self.lock.lock();
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        self.sched.lock().add_group(id);
        self.pending.lock().insert(id, VecDeque::new());
        PollGroup::new(id, self.ctx.clone())
    }

    /// Unregister a poll group from the scheduler.
    pub fn destroy_poll_group(&self, group: PollGroup) {
        let _guard = self.lock.lock();
        self.sched.lock().remove_group(group.id);
        self.pending.lock().remove(&group.id);
        drop(group);
    }

    /// Move queue pairs the scheduler assigned to `group` onto it.
    ///
    /// Returns how many queue pairs were attached. Called from the
    /// group's own thread, typically right before its poll pass.
    pub fn attach_pending(&self, group: &mut PollGroup) -> usize {
        let assigned: Vec<NewQpair> = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&group.id) {
                Some(queue) => queue.drain(..).collect(),
                None => Vec::new(),
            }
        };
        let mut count = 0;
        for new in assigned {
            match group.add_qpair(new) {
                Ok(_) => count += 1,
                Err(e) => warn!(error = %e, "failed to attach new queue pair"),
            }
        }
        count
    }

    /// Listen addresses whose queue pairs must be torn down after an
    /// address change. Poll-group drivers pass these to
    /// [`PollGroup::disconnect_listener_qpairs`].
    pub fn drain_addr_changes(&self) -> Vec<String> {
        self.addr_changes.lock().drain(..).collect()
    }
}

impl FabricTransport for RdmaTargetTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn opts(&self) -> TransportOpts {
        self.ctx.opts.clone()
    }

    fn listen(&self, addr: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(addr) {
            return Ok(());
        }
        let listener = CmListener::bind(
            addr,
            self.ctx.rdma_opts.acceptor_backlog.max(1) as usize,
            self.channel.sender(),
        )?;
        listeners.insert(addr.to_string(), listener);
        Ok(())
    }

    fn stop_listen(&self, addr: &str) -> Result<()> {
        let _guard = self.lock.lock();
        match self.listeners.lock().remove(addr) {
            Some(listener) => {
                listener.unbind();
                Ok(())
            }
            None => Err(Error::not_found(format!("not listening on {}", addr))),
        }
    }

    fn accept_poll(&self) -> usize {
        let _guard = self.lock.lock();
        let mut count = 0;
        while let Some((_token, event)) = self.channel.poll() {
            match event {
                CmEvent::ConnectRequest(request) => {
                    count += 1;
                    let Some(new) = handle_connect_request(&self.ctx, request) else {
                        continue;
                    };
                    let Some(group_id) = self.sched.lock().optimal_group(new.qid) else {
                        warn!("no poll groups registered, dropping connection");
                        new.connect
                            .reject(crate::proto::RejectStatus::NoResources);
                        continue;
                    };
                    self.pending
                        .lock()
                        .entry(group_id)
                        .or_default()
                        .push_back(new);
                }
                CmEvent::AddrChange => {
                    // Re-establish every listener and schedule its queue
                    // pairs for disconnect.
                    let addrs: Vec<String> =
                        self.listeners.lock().keys().cloned().collect();
                    for addr in addrs {
                        warn!(%addr, "listener address changed, re-establishing");
                        let _ = self.stop_listen(&addr);
                        let _ = self.listen(&addr);
                        self.addr_changes.lock().push(addr);
                    }
                }
                _ => {}
            }
        }
        count
    }

    fn cdata_init(&self, cdata: &mut ControllerData) {
        cdata.msdbd = MAX_SGL_DESCRIPTORS as u8;
        cdata.ioccsz = self.ctx.opts.ioccsz();
        cdata.icdoff = 0;
    }

    fn listener_discover(&self, addr: &str) -> Option<DiscoveryLogEntry> {
        let listeners = self.listeners.lock();
        let _listener = listeners.get(addr)?;
        let (traddr, trsvcid) = match addr.rsplit_once(':') {
            Some((a, p)) => (a.to_string(), p.to_string()),
            None => (addr.to_string(), String::new()),
        };
        Some(DiscoveryLogEntry {
            trtype: TRANSPORT_NAME,
            traddr,
            trsvcid,
            qptype: "reliable_connected",
            prtype: "none",
            cms: "rdma_cm",
        })
    }

    fn dump_opts(&self) -> serde_json::Value {
        let rdma = &self.ctx.rdma_opts;
        let mut out = json!({
            "max_srq_depth": rdma.max_srq_depth,
            "no_srq": rdma.no_srq,
            "acceptor_backlog": rdma.acceptor_backlog,
            "no_wr_batching": rdma.no_wr_batching,
        });
        if rdma.no_srq {
            out["num_cqe"] = json!(rdma.num_cqe);
        }
        out
    }
}

impl PollGroup {
    /// Disconnect every queue pair that arrived through `addr`; used when
    /// a listener's address changes.
    pub fn disconnect_listener_qpairs(&mut self, addr: &str) {
        for poller in &mut self.pollers {
            for qpair in poller.qpairs.values_mut() {
                if qpair.core.listen_addr == addr {
                    qpair
                        .core
                        .fail(crate::target::FailureReason::Local);
                }
            }
        }
    }
}

/// Register the RDMA transport for `backend` in the process-global
/// transport registry.
pub fn register_rdma_transport(backend: Arc<dyn BlockDevice>) {
    register_transport(
        TRANSPORT_NAME,
        Arc::new(move |opts, rdma_opts| {
            let transport = RdmaTargetTransport::new(opts, rdma_opts, backend.clone())?;
            Ok(transport as Arc<dyn FabricTransport>)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemDisk;
    use crate::util::dif::{DifFlags, DifType};

    fn make_transport() -> Arc<RdmaTargetTransport> {
        let mut opts = TransportOpts::default();
        opts.num_shared_buffers = 64;
        opts.validate().unwrap();
        let backend = Arc::new(MemDisk::new(
            64,
            512,
            0,
            false,
            DifType::Disable,
            DifFlags::empty(),
        ));
        RdmaTargetTransport::new(opts, RdmaOpts::default(), backend).unwrap()
    }

    #[test]
    fn test_listen_stop_listen() {
        let transport = make_transport();
        transport.listen("ut-transport0:4420").unwrap();
        // Listening twice on the same address is idempotent.
        transport.listen("ut-transport0:4420").unwrap();
        assert!(transport.listener_discover("ut-transport0:4420").is_some());
        transport.stop_listen("ut-transport0:4420").unwrap();
        assert!(transport.stop_listen("ut-transport0:4420").is_err());
        assert!(transport.listener_discover("ut-transport0:4420").is_none());
    }

    #[test]
    fn test_cdata_and_dump_opts() {
        let transport = make_transport();
        let mut cdata = ControllerData::default();
        transport.cdata_init(&mut cdata);
        assert_eq!(cdata.msdbd, 16);
        assert_eq!(cdata.icdoff, 0);
        // 64-byte command plus 4 KiB of in-capsule data, in 16-byte units.
        assert_eq!(cdata.ioccsz, (64 + 4096) / 16);

        let dump = transport.dump_opts();
        assert_eq!(dump["max_srq_depth"], 4096);
        assert_eq!(dump["no_srq"], false);
    }

    #[test]
    fn test_registry_roundtrip() {
        let backend = Arc::new(MemDisk::new(
            16,
            512,
            0,
            false,
            DifType::Disable,
            DifFlags::empty(),
        ));
        register_rdma_transport(backend);
        let mut opts = TransportOpts::default();
        opts.num_shared_buffers = 64;
        let transport =
            crate::transport::create_transport(TRANSPORT_NAME, opts, Some(r#"{"no_srq": true}"#))
                .unwrap();
        assert_eq!(transport.name(), TRANSPORT_NAME);
        assert_eq!(transport.dump_opts()["no_srq"], true);
    }
}
