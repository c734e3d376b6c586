//! Poll groups and per-device pollers.
//!
//! A poll group runs on one cooperative thread. Each of its pollers owns
//! one completion queue and a ring of queue pairs (plus the shared
//! receive queue and its resource set when SRQ mode is on). One poll pass
//! reaps a bounded batch of completions, dispatches them by work-request
//! kind, re-drives parked requests in priority order (pending RDMA reads,
//! then RDMA writes, then buffer waiters, then fresh captures), flushes
//! staged work requests, and finally reaps queue pairs that have drained.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::backend::BlockDevice;
use crate::config::{RdmaOpts, TransportOpts};
use crate::error::{Error, Result};
use crate::proto::{sc, ConnectAcceptData, NvmeStatus, MAX_SGL_DESCRIPTORS};
use crate::rdma::cm::{CmEvent, CmEventChannel, CmId, CmToken, ConnectRequest};
use crate::rdma::mem::MemMap;
use crate::rdma::verbs::{Cq, Device, Pd, Qp, QpCaps, Srq, WcStatus, WorkCompletion};
use crate::target::qpair::{QpairCore, RdmaQpair, ResourceOpts, Resources};
use crate::target::request::{self, RequestState};
use crate::target::{unpack_wr_id, FailureReason, QpairState, WrKind};
use crate::transport::{BufCache, BufferPool, ObjectPool};

/// Completions reaped per poll, per poller.
const CQ_POLL_BATCH: usize = 32;

/// Default SGEs per send work request on the target (matches MSDBD).
pub const DEFAULT_TX_SGE: u32 = MAX_SGL_DESCRIPTORS as u32;
/// Default SGEs per receive work request on the target (command plus
/// in-capsule data).
pub const DEFAULT_RX_SGE: u32 = 2;

/// Unit token bounding the data work-request records in flight.
#[derive(Debug, Default)]
pub struct DataWrToken;

/// Shared, immutable target context handed to every poll group.
pub struct TargetCtx {
    /// Validated process-wide options
    pub opts: TransportOpts,
    /// RDMA-specific options
    pub rdma_opts: RdmaOpts,
    /// The device all queue pairs live on
    pub device: Device,
    /// The protection domain of the transport's registrations
    pub pd: Pd,
    /// Registration map translating pool buffers to keys
    pub mem_map: MemMap,
    /// The block device commands execute against
    pub backend: Arc<dyn BlockDevice>,
    /// Bounded pool of data work-request records
    pub data_wr_pool: ObjectPool<DataWrToken>,
    /// The shared data-buffer pool
    pub pool: BufferPool,
    next_tag: AtomicU64,
}

impl TargetCtx {
    /// Build the shared context, registering every pool buffer with the
    /// device so payload addresses always translate.
    pub fn new(
        opts: TransportOpts,
        rdma_opts: RdmaOpts,
        device: Device,
        backend: Arc<dyn BlockDevice>,
        pool: BufferPool,
    ) -> Result<Arc<Self>> {
        let pd = device.alloc_pd();
        let mem_map = MemMap::for_pd(&pd, None);
        for buf in pool.buffers() {
            mem_map.register(buf)?;
        }
        let data_wr_pool = ObjectPool::new(
            opts.max_queue_depth as usize * MAX_SGL_DESCRIPTORS,
        );
        Ok(Arc::new(Self {
            opts,
            rdma_opts,
            device,
            pd,
            mem_map,
            backend,
            data_wr_pool,
            pool,
            next_tag: AtomicU64::new(1),
        }))
    }

    /// A fresh tag for a block-device submission.
    pub fn next_backend_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }
}

/// A completion reported by the block device (or the transport's own
/// admin handling).
#[derive(Debug)]
pub struct BackendCpl {
    /// Queue pair owning the request
    pub qp_num: u32,
    /// Request index in its arena
    pub req_idx: u16,
    /// Submission tag the completion answers; a completion whose tag no
    /// longer matches the slot raced a teardown and is dropped
    pub tag: u64,
    /// Completion status
    pub status: NvmeStatus,
    /// Command-specific result to store, when present
    pub cdw0: Option<u32>,
}

/// An ABORT admin command waiting for its target request to resolve.
#[derive(Debug)]
pub struct PendingAbort {
    /// Queue pair the ABORT command arrived on
    pub abort_qp: u32,
    /// The ABORT request record
    pub abort_req: u16,
    /// Submission queue id named by the command
    pub target_sqid: u16,
    /// Command id named by the command
    pub target_cid: u16,
    /// When waiting for an outstanding transfer gives up
    pub deadline: Instant,
}

/// Counters of one poll group.
#[derive(Debug, Default, Clone)]
pub struct GroupStats {
    /// Requests that waited for a data buffer
    pub pending_data_buffer: u64,
    /// Requests that waited on RDMA READ quota
    pub pending_rdma_read: u64,
    /// Requests that waited on send quota for their RDMA WRITE
    pub pending_rdma_write: u64,
    /// Capsules that waited for a free request record
    pub pending_free_request: u64,
    /// Accumulated receive-to-free latency
    pub request_latency_us: u64,
}

/// The poll-group state the request machine needs besides the queue pair.
pub struct GroupShared {
    /// Per-group buffer cache in front of the shared pool
    pub cache: BufCache,
    /// Requests waiting for buffers, across all queue pairs of the group
    pub pending_buf_queue: VecDeque<(u32, u16)>,
    /// ABORT commands in flight
    pub pending_aborts: Vec<PendingAbort>,
    /// Where block-device completions are reported
    pub backend_tx: Sender<BackendCpl>,
    /// Group counters
    pub stats: GroupStats,
}

/// Counters of one poller.
#[derive(Debug, Default, Clone)]
pub struct PollerStats {
    /// Poll passes
    pub polls: u64,
    /// Poll passes that reaped nothing
    pub idle_polls: u64,
    /// Completions reaped
    pub completions: u64,
    /// Capsules received
    pub requests: u64,
}

/// One per-device poller: a completion queue and its ring of queue pairs.
pub struct Poller {
    /// The completion queue shared by this poller's queue pairs
    pub cq: Cq,
    /// The shared receive queue, when enabled
    pub srq: Option<Srq>,
    /// The shared resource set owned on behalf of all queue pairs (SRQ)
    pub resources: Option<Resources>,
    /// Queue pairs by queue pair number
    pub qpairs: HashMap<u32, RdmaQpair>,
    /// Server-side connection tokens to queue pair numbers
    pub cm_tokens: HashMap<CmToken, u32>,
    /// Poller counters
    pub stats: PollerStats,
    /// Depth of the shared receive queue
    pub max_srq_depth: u16,
}

/// A freshly accepted connection waiting to become a queue pair.
pub struct NewQpair {
    /// The listen address the connection arrived on
    pub listen_addr: String,
    /// Queue id from the connect private data
    pub qid: u16,
    /// Negotiated queue depth
    pub max_queue_depth: u16,
    /// Negotiated RDMA READ depth
    pub max_read_depth: u16,
    /// The connect request to answer once the queue pair exists
    pub connect: ConnectRequest,
}

/// Split a queue pair into its core and the resource set backing it:
/// its own arenas, or the poller's shared set under SRQ.
fn qpair_parts<'a>(
    qpair: &'a mut RdmaQpair,
    shared_rsrc: &'a mut Option<Resources>,
) -> (&'a mut QpairCore, &'a mut Resources) {
    let RdmaQpair { core, resources } = qpair;
    let rsrc = match resources.as_mut() {
        Some(rsrc) => rsrc,
        None => shared_rsrc
            .as_mut()
            .expect("queue pair without a resource set"),
    };
    (core, rsrc)
}

/// A poll group: pollers plus the state shared across them.
pub struct PollGroup {
    /// Group identity used by the connection scheduler
    pub id: usize,
    /// State the request machine shares across pollers
    pub shared: GroupShared,
    /// Per-device pollers
    pub pollers: Vec<Poller>,
    /// Event channel carrying this group's queue-pair connection events
    pub cm_channel: CmEventChannel,
    backend_rx: Receiver<BackendCpl>,
    ctx: Arc<TargetCtx>,
}

impl PollGroup {
    /// Create a poll group over the transport's device.
    pub fn new(id: usize, ctx: Arc<TargetCtx>) -> Self {
        let (backend_tx, backend_rx) = unbounded();

        let mut srq = None;
        let mut resources = None;
        let mut max_srq_depth = 0u16;
        let num_cqe;
        if !ctx.rdma_opts.no_srq && ctx.device.attr().max_srq > 0 {
            let depth = ctx
                .rdma_opts
                .max_srq_depth
                .min(ctx.device.attr().max_srq_wr) as u16;
            if ctx.rdma_opts.max_srq_depth > ctx.device.attr().max_srq_wr {
                warn!(
                    requested = ctx.rdma_opts.max_srq_depth,
                    supported = ctx.device.attr().max_srq_wr,
                    "clamping shared receive queue depth to the device limit"
                );
            }
            let shared_srq = Srq::new(depth as u32);
            let rsrc = Resources::new(&ResourceOpts {
                device: ctx.device.clone(),
                pd: ctx.pd.clone(),
                max_queue_depth: depth,
                in_capsule_data_size: ctx.opts.in_capsule_data_size,
                shared: true,
            });
            if shared_srq
                .post_recv(rsrc.rings.initial_recv_wrs(depth))
                .is_err()
            {
                error!("unable to post the initial shared receive ring");
            }
            // num_recv + num_data_wr + num_send_wr, each bounded by the
            // shared receive depth.
            num_cqe = depth as usize * 3;
            max_srq_depth = depth;
            srq = Some(shared_srq);
            resources = Some(rsrc);
        } else {
            num_cqe = ctx.rdma_opts.num_cqe.max(1) as usize;
        }

        let poller = Poller {
            cq: Cq::new(num_cqe),
            srq,
            resources,
            qpairs: HashMap::new(),
            cm_tokens: HashMap::new(),
            stats: PollerStats::default(),
            max_srq_depth,
        };

        let cache = BufCache::new(ctx.pool.clone(), ctx.opts.buf_cache_size as usize);
        info!(group = id, srq = max_srq_depth > 0, "created poll group");

        Self {
            id,
            shared: GroupShared {
                cache,
                pending_buf_queue: VecDeque::new(),
                pending_aborts: Vec::new(),
                backend_tx,
                stats: GroupStats::default(),
            },
            pollers: vec![poller],
            cm_channel: CmEventChannel::new(),
            backend_rx,
            ctx,
        }
    }

    /// Turn an accepted connection into a live queue pair: create the
    /// queue pair on this group's poller, post its receive ring, answer
    /// the connect, and start serving.
    pub fn add_qpair(&mut self, new: NewQpair) -> Result<u32> {
        let ctx = &self.ctx;
        let poller = &mut self.pollers[0];

        let attr = ctx.device.attr();
        let max_send_sge = DEFAULT_TX_SGE.min(attr.max_sge);
        let max_recv_sge = DEFAULT_RX_SGE.min(attr.max_sge);
        // Sends cover data transfers plus the completion for every slot.
        let max_send_depth = (new.max_queue_depth as u32 * 2).min(attr.max_qp_wr);

        let caps = QpCaps {
            max_send_wr: max_send_depth,
            max_recv_wr: new.max_queue_depth as u32,
            max_send_sge,
            max_recv_sge,
        };
        let qp = Qp::new(
            &ctx.device,
            &ctx.pd,
            poller.cq.clone(),
            poller.cq.clone(),
            caps,
            poller.srq.clone(),
        );
        let qp_num = qp.qp_num();

        let resources = if poller.srq.is_none() {
            let rsrc = Resources::new(&ResourceOpts {
                device: ctx.device.clone(),
                pd: ctx.pd.clone(),
                max_queue_depth: new.max_queue_depth,
                in_capsule_data_size: ctx.opts.in_capsule_data_size,
                shared: false,
            });
            if qp
                .post_recv(rsrc.rings.initial_recv_wrs(new.max_queue_depth))
                .is_err()
            {
                return Err(Error::no_mem("unable to post the initial receive ring"));
            }
            Some(rsrc)
        } else {
            None
        };

        let cm = CmId::new(self.cm_channel.sender());
        cm.set_qp(qp.clone());

        let core = QpairCore {
            qp: qp.clone(),
            cm: cm.clone(),
            qp_num,
            qid: new.qid,
            listen_addr: new.listen_addr.clone(),
            max_queue_depth: new.max_queue_depth,
            max_read_depth: new.max_read_depth,
            max_send_depth,
            max_send_sge,
            max_recv_sge,
            current_recv_depth: 0,
            current_read_depth: 0,
            current_send_depth: 0,
            pending_rdma_read_queue: VecDeque::new(),
            pending_rdma_write_queue: VecDeque::new(),
            qd: 0,
            sq_head: 0,
            state: QpairState::Active,
            failure: None,
            srq: poller.srq.clone(),
            last_wqe_reached: false,
            to_close: false,
            sends: Default::default(),
            recvs: Default::default(),
            // The admin queue never defers its doorbell.
            no_wr_batching: ctx.rdma_opts.no_wr_batching || new.qid == 0,
            last_activity: Instant::now(),
        };

        poller.cm_tokens.insert(cm.token(), qp_num);
        poller.qpairs.insert(qp_num, RdmaQpair { core, resources });

        new.connect.accept(
            &cm,
            &qp,
            ConnectAcceptData {
                recfmt: 0,
                crqsize: new.max_queue_depth,
            },
        );
        debug!(
            qp_num,
            qid = new.qid,
            max_queue_depth = new.max_queue_depth,
            max_read_depth = new.max_read_depth,
            "queue pair added to poll group"
        );
        Ok(qp_num)
    }

    /// Number of live queue pairs in this group.
    pub fn qpair_count(&self) -> usize {
        self.pollers.iter().map(|p| p.qpairs.len()).sum()
    }

    /// One poll pass. Returns the number of completions processed.
    pub fn poll(&mut self) -> usize {
        let ctx = self.ctx.clone();
        let mut count = 0;

        self.drain_cm_events();
        count += self.drain_backend_completions(&ctx);
        self.resolve_aborts(&ctx);

        for poller_idx in 0..self.pollers.len() {
            count += Self::poller_poll(&ctx, &mut self.shared, &mut self.pollers[poller_idx]);
        }

        self.check_association_timeout();
        count
    }

    fn drain_cm_events(&mut self) {
        while let Some((token, event)) = self.cm_channel.poll() {
            let poller = &mut self.pollers[0];
            let Some(&qp_num) = poller.cm_tokens.get(&token) else {
                continue;
            };
            match event {
                CmEvent::Disconnected => {
                    if let Some(qpair) = poller.qpairs.get_mut(&qp_num) {
                        debug!(qp_num, "peer disconnected");
                        qpair.core.fail(FailureReason::Remote);
                    }
                }
                CmEvent::DeviceRemoval => {
                    if let Some(qpair) = poller.qpairs.get_mut(&qp_num) {
                        qpair.core.fail(FailureReason::Local);
                    }
                }
                _ => {}
            }
        }

        // Device-level asynchronous events.
        while let Some(event) = self.ctx.device.poll_async_event() {
            let poller = &mut self.pollers[0];
            match event {
                crate::rdma::verbs::AsyncEvent::LastWqeReached { qp_num } => {
                    if let Some(qpair) = poller.qpairs.get_mut(&qp_num) {
                        qpair.core.last_wqe_reached = true;
                    }
                }
                crate::rdma::verbs::AsyncEvent::QpFatal { qp_num } => {
                    if let Some(qpair) = poller.qpairs.get_mut(&qp_num) {
                        error!(qp_num, "fatal event received for queue pair");
                        qpair.core.fail(FailureReason::Local);
                    }
                }
                crate::rdma::verbs::AsyncEvent::SqDrained { qp_num } => {
                    if let Some(qpair) = poller.qpairs.get_mut(&qp_num) {
                        if qpair.core.qp.state() == crate::rdma::verbs::QpState::Err {
                            qpair.core.fail(FailureReason::Local);
                        }
                    }
                }
            }
        }
    }

    fn drain_backend_completions(&mut self, ctx: &TargetCtx) -> usize {
        let mut count = 0;
        while let Ok(cpl) = self.backend_rx.try_recv() {
            let poller = &mut self.pollers[0];
            let Poller {
                qpairs, resources, ..
            } = poller;
            let Some(qpair) = qpairs.get_mut(&cpl.qp_num) else {
                continue;
            };
            let (core, rsrc) = qpair_parts(qpair, resources);

            let req = &mut rsrc.reqs[cpl.req_idx as usize];
            if req.state != RequestState::Executing || req.backend_tag != cpl.tag {
                // The request raced teardown; nothing left to do.
                continue;
            }
            req.rsp.status = cpl.status;
            if let Some(cdw0) = cpl.cdw0 {
                req.rsp.cdw0 = cdw0;
            }
            req.state = if core.is_broken() {
                RequestState::Completed
            } else {
                RequestState::Executed
            };
            request::request_process(ctx, &mut self.shared, core, rsrc, cpl.req_idx);
            count += 1;
        }
        count
    }

    fn resolve_aborts(&mut self, ctx: &TargetCtx) {
        let mut aborts = std::mem::take(&mut self.shared.pending_aborts);
        aborts.retain(|abort| {
            let done = Self::try_resolve_abort(
                ctx,
                &mut self.shared,
                &mut self.pollers[0],
                abort,
            );
            !done
        });
        self.shared.pending_aborts.extend(aborts);
    }

    /// Attempt to resolve one pending ABORT. Returns true when finished
    /// (the ABORT command's completion has been pushed).
    fn try_resolve_abort(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        poller: &mut Poller,
        abort: &PendingAbort,
    ) -> bool {
        let Poller {
            qpairs, resources, ..
        } = poller;

        // Find the queue pair the command names.
        let target_qp_num = qpairs
            .iter()
            .find(|(_, q)| q.core.qid == abort.target_sqid)
            .map(|(&n, _)| n);

        let mut aborted = false;
        let mut finished = true;

        if let Some(target_qp_num) = target_qp_num {
            let qpair = qpairs.get_mut(&target_qp_num).unwrap();
            let (core, rsrc) = qpair_parts(qpair, resources);

            let found = rsrc
                .reqs
                .iter()
                .position(|r| {
                    r.state != RequestState::Free
                        && r.cmd.cid == abort.target_cid
                        && r.qp_num == target_qp_num
                })
                .map(|i| i as u16);

            if let Some(req_idx) = found {
                let state = rsrc.reqs[req_idx as usize].state;
                match state {
                    RequestState::Executing => {
                        let tag = rsrc.reqs[req_idx as usize].backend_tag;
                        if ctx.backend.abort(tag) {
                            aborted = true;
                        }
                    }
                    RequestState::NeedBuffer => {
                        shared
                            .pending_buf_queue
                            .retain(|&(q, r)| !(q == target_qp_num && r == req_idx));
                        Self::finish_aborted_request(ctx, shared, core, rsrc, req_idx);
                        aborted = true;
                    }
                    RequestState::DataTransferToControllerPending => {
                        core.pending_rdma_read_queue.retain(|&r| r != req_idx);
                        Self::finish_aborted_request(ctx, shared, core, rsrc, req_idx);
                        aborted = true;
                    }
                    RequestState::DataTransferToHostPending => {
                        core.pending_rdma_write_queue.retain(|&r| r != req_idx);
                        Self::finish_aborted_request(ctx, shared, core, rsrc, req_idx);
                        aborted = true;
                    }
                    RequestState::TransferringHostToController => {
                        if Instant::now() < abort.deadline {
                            // Wait for the RDMA READ to land before giving
                            // a verdict.
                            finished = false;
                        }
                    }
                    _ => {}
                }
            }
        }

        if finished {
            // CDW0 bit zero clear means the command was aborted.
            let cdw0 = if aborted { 0 } else { 1 };
            let _ = shared.backend_tx.send(BackendCpl {
                qp_num: abort.abort_qp,
                req_idx: abort.abort_req,
                tag: 0,
                status: NvmeStatus::success(),
                cdw0: Some(cdw0),
            });
        }
        finished
    }

    fn finish_aborted_request(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        core: &mut QpairCore,
        rsrc: &mut Resources,
        req_idx: u16,
    ) {
        let req = &mut rsrc.reqs[req_idx as usize];
        req.rsp.status = NvmeStatus::generic(sc::ABORTED_BY_REQUEST);
        req.state = RequestState::ReadyToComplete;
        request::request_process(ctx, shared, core, rsrc, req_idx);
    }

    fn poller_poll(ctx: &TargetCtx, shared: &mut GroupShared, poller: &mut Poller) -> usize {
        let completions = poller.cq.poll(CQ_POLL_BATCH);
        poller.stats.polls += 1;
        if completions.is_empty() {
            poller.stats.idle_polls += 1;
        }
        poller.stats.completions += completions.len() as u64;

        let mut count = 0;
        let mut dirty: Vec<u32> = Vec::new();
        for wc in completions {
            if Self::dispatch_completion(ctx, shared, poller, &wc, &mut count) {
                if !dirty.contains(&wc.qp_num) {
                    dirty.push(wc.qp_num);
                }
            }
        }

        // Service parked requests of dirtied queue pairs: reads first,
        // writes second; reads carry the stricter quota.
        for qp_num in dirty {
            Self::qpair_process_pending(ctx, shared, poller, qp_num, false);
        }

        // Requests waiting on buffers, group-wide FIFO.
        Self::service_buf_queue(ctx, shared, poller);

        // Pair captured capsules with free request records.
        Self::pair_incoming(ctx, shared, poller);

        // Push staged work requests to the device.
        Self::submit_all(ctx, shared, poller);

        // Reap queue pairs that drained.
        Self::destroy_drained(ctx, shared, poller);

        count
    }

    /// Dispatch one completion. Returns true when its queue pair should
    /// have its pending lists serviced.
    fn dispatch_completion(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        poller: &mut Poller,
        wc: &WorkCompletion,
        count: &mut usize,
    ) -> bool {
        let (kind, idx) = unpack_wr_id(wc.wr_id);
        let Poller {
            qpairs,
            resources,
            srq,
            stats,
            ..
        } = poller;

        match kind {
            WrKind::Send => {
                let Some(qpair) = qpairs.get_mut(&wc.qp_num) else {
                    return false;
                };
                let (core, rsrc) = qpair_parts(qpair, resources);
                let req = &mut rsrc.reqs[idx as usize];
                if req.state == RequestState::Free {
                    return false;
                }
                if wc.status == WcStatus::Success {
                    *count += 1;
                    debug_assert!(matches!(
                        req.state,
                        RequestState::TransferringControllerToHost | RequestState::Completing
                    ));
                }
                req.state = RequestState::Completed;
                // Any RDMA WRITEs were chained in front of this send.
                core.current_send_depth = core
                    .current_send_depth
                    .saturating_sub(req.num_outstanding_data_wr + 1);
                req.num_outstanding_data_wr = 0;
                request::request_process(ctx, shared, core, rsrc, idx);

                if wc.status != WcStatus::Success {
                    Self::note_wc_error(core, wc);
                }
                true
            }
            WrKind::Recv => {
                if !qpairs.contains_key(&wc.qp_num) {
                    // A late completion for a destroyed queue pair on the
                    // shared receive queue: recycle the capsule.
                    if let (Some(srq), Some(rsrc)) = (srq.as_ref(), resources.as_mut()) {
                        let _ = srq.post_recv(vec![rsrc.rings.recv_wr(idx)]);
                    }
                    return false;
                }
                let qpair = qpairs.get_mut(&wc.qp_num).unwrap();
                let (core, rsrc) = qpair_parts(qpair, resources);

                if wc.status == WcStatus::Success
                    && core.current_recv_depth >= core.max_queue_depth
                {
                    error!(qp_num = wc.qp_num, "receive ring overrun, disconnecting");
                    core.fail(FailureReason::Remote);
                    return true;
                }

                core.current_recv_depth += 1;
                core.last_activity = Instant::now();
                let recv = &mut rsrc.recvs[idx as usize];
                recv.qp_num = wc.qp_num;
                recv.receive_tick = Some(Instant::now());
                stats.requests += 1;
                rsrc.incoming_queue.push_front(idx);

                if wc.status != WcStatus::Success {
                    Self::note_wc_error(core, wc);
                }
                true
            }
            WrKind::Data => {
                let Some(qpair) = qpairs.get_mut(&wc.qp_num) else {
                    return false;
                };
                let (core, rsrc) = qpair_parts(qpair, resources);
                let req = &mut rsrc.reqs[idx as usize];
                if req.state == RequestState::Free {
                    return false;
                }
                debug_assert!(req.num_outstanding_data_wr > 0);
                core.current_send_depth = core.current_send_depth.saturating_sub(1);
                req.num_outstanding_data_wr -= 1;

                if wc.status == WcStatus::Success {
                    debug_assert_eq!(wc.opcode, crate::rdma::verbs::WcOpcode::RdmaRead);
                    core.current_read_depth = core.current_read_depth.saturating_sub(1);
                    if req.num_outstanding_data_wr == 0 {
                        req.state = RequestState::ReadyToExecute;
                        request::request_process(ctx, shared, core, rsrc, idx);
                    }
                } else {
                    // A failed RDMA READ was never linked to a send, so the
                    // request must complete here; a failed WRITE waits for
                    // its chained send to flush.
                    if wc.opcode == crate::rdma::verbs::WcOpcode::RdmaRead {
                        core.current_read_depth = core.current_read_depth.saturating_sub(1);
                        if req.num_outstanding_data_wr == 0 {
                            req.state = RequestState::Completed;
                            request::request_process(ctx, shared, core, rsrc, idx);
                        }
                    }
                    Self::note_wc_error(core, wc);
                }
                true
            }
        }
    }

    fn note_wc_error(core: &mut QpairCore, wc: &WorkCompletion) {
        if wc.status == WcStatus::WrFlushErr {
            // Expected while a dying queue pair flushes its posted work.
            debug!(qp_num = wc.qp_num, "flushed work request");
        } else {
            error!(qp_num = wc.qp_num, status = ?wc.status, "work completion error");
        }
        if core.state == QpairState::Active {
            core.fail(FailureReason::Remote);
        }
    }

    fn qpair_process_pending(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        poller: &mut Poller,
        qp_num: u32,
        drain: bool,
    ) {
        let Poller {
            qpairs, resources, ..
        } = poller;
        let Some(qpair) = qpairs.get_mut(&qp_num) else {
            return;
        };
        let (core, rsrc) = qpair_parts(qpair, resources);

        // RDMA reads first: they carry the stricter quota.
        let reads: Vec<u16> = core.pending_rdma_read_queue.iter().copied().collect();
        for req_idx in reads {
            if !request::request_process(ctx, shared, core, rsrc, req_idx) && !drain {
                break;
            }
        }

        let writes: Vec<u16> = core.pending_rdma_write_queue.iter().copied().collect();
        for req_idx in writes {
            if !request::request_process(ctx, shared, core, rsrc, req_idx) && !drain {
                break;
            }
        }
    }

    fn service_buf_queue(ctx: &TargetCtx, shared: &mut GroupShared, poller: &mut Poller) {
        loop {
            let Some(&(qp_num, req_idx)) = shared.pending_buf_queue.front() else {
                return;
            };
            let Poller {
                qpairs, resources, ..
            } = poller;
            let Some(qpair) = qpairs.get_mut(&qp_num) else {
                shared.pending_buf_queue.pop_front();
                continue;
            };
            let (core, rsrc) = qpair_parts(qpair, resources);
            if !request::request_process(ctx, shared, core, rsrc, req_idx) {
                return;
            }
        }
    }

    fn pair_incoming(ctx: &TargetCtx, shared: &mut GroupShared, poller: &mut Poller) {
        let Poller {
            qpairs,
            resources,
            srq,
            ..
        } = poller;

        // Shared resource set: capsules from every queue pair of the
        // poller land in one incoming queue.
        if let Some(rsrc) = resources.as_mut() {
            loop {
                if rsrc.incoming_queue.is_empty() {
                    break;
                }
                if rsrc.free_queue.is_empty() {
                    shared.stats.pending_free_request += 1;
                    break;
                }
                let recv_idx = *rsrc.incoming_queue.front().unwrap();
                let qp_num = rsrc.recvs[recv_idx as usize].qp_num;
                let Some(qpair) = qpairs.get_mut(&qp_num) else {
                    // Owner vanished; recycle the capsule.
                    rsrc.incoming_queue.pop_front();
                    if let Some(srq) = srq.as_ref() {
                        let _ = srq.post_recv(vec![rsrc.rings.recv_wr(recv_idx)]);
                    }
                    continue;
                };
                rsrc.incoming_queue.pop_front();
                let req_idx = rsrc.free_queue.pop_front().unwrap();
                Self::start_request(ctx, shared, &mut qpair.core, rsrc, req_idx, recv_idx);
            }
            return;
        }

        // Per-queue-pair resource sets.
        for qpair in qpairs.values_mut() {
            let rsrc = qpair.resources.as_mut().expect("owned resources");
            loop {
                if rsrc.incoming_queue.is_empty() {
                    break;
                }
                if rsrc.free_queue.is_empty() {
                    shared.stats.pending_free_request += 1;
                    break;
                }
                let recv_idx = rsrc.incoming_queue.pop_front().unwrap();
                let req_idx = rsrc.free_queue.pop_front().unwrap();
                rsrc.recvs[recv_idx as usize].qp_num = qpair.core.qp_num;
                Self::start_request(ctx, shared, &mut qpair.core, rsrc, req_idx, recv_idx);
            }
        }
    }

    fn start_request(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        core: &mut QpairCore,
        rsrc: &mut Resources,
        req_idx: u16,
        recv_idx: u16,
    ) {
        {
            let req = &mut rsrc.reqs[req_idx as usize];
            req.recv_idx = Some(recv_idx);
            req.qp_num = rsrc.recvs[recv_idx as usize].qp_num;
            req.receive_tick = rsrc.recvs[recv_idx as usize].receive_tick;
            req.state = RequestState::New;
        }
        core.qd += 1;
        request::request_process(ctx, shared, core, rsrc, req_idx);
    }

    fn submit_all(ctx: &TargetCtx, shared: &mut GroupShared, poller: &mut Poller) {
        let Poller {
            qpairs, resources, ..
        } = poller;
        for qpair in qpairs.values_mut() {
            let (core, rsrc) = qpair_parts(qpair, resources);
            Self::submit_qpair(ctx, shared, core, rsrc);
        }
    }

    /// Flush one queue pair's staged sends and receives, handling
    /// partial-post failures.
    fn submit_qpair(
        ctx: &TargetCtx,
        shared: &mut GroupShared,
        core: &mut QpairCore,
        rsrc: &mut Resources,
    ) {
        if let Err(failure) = {
            let qp = core.qp.clone();
            core.sends.flush(&qp)
        } {
            error!(
                qp_num = core.qp_num,
                unposted = failure.unposted,
                "failed to post staged sends"
            );
            // Wind the depth back down by the work requests that never
            // reached the device and fail the guilty request.
            core.current_send_depth =
                core.current_send_depth.saturating_sub(failure.unposted as u32);
            let (kind, idx) = unpack_wr_id(failure.bad_wr_id);
            let req = &mut rsrc.reqs[idx as usize];
            if req.state != RequestState::Free {
                match kind {
                    WrKind::Data
                        if req.state == RequestState::TransferringHostToController =>
                    {
                        req.rsp.status = NvmeStatus::generic(sc::INTERNAL_DEVICE_ERROR);
                        req.state = RequestState::ReadyToComplete;
                    }
                    WrKind::Send | WrKind::Data => {
                        req.state = RequestState::Completed;
                    }
                    WrKind::Recv => {}
                }
                request::request_process(ctx, shared, core, rsrc, idx);
            }
            core.sends.clear();
            core.fail(FailureReason::Local);
        }

        let flush_result = if let Some(srq) = core.srq.clone() {
            core.recvs.flush_srq(&srq)
        } else {
            let qp = core.qp.clone();
            core.recvs.flush(&qp)
        };
        if let Err(failure) = flush_result {
            error!(
                qp_num = core.qp_num,
                unposted = failure.unposted,
                "failed to post staged receives"
            );
            core.current_recv_depth += failure.unposted as u16;
            core.recvs.clear();
            core.fail(FailureReason::Local);
        }
    }

    fn destroy_drained(ctx: &TargetCtx, shared: &mut GroupShared, poller: &mut Poller) {
        let drained: Vec<u32> = poller
            .qpairs
            .iter()
            .filter(|(_, q)| q.core.to_close)
            .map(|(&n, _)| n)
            .collect();

        for qp_num in drained {
            // Give parked requests one drain pass so they reach the
            // completed state and release their resources.
            Self::qpair_process_pending(ctx, shared, poller, qp_num, true);

            let Poller {
                qpairs, resources, ..
            } = poller;
            let qpair = qpairs.get_mut(&qp_num).unwrap();
            let (core, rsrc) = qpair_parts(qpair, resources);

            // Parked requests with nothing posted are aborted the way a
            // deleted submission queue aborts its commands. Requests with
            // work still in the completion queue finish through the flush
            // path on a later pass.
            let stuck: Vec<u16> = rsrc
                .reqs
                .iter()
                .filter(|r| {
                    r.qp_num == qp_num
                        && matches!(
                            r.state,
                            RequestState::New
                                | RequestState::NeedBuffer
                                | RequestState::DataTransferToControllerPending
                                | RequestState::DataTransferToHostPending
                                | RequestState::ReadyToExecute
                                | RequestState::Executed
                                | RequestState::ReadyToComplete
                        )
                })
                .map(|r| r.idx)
                .collect();
            for req_idx in stuck {
                let req = &mut rsrc.reqs[req_idx as usize];
                if req.rsp.status.is_success() {
                    req.rsp.status = NvmeStatus::generic(sc::ABORTED_SQ_DELETION);
                }
                request::request_process(ctx, shared, core, rsrc, req_idx);
            }

            if core.ready_to_destroy(ctx.device.attr().last_wqe_supported) {
                info!(qp_num, "destroying drained queue pair");
                let token = core.cm.token();
                poller.cm_tokens.remove(&token);
                poller.qpairs.remove(&qp_num);
            }
        }
    }

    fn check_association_timeout(&mut self) {
        let timeout = Duration::from_millis(self.ctx.opts.association_timeout_ms as u64);
        let poller = &mut self.pollers[0];
        let idle_admin = poller
            .qpairs
            .values()
            .any(|q| q.core.qid == 0 && q.core.last_activity.elapsed() > timeout);
        if idle_admin {
            warn!("controller association idle past its timeout, disconnecting");
            for qpair in poller.qpairs.values_mut() {
                qpair.core.fail(FailureReason::Remote);
            }
        }
    }

    /// Dump group and poller statistics as JSON.
    pub fn dump_stats(&self) -> serde_json::Value {
        json!({
            "pending_data_buffer": self.shared.stats.pending_data_buffer,
            "pending_rdma_read": self.shared.stats.pending_rdma_read,
            "pending_rdma_write": self.shared.stats.pending_rdma_write,
            "pending_free_request": self.shared.stats.pending_free_request,
            "request_latency_us": self.shared.stats.request_latency_us,
            "pollers": self.pollers.iter().map(|p| json!({
                "polls": p.stats.polls,
                "idle_polls": p.stats.idle_polls,
                "completions": p.stats.completions,
                "requests": p.stats.requests,
                "qpairs": p.qpairs.len(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// Round-robin scheduler placing new queue pairs onto poll groups: admin
/// queues and I/O queues advance independent cursors.
#[derive(Debug, Default)]
pub struct ConnSched {
    groups: Vec<usize>,
    next_admin: usize,
    next_io: usize,
}

impl ConnSched {
    /// Register a poll group id.
    pub fn add_group(&mut self, id: usize) {
        self.groups.push(id);
    }

    /// Remove a poll group id.
    pub fn remove_group(&mut self, id: usize) {
        if let Some(pos) = self.groups.iter().position(|&g| g == id) {
            self.groups.remove(pos);
            if self.groups.is_empty() {
                self.next_admin = 0;
                self.next_io = 0;
            } else {
                if self.next_admin >= self.groups.len() {
                    self.next_admin = 0;
                }
                if self.next_io >= self.groups.len() {
                    self.next_io = 0;
                }
            }
        }
    }

    /// Pick the poll group for a new queue pair and advance the cursor.
    pub fn optimal_group(&mut self, qid: u16) -> Option<usize> {
        if self.groups.is_empty() {
            return None;
        }
        let cursor = if qid == 0 {
            &mut self.next_admin
        } else {
            &mut self.next_io
        };
        let id = self.groups[*cursor];
        *cursor = (*cursor + 1) % self.groups.len();
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_sched_round_robin() {
        let mut sched = ConnSched::default();
        assert_eq!(sched.optimal_group(0), None);
        sched.add_group(10);
        sched.add_group(11);
        sched.add_group(12);

        // Admin and I/O cursors advance independently.
        assert_eq!(sched.optimal_group(0), Some(10));
        assert_eq!(sched.optimal_group(1), Some(10));
        assert_eq!(sched.optimal_group(0), Some(11));
        assert_eq!(sched.optimal_group(5), Some(11));
        assert_eq!(sched.optimal_group(0), Some(12));
        assert_eq!(sched.optimal_group(0), Some(10));

        sched.remove_group(11);
        assert_eq!(sched.optimal_group(1), Some(12));
        assert_eq!(sched.optimal_group(1), Some(10));
    }
}
