//! Target queue-pair resources and depth accounting.
//!
//! Every queue pair pre-allocates a fixed pool of request records, receive
//! capsules, command buffers, and completion buffers, and posts its whole
//! receive ring up front. When the poller runs a shared receive queue the
//! poller owns one resource set for all of its queue pairs and the queue
//! pair only keeps depth counters and pending queues.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::proto::{NvmeCmd, NvmeCpl, SglDescriptor, NVME_CMD_SIZE, NVME_CPL_SIZE, SGL_DESC_SIZE};
use crate::rdma::batch::{RecvBatcher, SendBatcher};
use crate::rdma::cm::CmId;
use crate::rdma::verbs::{AccessFlags, Device, Mr, Pd, Qp, RecvWr, SendWr, Sge, Srq};
use crate::target::request::RdmaRequest;
use crate::target::{pack_wr_id, FailureReason, QpairState, WrKind};
use crate::util::dma::DmaBuf;
use crate::util::sg::SgEntry;

/// Construction parameters for a resource set.
pub struct ResourceOpts {
    /// Device the rings are registered with
    pub device: Device,
    /// Protection domain of the registrations
    pub pd: Pd,
    /// Arena depth
    pub max_queue_depth: u16,
    /// Bytes of in-capsule data reserved behind each command
    pub in_capsule_data_size: u32,
    /// Whether this set backs a shared receive queue
    pub shared: bool,
}

/// One receive capsule slot.
#[derive(Debug)]
pub struct RdmaRecv {
    /// Index in the receive arena
    pub idx: u16,
    /// Queue pair the inbound capsule arrived on (set at completion when
    /// the resource set is shared)
    pub qp_num: u32,
    /// When the capsule was reaped, for request latency accounting
    pub receive_tick: Option<Instant>,
}

/// The registered command, completion, and in-capsule rings of a
/// resource set. Split out so the rings can be read while request
/// records are mutably borrowed.
pub struct CapsuleRings {
    cmd_ring: DmaBuf,
    cpl_ring: DmaBuf,
    capsule_ring: DmaBuf,
    cmd_mr: Mr,
    cpl_mr: Mr,
    capsule_mr: Mr,
    in_capsule_data_size: u32,
}

/// Arena of receive capsules, request records, and their wire buffers.
pub struct Resources {
    /// Request records
    pub reqs: Vec<RdmaRequest>,
    /// Receive slots
    pub recvs: Vec<RdmaRecv>,
    /// Requests in the free state
    pub free_queue: VecDeque<u16>,
    /// Receives waiting for a free request record
    pub incoming_queue: VecDeque<u16>,
    /// The registered wire buffers
    pub rings: CapsuleRings,
    /// Whether the poller owns this set on behalf of many queue pairs
    pub shared: bool,
}

impl Resources {
    /// Allocate and register the arenas.
    pub fn new(opts: &ResourceOpts) -> Self {
        let depth = opts.max_queue_depth as usize;
        let cmd_ring = DmaBuf::alloc(depth * NVME_CMD_SIZE);
        let cpl_ring = DmaBuf::alloc(depth * NVME_CPL_SIZE);
        let capsule_ring = DmaBuf::alloc(depth * opts.in_capsule_data_size as usize);

        let access =
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        let cmd_mr = opts.device.reg_mr(&opts.pd, cmd_ring.clone(), access);
        let cpl_mr = opts.device.reg_mr(&opts.pd, cpl_ring.clone(), access);
        let capsule_mr = opts.device.reg_mr(&opts.pd, capsule_ring.clone(), access);

        let mut reqs = Vec::with_capacity(depth);
        let mut recvs = Vec::with_capacity(depth);
        let mut free_queue = VecDeque::with_capacity(depth);
        for i in 0..depth {
            reqs.push(RdmaRequest::new(i as u16));
            recvs.push(RdmaRecv {
                idx: i as u16,
                qp_num: 0,
                receive_tick: None,
            });
            free_queue.push_back(i as u16);
        }

        debug!(
            depth,
            in_capsule_data_size = opts.in_capsule_data_size,
            shared = opts.shared,
            "allocated queue pair resources"
        );

        Self {
            reqs,
            recvs,
            free_queue,
            incoming_queue: VecDeque::new(),
            rings: CapsuleRings {
                cmd_ring,
                cpl_ring,
                capsule_ring,
                cmd_mr,
                cpl_mr,
                capsule_mr,
                in_capsule_data_size: opts.in_capsule_data_size,
            },
            shared: opts.shared,
        }
    }
}

impl CapsuleRings {
    /// The receive work request for slot `idx`: one SGE for the fixed
    /// command, one for the in-capsule data region behind it.
    pub fn recv_wr(&self, idx: u16) -> RecvWr {
        let cmd_addr = self.cmd_ring.base() + (idx as usize * NVME_CMD_SIZE) as u64;
        let capsule_addr =
            self.capsule_ring.base() + (idx as u64) * self.in_capsule_data_size as u64;
        RecvWr {
            wr_id: pack_wr_id(WrKind::Recv, idx),
            sgl: vec![
                Sge {
                    addr: cmd_addr,
                    length: NVME_CMD_SIZE as u32,
                    lkey: self.cmd_mr.lkey,
                },
                Sge {
                    addr: capsule_addr,
                    length: self.in_capsule_data_size,
                    lkey: self.capsule_mr.lkey,
                },
            ],
        }
    }

    /// Work requests for the whole initial receive ring of `depth` slots.
    pub fn initial_recv_wrs(&self, depth: u16) -> Vec<RecvWr> {
        (0..depth).map(|i| self.recv_wr(i)).collect()
    }

    /// Decode the command most recently received into slot `idx`.
    pub fn recv_cmd(&self, idx: u16) -> NvmeCmd {
        let mut raw = [0u8; NVME_CMD_SIZE];
        self.cmd_ring.read_at(idx as usize * NVME_CMD_SIZE, &mut raw);
        NvmeCmd::from_bytes(&raw)
    }

    /// A scatter/gather view of slot `idx`'s in-capsule data region.
    pub fn capsule_entry(&self, idx: u16, offset: u32, len: u32) -> SgEntry {
        let base = idx as usize * self.in_capsule_data_size as usize;
        SgEntry::new(
            self.capsule_ring.clone(),
            base + offset as usize,
            len as usize,
        )
    }

    /// Read `count` SGL descriptors from slot `idx`'s capsule region at
    /// byte `offset`.
    pub fn capsule_descriptors(&self, idx: u16, offset: u32, count: usize) -> Vec<SglDescriptor> {
        let base = idx as usize * self.in_capsule_data_size as usize + offset as usize;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let mut raw = [0u8; SGL_DESC_SIZE];
            self.capsule_ring.read_at(base + i * SGL_DESC_SIZE, &mut raw);
            out.push(SglDescriptor::from_bytes(&raw));
        }
        out
    }

    /// Write the completion for request `idx` into its response slot.
    pub fn write_cpl(&self, idx: u16, cpl: &NvmeCpl) {
        self.cpl_ring
            .write_at(idx as usize * NVME_CPL_SIZE, &cpl.to_bytes());
    }

    /// The SGE describing request `idx`'s response slot.
    pub fn cpl_sge(&self, idx: u16) -> Sge {
        Sge {
            addr: self.cpl_ring.base() + (idx as usize * NVME_CPL_SIZE) as u64,
            length: NVME_CPL_SIZE as u32,
            lkey: self.cpl_mr.lkey,
        }
    }

    /// Read back the completion in request `idx`'s response slot.
    pub fn read_cpl(&self, idx: u16) -> NvmeCpl {
        let mut raw = [0u8; NVME_CPL_SIZE];
        self.cpl_ring.read_at(idx as usize * NVME_CPL_SIZE, &mut raw);
        NvmeCpl::from_bytes(&raw)
    }

    /// Write raw command bytes into slot `idx`, the way an inbound send
    /// would. Exposed for tests that hand-deliver capsules.
    pub fn store_cmd(&self, idx: u16, cmd: &NvmeCmd) {
        self.cmd_ring
            .write_at(idx as usize * NVME_CMD_SIZE, &cmd.to_bytes());
    }

    /// Write raw bytes into slot `idx`'s in-capsule region.
    pub fn store_capsule_data(&self, idx: u16, offset: u32, data: &[u8]) {
        let base = idx as usize * self.in_capsule_data_size as usize;
        self.capsule_ring.write_at(base + offset as usize, data);
    }
}

/// Queue-pair state apart from the (possibly shared) resource arenas.
pub struct QpairCore {
    /// The underlying queue pair
    pub qp: Qp,
    /// Server-side connection endpoint
    pub cm: CmId,
    /// Queue pair number, the completion-side identity
    pub qp_num: u32,
    /// Queue id; zero is the admin queue
    pub qid: u16,
    /// The listen address this connection arrived on
    pub listen_addr: String,
    /// Negotiated command depth
    pub max_queue_depth: u16,
    /// Negotiated outstanding RDMA READ limit
    pub max_read_depth: u16,
    /// Send-queue depth limit
    pub max_send_depth: u32,
    /// SGEs per send work request
    pub max_send_sge: u32,
    /// SGEs per receive work request
    pub max_recv_sge: u32,
    /// Outstanding receives
    pub current_recv_depth: u16,
    /// Outstanding RDMA READs
    pub current_read_depth: u16,
    /// Outstanding send-queue work requests
    pub current_send_depth: u32,
    /// Requests waiting to start their RDMA READ, FIFO
    pub pending_rdma_read_queue: VecDeque<u16>,
    /// Requests waiting to start their RDMA WRITE, FIFO
    pub pending_rdma_write_queue: VecDeque<u16>,
    /// Requests not in the free state
    pub qd: u32,
    /// Submission queue head, echoed in completions
    pub sq_head: u16,
    /// Lifecycle state
    pub state: QpairState,
    /// Failure classification once the queue pair is dying
    pub failure: Option<FailureReason>,
    /// The shared receive queue, when the poller runs one
    pub srq: Option<Srq>,
    /// Set when the device reported the last WQE event for this QP
    pub last_wqe_reached: bool,
    /// Set when close was requested
    pub to_close: bool,
    /// Staged send work requests
    pub sends: SendBatcher,
    /// Staged receive work requests
    pub recvs: RecvBatcher,
    /// Flush staged work eagerly instead of at the poll tail. Always set
    /// on the admin queue pair.
    pub no_wr_batching: bool,
    /// Last time the peer showed signs of life
    pub last_activity: Instant,
}

impl QpairCore {
    /// Whether the RDMA-level or lifecycle state forbids serving requests.
    pub fn is_broken(&self) -> bool {
        self.state != QpairState::Active
            || self.qp.state() == crate::rdma::verbs::QpState::Err
    }

    /// Mark the queue pair failed and push the RDMA side into its error
    /// state so outstanding work flushes.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.state != QpairState::Error {
            debug!(qp_num = self.qp_num, ?reason, "queue pair failed");
            self.state = QpairState::Error;
            self.failure = Some(reason);
        }
        self.to_close = true;
        self.qp.set_error();
    }

    /// Stage a chain of send work requests, flushing eagerly when
    /// batching is off for this queue pair.
    pub fn queue_sends(&mut self, wrs: Vec<SendWr>) {
        self.sends.queue(wrs);
        if self.no_wr_batching {
            let qp = self.qp.clone();
            if self.sends.flush(&qp).is_err() {
                self.fail(FailureReason::Local);
            }
        }
    }

    /// Stage one receive work request (a recycled capsule slot), flushing
    /// eagerly when batching is off for this queue pair.
    pub fn queue_recv(&mut self, wr: RecvWr) {
        self.recvs.queue(vec![wr]);
        if self.no_wr_batching {
            let result = if let Some(srq) = self.srq.clone() {
                self.recvs.flush_srq(&srq)
            } else {
                let qp = self.qp.clone();
                self.recvs.flush(&qp)
            };
            if result.is_err() {
                self.fail(FailureReason::Local);
            }
        }
    }

    /// Advance the submission queue head and return the new value.
    pub fn advance_sq_head(&mut self) -> u16 {
        if self.sq_head == self.max_queue_depth.saturating_sub(1) {
            self.sq_head = 0;
        } else {
            self.sq_head += 1;
        }
        self.sq_head
    }

    /// The destruction gate: a queue pair is destroyed only once its send
    /// queue drained and the receive side is fully accounted for.
    pub fn ready_to_destroy(&self, device_last_wqe_supported: bool) -> bool {
        if !self.to_close {
            return false;
        }
        if self.current_send_depth != 0 {
            return false;
        }
        if self.srq.is_none() && self.current_recv_depth != self.max_queue_depth {
            return false;
        }
        if self.srq.is_some() && !self.last_wqe_reached && device_last_wqe_supported {
            return false;
        }
        true
    }
}

/// A target queue pair: its core state plus its own resource arenas,
/// unless the poller owns a shared set.
pub struct RdmaQpair {
    /// Depth counters, pending queues, staging lists
    pub core: QpairCore,
    /// Owned arenas; `None` when the poller's shared set is used
    pub resources: Option<Resources>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::verbs::{Device, DeviceAttr};

    fn resources(depth: u16, shared: bool) -> Resources {
        let device = Device::new("tq0", DeviceAttr::default());
        let pd = device.alloc_pd();
        Resources::new(&ResourceOpts {
            device,
            pd,
            max_queue_depth: depth,
            in_capsule_data_size: 4096,
            shared,
        })
    }

    #[test]
    fn test_arena_sizes_and_free_queue() {
        let rsrc = resources(16, false);
        assert_eq!(rsrc.reqs.len(), 16);
        assert_eq!(rsrc.recvs.len(), 16);
        assert_eq!(rsrc.free_queue.len(), 16);
        assert!(rsrc.incoming_queue.is_empty());
        assert!(!rsrc.shared);
    }

    #[test]
    fn test_recv_wr_shape() {
        let rsrc = resources(4, true);
        let wrs = rsrc.rings.initial_recv_wrs(4);
        assert_eq!(wrs.len(), 4);
        for (i, wr) in wrs.iter().enumerate() {
            assert_eq!(wr.sgl.len(), 2);
            assert_eq!(wr.sgl[0].length, NVME_CMD_SIZE as u32);
            assert_eq!(wr.sgl[1].length, 4096);
            let (kind, idx) = crate::target::unpack_wr_id(wr.wr_id);
            assert_eq!(kind, WrKind::Recv);
            assert_eq!(idx, i as u16);
        }
        // Slots are disjoint.
        assert_eq!(
            wrs[1].sgl[0].addr - wrs[0].sgl[0].addr,
            NVME_CMD_SIZE as u64
        );
        assert_eq!(wrs[1].sgl[1].addr - wrs[0].sgl[1].addr, 4096);
    }

    #[test]
    fn test_cpl_slot_roundtrip() {
        let rsrc = resources(4, false);
        let cpl = NvmeCpl {
            cid: 3,
            sqhd: 9,
            ..Default::default()
        };
        rsrc.rings.write_cpl(2, &cpl);
        let sge = rsrc.rings.cpl_sge(2);
        assert_eq!(sge.length, NVME_CPL_SIZE as u32);
        let decoded = rsrc.rings.read_cpl(2);
        assert_eq!(decoded.cid, 3);
        assert_eq!(decoded.sqhd, 9);
    }

    #[test]
    fn test_cmd_store_decode_roundtrip() {
        let rsrc = resources(4, false);
        let cmd = NvmeCmd {
            opc: 0x02,
            cid: 7,
            nsid: 1,
            ..Default::default()
        };
        rsrc.rings.store_cmd(1, &cmd);
        let decoded = rsrc.rings.recv_cmd(1);
        assert_eq!(decoded.opc, 0x02);
        assert_eq!(decoded.cid, 7);
    }
}
