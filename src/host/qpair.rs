//! Host queue pair.
//!
//! Owns the command and response arenas, walks the connect sequence
//! (address, route, connect, established) awaiting exactly one event per
//! step, posts the response receive ring, and pairs SEND and RECV
//! completions per command: a request finishes only once both its send
//! completed and its response capsule arrived, whichever lands first.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::host::request::{
    req_init, BuildCtx, HostRequest, RdmaReq, CMD_SLOT_SIZE, RECV_COMPLETED, SEND_COMPLETED,
};
use crate::proto::{ConnectRequestData, NvmeCpl, NvmeStatus, sc, NVME_CPL_SIZE};
use crate::rdma::batch::{RecvBatcher, SendBatcher};
use crate::rdma::cm::{CmEvent, CmEventChannel, CmEventKind, CmId, ConnParam};
use crate::rdma::mem::MemMap;
use crate::rdma::verbs::{
    AccessFlags, Cq, Device, Mr, Pd, Qp, QpCaps, RecvWr, SendWr, Sge, WcOpcode, WcStatus,
    WrOpcode,
};
use crate::util::dma::DmaBuf;

/// Send SGEs per command: the capsule and an optional inline payload.
pub const DEFAULT_TX_SGE: u32 = 2;
/// Receive SGEs per response: the 16-byte completion.
pub const DEFAULT_RX_SGE: u32 = 1;

/// How long each connect step waits for its one expected event.
pub const CM_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Completions reaped per batch.
const MAX_COMPLETIONS_PER_POLL: usize = 128;

/// Why the queue pair stopped working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The peer went away
    Remote,
    /// The local device went away
    Local,
    /// Cause unknown
    Unknown,
}

/// Capabilities copied from the controller at connect time.
#[derive(Debug, Clone, Copy)]
pub struct QpairCaps {
    /// Bytes that may ride inline in a command capsule
    pub ioccsz_bytes: u32,
    /// In-capsule data offset advertised by the controller
    pub icdoff: u16,
    /// SGL fan-out limit
    pub max_sges: usize,
}

impl Default for QpairCaps {
    fn default() -> Self {
        Self {
            ioccsz_bytes: 4096,
            icdoff: 0,
            max_sges: crate::proto::MAX_SGL_DESCRIPTORS,
        }
    }
}

/// A host queue pair.
pub struct HostQpair {
    /// Queue id; zero is the admin queue
    pub qid: u16,
    /// Negotiated queue depth
    pub num_entries: u16,
    /// Defer work-request posting to the completion path
    pub delay_cmd_submit: bool,
    /// Failure classification once the queue pair died
    pub failure: Option<TransportFailure>,
    caps: QpairCaps,
    device: Device,
    pd: Pd,
    cm: Option<CmId>,
    qp: Option<Qp>,
    cq: Option<Cq>,
    cmds: DmaBuf,
    cmds_mr: Option<Mr>,
    rsps: DmaBuf,
    rsps_mr: Option<Mr>,
    rdma_reqs: Vec<RdmaReq>,
    free_reqs: VecDeque<u16>,
    outstanding: usize,
    sends: SendBatcher,
    recvs: RecvBatcher,
    mr_map: Option<MemMap>,
    /// SGEs per send work request after device clamping
    pub max_send_sge: u32,
    /// SGEs per receive work request after device clamping
    pub max_recv_sge: u32,
}

impl HostQpair {
    /// Allocate a queue pair of `num_entries` slots. Nothing touches the
    /// wire until [`HostQpair::connect`].
    pub fn new(device: Device, pd: Pd, qid: u16, num_entries: u16, delay_cmd_submit: bool) -> Self {
        let mut rdma_reqs = Vec::with_capacity(num_entries as usize);
        let mut free_reqs = VecDeque::with_capacity(num_entries as usize);
        for i in 0..num_entries {
            rdma_reqs.push(RdmaReq::new(i));
            free_reqs.push_back(i);
        }
        Self {
            qid,
            num_entries,
            delay_cmd_submit,
            failure: None,
            caps: QpairCaps::default(),
            device,
            pd,
            cm: None,
            qp: None,
            cq: None,
            cmds: DmaBuf::alloc(num_entries as usize * CMD_SLOT_SIZE),
            cmds_mr: None,
            rsps: DmaBuf::alloc(num_entries as usize * NVME_CPL_SIZE),
            rsps_mr: None,
            rdma_reqs,
            free_reqs,
            outstanding: 0,
            sends: SendBatcher::new(),
            recvs: RecvBatcher::new(),
            mr_map: None,
            max_send_sge: DEFAULT_TX_SGE,
            max_recv_sge: DEFAULT_RX_SGE,
        }
    }

    /// Copy controller capabilities used by the builders.
    pub fn set_caps(&mut self, caps: QpairCaps) {
        self.caps = caps;
    }

    /// The connection-manager token of this queue pair, once connected.
    pub fn cm_token(&self) -> Option<u64> {
        self.cm.as_ref().map(|cm| cm.token())
    }

    /// The shared registration map of this queue pair's domain.
    pub fn mr_map(&self) -> Option<&MemMap> {
        self.mr_map.as_ref()
    }

    /// Requests currently in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Walk the connect sequence against `addr`.
    ///
    /// Address resolution, route resolution, and the connect itself each
    /// await exactly one expected event on `channel`. A stale-connection
    /// reject surfaces as a retryable error for the caller's backoff
    /// loop.
    pub fn connect(
        &mut self,
        channel: &CmEventChannel,
        addr: &str,
        cntlid: u16,
    ) -> Result<()> {
        let cm = CmId::new(channel.sender());

        cm.resolve_addr(addr);
        channel.await_event(cm.token(), CmEventKind::AddrResolved, CM_EVENT_TIMEOUT)?;
        cm.resolve_route();
        channel.await_event(cm.token(), CmEventKind::RouteResolved, CM_EVENT_TIMEOUT)?;

        // Create the queue pair before connecting; the peer pairs with it
        // when it accepts.
        let attr = self.device.attr();
        self.max_send_sge = DEFAULT_TX_SGE.min(attr.max_sge);
        self.max_recv_sge = DEFAULT_RX_SGE.min(attr.max_sge);
        let cq = Cq::new(self.num_entries as usize * 2);
        let qp = Qp::new(
            &self.device,
            &self.pd,
            cq.clone(),
            cq.clone(),
            QpCaps {
                max_send_wr: self.num_entries as u32,
                max_recv_wr: self.num_entries as u32,
                max_send_sge: self.max_send_sge,
                max_recv_sge: self.max_recv_sge,
            },
            None,
        );
        cm.set_qp(qp.clone());

        let request_data = ConnectRequestData {
            recfmt: 0,
            qid: self.qid,
            hrqsize: self.num_entries,
            hsqsize: self.num_entries - 1,
            cntlid,
        };
        cm.connect(ConnParam {
            private_data: request_data.to_bytes().to_vec(),
            initiator_depth: (self.num_entries as u32).min(attr.max_qp_init_rd_atom) as u16,
            responder_resources: 0,
        })?;

        let event = channel.await_event(cm.token(), CmEventKind::Established, CM_EVENT_TIMEOUT)?;
        if let CmEvent::Established { accept, remote } = event {
            debug!(
                requested = self.num_entries,
                granted = accept.crqsize,
                "connection established"
            );
            // The peer's receive queue bounds how much we may keep in
            // flight.
            self.num_entries = self.num_entries.min(accept.crqsize);
            cm.set_remote(remote);
        }

        // Register the message arenas and post the response ring.
        let access =
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        self.cmds_mr = Some(self.device.reg_mr(&self.pd, self.cmds.clone(), access));
        self.rsps_mr = Some(self.device.reg_mr(&self.pd, self.rsps.clone(), access));

        let rsps_lkey = self.rsps_mr.as_ref().unwrap().lkey;
        for i in 0..self.num_entries {
            self.recvs.queue(vec![self.rsp_recv_wr(i, rsps_lkey)]);
        }
        self.recvs
            .flush(&qp)
            .map_err(|_| Error::no_mem("unable to post the response receive ring"))?;

        self.mr_map = Some(MemMap::for_pd(&self.pd, None));
        self.cq = Some(cq);
        self.qp = Some(qp);
        self.cm = Some(cm);
        self.failure = None;
        Ok(())
    }

    fn rsp_recv_wr(&self, rsp_idx: u16, lkey: u32) -> RecvWr {
        RecvWr {
            wr_id: rsp_idx as u64,
            sgl: vec![Sge {
                addr: self.rsps.base() + (rsp_idx as usize * NVME_CPL_SIZE) as u64,
                length: NVME_CPL_SIZE as u32,
                lkey,
            }],
        }
    }

    /// Tear the connection down and release the registrations. Safe to
    /// call on a half-connected queue pair.
    pub fn disconnect(&mut self) {
        if let Some(map) = self.mr_map.take() {
            map.release();
        }
        if let Some(mr) = self.cmds_mr.take() {
            self.device.dereg_mr(&mr);
        }
        if let Some(mr) = self.rsps_mr.take() {
            self.device.dereg_mr(&mr);
        }
        if let Some(cm) = self.cm.take() {
            cm.disconnect();
        }
        self.sends.clear();
        self.recvs.clear();
        self.qp = None;
        self.cq = None;
    }

    /// Submit a command. The returned command id indexes the in-flight
    /// slot and equals the cid placed on the wire.
    pub fn submit(&mut self, req: HostRequest) -> Result<u16> {
        if self.failure.is_some() {
            return Err(Error::bad_fd("queue pair has failed"));
        }
        let Some(&id) = self.free_reqs.front() else {
            // The caller may resubmit once completions drain.
            return Err(Error::again("no free request slots"));
        };
        let mr_map = self
            .mr_map
            .as_ref()
            .ok_or_else(|| Error::bad_fd("queue pair is not connected"))?;

        let bctx = BuildCtx {
            mr_map,
            cmds: &self.cmds,
            cmds_lkey: self.cmds_mr.as_ref().unwrap().lkey,
            max_sges: self.caps.max_sges,
            ioccsz_bytes: self.caps.ioccsz_bytes,
            icdoff: self.caps.icdoff,
        };
        req_init(&bctx, &mut self.rdma_reqs[id as usize], req)?;
        self.free_reqs.pop_front();
        self.outstanding += 1;

        let slot = &self.rdma_reqs[id as usize];
        let wr = SendWr {
            wr_id: id as u64,
            opcode: WrOpcode::Send,
            sgl: slot.send_sgl[..slot.num_sge].to_vec(),
            remote_addr: 0,
            rkey: 0,
            signaled: true,
        };
        self.sends.queue(vec![wr]);

        if !self.delay_cmd_submit {
            self.submit_staged()?;
        }
        Ok(id)
    }

    fn submit_staged(&mut self) -> Result<()> {
        let Some(qp) = self.qp.clone() else {
            return Ok(());
        };
        if self.sends.flush(&qp).is_err() {
            error!(qid = self.qid, "failed to post work requests on the send queue");
            self.failure = Some(TransportFailure::Unknown);
            return Err(Error::bad_fd("send queue post failed"));
        }
        if self.recvs.flush(&qp).is_err() {
            error!(qid = self.qid, "failed to post work requests on the receive queue");
            self.failure = Some(TransportFailure::Unknown);
            return Err(Error::bad_fd("receive queue post failed"));
        }
        Ok(())
    }

    fn read_rsp(&self, rsp_idx: u16) -> NvmeCpl {
        let mut raw = [0u8; NVME_CPL_SIZE];
        self.rsps.read_at(rsp_idx as usize * NVME_CPL_SIZE, &mut raw);
        NvmeCpl::from_bytes(&raw)
    }

    /// Complete a request whose send and receive both finished: fire the
    /// callback, free the slot, and recycle the response buffer.
    fn request_ready(&mut self, id: u16) {
        let rsp_idx = self.rdma_reqs[id as usize].rsp_idx;
        let cpl = self.read_rsp(rsp_idx);
        let slot = &mut self.rdma_reqs[id as usize];
        slot.completion_flags = 0;
        if let Some(mut req) = slot.req.take() {
            if let Some(cb) = req.cb.take() {
                cb(&cpl);
            }
        }
        self.free_reqs.push_front(id);
        self.outstanding -= 1;

        let lkey = self.rsps_mr.as_ref().unwrap().lkey;
        let wr = self.rsp_recv_wr(rsp_idx, lkey);
        self.recvs.queue(vec![wr]);
    }

    /// Reap up to `max_completions` completed commands (all outstanding
    /// when zero).
    pub fn process_completions(&mut self, max_completions: usize) -> Result<usize> {
        let max_completions = if max_completions == 0 {
            self.num_entries as usize
        } else {
            max_completions.min(self.num_entries as usize)
        };
        let Some(cq) = self.cq.clone() else {
            return Err(Error::bad_fd("queue pair is not connected"));
        };

        let mut reaped = 0;
        'poll: while reaped < max_completions {
            let batch = (max_completions - reaped).min(MAX_COMPLETIONS_PER_POLL);
            let wcs = cq.poll(batch);
            if wcs.is_empty() {
                break;
            }
            for wc in wcs {
                if wc.status != WcStatus::Success {
                    error!(qid = self.qid, status = ?wc.status, "completion queue error");
                    self.failure = Some(match wc.status {
                        WcStatus::RetryExcErr => TransportFailure::Remote,
                        _ => TransportFailure::Unknown,
                    });
                    break 'poll;
                }
                match wc.opcode {
                    WcOpcode::Recv => {
                        if (wc.byte_len as usize) < NVME_CPL_SIZE {
                            warn!(byte_len = wc.byte_len, "runt response capsule");
                            self.failure = Some(TransportFailure::Unknown);
                            break 'poll;
                        }
                        let rsp_idx = wc.wr_id as u16;
                        let cpl = self.read_rsp(rsp_idx);
                        let id = cpl.cid;
                        if id as usize >= self.rdma_reqs.len() {
                            warn!(cid = id, "response capsule with an unknown command id");
                            self.failure = Some(TransportFailure::Unknown);
                            break 'poll;
                        }
                        let slot = &mut self.rdma_reqs[id as usize];
                        slot.completion_flags |= RECV_COMPLETED;
                        slot.rsp_idx = rsp_idx;
                        if slot.completion_flags & SEND_COMPLETED != 0 {
                            self.request_ready(id);
                            reaped += 1;
                        }
                    }
                    WcOpcode::Send => {
                        let id = wc.wr_id as u16;
                        let slot = &mut self.rdma_reqs[id as usize];
                        slot.completion_flags |= SEND_COMPLETED;
                        if slot.completion_flags & RECV_COMPLETED != 0 {
                            self.request_ready(id);
                            reaped += 1;
                        }
                    }
                    _ => {
                        warn!(opcode = ?wc.opcode, "unexpected opcode on the completion queue");
                        self.failure = Some(TransportFailure::Unknown);
                        break 'poll;
                    }
                }
            }
        }

        self.submit_staged().ok();
        if self.failure.is_some() {
            self.abort_reqs(true);
            return Err(Error::bad_fd("queue pair failed during completion polling"));
        }
        Ok(reaped)
    }

    /// Complete every outstanding request with an aborted status, the way
    /// a deleted submission queue aborts its commands.
    pub fn abort_reqs(&mut self, dnr: bool) {
        for id in 0..self.rdma_reqs.len() as u16 {
            let slot = &mut self.rdma_reqs[id as usize];
            let Some(mut req) = slot.req.take() else {
                continue;
            };
            slot.completion_flags = 0;
            let cpl = NvmeCpl {
                cid: id,
                status: NvmeStatus {
                    sct: crate::proto::sct::GENERIC,
                    sc: sc::ABORTED_SQ_DELETION,
                    dnr,
                },
                ..Default::default()
            };
            if let Some(cb) = req.cb.take() {
                cb(&cpl);
            }
            self.free_reqs.push_front(id);
            self.outstanding -= 1;
        }
    }
}
