//! Software verbs provider.
//!
//! Models the RDMA device surface the transport is written against:
//! devices with queried attributes, protection domains, registered memory
//! regions with local/remote keys, completion queues, queue pairs and
//! shared receive queues, and asynchronous device events. Two queue pairs
//! can be cross-connected in process; flushed work requests then move real
//! bytes between registered regions and produce completions with the same
//! ordering and signaling rules a reliable-connected hardware QP gives:
//! SENDs land in the peer's posted receive ring, RDMA READ/WRITE resolve
//! `(remote_addr, rkey)` against the peer's registrations, and unsignaled
//! successful work requests complete silently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::dma::DmaBuf;

bitflags! {
    /// Access rights of a registered memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Local write access
        const LOCAL_WRITE = 0x1;
        /// Remote read access
        const REMOTE_READ = 0x2;
        /// Remote write access
        const REMOTE_WRITE = 0x4;
    }
}

bitflags! {
    /// Device capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapFlags: u32 {
        /// The device supports SEND with invalidate
        const MEM_MGT_EXTENSIONS = 0x1;
    }
}

/// Queried device limits.
#[derive(Debug, Clone)]
pub struct DeviceAttr {
    /// Maximum work requests on a queue pair
    pub max_qp_wr: u32,
    /// Maximum outstanding RDMA READ/atomic operations a QP can initiate
    pub max_qp_init_rd_atom: u32,
    /// Maximum scatter/gather entries per work request
    pub max_sge: u32,
    /// Maximum number of shared receive queues
    pub max_srq: u32,
    /// Maximum work requests on a shared receive queue
    pub max_srq_wr: u32,
    /// Capability flags
    pub cap_flags: DeviceCapFlags,
    /// Whether the device delivers the last-WQE-reached event for SRQs
    pub last_wqe_supported: bool,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: 4096,
            max_qp_init_rd_atom: 128,
            max_sge: 32,
            max_srq: 1024,
            max_srq_wr: 4096,
            cap_flags: DeviceCapFlags::MEM_MGT_EXTENSIONS,
            last_wqe_supported: true,
        }
    }
}

/// RDMA-level queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created
    Reset,
    /// Initialized
    Init,
    /// Ready to receive
    Rtr,
    /// Ready to send
    Rts,
    /// Send queue drained
    Sqd,
    /// Send queue error
    Sqe,
    /// Error; posted work flushes
    Err,
}

impl QpState {
    /// Whether this state is one the transport knows how to handle.
    pub fn is_known(self) -> bool {
        matches!(
            self,
            QpState::Reset
                | QpState::Init
                | QpState::Rtr
                | QpState::Rts
                | QpState::Sqd
                | QpState::Sqe
                | QpState::Err
        )
    }
}

/// Asynchronous device events, the analog of ibv async events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// A queue pair hit a fatal error
    QpFatal {
        /// The affected queue pair number
        qp_num: u32,
    },
    /// The last work queue entry of an SRQ-attached QP was consumed
    LastWqeReached {
        /// The affected queue pair number
        qp_num: u32,
    },
    /// The send queue drained
    SqDrained {
        /// The affected queue pair number
        qp_num: u32,
    },
}

/// One scatter/gather element of a work request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    /// Virtual address of the region
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    /// Local key of the memory region holding the address
    pub lkey: u32,
}

/// Send-side work request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send into the peer's receive ring
    Send,
    /// Send that also invalidates a remote key at the peer
    SendWithInval,
    /// One-sided read from peer memory
    RdmaRead,
    /// One-sided write into peer memory
    RdmaWrite,
}

/// A send-side work request.
#[derive(Debug, Clone)]
pub struct SendWr {
    /// Caller cookie returned in the completion
    pub wr_id: u64,
    /// Operation
    pub opcode: WrOpcode,
    /// Local scatter/gather list
    pub sgl: Vec<Sge>,
    /// Remote address for RDMA READ/WRITE
    pub remote_addr: u64,
    /// Remote key for RDMA READ/WRITE, or the key to invalidate
    pub rkey: u32,
    /// Whether a successful completion is reported
    pub signaled: bool,
}

impl SendWr {
    /// Total byte length described by the scatter/gather list.
    pub fn byte_len(&self) -> u32 {
        self.sgl.iter().map(|s| s.length).sum()
    }
}

/// A receive-side work request.
#[derive(Debug, Clone)]
pub struct RecvWr {
    /// Caller cookie returned in the completion
    pub wr_id: u64,
    /// Local scatter/gather list the inbound send lands in
    pub sgl: Vec<Sge>,
}

/// Completion opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// A send completed
    Send,
    /// An RDMA READ completed
    RdmaRead,
    /// An RDMA WRITE completed
    RdmaWrite,
    /// An inbound send landed in a posted receive
    Recv,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// Success
    Success,
    /// Flushed because the queue pair left the ready state
    WrFlushErr,
    /// Local protection error (bad lkey or range)
    LocProtErr,
    /// Remote access error (bad rkey or range)
    RemAccessErr,
    /// The peer stopped responding
    RetryExcErr,
}

/// A reaped work completion.
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    /// Cookie of the completed work request
    pub wr_id: u64,
    /// Completion status
    pub status: WcStatus,
    /// Completed operation
    pub opcode: WcOpcode,
    /// Bytes transferred (receives and reads)
    pub byte_len: u32,
    /// Queue pair number the completion belongs to
    pub qp_num: u32,
    /// Remote key invalidated by a SEND with invalidate
    pub invalidated_rkey: Option<u32>,
}

struct MrRecord {
    pd: u32,
    buf: DmaBuf,
    addr: u64,
    len: usize,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
}

/// A registered memory region handle.
#[derive(Debug, Clone)]
pub struct Mr {
    /// Local key
    pub lkey: u32,
    /// Remote key
    pub rkey: u32,
    /// Registered base address
    pub addr: u64,
    /// Registered length
    pub len: usize,
}

struct DeviceInner {
    name: String,
    attr: DeviceAttr,
    next_key: Mutex<u32>,
    mrs: RwLock<HashMap<u32, Arc<MrRecord>>>,
    async_events: Mutex<VecDeque<AsyncEvent>>,
}

lazy_static::lazy_static! {
    // Protection domains are process-wide identities: registration maps
    // key on them across devices.
    static ref NEXT_PD: Mutex<u32> = Mutex::new(1);
}

/// An RDMA device. Cloning shares the device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Device {
    /// Open a device with the given name and attributes.
    pub fn new(name: &str, attr: DeviceAttr) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                name: name.to_string(),
                attr,
                next_key: Mutex::new(1),
                mrs: RwLock::new(HashMap::new()),
                async_events: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queried device attributes.
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.attr
    }

    /// Allocate a protection domain.
    pub fn alloc_pd(&self) -> Pd {
        let mut next = NEXT_PD.lock();
        let id = *next;
        *next += 1;
        Pd {
            device: self.clone(),
            id,
        }
    }

    /// Register a buffer with the device, producing local and remote keys.
    pub fn reg_mr(&self, pd: &Pd, buf: DmaBuf, access: AccessFlags) -> Mr {
        let mut next = self.inner.next_key.lock();
        let key = *next;
        *next += 1;
        drop(next);

        let record = Arc::new(MrRecord {
            pd: pd.id,
            addr: buf.base(),
            len: buf.len(),
            lkey: key,
            rkey: key,
            access,
            buf,
        });
        let mr = Mr {
            lkey: record.lkey,
            rkey: record.rkey,
            addr: record.addr,
            len: record.len,
        };
        self.inner.mrs.write().insert(key, record);
        debug!(
            device = %self.inner.name,
            lkey = key,
            addr = format_args!("{:#x}", mr.addr),
            len = mr.len,
            "registered memory region"
        );
        mr
    }

    /// Deregister a memory region.
    pub fn dereg_mr(&self, mr: &Mr) {
        self.inner.mrs.write().remove(&mr.lkey);
    }

    /// Find the region containing `addr .. addr + len` by local key space.
    ///
    /// Returns the region handle and how many bytes remain registered from
    /// `addr` to its end. A lookup never spans two regions.
    pub fn translate(&self, pd: &Pd, addr: u64, len: usize) -> Result<(Mr, usize)> {
        let mrs = self.inner.mrs.read();
        for record in mrs.values() {
            if record.pd == pd.id
                && addr >= record.addr
                && addr < record.addr + record.len as u64
            {
                let real = (record.addr + record.len as u64 - addr) as usize;
                if real < len {
                    return Err(Error::not_found(format!(
                        "translation for {:#x} covers only {} of {} bytes",
                        addr, real, len
                    )));
                }
                return Ok((
                    Mr {
                        lkey: record.lkey,
                        rkey: record.rkey,
                        addr: record.addr,
                        len: record.len,
                    },
                    real,
                ));
            }
        }
        Err(Error::not_found(format!("no translation for {:#x}", addr)))
    }

    fn resolve_local(&self, sge: &Sge) -> Result<(DmaBuf, usize)> {
        let mrs = self.inner.mrs.read();
        let record = mrs
            .get(&sge.lkey)
            .ok_or_else(|| Error::not_found(format!("unknown lkey {:#x}", sge.lkey)))?;
        if sge.addr < record.addr
            || sge.addr + sge.length as u64 > record.addr + record.len as u64
        {
            return Err(Error::range("SGE outside its memory region"));
        }
        Ok((record.buf.clone(), (sge.addr - record.addr) as usize))
    }

    fn resolve_remote(
        &self,
        rkey: u32,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<(DmaBuf, usize)> {
        let mrs = self.inner.mrs.read();
        let record = mrs
            .values()
            .find(|r| r.rkey == rkey)
            .ok_or_else(|| Error::not_found(format!("unknown rkey {:#x}", rkey)))?;
        if !record.access.contains(access) {
            return Err(Error::invalid("remote access not permitted"));
        }
        if addr < record.addr || addr + len as u64 > record.addr + record.len as u64 {
            return Err(Error::range("remote range outside its memory region"));
        }
        Ok((record.buf.clone(), (addr - record.addr) as usize))
    }

    /// Queue an asynchronous device event.
    pub fn push_async_event(&self, event: AsyncEvent) {
        self.inner.async_events.lock().push_back(event);
    }

    /// Reap the next asynchronous device event, if any.
    pub fn poll_async_event(&self) -> Option<AsyncEvent> {
        self.inner.async_events.lock().pop_front()
    }
}

/// A protection domain.
#[derive(Clone)]
pub struct Pd {
    device: Device,
    id: u32,
}

impl std::fmt::Debug for Pd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pd").field("id", &self.id).finish()
    }
}

impl Pd {
    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Numeric id of this protection domain.
    pub fn id(&self) -> u32 {
        self.id
    }
}

struct CqInner {
    capacity: usize,
    queue: Mutex<VecDeque<WorkCompletion>>,
}

/// A completion queue. Cloning shares the queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl std::fmt::Debug for Cq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cq")
            .field("depth", &self.inner.queue.lock().len())
            .finish()
    }
}

impl Cq {
    /// Create a completion queue holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(CqInner {
                capacity,
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append a completion. Overruns are logged and dropped; a hardware CQ
    /// overrun is fatal to the attached QPs, which the poller notices
    /// through the flush path.
    pub fn push(&self, wc: WorkCompletion) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            warn!(capacity = self.inner.capacity, "completion queue overrun");
            return;
        }
        queue.push_back(wc);
    }

    /// Reap up to `max` completions.
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        let mut queue = self.inner.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }
}

struct SrqInner {
    max_wr: u32,
    queue: Mutex<VecDeque<RecvWr>>,
}

/// A shared receive queue feeding several queue pairs.
#[derive(Clone)]
pub struct Srq {
    inner: Arc<SrqInner>,
}

impl std::fmt::Debug for Srq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Srq")
            .field("posted", &self.inner.queue.lock().len())
            .finish()
    }
}

impl Srq {
    /// Create a shared receive queue.
    pub fn new(max_wr: u32) -> Self {
        Self {
            inner: Arc::new(SrqInner {
                max_wr,
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Post receive work requests. Returns the index of the first request
    /// that did not fit.
    pub fn post_recv(&self, wrs: Vec<RecvWr>) -> std::result::Result<(), usize> {
        let mut queue = self.inner.queue.lock();
        for (i, wr) in wrs.into_iter().enumerate() {
            if queue.len() >= self.inner.max_wr as usize {
                return Err(i);
            }
            queue.push_back(wr);
        }
        Ok(())
    }

    fn take(&self) -> Option<RecvWr> {
        self.inner.queue.lock().pop_front()
    }

    /// Number of receives currently posted.
    pub fn posted(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// Queue pair capacity limits.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    /// Maximum send work requests
    pub max_send_wr: u32,
    /// Maximum receive work requests
    pub max_recv_wr: u32,
    /// Maximum SGEs per send work request
    pub max_send_sge: u32,
    /// Maximum SGEs per receive work request
    pub max_recv_sge: u32,
}

struct QpInner {
    qp_num: u32,
    device: Device,
    pd_id: u32,
    send_cq: Cq,
    recv_cq: Cq,
    caps: QpCaps,
    srq: Option<Srq>,
    state: Mutex<QpState>,
    recv_queue: Mutex<VecDeque<RecvWr>>,
    outstanding_sends: Mutex<u32>,
    peer: Mutex<Weak<QpInner>>,
}

lazy_static::lazy_static! {
    static ref NEXT_QP_NUM: Mutex<u32> = Mutex::new(1);
}

/// A reliable-connected queue pair. Cloning shares the queue pair.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl std::fmt::Debug for Qp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qp")
            .field("qp_num", &self.inner.qp_num)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl Qp {
    /// Create a queue pair on `device` in the RESET state.
    pub fn new(device: &Device, pd: &Pd, send_cq: Cq, recv_cq: Cq, caps: QpCaps, srq: Option<Srq>) -> Self {
        let mut next = NEXT_QP_NUM.lock();
        let qp_num = *next;
        *next += 1;
        Self {
            inner: Arc::new(QpInner {
                qp_num,
                device: device.clone(),
                pd_id: pd.id,
                send_cq,
                recv_cq,
                caps,
                srq,
                state: Mutex::new(QpState::Reset),
                recv_queue: Mutex::new(VecDeque::new()),
                outstanding_sends: Mutex::new(0),
                peer: Mutex::new(Weak::new()),
            }),
        }
    }

    /// The queue pair number.
    pub fn qp_num(&self) -> u32 {
        self.inner.qp_num
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Capacity limits negotiated at creation.
    pub fn caps(&self) -> QpCaps {
        self.inner.caps
    }

    /// Query the current RDMA-level state.
    pub fn state(&self) -> QpState {
        *self.inner.state.lock()
    }

    /// The shared receive queue, when one is attached.
    pub fn srq(&self) -> Option<&Srq> {
        self.inner.srq.as_ref()
    }

    /// Cross-connect two queue pairs and move both to RTS.
    pub fn connect_pair(a: &Qp, b: &Qp) {
        *a.inner.peer.lock() = Arc::downgrade(&b.inner);
        *b.inner.peer.lock() = Arc::downgrade(&a.inner);
        *a.inner.state.lock() = QpState::Rts;
        *b.inner.state.lock() = QpState::Rts;
    }

    /// Drop the connection and move this queue pair to the error state,
    /// flushing all posted receives. The peer, if still alive, is moved to
    /// the error state as well.
    pub fn disconnect(&self) {
        let peer = self.inner.peer.lock().upgrade();
        self.set_error();
        if let Some(peer) = peer {
            Qp { inner: peer }.set_error();
        }
    }

    /// Move to the error state and flush every posted receive.
    pub fn set_error(&self) {
        let mut state = self.inner.state.lock();
        if *state == QpState::Err {
            return;
        }
        *state = QpState::Err;
        drop(state);
        *self.inner.peer.lock() = Weak::new();

        let flushed: Vec<RecvWr> = self.inner.recv_queue.lock().drain(..).collect();
        for wr in flushed {
            self.inner.recv_cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::WrFlushErr,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                qp_num: self.inner.qp_num,
                invalidated_rkey: None,
            });
        }
    }

    /// Post receive work requests onto the queue pair's own ring.
    ///
    /// Returns the index of the first request that did not fit.
    pub fn post_recv(&self, wrs: Vec<RecvWr>) -> std::result::Result<(), usize> {
        if let Some(srq) = &self.inner.srq {
            return srq.post_recv(wrs);
        }
        let mut queue = self.inner.recv_queue.lock();
        for (i, wr) in wrs.into_iter().enumerate() {
            if queue.len() >= self.inner.caps.max_recv_wr as usize {
                return Err(i);
            }
            if wr.sgl.len() > self.inner.caps.max_recv_sge as usize {
                return Err(i);
            }
            queue.push_back(wr);
        }
        Ok(())
    }

    /// Post a chain of send-side work requests.
    ///
    /// The chain executes in order. On capacity exhaustion the index of
    /// the first rejected request is returned and nothing from that point
    /// on executes. Unsignaled successful requests produce no completion;
    /// every request flushed by an error state produces one.
    pub fn post_send(&self, wrs: Vec<SendWr>) -> std::result::Result<(), usize> {
        let state = self.state();
        if state == QpState::Err {
            // Flush everything.
            for wr in &wrs {
                self.push_send_completion(wr, WcStatus::WrFlushErr, 0);
            }
            return Ok(());
        }
        if state != QpState::Rts {
            return Err(0);
        }

        for (i, wr) in wrs.iter().enumerate() {
            if wr.sgl.len() > self.inner.caps.max_send_sge as usize {
                return Err(i);
            }
            let mut outstanding = self.inner.outstanding_sends.lock();
            if *outstanding >= self.inner.caps.max_send_wr {
                return Err(i);
            }
            *outstanding += 1;
            drop(outstanding);

            self.execute(wr);
            *self.inner.outstanding_sends.lock() -= 1;
        }
        Ok(())
    }

    fn push_send_completion(&self, wr: &SendWr, status: WcStatus, byte_len: u32) {
        let opcode = match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithInval => WcOpcode::Send,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
        };
        if wr.signaled || status != WcStatus::Success {
            self.inner.send_cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode,
                byte_len,
                qp_num: self.inner.qp_num,
                invalidated_rkey: None,
            });
        }
    }

    fn gather(&self, sgl: &[Sge]) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for sge in sgl {
            let (buf, off) = self.inner.device.resolve_local(sge)?;
            let mut chunk = vec![0u8; sge.length as usize];
            buf.read_at(off, &mut chunk);
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn scatter(device: &Device, sgl: &[Sge], data: &[u8]) -> Result<u32> {
        let mut done = 0usize;
        for sge in sgl {
            if done >= data.len() {
                break;
            }
            let take = (sge.length as usize).min(data.len() - done);
            let (buf, off) = device.resolve_local(sge)?;
            buf.write_at(off, &data[done..done + take]);
            done += take;
        }
        Ok(done as u32)
    }

    fn execute(&self, wr: &SendWr) {
        let peer = match self.inner.peer.lock().upgrade() {
            Some(peer) => peer,
            None => {
                self.push_send_completion(wr, WcStatus::RetryExcErr, 0);
                self.set_error();
                return;
            }
        };
        let peer = Qp { inner: peer };

        match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithInval => {
                let data = match self.gather(&wr.sgl) {
                    Ok(data) => data,
                    Err(_) => {
                        self.push_send_completion(wr, WcStatus::LocProtErr, 0);
                        self.set_error();
                        return;
                    }
                };
                let recv = if let Some(srq) = &peer.inner.srq {
                    srq.take()
                } else {
                    peer.inner.recv_queue.lock().pop_front()
                };
                let Some(recv) = recv else {
                    // Receiver-not-ready with no retry budget left.
                    self.push_send_completion(wr, WcStatus::RetryExcErr, 0);
                    self.set_error();
                    return;
                };
                let written =
                    match Qp::scatter(&peer.inner.device, &recv.sgl, &data) {
                        Ok(written) => written,
                        Err(_) => {
                            self.push_send_completion(wr, WcStatus::RemAccessErr, 0);
                            self.set_error();
                            return;
                        }
                    };
                let invalidated = match wr.opcode {
                    WrOpcode::SendWithInval => Some(wr.rkey),
                    _ => None,
                };
                peer.inner.recv_cq.push(WorkCompletion {
                    wr_id: recv.wr_id,
                    status: WcStatus::Success,
                    opcode: WcOpcode::Recv,
                    byte_len: written,
                    qp_num: peer.inner.qp_num,
                    invalidated_rkey: invalidated,
                });
                self.push_send_completion(wr, WcStatus::Success, written);
            }
            WrOpcode::RdmaWrite => {
                let data = match self.gather(&wr.sgl) {
                    Ok(data) => data,
                    Err(_) => {
                        self.push_send_completion(wr, WcStatus::LocProtErr, 0);
                        self.set_error();
                        return;
                    }
                };
                match peer.inner.device.resolve_remote(
                    wr.rkey,
                    wr.remote_addr,
                    data.len(),
                    AccessFlags::REMOTE_WRITE,
                ) {
                    Ok((buf, off)) => {
                        buf.write_at(off, &data);
                        self.push_send_completion(wr, WcStatus::Success, data.len() as u32);
                    }
                    Err(_) => {
                        self.push_send_completion(wr, WcStatus::RemAccessErr, 0);
                        self.set_error();
                    }
                }
            }
            WrOpcode::RdmaRead => {
                let total: usize = wr.sgl.iter().map(|s| s.length as usize).sum();
                match peer.inner.device.resolve_remote(
                    wr.rkey,
                    wr.remote_addr,
                    total,
                    AccessFlags::REMOTE_READ,
                ) {
                    Ok((buf, off)) => {
                        let data = buf.to_vec(off, total);
                        match Qp::scatter(&self.inner.device, &wr.sgl, &data) {
                            Ok(read) => {
                                self.push_send_completion(wr, WcStatus::Success, read)
                            }
                            Err(_) => {
                                self.push_send_completion(wr, WcStatus::LocProtErr, 0);
                                self.set_error();
                            }
                        }
                    }
                    Err(_) => {
                        self.push_send_completion(wr, WcStatus::RemAccessErr, 0);
                        self.set_error();
                    }
                }
            }
        }
    }

    /// Number of receives currently posted on this queue pair's own ring.
    pub fn posted_recvs(&self) -> usize {
        self.inner.recv_queue.lock().len()
    }

    /// The protection domain id this queue pair was created under.
    pub fn pd_id(&self) -> u32 {
        self.inner.pd_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Device, Pd, Qp, Qp) {
        let device = Device::new("soft0", DeviceAttr::default());
        let pd = device.alloc_pd();
        let caps = QpCaps {
            max_send_wr: 64,
            max_recv_wr: 64,
            max_send_sge: 16,
            max_recv_sge: 2,
        };
        let a = Qp::new(&device, &pd, Cq::new(128), Cq::new(128), caps, None);
        let b = Qp::new(&device, &pd, Cq::new(128), Cq::new(128), caps, None);
        Qp::connect_pair(&a, &b);
        (device, pd, a, b)
    }

    fn reg(device: &Device, pd: &Pd, len: usize) -> (Mr, DmaBuf) {
        let buf = DmaBuf::alloc(len);
        let mr = device.reg_mr(
            pd,
            buf.clone(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        );
        (mr, buf)
    }

    fn recv_cq_of(qp: &Qp) -> Cq {
        qp.inner.recv_cq.clone()
    }

    #[test]
    fn test_send_lands_in_posted_recv() {
        let (device, pd, a, b) = pair();
        let (src_mr, src) = reg(&device, &pd, 64);
        let (dst_mr, dst) = reg(&device, &pd, 64);
        src.write_at(0, b"hello rdma");

        b.post_recv(vec![RecvWr {
            wr_id: 7,
            sgl: vec![Sge {
                addr: dst_mr.addr,
                length: 64,
                lkey: dst_mr.lkey,
            }],
        }])
        .unwrap();

        a.post_send(vec![SendWr {
            wr_id: 1,
            opcode: WrOpcode::Send,
            sgl: vec![Sge {
                addr: src_mr.addr,
                length: 10,
                lkey: src_mr.lkey,
            }],
            remote_addr: 0,
            rkey: 0,
            signaled: true,
        }])
        .unwrap();

        let recvs = recv_cq_of(&b).poll(8);
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].wr_id, 7);
        assert_eq!(recvs[0].byte_len, 10);
        assert_eq!(recvs[0].opcode, WcOpcode::Recv);
        assert_eq!(dst.to_vec(0, 10), b"hello rdma".to_vec());

        let sends = a.inner.send_cq.poll(8);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].opcode, WcOpcode::Send);
    }

    #[test]
    fn test_unsignaled_send_completes_silently() {
        let (device, pd, a, b) = pair();
        let (src_mr, _src) = reg(&device, &pd, 16);
        let (dst_mr, _dst) = reg(&device, &pd, 16);
        b.post_recv(vec![RecvWr {
            wr_id: 1,
            sgl: vec![Sge {
                addr: dst_mr.addr,
                length: 16,
                lkey: dst_mr.lkey,
            }],
        }])
        .unwrap();
        a.post_send(vec![SendWr {
            wr_id: 2,
            opcode: WrOpcode::Send,
            sgl: vec![Sge {
                addr: src_mr.addr,
                length: 4,
                lkey: src_mr.lkey,
            }],
            remote_addr: 0,
            rkey: 0,
            signaled: false,
        }])
        .unwrap();
        assert!(a.inner.send_cq.poll(8).is_empty());
    }

    #[test]
    fn test_rdma_read_write_move_bytes() {
        let (device, pd, a, _b) = pair();
        let (local_mr, local) = reg(&device, &pd, 32);
        let (remote_mr, remote) = reg(&device, &pd, 32);
        remote.write_at(0, &[9u8; 16]);

        a.post_send(vec![SendWr {
            wr_id: 3,
            opcode: WrOpcode::RdmaRead,
            sgl: vec![Sge {
                addr: local_mr.addr,
                length: 16,
                lkey: local_mr.lkey,
            }],
            remote_addr: remote_mr.addr,
            rkey: remote_mr.rkey,
            signaled: true,
        }])
        .unwrap();
        assert_eq!(local.to_vec(0, 16), vec![9u8; 16]);
        let wcs = a.inner.send_cq.poll(8);
        assert_eq!(wcs[0].opcode, WcOpcode::RdmaRead);

        local.write_at(16, &[4u8; 8]);
        a.post_send(vec![SendWr {
            wr_id: 4,
            opcode: WrOpcode::RdmaWrite,
            sgl: vec![Sge {
                addr: local_mr.addr + 16,
                length: 8,
                lkey: local_mr.lkey,
            }],
            remote_addr: remote_mr.addr + 20,
            rkey: remote_mr.rkey,
            signaled: true,
        }])
        .unwrap();
        assert_eq!(remote.to_vec(20, 8), vec![4u8; 8]);
    }

    #[test]
    fn test_error_state_flushes() {
        let (device, pd, a, b) = pair();
        let (mr, _buf) = reg(&device, &pd, 16);
        b.post_recv(vec![RecvWr {
            wr_id: 11,
            sgl: vec![Sge {
                addr: mr.addr,
                length: 16,
                lkey: mr.lkey,
            }],
        }])
        .unwrap();

        b.set_error();
        let flushed = recv_cq_of(&b).poll(8);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].status, WcStatus::WrFlushErr);

        a.set_error();
        a.post_send(vec![SendWr {
            wr_id: 12,
            opcode: WrOpcode::Send,
            sgl: vec![],
            remote_addr: 0,
            rkey: 0,
            signaled: false,
        }])
        .unwrap();
        let flushed = a.inner.send_cq.poll(8);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].status, WcStatus::WrFlushErr);
    }

    #[test]
    fn test_translate_rejects_spanning_lookups() {
        let device = Device::new("soft1", DeviceAttr::default());
        let pd = device.alloc_pd();
        let (mr, _buf) = reg(&device, &pd, 4096);
        assert!(device.translate(&pd, mr.addr, 4096).is_ok());
        assert!(device.translate(&pd, mr.addr + 4000, 200).is_err());
        assert!(device.translate(&pd, 0x100, 8).is_err());
    }
}
