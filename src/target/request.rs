//! Target request lifecycle.
//!
//! A request is born when a receive capsule pairs with a free request
//! record and dies when its completion send finishes and the record
//! returns to the free queue. In between it walks an explicit state
//! machine: buffer acquisition, the optional RDMA READ pull of write
//! data, execution at the block device, the optional RDMA WRITE push of
//! read data chained in front of the completion send, and release. The
//! machine is non-blocking: whenever a request cannot make progress it
//! parks on the queue that will re-drive it.

use std::time::Instant;

use tracing::{debug, error, warn};

use crate::proto::{
    opc, sc, NvmeCmd, NvmeCpl, NvmeStatus, SglDescriptor, XferDir, MAX_SGL_DESCRIPTORS,
    SGL_DESC_SIZE,
};
use crate::rdma::verbs::{SendWr, Sge, WrOpcode};
use crate::target::poll_group::{BackendCpl, GroupShared, PendingAbort, TargetCtx};
use crate::target::qpair::{QpairCore, Resources};
use crate::target::{pack_wr_id, WrKind};
use crate::util::dif::{self, DifCtx, DifErrorType, DifFlags, DifType};
use crate::util::dma::DmaBuf;
use crate::util::sg::SgEntry;
use crate::backend::{IoRequest, IoType};

/// Lifecycle states of a target request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// The record is not in use
    Free,
    /// A receive capsule was just paired with the record
    New,
    /// Parked until data buffers are available
    NeedBuffer,
    /// Parked until RDMA READ quota is available
    DataTransferToControllerPending,
    /// RDMA READ of write data in flight
    TransferringHostToController,
    /// Ready to execute at the block device
    ReadyToExecute,
    /// Executing at the block device
    Executing,
    /// The block device finished
    Executed,
    /// Parked until send quota for the RDMA WRITE is available
    DataTransferToHostPending,
    /// Ready to post the completion (and any read data)
    ReadyToComplete,
    /// RDMA WRITE of read data plus completion send in flight
    TransferringControllerToHost,
    /// Completion send in flight without a data transfer
    Completing,
    /// Finished; the record is about to be freed
    Completed,
}

/// Protection-information bookkeeping attached to a request when the
/// transport hides PI from the host.
#[derive(Debug, Clone)]
pub struct DifState {
    /// Per-block protection configuration
    pub ctx: DifCtx,
    /// Payload length as the host sees it
    pub orig_length: u32,
    /// Payload length once metadata is interleaved
    pub elba_length: u32,
}

/// A target request record.
pub struct RdmaRequest {
    /// Index in the request arena; doubles as the response slot index
    pub idx: u16,
    /// Lifecycle state
    pub state: RequestState,
    /// Queue pair this request currently belongs to
    pub qp_num: u32,
    /// The captured receive capsule
    pub recv_idx: Option<u16>,
    /// Decoded command
    pub cmd: NvmeCmd,
    /// The completion being built
    pub rsp: NvmeCpl,
    /// Data transfer direction
    pub xfer: XferDir,
    /// Wire-visible payload length
    pub length: u32,
    /// Payload regions
    pub iovs: Vec<SgEntry>,
    /// Buffers drawn from the shared pool
    pub pooled: Vec<DmaBuf>,
    /// Whether the payload lives in pool buffers (false for in-capsule)
    pub data_from_pool: bool,
    /// Byte offset within the current region while building SGEs
    pub offset: usize,
    /// Region cursor while building SGEs
    pub iovpos: usize,
    /// Data work requests not yet completed
    pub num_outstanding_data_wr: u32,
    /// Built data work requests, consumed when the transfer posts
    pub data_wrs: Vec<SendWr>,
    /// Extra work-request records drawn from the shared pool
    pub wr_tokens: usize,
    /// Remote key to invalidate with the completion send
    pub rsp_inval_rkey: Option<u32>,
    /// Protection-information state when the transport inserts/strips PI
    pub dif: Option<DifState>,
    /// When the capsule was received, for latency accounting
    pub receive_tick: Option<Instant>,
    /// Tag identifying the in-flight block-device operation
    pub backend_tag: u64,
}

impl RdmaRequest {
    /// A free record for arena slot `idx`.
    pub fn new(idx: u16) -> Self {
        Self {
            idx,
            state: RequestState::Free,
            qp_num: 0,
            recv_idx: None,
            cmd: NvmeCmd::default(),
            rsp: NvmeCpl::default(),
            xfer: XferDir::None,
            length: 0,
            iovs: Vec::new(),
            pooled: Vec::new(),
            data_from_pool: false,
            offset: 0,
            iovpos: 0,
            num_outstanding_data_wr: 0,
            data_wrs: Vec::new(),
            wr_tokens: 0,
            rsp_inval_rkey: None,
            dif: None,
            receive_tick: None,
            backend_tag: 0,
        }
    }

    fn reset(&mut self) {
        self.qp_num = 0;
        self.recv_idx = None;
        self.cmd = NvmeCmd::default();
        self.rsp = NvmeCpl::default();
        self.xfer = XferDir::None;
        self.length = 0;
        self.iovs.clear();
        self.pooled.clear();
        self.data_from_pool = false;
        self.offset = 0;
        self.iovpos = 0;
        self.num_outstanding_data_wr = 0;
        self.data_wrs.clear();
        self.wr_tokens = 0;
        self.rsp_inval_rkey = None;
        self.dif = None;
        self.receive_tick = None;
        self.backend_tag = 0;
    }
}

/// Outcome of SGL parsing.
enum ParseOutcome {
    /// Buffers acquired and work requests built
    Filled,
    /// The pool is empty; stay parked on the buffer queue
    Pending,
    /// The capsule is malformed; complete with this status code
    Fail(u8),
}

/// Map a protection-verification failure onto its media status code.
pub fn dif_error_to_status(err: DifErrorType) -> u8 {
    match err {
        DifErrorType::Guard => sc::GUARD_CHECK_ERROR,
        DifErrorType::AppTag => sc::APPLICATION_TAG_CHECK_ERROR,
        DifErrorType::RefTag => sc::REFERENCE_TAG_CHECK_ERROR,
    }
}

/// Derive the protection context for a command when the transport is
/// configured to insert and strip PI on behalf of the host.
pub fn request_get_dif_state(ctx: &TargetCtx, cmd: &NvmeCmd) -> Option<DifState> {
    if !ctx.opts.dif_insert_or_strip {
        return None;
    }
    if !matches!(cmd.opc, opc::READ | opc::WRITE | opc::COMPARE) {
        return None;
    }
    let backend = &ctx.backend;
    let md_size = backend.get_md_size();
    if md_size == 0 || !backend.is_md_interleaved() {
        return None;
    }
    let dif_type = backend.get_dif_type();
    if dif_type == DifType::Disable {
        return None;
    }

    // The generated tuple follows the device format's enabled checks;
    // the expected tags ride in CDW15.
    let mut flags = DifFlags::empty();
    for check in [
        DifFlags::GUARD_CHECK,
        DifFlags::APPTAG_CHECK,
        DifFlags::REFTAG_CHECK,
    ] {
        if backend.is_dif_check_enabled(check) {
            flags |= check;
        }
    }
    if dif_type == DifType::Type3 {
        flags.remove(DifFlags::REFTAG_CHECK);
    }

    let block_size = backend.get_block_size() + md_size;
    let dif_ctx = DifCtx::new(
        block_size as usize,
        md_size as usize,
        true,
        true,
        dif_type,
        flags,
        cmd.cdw10,
        (cmd.cdw15 >> 16) as u16,
        (cmd.cdw15 & 0xFFFF) as u16,
    )
    .ok()?;

    Some(DifState {
        ctx: dif_ctx,
        orig_length: 0,
        elba_length: 0,
    })
}

/// Estimate the work requests needed once DIF interleaving splits SGEs
/// around metadata.
fn calc_num_wrs(length: u32, io_unit_size: u32, block_size: u32) -> u32 {
    let mut num_sge = 0u32;
    let mut remaining = length;
    while remaining > 0 {
        let buffer_len = remaining.min(io_unit_size);
        let mut in_block = buffer_len.div_ceil(block_size);
        if in_block * block_size > buffer_len {
            in_block += 1;
        }
        num_sge += in_block;
        remaining -= buffer_len;
    }
    num_sge.div_ceil(MAX_SGL_DESCRIPTORS as u32)
}

/// Build the SGE lists of `num_wrs` data work requests over the request's
/// payload regions, starting at the request's cursor.
///
/// Returns the built work requests; the remote address and key are filled
/// in by the caller. With an active protection context the SGEs split at
/// metadata boundaries so the host only ever sees raw data bytes.
fn fill_wr_sgl(
    ctx: &TargetCtx,
    req: &mut RdmaRequest,
    total_length: u32,
    num_wrs: u32,
) -> Result<Vec<SendWr>, u8> {
    let (wr_opcode, signaled) = match req.xfer {
        XferDir::HostToController => (WrOpcode::RdmaRead, true),
        XferDir::ControllerToHost => (WrOpcode::RdmaWrite, false),
        _ => unreachable!("data transfer for a data-less command"),
    };
    let wr_id = pack_wr_id(WrKind::Data, req.idx);

    let mut dif_remaining_block = 0usize;
    let mut dif_data_block = 0usize;
    let mut dif_md = 0usize;
    if let Some(dif) = &req.dif {
        dif_data_block = dif.ctx.data_block_size();
        dif_md = dif.ctx.md_size;
        dif_remaining_block = dif_data_block;
    }

    let mut wrs: Vec<SendWr> = Vec::with_capacity(num_wrs as usize);
    let mut sgl: Vec<Sge> = Vec::new();
    let mut total = total_length as usize;

    while total > 0 {
        if req.iovpos >= req.iovs.len() {
            error!("not enough payload regions to hold the data transfer");
            return Err(sc::DATA_SGL_LENGTH_INVALID);
        }
        let iov = req.iovs[req.iovpos].clone();
        let translation = ctx
            .mem_map
            .translate(iov.addr(), iov.len())
            .map_err(|_| sc::INTERNAL_DEVICE_ERROR)?;

        let mut remaining = (iov.len() - req.offset).min(total);

        if req.dif.is_none() {
            sgl.push(Sge {
                addr: iov.addr() + req.offset as u64,
                length: remaining as u32,
                lkey: translation.lkey,
            });
            req.offset += remaining;
            total -= remaining;
            if req.offset == iov.len() {
                req.offset = 0;
                req.iovpos += 1;
            }
            if sgl.len() == MAX_SGL_DESCRIPTORS || total == 0 {
                wrs.push(SendWr {
                    wr_id,
                    opcode: wr_opcode,
                    sgl: std::mem::take(&mut sgl),
                    remote_addr: 0,
                    rkey: 0,
                    signaled,
                });
                if total > 0 && wrs.len() == num_wrs as usize {
                    error!("not enough work requests to hold the data transfer");
                    return Err(sc::DATA_SGL_LENGTH_INVALID);
                }
            }
        } else {
            // SGEs cover only data portions; metadata gaps are skipped so
            // the wire transfer never touches protection bytes.
            while remaining > 0 {
                if sgl.len() == MAX_SGL_DESCRIPTORS {
                    wrs.push(SendWr {
                        wr_id,
                        opcode: wr_opcode,
                        sgl: std::mem::take(&mut sgl),
                        remote_addr: 0,
                        rkey: 0,
                        signaled,
                    });
                    if wrs.len() == num_wrs as usize {
                        return Err(sc::DATA_SGL_LENGTH_INVALID);
                    }
                }
                let sge_len = remaining.min(dif_remaining_block);
                sgl.push(Sge {
                    addr: iov.addr() + req.offset as u64,
                    length: sge_len as u32,
                    lkey: translation.lkey,
                });
                remaining -= sge_len;
                dif_remaining_block -= sge_len;
                req.offset += sge_len;
                total -= sge_len;

                if dif_remaining_block == 0 {
                    // Skip the metadata field; metadata that does not fit
                    // this buffer spills into the next one.
                    req.offset += dif_md;
                    total = total.saturating_sub(dif_md);
                    remaining = remaining.saturating_sub(dif_md);
                    dif_remaining_block = dif_data_block;
                }
                if remaining == 0 {
                    // Metadata spilling past this region is skipped at the
                    // head of the next one.
                    req.offset = req.offset.saturating_sub(iov.len());
                    req.iovpos += 1;
                }
            }
            if total == 0 && !sgl.is_empty() {
                wrs.push(SendWr {
                    wr_id,
                    opcode: wr_opcode,
                    sgl: std::mem::take(&mut sgl),
                    remote_addr: 0,
                    rkey: 0,
                    signaled,
                });
            }
        }
    }

    Ok(wrs)
}

/// Point a run of work requests at a keyed remote range, advancing the
/// remote address by the bytes each one consumes.
fn update_remote_addr(wrs: &mut [SendWr], base: u64, rkey: u32) {
    let mut offset = 0u64;
    for wr in wrs.iter_mut() {
        wr.rkey = rkey;
        wr.remote_addr = base + offset;
        offset += wr.sgl.iter().map(|s| s.length as u64).sum::<u64>();
    }
}

/// Acquire pool buffers for `length` bytes and build the data work
/// requests for a single keyed SGL.
fn fill_iovs(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    req: &mut RdmaRequest,
    length: u32,
) -> ParseOutcome {
    let io_unit = ctx.opts.io_unit_size;
    let num_buffers = length.div_ceil(io_unit) as usize;
    let Some(bufs) = group.cache.get_bulk(num_buffers) else {
        return ParseOutcome::Pending;
    };

    let mut remaining = length as usize;
    for buf in &bufs {
        let take = remaining.min(io_unit as usize);
        req.iovs.push(SgEntry::new(buf.clone(), 0, take));
        remaining -= take;
    }
    req.pooled = bufs;
    req.data_from_pool = true;
    req.iovpos = 0;
    req.offset = 0;

    let mut num_wrs = 1u32;
    if let Some(dif) = &req.dif {
        num_wrs = calc_num_wrs(length, io_unit, dif.ctx.block_size as u32);
        if num_wrs > 1 {
            let Some(tokens) = ctx.data_wr_pool.get_bulk(num_wrs as usize - 1) else {
                release_buffers(group, req);
                return ParseOutcome::Pending;
            };
            req.wr_tokens = tokens.len();
        }
    }

    match fill_wr_sgl(ctx, req, length, num_wrs) {
        Ok(mut wrs) => {
            let sgl1 = &req.cmd.sgl1;
            update_remote_addr(&mut wrs, sgl1.address, sgl1.key);
            req.num_outstanding_data_wr = wrs.len() as u32;
            req.data_wrs = wrs;
            ParseOutcome::Filled
        }
        Err(status) => {
            release_buffers(group, req);
            release_wr_tokens(ctx, req);
            ParseOutcome::Fail(status)
        }
    }
}

/// Parse the multi-descriptor (last segment) SGL form: an array of keyed
/// descriptors in the capsule tail, one data work request per entry.
fn fill_iovs_multi_sgl(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    rsrc_caps: &[SglDescriptor],
    req: &mut RdmaRequest,
) -> ParseOutcome {
    let num_desc = rsrc_caps.len();
    let mut lengths = Vec::with_capacity(num_desc);
    let mut total_length = 0u64;
    let mut orig_total = 0u64;
    for desc in rsrc_caps {
        let mut len = desc.length as u64;
        orig_total += len;
        if let Some(dif) = &req.dif {
            len = dif.ctx.length_with_md(len as usize) as u64;
        }
        lengths.push(len as u32);
        total_length += len;
    }

    if total_length > ctx.opts.max_io_size as u64 {
        warn!(
            total_length,
            max_io_size = ctx.opts.max_io_size,
            "multi SGL length exceeds max I/O size"
        );
        return ParseOutcome::Fail(sc::DATA_SGL_LENGTH_INVALID);
    }

    if num_desc > 1 {
        let Some(tokens) = ctx.data_wr_pool.get_bulk(num_desc - 1) else {
            return ParseOutcome::Pending;
        };
        req.wr_tokens = tokens.len();
    }

    let io_unit = ctx.opts.io_unit_size;
    let num_buffers = lengths
        .iter()
        .map(|&l| l.div_ceil(io_unit) as usize)
        .sum::<usize>();
    let Some(bufs) = group.cache.get_bulk(num_buffers) else {
        release_wr_tokens(ctx, req);
        return ParseOutcome::Pending;
    };

    // Carve per-descriptor regions out of the pool buffers.
    let mut buf_iter = bufs.iter();
    for &len in &lengths {
        let mut remaining = len as usize;
        while remaining > 0 {
            let buf = buf_iter.next().expect("buffer budget miscounted");
            let take = remaining.min(io_unit as usize);
            req.iovs.push(SgEntry::new(buf.clone(), 0, take));
            remaining -= take;
        }
    }
    req.pooled = bufs;
    req.data_from_pool = true;
    req.iovpos = 0;
    req.offset = 0;
    req.length = 0;

    let mut all_wrs: Vec<SendWr> = Vec::with_capacity(num_desc);
    for (i, desc) in rsrc_caps.iter().enumerate() {
        if desc.dtype != crate::proto::sgl_type::KEYED_DATA_BLOCK
            || !matches!(
                desc.subtype,
                crate::proto::sgl_subtype::ADDRESS | crate::proto::sgl_subtype::INVALIDATE_KEY
            )
        {
            release_buffers(group, req);
            release_wr_tokens(ctx, req);
            req.iovs.clear();
            return ParseOutcome::Fail(sc::DATA_SGL_LENGTH_INVALID);
        }
        match fill_wr_sgl(ctx, req, lengths[i], 1) {
            Ok(mut wrs) => {
                update_remote_addr(&mut wrs, desc.address, desc.key);
                all_wrs.append(&mut wrs);
                req.length += desc.length;
            }
            Err(status) => {
                release_buffers(group, req);
                release_wr_tokens(ctx, req);
                req.iovs.clear();
                return ParseOutcome::Fail(status);
            }
        }
    }

    // The final descriptor may ask for its key to be invalidated with the
    // completion, when the device can do that.
    if let Some(last) = rsrc_caps.last() {
        if last.subtype == crate::proto::sgl_subtype::INVALIDATE_KEY
            && ctx
                .device
                .attr()
                .cap_flags
                .contains(crate::rdma::verbs::DeviceCapFlags::MEM_MGT_EXTENSIONS)
        {
            req.rsp_inval_rkey = Some(last.key);
        }
    }

    if let Some(dif) = req.dif.as_mut() {
        dif.orig_length = orig_total as u32;
        dif.elba_length = total_length as u32;
    }
    req.num_outstanding_data_wr = all_wrs.len() as u32;
    req.data_wrs = all_wrs;
    ParseOutcome::Filled
}

fn release_buffers(group: &mut GroupShared, req: &mut RdmaRequest) {
    for buf in req.pooled.drain(..) {
        group.cache.put(buf);
    }
    req.iovs.clear();
    req.data_from_pool = false;
}

fn release_wr_tokens(ctx: &TargetCtx, req: &mut RdmaRequest) {
    for _ in 0..req.wr_tokens {
        ctx.data_wr_pool.put(Default::default());
    }
    req.wr_tokens = 0;
}

/// Parse the command's single leading SGL descriptor into payload regions
/// and data work requests. Three wire forms are recognized; anything else
/// fails the request with an invalid-SGL-type status.
fn parse_sgl(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    core: &QpairCore,
    rsrc_caps: Option<Vec<SglDescriptor>>,
    capsule: Option<SgEntry>,
    req: &mut RdmaRequest,
) -> ParseOutcome {
    use crate::proto::{sgl_subtype, sgl_type};

    let sgl = req.cmd.sgl1;

    if sgl.dtype == sgl_type::KEYED_DATA_BLOCK
        && matches!(
            sgl.subtype,
            sgl_subtype::ADDRESS | sgl_subtype::INVALIDATE_KEY
        )
    {
        let mut length = sgl.length;
        if length > ctx.opts.max_io_size {
            warn!(
                length,
                max_io_size = ctx.opts.max_io_size,
                "SGL length exceeds max I/O size"
            );
            return ParseOutcome::Fail(sc::DATA_SGL_LENGTH_INVALID);
        }

        if sgl.subtype == sgl_subtype::INVALIDATE_KEY
            && ctx
                .device
                .attr()
                .cap_flags
                .contains(crate::rdma::verbs::DeviceCapFlags::MEM_MGT_EXTENSIONS)
        {
            req.rsp_inval_rkey = Some(sgl.key);
        }

        req.length = length;
        if let Some(dif) = req.dif.as_mut() {
            dif.orig_length = length;
            dif.elba_length = dif.ctx.length_with_md(length as usize) as u32;
            length = dif.elba_length;
        }

        let outcome = fill_iovs(ctx, group, req, length);
        if matches!(outcome, ParseOutcome::Pending) {
            debug!(req_idx = req.idx, "no large data buffers available, queueing request");
        }
        debug_assert!(req.iovs.len() <= core.max_send_sge as usize * MAX_SGL_DESCRIPTORS);
        outcome
    } else if sgl.dtype == sgl_type::DATA_BLOCK && sgl.subtype == sgl_subtype::OFFSET {
        // In-capsule data: the payload already arrived inside the
        // receive capsule.
        let offset = sgl.address;
        let max_len = ctx.opts.in_capsule_data_size as u64;
        if offset > max_len {
            warn!(offset, max_len, "in-capsule offset exceeds capsule length");
            return ParseOutcome::Fail(sc::INVALID_SGL_OFFSET);
        }
        if sgl.length as u64 > max_len - offset {
            warn!(
                length = sgl.length,
                remaining = max_len - offset,
                "in-capsule data length exceeds capsule length"
            );
            return ParseOutcome::Fail(sc::DATA_SGL_LENGTH_INVALID);
        }

        let capsule = capsule.expect("in-capsule parse without a capsule region");
        req.num_outstanding_data_wr = 0;
        req.data_from_pool = false;
        req.length = sgl.length;
        req.iovs.push(capsule);
        ParseOutcome::Filled
    } else if sgl.dtype == sgl_type::LAST_SEGMENT && sgl.subtype == sgl_subtype::OFFSET {
        let descs = rsrc_caps.expect("multi-SGL parse without descriptors");
        fill_iovs_multi_sgl(ctx, group, &descs, req)
    } else {
        error!(
            dtype = sgl.dtype,
            subtype = sgl.subtype,
            "invalid NVMe-oF I/O command SGL"
        );
        ParseOutcome::Fail(sc::SGL_DESCRIPTOR_TYPE_INVALID)
    }
}

/// Post the RDMA READ chain pulling write data from the host.
fn request_transfer_in(core: &mut QpairCore, req: &mut RdmaRequest) {
    debug_assert_eq!(req.xfer, XferDir::HostToController);
    let wrs = std::mem::take(&mut req.data_wrs);
    let n = wrs.len() as u32;
    debug_assert_eq!(n, req.num_outstanding_data_wr);
    core.queue_sends(wrs);
    core.current_read_depth += n as u16;
    core.current_send_depth += n;
}

/// Post the completion send, chaining any controller-to-host data in
/// front of it so the host observes the data before the completion.
/// Returns true when data was posted.
fn request_transfer_out(
    core: &mut QpairCore,
    rings: &crate::target::qpair::CapsuleRings,
    req: &mut RdmaRequest,
) -> bool {
    let sqhd = core.advance_sq_head();
    req.rsp.sqhd = sqhd;
    req.rsp.sqid = core.qid;
    req.rsp.cid = req.cmd.cid;

    // Recycle the receive capsule.
    if let Some(recv_idx) = req.recv_idx.take() {
        core.queue_recv(rings.recv_wr(recv_idx));
        debug_assert!(core.current_recv_depth > 0);
        core.current_recv_depth -= 1;
    }

    rings.write_cpl(req.idx, &req.rsp);
    let rsp_wr = SendWr {
        wr_id: pack_wr_id(WrKind::Send, req.idx),
        opcode: match req.rsp_inval_rkey {
            Some(_) => WrOpcode::SendWithInval,
            None => WrOpcode::Send,
        },
        sgl: vec![rings.cpl_sge(req.idx)],
        remote_addr: 0,
        rkey: req.rsp_inval_rkey.unwrap_or(0),
        signaled: true,
    };

    let mut data_posted = false;
    let mut num_data_wr = 0u32;
    let mut chain: Vec<SendWr>;
    if !req.rsp.status.is_success() {
        // On failure no data leaves the controller.
        req.num_outstanding_data_wr = 0;
        chain = vec![rsp_wr];
    } else if req.xfer == XferDir::ControllerToHost && !req.data_wrs.is_empty() {
        chain = std::mem::take(&mut req.data_wrs);
        num_data_wr = chain.len() as u32;
        chain.push(rsp_wr);
        data_posted = true;
    } else {
        req.num_outstanding_data_wr = 0;
        chain = vec![rsp_wr];
    }

    core.queue_sends(chain);
    core.current_send_depth += num_data_wr + 1;
    data_posted
}

/// Release a completed request back to the free queue, restoring buffers
/// and counters.
pub fn request_free(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    core: &mut QpairCore,
    rsrc: &mut Resources,
    req_idx: u16,
) {
    let req = &mut rsrc.reqs[req_idx as usize];
    if req.data_from_pool {
        for buf in req.pooled.drain(..) {
            group.cache.put(buf);
        }
    }
    for _ in 0..req.wr_tokens {
        ctx.data_wr_pool.put(Default::default());
    }
    let recv_idx = req.recv_idx.take();
    req.reset();
    req.state = RequestState::Free;

    // A record freed without a completion send still holds its capsule;
    // with a shared receive queue that capsule must go back to the SRQ or
    // the poller eventually starves.
    if core.srq.is_some() {
        if let Some(recv_idx) = recv_idx {
            core.queue_recv(rsrc.rings.recv_wr(recv_idx));
        }
    }

    core.qd = core.qd.saturating_sub(1);
    rsrc.free_queue.push_front(req_idx);
}

/// Hand a request to the block device (or resolve it internally for
/// admin commands the transport implements itself).
fn start_execution(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    core: &QpairCore,
    req: &mut RdmaRequest,
) {
    let qp_num = core.qp_num;
    let req_idx = req.idx;

    if core.qid == 0 {
        match req.cmd.opc {
            opc::ABORT => {
                // CDW10: SQID in the low half, CID in the high half.
                let sqid = (req.cmd.cdw10 & 0xFFFF) as u16;
                let cid = (req.cmd.cdw10 >> 16) as u16;
                group.pending_aborts.push(PendingAbort {
                    abort_qp: qp_num,
                    abort_req: req_idx,
                    target_sqid: sqid,
                    target_cid: cid,
                    deadline: Instant::now()
                        + std::time::Duration::from_secs(ctx.opts.abort_timeout_sec as u64),
                });
                return;
            }
            opc::ASYNC_EVENT_REQUEST => {
                // Held until an event fires or the queue pair goes away.
                return;
            }
            _ => {
                // Other admin commands complete without transport work.
                let _ = group.backend_tx.send(BackendCpl {
                    qp_num,
                    req_idx,
                    tag: 0,
                    status: NvmeStatus::success(),
                    cdw0: None,
                });
                return;
            }
        }
    }

    let io_type = match req.cmd.opc {
        opc::READ => IoType::Read,
        opc::WRITE => IoType::Write,
        opc::COMPARE => IoType::Compare,
        opc::COMPARE_AND_WRITE => IoType::CompareAndWrite,
        opc::WRITE_ZEROES => IoType::WriteZeroes,
        opc::DATASET_MANAGEMENT => IoType::Unmap,
        opc::FLUSH => IoType::Flush,
        opc::ZONE_MGMT_SEND => IoType::ZoneManagement,
        opc::ZONE_MGMT_RECV => IoType::ZoneReport,
        _ => {
            let _ = group.backend_tx.send(BackendCpl {
                qp_num,
                req_idx,
                tag: 0,
                status: NvmeStatus::generic(sc::INVALID_OPCODE),
                cdw0: None,
            });
            return;
        }
    };

    let lba = (req.cmd.cdw10 as u64) | ((req.cmd.cdw11 as u64) << 32);
    let num_blocks = match io_type {
        IoType::Read
        | IoType::Write
        | IoType::Compare
        | IoType::CompareAndWrite
        | IoType::WriteZeroes => (req.cmd.cdw12 as u64 & 0xFFFF) + 1,
        _ => 0,
    };

    req.backend_tag = ctx.next_backend_tag();
    let tag = req.backend_tag;
    let tx = group.backend_tx.clone();
    ctx.backend.submit(
        tag,
        IoRequest {
            io_type,
            lba,
            num_blocks,
            iovs: req.iovs.clone(),
        },
        Box::new(move |status| {
            let _ = tx.send(BackendCpl {
                qp_num,
                req_idx,
                tag,
                status,
                cdw0: None,
            });
        }),
    );
}

/// Drive one request through as many state transitions as it can make.
///
/// Returns true when the request changed state; false means it parked and
/// the caller should stop servicing the queue behind it.
pub fn request_process(
    ctx: &TargetCtx,
    group: &mut GroupShared,
    core: &mut QpairCore,
    rsrc: &mut Resources,
    req_idx: u16,
) -> bool {
    let mut progress = false;

    debug_assert!(rsrc.reqs[req_idx as usize].state != RequestState::Free);

    // A dying queue pair forces every request straight to completion so
    // its resources release.
    if core.is_broken() {
        let state = rsrc.reqs[req_idx as usize].state;
        match state {
            RequestState::NeedBuffer => {
                group
                    .pending_buf_queue
                    .retain(|&(q, r)| !(q == core.qp_num && r == req_idx));
            }
            RequestState::DataTransferToControllerPending => {
                core.pending_rdma_read_queue.retain(|&r| r != req_idx);
            }
            RequestState::DataTransferToHostPending => {
                core.pending_rdma_write_queue.retain(|&r| r != req_idx);
            }
            _ => {}
        }
        rsrc.reqs[req_idx as usize].state = RequestState::Completed;
    }

    loop {
        let prev_state = rsrc.reqs[req_idx as usize].state;
        debug!(req_idx, state = ?prev_state, "request entering state");

        match prev_state {
            RequestState::Free => {
                // Pairing with a receive kicks the record to NEW.
                break;
            }
            RequestState::New => {
                let recv_idx = rsrc.reqs[req_idx as usize]
                    .recv_idx
                    .expect("new request without a capsule");
                let cmd = rsrc.rings.recv_cmd(recv_idx);
                let receive_tick = rsrc.recvs[recv_idx as usize].receive_tick;
                let req = &mut rsrc.reqs[req_idx as usize];
                req.cmd = cmd;
                req.rsp = NvmeCpl::default();
                req.rsp.cid = req.cmd.cid;
                req.receive_tick = receive_tick;
                req.rsp_inval_rkey = None;

                if core.is_broken() {
                    req.state = RequestState::Completed;
                    continue;
                }

                req.dif = request_get_dif_state(ctx, &req.cmd);
                req.xfer = req.cmd.xfer();

                match req.xfer {
                    XferDir::Bidirectional => {
                        req.rsp.status = NvmeStatus::generic(sc::INVALID_OPCODE);
                        req.state = RequestState::ReadyToComplete;
                        debug!(req_idx, "invalid transfer type (bidirectional)");
                    }
                    XferDir::None => {
                        req.state = RequestState::ReadyToExecute;
                    }
                    _ => {
                        req.state = RequestState::NeedBuffer;
                        group.pending_buf_queue.push_back((core.qp_num, req_idx));
                    }
                }
            }
            RequestState::NeedBuffer => {
                debug_assert!(rsrc.reqs[req_idx as usize].xfer != XferDir::None);

                if group.pending_buf_queue.front() != Some(&(core.qp_num, req_idx)) {
                    // Wait in line for a buffer.
                    break;
                }

                // Pull what the parse needs from the arenas up front so the
                // record can be borrowed mutably below.
                let recv_idx = rsrc.reqs[req_idx as usize].recv_idx.unwrap();
                let sgl = rsrc.reqs[req_idx as usize].cmd.sgl1;
                let capsule;
                let descs;
                {
                    use crate::proto::{sgl_subtype, sgl_type};
                    capsule = if sgl.dtype == sgl_type::DATA_BLOCK
                        && sgl.subtype == sgl_subtype::OFFSET
                        && sgl.address <= ctx.opts.in_capsule_data_size as u64
                        && sgl.length as u64
                            <= ctx.opts.in_capsule_data_size as u64 - sgl.address
                    {
                        Some(rsrc.rings.capsule_entry(recv_idx, sgl.address as u32, sgl.length))
                    } else {
                        None
                    };
                    descs = if sgl.dtype == sgl_type::LAST_SEGMENT
                        && sgl.subtype == sgl_subtype::OFFSET
                    {
                        let count = (sgl.length as usize / SGL_DESC_SIZE)
                            .min(MAX_SGL_DESCRIPTORS);
                        Some(rsrc.rings.capsule_descriptors(recv_idx, sgl.address as u32, count))
                    } else {
                        None
                    };
                }

                let req = &mut rsrc.reqs[req_idx as usize];
                match parse_sgl(ctx, group, core, descs, capsule, req) {
                    ParseOutcome::Pending => {
                        group.stats.pending_data_buffer += 1;
                        break;
                    }
                    ParseOutcome::Fail(status) => {
                        group.pending_buf_queue.pop_front();
                        req.rsp.status = NvmeStatus::generic(status);
                        req.state = RequestState::ReadyToComplete;
                    }
                    ParseOutcome::Filled => {
                        group.pending_buf_queue.pop_front();
                        if req.xfer == XferDir::HostToController && req.data_from_pool {
                            req.state = RequestState::DataTransferToControllerPending;
                            core.pending_rdma_read_queue.push_back(req_idx);
                        } else {
                            req.state = RequestState::ReadyToExecute;
                        }
                    }
                }
            }
            RequestState::DataTransferToControllerPending => {
                if core.pending_rdma_read_queue.front() != Some(&req_idx) {
                    // Strict FIFO: wait in line to perform RDMA.
                    break;
                }
                let num_wr = rsrc.reqs[req_idx as usize].num_outstanding_data_wr;
                if core.current_send_depth + num_wr > core.max_send_depth
                    || core.current_read_depth as u32 + num_wr > core.max_read_depth as u32
                {
                    group.stats.pending_rdma_read += 1;
                    break;
                }
                core.pending_rdma_read_queue.pop_front();
                request_transfer_in(core, &mut rsrc.reqs[req_idx as usize]);
                rsrc.reqs[req_idx as usize].state =
                    RequestState::TransferringHostToController;
            }
            RequestState::TransferringHostToController => {
                // The RDMA READ completion advances this request.
                break;
            }
            RequestState::ReadyToExecute => {
                let req = &mut rsrc.reqs[req_idx as usize];
                if let Some(dif) = req.dif.clone() {
                    if req.xfer == XferDir::HostToController {
                        let num_blocks =
                            (dif.elba_length as usize).div_ceil(dif.ctx.block_size);
                        if dif::generate(&req.iovs, num_blocks, &dif.ctx).is_err() {
                            error!(req_idx, "protection information generation failed");
                            req.state = RequestState::Completed;
                            core.fail(crate::target::FailureReason::Local);
                            continue;
                        }
                    }
                    // The device sees extended blocks from here on.
                    req.length = dif.elba_length;
                }
                req.state = RequestState::Executing;
                start_execution(ctx, group, core, &mut rsrc.reqs[req_idx as usize]);
            }
            RequestState::Executing => {
                // The back end's completion advances this request.
                break;
            }
            RequestState::Executed => {
                let req = &mut rsrc.reqs[req_idx as usize];
                if req.rsp.status.is_success() && req.xfer == XferDir::ControllerToHost {
                    core.pending_rdma_write_queue.push_back(req_idx);
                    req.state = RequestState::DataTransferToHostPending;
                } else {
                    req.state = RequestState::ReadyToComplete;
                }
                if let Some(dif) = req.dif.clone() {
                    // The host only ever learns the raw data length.
                    req.length = dif.orig_length;
                    if req.xfer == XferDir::ControllerToHost {
                        let num_blocks =
                            (dif.elba_length as usize).div_ceil(dif.ctx.block_size);
                        if let Err(err) = dif::verify(&req.iovs, num_blocks, &dif.ctx) {
                            error!(
                                err_type = ?err.err_type,
                                err_offset = err.err_offset,
                                "protection information error detected"
                            );
                            req.rsp.status = NvmeStatus::media(dif_error_to_status(err.err_type));
                            req.state = RequestState::ReadyToComplete;
                            core.pending_rdma_write_queue.retain(|&r| r != req_idx);
                        }
                    }
                }
            }
            RequestState::DataTransferToHostPending => {
                if core.pending_rdma_write_queue.front() != Some(&req_idx) {
                    break;
                }
                let num_wr = rsrc.reqs[req_idx as usize].num_outstanding_data_wr;
                // The +1 accounts for the completion send chained behind
                // the data.
                if core.current_send_depth + num_wr + 1 > core.max_send_depth {
                    group.stats.pending_rdma_write += 1;
                    break;
                }
                core.pending_rdma_write_queue.pop_front();
                rsrc.reqs[req_idx as usize].state = RequestState::ReadyToComplete;
            }
            RequestState::ReadyToComplete => {
                let rings = &rsrc.rings;
                let req = &mut rsrc.reqs[req_idx as usize];
                let data_posted = request_transfer_out(core, rings, req);
                req.state = if data_posted {
                    RequestState::TransferringControllerToHost
                } else {
                    RequestState::Completing
                };
            }
            RequestState::TransferringControllerToHost | RequestState::Completing => {
                // The send completion advances this request.
                break;
            }
            RequestState::Completed => {
                if let Some(tick) = rsrc.reqs[req_idx as usize].receive_tick {
                    group.stats.request_latency_us += tick.elapsed().as_micros() as u64;
                }
                request_free(ctx, group, core, rsrc, req_idx);
                break;
            }
        }

        if rsrc.reqs[req_idx as usize].state != prev_state {
            progress = true;
        } else {
            break;
        }
    }

    progress
}
