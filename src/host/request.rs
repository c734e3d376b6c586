//! Initiator request records and payload builders.
//!
//! Every submitted command is described by one send work request with up
//! to two SGEs: the fixed NVMe command (plus an optional trailing
//! descriptor list) and, for inline-eligible payloads, the payload
//! itself. Which of the five builders runs depends on the payload shape
//! and whether in-capsule data is usable for the command.

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::proto::{
    NvmeCmd, NvmeCpl, SglDescriptor, XferDir, MAX_SGL_DESCRIPTORS, NVME_CMD_SIZE,
    PSDT_SGL_MPTR_CONTIG, SGL_DESC_SIZE, SGL_KEYED_MAX_LEN,
};
use crate::rdma::mem::MemMap;
use crate::rdma::verbs::Sge;
use crate::util::dma::DmaBuf;
use crate::util::sg::SgEntry;

/// Bytes reserved per command slot: the fixed command plus the largest
/// trailing descriptor list.
pub const CMD_SLOT_SIZE: usize = NVME_CMD_SIZE + MAX_SGL_DESCRIPTORS * SGL_DESC_SIZE;

/// The send side completed.
pub const SEND_COMPLETED: u8 = 1 << 0;
/// The matching response arrived.
pub const RECV_COMPLETED: u8 = 1 << 1;

/// Iterator contract over a scattered payload: `reset_sgl` seeks to a
/// byte offset, `next_sge` returns the next contiguous region.
pub trait SglPayload: Send {
    /// Seek to `offset` bytes into the payload.
    fn reset_sgl(&mut self, offset: usize);

    /// The next contiguous region as `(address, length)`.
    fn next_sge(&mut self) -> Result<(u64, u32)>;
}

/// [`SglPayload`] over a plain list of regions.
pub struct VecSglPayload {
    entries: Vec<SgEntry>,
    pos: usize,
    offset: usize,
}

impl VecSglPayload {
    /// Iterate over `entries`.
    pub fn new(entries: Vec<SgEntry>) -> Self {
        Self {
            entries,
            pos: 0,
            offset: 0,
        }
    }
}

impl SglPayload for VecSglPayload {
    fn reset_sgl(&mut self, mut offset: usize) {
        self.pos = 0;
        self.offset = 0;
        while self.pos < self.entries.len() && offset >= self.entries[self.pos].len() {
            offset -= self.entries[self.pos].len();
            self.pos += 1;
        }
        self.offset = offset;
    }

    fn next_sge(&mut self) -> Result<(u64, u32)> {
        let entry = self
            .entries
            .get(self.pos)
            .ok_or_else(|| Error::range("payload iterator exhausted"))?;
        let addr = entry.addr() + self.offset as u64;
        let len = (entry.len() - self.offset) as u32;
        self.pos += 1;
        self.offset = 0;
        Ok((addr, len))
    }
}

/// The payload of a submitted command.
pub enum Payload {
    /// No data
    None,
    /// One contiguous registered region
    Contig(SgEntry),
    /// A scattered payload walked through the iterator contract
    Sgl {
        /// Region iterator
        iter: Box<dyn SglPayload>,
        /// Total payload bytes
        size: u32,
    },
}

impl Payload {
    /// Total payload bytes.
    pub fn size(&self) -> u32 {
        match self {
            Payload::None => 0,
            Payload::Contig(entry) => entry.len() as u32,
            Payload::Sgl { size, .. } => *size,
        }
    }
}

/// Completion callback of a host request.
pub type HostCompletion = Box<dyn FnOnce(&NvmeCpl) + Send>;

/// A command submitted by the upper layer.
pub struct HostRequest {
    /// The command; the transport fills the cid and data pointer
    pub cmd: NvmeCmd,
    /// The payload
    pub payload: Payload,
    /// Fires when the response capsule arrives
    pub cb: Option<HostCompletion>,
}

/// Per-slot transport state of an in-flight request.
pub struct RdmaReq {
    /// Slot index; placed in the command cid
    pub id: u16,
    /// SEND/RECV completion pairing flags
    pub completion_flags: u8,
    /// Which response slot carried the matching completion
    pub rsp_idx: u16,
    /// The send SGEs: the command, and optionally the inline payload
    pub send_sgl: [Sge; 2],
    /// How many of `send_sgl` are live
    pub num_sge: usize,
    /// The caller's request while in flight
    pub req: Option<HostRequest>,
}

impl RdmaReq {
    /// An idle slot.
    pub fn new(id: u16) -> Self {
        Self {
            id,
            completion_flags: 0,
            rsp_idx: 0,
            send_sgl: [Sge::default(); 2],
            num_sge: 0,
            req: None,
        }
    }
}

/// Everything the builders need from the queue pair and controller.
pub struct BuildCtx<'a> {
    /// The registration map of the queue pair's protection domain
    pub mr_map: &'a MemMap,
    /// The command slot ring
    pub cmds: &'a DmaBuf,
    /// Local key of the command ring registration
    pub cmds_lkey: u32,
    /// The controller's SGL fan-out limit
    pub max_sges: usize,
    /// Bytes that may ride inline in a command capsule
    pub ioccsz_bytes: u32,
    /// In-capsule data offset advertised by the controller
    pub icdoff: u16,
}

impl BuildCtx<'_> {
    fn cmd_slot_addr(&self, id: u16) -> u64 {
        self.cmds.base() + (id as usize * CMD_SLOT_SIZE) as u64
    }

    fn store_cmd(&self, id: u16, cmd: &NvmeCmd) {
        self.cmds
            .write_at(id as usize * CMD_SLOT_SIZE, &cmd.to_bytes());
    }

    fn store_desc(&self, id: u16, n: usize, desc: &SglDescriptor) {
        self.cmds.write_at(
            id as usize * CMD_SLOT_SIZE + NVME_CMD_SIZE + n * SGL_DESC_SIZE,
            &desc.to_bytes(),
        );
    }
}

/// Build an SGL describing an empty payload.
fn build_null_request(bctx: &BuildCtx<'_>, rdma_req: &mut RdmaReq, cmd: &mut NvmeCmd) {
    cmd.psdt = PSDT_SGL_MPTR_CONTIG;
    cmd.sgl1 = SglDescriptor::keyed(0, 0, 0, crate::proto::sgl_subtype::ADDRESS);

    // Only the fixed command travels.
    rdma_req.send_sgl[0] = Sge {
        addr: bctx.cmd_slot_addr(rdma_req.id),
        length: NVME_CMD_SIZE as u32,
        lkey: bctx.cmds_lkey,
    };
    rdma_req.num_sge = 1;
}

/// Build a keyed SGL describing a contiguous payload.
fn build_contig_request(
    bctx: &BuildCtx<'_>,
    rdma_req: &mut RdmaReq,
    cmd: &mut NvmeCmd,
    payload: &SgEntry,
) -> Result<()> {
    let size = payload.len() as u64;
    if size > SGL_KEYED_MAX_LEN {
        return Err(Error::range("payload exceeds the 24-bit descriptor length"));
    }
    let translation = bctx.mr_map.translate(payload.addr(), payload.len())?;

    cmd.psdt = PSDT_SGL_MPTR_CONTIG;
    cmd.sgl1 = SglDescriptor::keyed(
        payload.addr(),
        size as u32,
        translation.rkey,
        crate::proto::sgl_subtype::ADDRESS,
    );

    rdma_req.send_sgl[0] = Sge {
        addr: bctx.cmd_slot_addr(rdma_req.id),
        length: NVME_CMD_SIZE as u32,
        lkey: bctx.cmds_lkey,
    };
    rdma_req.num_sge = 1;
    Ok(())
}

/// Build an inline SGL describing a contiguous payload carried in the
/// command capsule.
fn build_contig_inline_request(
    bctx: &BuildCtx<'_>,
    rdma_req: &mut RdmaReq,
    cmd: &mut NvmeCmd,
    payload: &SgEntry,
) -> Result<()> {
    let translation = bctx.mr_map.translate(payload.addr(), payload.len())?;

    cmd.psdt = PSDT_SGL_MPTR_CONTIG;
    // Inline is only offered when icdoff is zero, so the offset is zero.
    cmd.sgl1 = SglDescriptor::in_capsule(0, payload.len() as u32);

    rdma_req.send_sgl[0] = Sge {
        addr: bctx.cmd_slot_addr(rdma_req.id),
        length: NVME_CMD_SIZE as u32,
        lkey: bctx.cmds_lkey,
    };
    rdma_req.send_sgl[1] = Sge {
        addr: payload.addr(),
        length: payload.len() as u32,
        lkey: translation.lkey,
    };
    rdma_req.num_sge = 2;
    Ok(())
}

/// Build a keyed SGL (or descriptor list) over a scattered payload.
fn build_sgl_request(
    bctx: &BuildCtx<'_>,
    rdma_req: &mut RdmaReq,
    cmd: &mut NvmeCmd,
    iter: &mut dyn SglPayload,
    payload_size: u32,
) -> Result<()> {
    iter.reset_sgl(0);

    let mut descs: Vec<SglDescriptor> = Vec::new();
    let mut remaining = payload_size;
    while remaining > 0 {
        if descs.len() >= bctx.max_sges {
            error!(
                payload_size,
                max_sges = bctx.max_sges,
                "scattered payload needs more descriptors than the controller allows"
            );
            return Err(Error::invalid("payload exceeds the SGL fan-out limit"));
        }
        let (addr, len) = iter.next_sge()?;
        let len = len.min(remaining);
        if len as u64 > SGL_KEYED_MAX_LEN {
            return Err(Error::range("region exceeds the 24-bit descriptor length"));
        }
        let translation = bctx.mr_map.translate(addr, len as usize)?;
        descs.push(SglDescriptor::keyed(
            addr,
            len,
            translation.rkey,
            crate::proto::sgl_subtype::ADDRESS,
        ));
        remaining -= len;
    }

    cmd.psdt = PSDT_SGL_MPTR_CONTIG;
    rdma_req.num_sge = 1;

    if descs.len() == 1 {
        // A single descriptor collapses into the command itself.
        cmd.sgl1 = descs[0];
        rdma_req.send_sgl[0] = Sge {
            addr: bctx.cmd_slot_addr(rdma_req.id),
            length: NVME_CMD_SIZE as u32,
            lkey: bctx.cmds_lkey,
        };
    } else {
        // The descriptor list rides in the capsule tail behind the
        // command.
        for (i, desc) in descs.iter().enumerate() {
            bctx.store_desc(rdma_req.id, i, desc);
        }
        cmd.sgl1 = SglDescriptor::last_segment(descs.len());
        rdma_req.send_sgl[0] = Sge {
            addr: bctx.cmd_slot_addr(rdma_req.id),
            length: (NVME_CMD_SIZE + descs.len() * SGL_DESC_SIZE) as u32,
            lkey: bctx.cmds_lkey,
        };
    }
    Ok(())
}

/// Build an inline SGL over a scattered payload.
///
/// Inline applies iff the first region covers the whole payload
/// (`first_sge.len >= payload_size`); otherwise this falls back to the
/// keyed descriptor form.
fn build_sgl_inline_request(
    bctx: &BuildCtx<'_>,
    rdma_req: &mut RdmaReq,
    cmd: &mut NvmeCmd,
    iter: &mut dyn SglPayload,
    payload_size: u32,
) -> Result<()> {
    iter.reset_sgl(0);
    let (addr, len) = iter.next_sge()?;

    if len < payload_size {
        debug!("inline SGL request split across regions, sending keyed instead");
        return build_sgl_request(bctx, rdma_req, cmd, iter, payload_size);
    }
    let len = len.min(payload_size);

    let translation = bctx.mr_map.translate(addr, len as usize)?;

    cmd.psdt = PSDT_SGL_MPTR_CONTIG;
    cmd.sgl1 = SglDescriptor::in_capsule(0, payload_size);

    rdma_req.send_sgl[0] = Sge {
        addr: bctx.cmd_slot_addr(rdma_req.id),
        length: NVME_CMD_SIZE as u32,
        lkey: bctx.cmds_lkey,
    };
    rdma_req.send_sgl[1] = Sge {
        addr,
        length: len,
        lkey: translation.lkey,
    };
    rdma_req.num_sge = 2;
    Ok(())
}

/// Attach `req` to slot `rdma_req`: pick and run the right builder, then
/// store the finished command in the slot's capsule memory.
pub fn req_init(bctx: &BuildCtx<'_>, rdma_req: &mut RdmaReq, mut req: HostRequest) -> Result<()> {
    req.cmd.cid = rdma_req.id;

    let payload_size = req.payload.size();
    // Interop: a non-zero icdoff would shift the in-capsule payload, so
    // inline is only used against targets advertising zero.
    let icd_supported = req.cmd.xfer() == XferDir::HostToController
        && payload_size <= bctx.ioccsz_bytes
        && bctx.icdoff == 0;

    let rc = if payload_size == 0 {
        build_null_request(bctx, rdma_req, &mut req.cmd);
        Ok(())
    } else {
        match &mut req.payload {
            Payload::None => {
                build_null_request(bctx, rdma_req, &mut req.cmd);
                Ok(())
            }
            Payload::Contig(entry) => {
                let entry = entry.clone();
                if icd_supported {
                    build_contig_inline_request(bctx, rdma_req, &mut req.cmd, &entry)
                } else {
                    build_contig_request(bctx, rdma_req, &mut req.cmd, &entry)
                }
            }
            Payload::Sgl { iter, .. } => {
                if icd_supported {
                    build_sgl_inline_request(bctx, rdma_req, &mut req.cmd, iter.as_mut(), payload_size)
                } else {
                    build_sgl_request(bctx, rdma_req, &mut req.cmd, iter.as_mut(), payload_size)
                }
            }
        }
    };
    rc?;

    bctx.store_cmd(rdma_req.id, &req.cmd);
    rdma_req.completion_flags = 0;
    rdma_req.req = Some(req);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{opc, sgl_subtype, sgl_type};
    use crate::rdma::verbs::{Device, DeviceAttr};

    struct Harness {
        _device: Device,
        map: MemMap,
        cmds: DmaBuf,
    }

    impl Harness {
        fn new() -> Self {
            let device = Device::new("hreq0", DeviceAttr::default());
            let pd = device.alloc_pd();
            let map = MemMap::for_pd(&pd, None);
            let cmds = DmaBuf::alloc(4 * CMD_SLOT_SIZE);
            Self {
                _device: device,
                map,
                cmds,
            }
        }

        fn bctx(&self) -> BuildCtx<'_> {
            BuildCtx {
                mr_map: &self.map,
                cmds: &self.cmds,
                cmds_lkey: 1,
                max_sges: MAX_SGL_DESCRIPTORS,
                ioccsz_bytes: 4096,
                icdoff: 0,
            }
        }

        fn registered(&self, len: usize) -> SgEntry {
            let buf = DmaBuf::alloc(len);
            self.map.register(&buf).unwrap();
            SgEntry::whole(buf)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.map.release();
        }
    }

    fn write_req(payload: Payload) -> HostRequest {
        HostRequest {
            cmd: NvmeCmd {
                opc: opc::WRITE,
                nsid: 1,
                ..Default::default()
            },
            payload,
            cb: None,
        }
    }

    fn read_req(payload: Payload) -> HostRequest {
        HostRequest {
            cmd: NvmeCmd {
                opc: opc::READ,
                nsid: 1,
                ..Default::default()
            },
            payload,
            cb: None,
        }
    }

    #[test]
    fn test_null_request() {
        let h = Harness::new();
        let mut slot = RdmaReq::new(0);
        req_init(&h.bctx(), &mut slot, write_req(Payload::None)).unwrap();
        let req = slot.req.as_ref().unwrap();
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::KEYED_DATA_BLOCK);
        assert_eq!(req.cmd.sgl1.length, 0);
        assert_eq!(req.cmd.sgl1.key, 0);
        assert_eq!(req.cmd.sgl1.address, 0);
        assert_eq!(slot.num_sge, 1);
        assert_eq!(slot.send_sgl[0].length, NVME_CMD_SIZE as u32);
    }

    #[test]
    fn test_contig_inline_for_h2c() {
        let h = Harness::new();
        let payload = h.registered(512);
        let mut slot = RdmaReq::new(1);
        req_init(&h.bctx(), &mut slot, write_req(Payload::Contig(payload.clone()))).unwrap();
        let req = slot.req.as_ref().unwrap();
        // Writes small enough for the capsule go inline: unkeyed SGL with
        // the offset subtype and a two-SGE send.
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::DATA_BLOCK);
        assert_eq!(req.cmd.sgl1.subtype, sgl_subtype::OFFSET);
        assert_eq!(req.cmd.sgl1.length, 512);
        assert_eq!(req.cmd.sgl1.address, 0);
        assert_eq!(slot.num_sge, 2);
        assert_eq!(slot.send_sgl[1].addr, payload.addr());
        assert_eq!(slot.send_sgl[1].length, 512);
    }

    #[test]
    fn test_contig_keyed_for_c2h() {
        let h = Harness::new();
        let payload = h.registered(8192);
        let mut slot = RdmaReq::new(2);
        req_init(&h.bctx(), &mut slot, read_req(Payload::Contig(payload.clone()))).unwrap();
        let req = slot.req.as_ref().unwrap();
        // Reads never go inline.
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::KEYED_DATA_BLOCK);
        assert_eq!(req.cmd.sgl1.subtype, sgl_subtype::ADDRESS);
        assert_eq!(req.cmd.sgl1.address, payload.addr());
        assert_eq!(req.cmd.sgl1.length, 8192);
        assert_ne!(req.cmd.sgl1.key, 0);
        assert_eq!(slot.num_sge, 1);
    }

    #[test]
    fn test_large_write_not_inline() {
        let h = Harness::new();
        let payload = h.registered(8192);
        let mut slot = RdmaReq::new(3);
        req_init(&h.bctx(), &mut slot, write_req(Payload::Contig(payload))).unwrap();
        let req = slot.req.as_ref().unwrap();
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::KEYED_DATA_BLOCK);
        assert_eq!(slot.num_sge, 1);
    }

    #[test]
    fn test_sgl_single_descriptor_collapses() {
        let h = Harness::new();
        let entry = h.registered(4096);
        let iter = VecSglPayload::new(vec![entry.clone()]);
        let mut slot = RdmaReq::new(0);
        req_init(
            &h.bctx(),
            &mut slot,
            read_req(Payload::Sgl {
                iter: Box::new(iter),
                size: 4096,
            }),
        )
        .unwrap();
        let req = slot.req.as_ref().unwrap();
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::KEYED_DATA_BLOCK);
        assert_eq!(req.cmd.sgl1.address, entry.addr());
        assert_eq!(slot.send_sgl[0].length, NVME_CMD_SIZE as u32);
    }

    #[test]
    fn test_sgl_multi_descriptor_last_segment() {
        let h = Harness::new();
        let a = h.registered(4096);
        let b = h.registered(4096);
        let iter = VecSglPayload::new(vec![a.clone(), b.clone()]);
        let mut slot = RdmaReq::new(1);
        req_init(
            &h.bctx(),
            &mut slot,
            read_req(Payload::Sgl {
                iter: Box::new(iter),
                size: 8192,
            }),
        )
        .unwrap();
        let req = slot.req.as_ref().unwrap();
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::LAST_SEGMENT);
        assert_eq!(req.cmd.sgl1.subtype, sgl_subtype::OFFSET);
        assert_eq!(req.cmd.sgl1.length, 2 * SGL_DESC_SIZE as u32);
        // The send covers the command plus the descriptor list.
        assert_eq!(
            slot.send_sgl[0].length,
            (NVME_CMD_SIZE + 2 * SGL_DESC_SIZE) as u32
        );

        // The descriptors landed behind the command in the slot.
        let mut raw = [0u8; SGL_DESC_SIZE];
        h.cmds.read_at(CMD_SLOT_SIZE + NVME_CMD_SIZE, &mut raw);
        let desc0 = SglDescriptor::from_bytes(&raw);
        assert_eq!(desc0.address, a.addr());
        assert_eq!(desc0.length, 4096);
        h.cmds
            .read_at(CMD_SLOT_SIZE + NVME_CMD_SIZE + SGL_DESC_SIZE, &mut raw);
        let desc1 = SglDescriptor::from_bytes(&raw);
        assert_eq!(desc1.address, b.addr());
    }

    #[test]
    fn test_sgl_inline_first_sge_covers_payload() {
        let h = Harness::new();
        let a = h.registered(4096);
        let b = h.registered(4096);
        // First region equals the payload: inline applies, later regions
        // are ignored.
        let iter = VecSglPayload::new(vec![a.clone(), b]);
        let mut slot = RdmaReq::new(2);
        req_init(
            &h.bctx(),
            &mut slot,
            write_req(Payload::Sgl {
                iter: Box::new(iter),
                size: 4096,
            }),
        )
        .unwrap();
        let req = slot.req.as_ref().unwrap();
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::DATA_BLOCK);
        assert_eq!(slot.num_sge, 2);
        assert_eq!(slot.send_sgl[1].addr, a.addr());
    }

    #[test]
    fn test_sgl_inline_falls_back_when_first_sge_short() {
        let h = Harness::new();
        let a = h.registered(1024);
        let b = h.registered(3072);
        let iter = VecSglPayload::new(vec![a, b]);
        let mut slot = RdmaReq::new(3);
        req_init(
            &h.bctx(),
            &mut slot,
            write_req(Payload::Sgl {
                iter: Box::new(iter),
                size: 4096,
            }),
        )
        .unwrap();
        let req = slot.req.as_ref().unwrap();
        // Fell back to the keyed descriptor-list form.
        assert_eq!(req.cmd.sgl1.dtype, sgl_type::LAST_SEGMENT);
        assert_eq!(slot.num_sge, 1);
    }

    #[test]
    fn test_unregistered_payload_rejected() {
        let h = Harness::new();
        let unregistered = SgEntry::whole(DmaBuf::alloc(512));
        let mut slot = RdmaReq::new(0);
        let err = req_init(
            &h.bctx(),
            &mut slot,
            read_req(Payload::Contig(unregistered)),
        )
        .unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::NotFound);
    }

    #[test]
    fn test_cid_equals_slot_index() {
        let h = Harness::new();
        let mut slot = RdmaReq::new(3);
        req_init(&h.bctx(), &mut slot, write_req(Payload::None)).unwrap();
        assert_eq!(slot.req.as_ref().unwrap().cmd.cid, 3);
    }
}
