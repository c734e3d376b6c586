//! NVMe and NVMe-oF wire schema.
//!
//! Byte-exact encodings consumed as-is by the transport: the 64-byte
//! command capsule header, the 16-byte completion, the 16-byte SGL
//! descriptor, and the private data blocks carried inside RDMA CONNECT
//! messages. Everything on the wire is little-endian except the
//! protection-information tuple, which the DIF engine stores big-endian.

use crate::error::{Error, Result};

/// Size of an NVMe command on the wire.
pub const NVME_CMD_SIZE: usize = 64;
/// Size of an NVMe completion on the wire.
pub const NVME_CPL_SIZE: usize = 16;
/// Size of one SGL descriptor on the wire.
pub const SGL_DESC_SIZE: usize = 16;
/// Largest SGL fan-out advertised by the target (MSDBD).
pub const MAX_SGL_DESCRIPTORS: usize = 16;

/// NVMe opcodes handled by the transport and its back-end.
pub mod opc {
    /// Flush
    pub const FLUSH: u8 = 0x00;
    /// Write
    pub const WRITE: u8 = 0x01;
    /// Read
    pub const READ: u8 = 0x02;
    /// Compare
    pub const COMPARE: u8 = 0x05;
    /// Write Zeroes
    pub const WRITE_ZEROES: u8 = 0x08;
    /// Dataset Management (unmap)
    pub const DATASET_MANAGEMENT: u8 = 0x09;
    /// Compare and Write (fused emulation)
    pub const COMPARE_AND_WRITE: u8 = 0x0E;
    /// Zone Management Send
    pub const ZONE_MGMT_SEND: u8 = 0x79;
    /// Zone Management Receive
    pub const ZONE_MGMT_RECV: u8 = 0x7A;
    /// Admin: Abort
    pub const ABORT: u8 = 0x08;
    /// Admin: Async Event Request
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0C;
}

/// Status code types.
pub mod sct {
    /// Generic command status
    pub const GENERIC: u8 = 0x0;
    /// Command-specific status
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    /// Media and data-integrity errors
    pub const MEDIA_ERROR: u8 = 0x2;
}

/// Generic and media status codes used by the transport.
pub mod sc {
    /// Successful completion
    pub const SUCCESS: u8 = 0x00;
    /// Invalid opcode (also used for bidirectional transfers)
    pub const INVALID_OPCODE: u8 = 0x01;
    /// Invalid field in command
    pub const INVALID_FIELD: u8 = 0x02;
    /// Internal device error (post failures after buffers were taken)
    pub const INTERNAL_DEVICE_ERROR: u8 = 0x06;
    /// Command aborted per abort request
    pub const ABORTED_BY_REQUEST: u8 = 0x07;
    /// Command aborted because the submission queue was deleted
    pub const ABORTED_SQ_DELETION: u8 = 0x08;
    /// Data SGL length invalid
    pub const DATA_SGL_LENGTH_INVALID: u8 = 0x0D;
    /// SGL descriptor type invalid
    pub const SGL_DESCRIPTOR_TYPE_INVALID: u8 = 0x0F;
    /// Invalid offset in an in-capsule SGL
    pub const INVALID_SGL_OFFSET: u8 = 0x16;
    /// Guard check error (media, PI)
    pub const GUARD_CHECK_ERROR: u8 = 0x82;
    /// Application tag check error (media, PI)
    pub const APPLICATION_TAG_CHECK_ERROR: u8 = 0x83;
    /// Reference tag check error (media, PI)
    pub const REFERENCE_TAG_CHECK_ERROR: u8 = 0x84;
}

/// Data transfer direction encoded in the low opcode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    /// No data transfer
    None,
    /// Host to controller (write-like)
    HostToController,
    /// Controller to host (read-like)
    ControllerToHost,
    /// Bidirectional (not supported by this transport)
    Bidirectional,
}

impl XferDir {
    /// Classify an opcode.
    pub fn from_opc(opc: u8) -> Self {
        match opc & 0x3 {
            0 => XferDir::None,
            1 => XferDir::HostToController,
            2 => XferDir::ControllerToHost,
            _ => XferDir::Bidirectional,
        }
    }
}

/// SGL descriptor types.
pub mod sgl_type {
    /// Unkeyed data block
    pub const DATA_BLOCK: u8 = 0x0;
    /// Last segment of a descriptor list
    pub const LAST_SEGMENT: u8 = 0x3;
    /// Keyed data block
    pub const KEYED_DATA_BLOCK: u8 = 0x4;
}

/// SGL descriptor subtypes.
pub mod sgl_subtype {
    /// Address subtype
    pub const ADDRESS: u8 = 0x0;
    /// Offset subtype (in-capsule data)
    pub const OFFSET: u8 = 0x1;
    /// Keyed address whose remote key should be invalidated on completion
    pub const INVALIDATE_KEY: u8 = 0xF;
}

/// Largest length representable in a keyed descriptor (24 bits).
pub const SGL_KEYED_MAX_LEN: u64 = (1 << 24) - 1;

/// A 16-byte NVMe SGL descriptor.
///
/// Keyed descriptors carry a 24-bit length and a 32-bit key; unkeyed
/// descriptors carry a 32-bit length. The address field doubles as the
/// in-capsule offset for the OFFSET subtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SglDescriptor {
    /// Remote address or in-capsule offset
    pub address: u64,
    /// Payload length in bytes
    pub length: u32,
    /// Remote key (keyed descriptors only)
    pub key: u32,
    /// Descriptor type
    pub dtype: u8,
    /// Descriptor subtype
    pub subtype: u8,
}

impl SglDescriptor {
    /// A keyed data-block descriptor.
    pub fn keyed(address: u64, length: u32, key: u32, subtype: u8) -> Self {
        Self {
            address,
            length,
            key,
            dtype: sgl_type::KEYED_DATA_BLOCK,
            subtype,
        }
    }

    /// An unkeyed data-block descriptor with the OFFSET subtype.
    pub fn in_capsule(offset: u64, length: u32) -> Self {
        Self {
            address: offset,
            length,
            key: 0,
            dtype: sgl_type::DATA_BLOCK,
            subtype: sgl_subtype::OFFSET,
        }
    }

    /// A last-segment descriptor referencing `count` keyed descriptors in
    /// the capsule tail.
    pub fn last_segment(count: usize) -> Self {
        Self {
            address: 0,
            length: (count * SGL_DESC_SIZE) as u32,
            key: 0,
            dtype: sgl_type::LAST_SEGMENT,
            subtype: sgl_subtype::OFFSET,
        }
    }

    /// Encode into the 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; SGL_DESC_SIZE] {
        let mut out = [0u8; SGL_DESC_SIZE];
        out[0..8].copy_from_slice(&self.address.to_le_bytes());
        if self.dtype == sgl_type::KEYED_DATA_BLOCK {
            let len = self.length.to_le_bytes();
            out[8..11].copy_from_slice(&len[0..3]);
            out[11..15].copy_from_slice(&self.key.to_le_bytes());
        } else {
            out[8..12].copy_from_slice(&self.length.to_le_bytes());
        }
        out[15] = (self.dtype << 4) | (self.subtype & 0xF);
        out
    }

    /// Decode from the 16-byte wire form.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let dtype = raw[15] >> 4;
        let subtype = raw[15] & 0xF;
        let address = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let (length, key) = if dtype == sgl_type::KEYED_DATA_BLOCK {
            (
                u32::from_le_bytes([raw[8], raw[9], raw[10], 0]),
                u32::from_le_bytes(raw[11..15].try_into().unwrap()),
            )
        } else {
            (u32::from_le_bytes(raw[8..12].try_into().unwrap()), 0)
        };
        Self {
            address,
            length,
            key,
            dtype,
            subtype,
        }
    }
}

/// PSDT value selecting SGL addressing for the data pointer.
pub const PSDT_SGL_MPTR_CONTIG: u8 = 0x1;

/// A 64-byte NVMe command as carried in a command capsule.
#[derive(Debug, Clone, Default)]
pub struct NvmeCmd {
    /// Opcode
    pub opc: u8,
    /// Fused operation bits
    pub fuse: u8,
    /// PRP or SGL data transfer selector
    pub psdt: u8,
    /// Command identifier
    pub cid: u16,
    /// Namespace identifier
    pub nsid: u32,
    /// Metadata pointer
    pub mptr: u64,
    /// The single leading SGL descriptor in the data pointer
    pub sgl1: SglDescriptor,
    /// Command dwords 10 through 15
    pub cdw10: u32,
    /// Command dword 11
    pub cdw11: u32,
    /// Command dword 12
    pub cdw12: u32,
    /// Command dword 13
    pub cdw13: u32,
    /// Command dword 14
    pub cdw14: u32,
    /// Command dword 15
    pub cdw15: u32,
}

impl NvmeCmd {
    /// Encode into the 64-byte wire form.
    pub fn to_bytes(&self) -> [u8; NVME_CMD_SIZE] {
        let mut out = [0u8; NVME_CMD_SIZE];
        let cdw0 = (self.opc as u32)
            | ((self.fuse as u32 & 0x3) << 8)
            | ((self.psdt as u32 & 0x3) << 14)
            | ((self.cid as u32) << 16);
        out[0..4].copy_from_slice(&cdw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        out[24..40].copy_from_slice(&self.sgl1.to_bytes());
        out[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        out[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        out[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        out[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        out[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        out[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        out
    }

    /// Decode from the 64-byte wire form.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let cdw0 = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        Self {
            opc: (cdw0 & 0xFF) as u8,
            fuse: ((cdw0 >> 8) & 0x3) as u8,
            psdt: ((cdw0 >> 14) & 0x3) as u8,
            cid: (cdw0 >> 16) as u16,
            nsid: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            mptr: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            sgl1: SglDescriptor::from_bytes(&raw[24..40]),
            cdw10: u32::from_le_bytes(raw[40..44].try_into().unwrap()),
            cdw11: u32::from_le_bytes(raw[44..48].try_into().unwrap()),
            cdw12: u32::from_le_bytes(raw[48..52].try_into().unwrap()),
            cdw13: u32::from_le_bytes(raw[52..56].try_into().unwrap()),
            cdw14: u32::from_le_bytes(raw[56..60].try_into().unwrap()),
            cdw15: u32::from_le_bytes(raw[60..64].try_into().unwrap()),
        }
    }

    /// Data transfer direction of this command.
    pub fn xfer(&self) -> XferDir {
        XferDir::from_opc(self.opc)
    }
}

/// Completion status: code type, code, and the do-not-retry bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeStatus {
    /// Status code type
    pub sct: u8,
    /// Status code
    pub sc: u8,
    /// Do not retry
    pub dnr: bool,
}

impl NvmeStatus {
    /// Successful generic status.
    pub fn success() -> Self {
        Self::default()
    }

    /// A generic-type status with the given code.
    pub fn generic(sc: u8) -> Self {
        Self {
            sct: sct::GENERIC,
            sc,
            dnr: false,
        }
    }

    /// A media-error status with the given code.
    pub fn media(sc: u8) -> Self {
        Self {
            sct: sct::MEDIA_ERROR,
            sc,
            dnr: false,
        }
    }

    /// Whether this is a successful completion.
    pub fn is_success(&self) -> bool {
        self.sct == sct::GENERIC && self.sc == sc::SUCCESS
    }
}

/// A 16-byte NVMe completion as carried in a response capsule.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeCpl {
    /// Command-specific result
    pub cdw0: u32,
    /// Submission queue head pointer
    pub sqhd: u16,
    /// Submission queue identifier
    pub sqid: u16,
    /// Command identifier being completed
    pub cid: u16,
    /// Completion status
    pub status: NvmeStatus,
}

impl NvmeCpl {
    /// Encode into the 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; NVME_CPL_SIZE] {
        let mut out = [0u8; NVME_CPL_SIZE];
        out[0..4].copy_from_slice(&self.cdw0.to_le_bytes());
        out[8..10].copy_from_slice(&self.sqhd.to_le_bytes());
        out[10..12].copy_from_slice(&self.sqid.to_le_bytes());
        out[12..14].copy_from_slice(&self.cid.to_le_bytes());
        let status: u16 = ((self.status.sc as u16) << 1)
            | ((self.status.sct as u16) << 9)
            | ((self.status.dnr as u16) << 15);
        out[14..16].copy_from_slice(&status.to_le_bytes());
        out
    }

    /// Decode from the 16-byte wire form.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let status = u16::from_le_bytes(raw[14..16].try_into().unwrap());
        Self {
            cdw0: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            sqhd: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
            sqid: u16::from_le_bytes(raw[10..12].try_into().unwrap()),
            cid: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            status: NvmeStatus {
                sc: ((status >> 1) & 0xFF) as u8,
                sct: ((status >> 9) & 0x7) as u8,
                dnr: status & 0x8000 != 0,
            },
        }
    }
}

/// Reject status codes carried in the CONNECT reject private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectStatus {
    /// The private data block was missing or too short
    InvalidPrivateDataLength = 0x1,
    /// The record format was not zero
    InvalidRecfmt = 0x2,
    /// The queue identifier was unacceptable
    InvalidQid = 0x3,
    /// The host send queue size was unacceptable
    InvalidHsqsize = 0x4,
    /// The host receive queue size was unacceptable
    InvalidHrqsize = 0x5,
    /// The target is out of resources
    NoResources = 0x6,
    /// Inbound RDMA read resources unacceptable
    InvalidIrd = 0x7,
    /// Outbound RDMA read resources unacceptable
    InvalidOrd = 0x8,
    /// Partition key mismatch
    InvalidPkey = 0x9,
    /// The queue pair type was unacceptable
    InvalidQType = 0xA,
    /// The controller identifier was unacceptable
    InvalidCntlid = 0xB,
}

/// Size of the CONNECT request private data block.
pub const CONNECT_REQUEST_DATA_SIZE: usize = 32;
/// Size of the CONNECT accept private data block.
pub const CONNECT_ACCEPT_DATA_SIZE: usize = 32;
/// Size of the CONNECT reject private data block.
pub const CONNECT_REJECT_DATA_SIZE: usize = 4;

/// Private data of an RDMA CONNECT request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectRequestData {
    /// Record format, must be zero
    pub recfmt: u16,
    /// Queue identifier (0 = admin)
    pub qid: u16,
    /// Host receive queue size
    pub hrqsize: u16,
    /// Host send queue size (zero-based)
    pub hsqsize: u16,
    /// Controller id the host believes it is talking to
    pub cntlid: u16,
}

impl ConnectRequestData {
    /// Encode into the 32-byte wire form.
    pub fn to_bytes(&self) -> [u8; CONNECT_REQUEST_DATA_SIZE] {
        let mut out = [0u8; CONNECT_REQUEST_DATA_SIZE];
        out[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        out[2..4].copy_from_slice(&self.qid.to_le_bytes());
        out[4..6].copy_from_slice(&self.hrqsize.to_le_bytes());
        out[6..8].copy_from_slice(&self.hsqsize.to_le_bytes());
        out[8..10].copy_from_slice(&self.cntlid.to_le_bytes());
        out
    }

    /// Decode, failing if the block is too short.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < CONNECT_REQUEST_DATA_SIZE {
            return Err(Error::bad_msg(format!(
                "connect private data too short: {} bytes",
                raw.len()
            )));
        }
        Ok(Self {
            recfmt: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            qid: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            hrqsize: u16::from_le_bytes(raw[4..6].try_into().unwrap()),
            hsqsize: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
            cntlid: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
        })
    }
}

/// Private data of an RDMA CONNECT accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectAcceptData {
    /// Record format, must be zero
    pub recfmt: u16,
    /// Controller receive queue size granted to the host
    pub crqsize: u16,
}

impl ConnectAcceptData {
    /// Encode into the 32-byte wire form.
    pub fn to_bytes(&self) -> [u8; CONNECT_ACCEPT_DATA_SIZE] {
        let mut out = [0u8; CONNECT_ACCEPT_DATA_SIZE];
        out[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        out[2..4].copy_from_slice(&self.crqsize.to_le_bytes());
        out
    }

    /// Decode, failing if the block is too short.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::bad_msg("accept private data too short"));
        }
        Ok(Self {
            recfmt: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            crqsize: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
        })
    }
}

/// Private data of an RDMA CONNECT reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRejectData {
    /// Record format, must be zero
    pub recfmt: u16,
    /// Reject status
    pub sts: u16,
}

impl ConnectRejectData {
    /// Build a reject block for `status`.
    pub fn new(status: RejectStatus) -> Self {
        Self {
            recfmt: 0,
            sts: status as u16,
        }
    }

    /// Encode into the 4-byte wire form.
    pub fn to_bytes(&self) -> [u8; CONNECT_REJECT_DATA_SIZE] {
        let mut out = [0u8; CONNECT_REJECT_DATA_SIZE];
        out[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        out[2..4].copy_from_slice(&self.sts.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xfer_classification() {
        assert_eq!(XferDir::from_opc(opc::WRITE), XferDir::HostToController);
        assert_eq!(XferDir::from_opc(opc::READ), XferDir::ControllerToHost);
        assert_eq!(XferDir::from_opc(opc::FLUSH), XferDir::None);
        assert_eq!(XferDir::from_opc(0x03), XferDir::Bidirectional);
    }

    #[test]
    fn test_keyed_sgl_roundtrip() {
        let desc = SglDescriptor::keyed(0x10000, 65536, 0xABCD, sgl_subtype::ADDRESS);
        let decoded = SglDescriptor::from_bytes(&desc.to_bytes());
        assert_eq!(decoded, desc);
        assert_eq!(decoded.dtype, sgl_type::KEYED_DATA_BLOCK);
    }

    #[test]
    fn test_keyed_sgl_length_is_24_bit() {
        let desc = SglDescriptor::keyed(0, 0x00FF_FFFF, 0x1, sgl_subtype::ADDRESS);
        let decoded = SglDescriptor::from_bytes(&desc.to_bytes());
        assert_eq!(decoded.length, 0x00FF_FFFF);
    }

    #[test]
    fn test_cmd_roundtrip() {
        let cmd = NvmeCmd {
            opc: opc::WRITE,
            fuse: 0,
            psdt: PSDT_SGL_MPTR_CONTIG,
            cid: 0x42,
            nsid: 1,
            mptr: 0,
            sgl1: SglDescriptor::in_capsule(0, 4096),
            cdw10: 0x1234_5678,
            cdw11: 0,
            cdw12: 7,
            cdw13: 0,
            cdw14: 0xDEAD_BEEF,
            cdw15: 0,
        };
        let decoded = NvmeCmd::from_bytes(&cmd.to_bytes());
        assert_eq!(decoded.opc, opc::WRITE);
        assert_eq!(decoded.cid, 0x42);
        assert_eq!(decoded.psdt, PSDT_SGL_MPTR_CONTIG);
        assert_eq!(decoded.sgl1, cmd.sgl1);
        assert_eq!(decoded.cdw14, 0xDEAD_BEEF);
    }

    #[test]
    fn test_cpl_roundtrip() {
        let cpl = NvmeCpl {
            cdw0: 1,
            sqhd: 12,
            sqid: 3,
            cid: 9,
            status: NvmeStatus {
                sct: sct::MEDIA_ERROR,
                sc: sc::GUARD_CHECK_ERROR,
                dnr: true,
            },
        };
        let decoded = NvmeCpl::from_bytes(&cpl.to_bytes());
        assert_eq!(decoded.cid, 9);
        assert_eq!(decoded.status.sct, sct::MEDIA_ERROR);
        assert_eq!(decoded.status.sc, sc::GUARD_CHECK_ERROR);
        assert!(decoded.status.dnr);
        assert!(!decoded.status.is_success());
    }

    #[test]
    fn test_connect_private_data_roundtrip() {
        let req = ConnectRequestData {
            recfmt: 0,
            qid: 1,
            hrqsize: 128,
            hsqsize: 127,
            cntlid: 0xFFFF,
        };
        let decoded = ConnectRequestData::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);
        assert!(ConnectRequestData::from_bytes(&[0u8; 8]).is_err());

        let acc = ConnectAcceptData {
            recfmt: 0,
            crqsize: 64,
        };
        assert_eq!(ConnectAcceptData::from_bytes(&acc.to_bytes()).unwrap(), acc);
    }
}
