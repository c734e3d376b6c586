//! Block-device back end consumed by the target request machine.
//!
//! The transport drives a narrow device surface: geometry queries,
//! protection-information description, asynchronous submit with a
//! completion callback, and an abort entry point. [`MemDisk`] is the
//! RAM-backed implementation used by the integration suites; it is
//! extended-LBA aware and can defer completions so tests can hold
//! requests in the executing state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::proto::{sc, sct, NvmeStatus};
use crate::util::dif::{DifFlags, DifType};
use crate::util::sg::{SgCursor, SgEntry};

/// Media-error status code for a failed compare.
pub const SC_COMPARE_FAILURE: u8 = 0x85;

/// The operations a transport submits to a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Read blocks
    Read,
    /// Write blocks
    Write,
    /// Deallocate a block range
    Unmap,
    /// Flush the volatile cache
    Flush,
    /// Reset the device
    Reset,
    /// Compare blocks against the payload
    Compare,
    /// Fused compare-and-write
    CompareAndWrite,
    /// Write zeroes without a payload
    WriteZeroes,
    /// Report zones
    ZoneReport,
    /// Zone management
    ZoneManagement,
    /// Raw NVMe passthrough
    NvmePassthrough,
}

/// One submitted block-device operation.
pub struct IoRequest {
    /// Operation
    pub io_type: IoType,
    /// First logical block
    pub lba: u64,
    /// Number of logical blocks
    pub num_blocks: u64,
    /// Payload regions, extended-LBA when metadata is interleaved
    pub iovs: Vec<SgEntry>,
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("io_type", &self.io_type)
            .field("lba", &self.lba)
            .field("num_blocks", &self.num_blocks)
            .finish()
    }
}

/// Completion callback for a submitted operation.
pub type IoCompletion = Box<dyn FnOnce(NvmeStatus) + Send>;

/// The narrow block-device API the target executes against.
pub trait BlockDevice: Send + Sync {
    /// Data bytes per logical block.
    fn get_block_size(&self) -> u32;

    /// Logical block count.
    fn get_num_blocks(&self) -> u64;

    /// Metadata bytes per logical block.
    fn get_md_size(&self) -> u32;

    /// Whether metadata is interleaved with the data (extended LBA).
    fn is_md_interleaved(&self) -> bool;

    /// The protection-information type of the device format.
    fn get_dif_type(&self) -> DifType;

    /// Whether a particular protection check is enabled on this device.
    fn is_dif_check_enabled(&self, check: DifFlags) -> bool;

    /// Submit an operation; `done` fires exactly once when it completes.
    fn submit(&self, tag: u64, request: IoRequest, done: IoCompletion);

    /// Abort the in-flight operation submitted under `tag`.
    ///
    /// Returns true when the operation was found and will complete with
    /// an aborted status.
    fn abort(&self, tag: u64) -> bool;
}

struct PendingIo {
    request: IoRequest,
    done: IoCompletion,
}

/// RAM-backed block device.
pub struct MemDisk {
    block_size: u32,
    md_size: u32,
    interleaved: bool,
    dif_type: DifType,
    dif_checks: DifFlags,
    num_blocks: u64,
    data: Mutex<Vec<u8>>,
    /// Defer completions until [`MemDisk::drain`] when set.
    manual_completion: AtomicBool,
    pending: Mutex<HashMap<u64, PendingIo>>,
    order: Mutex<Vec<u64>>,
}

impl MemDisk {
    /// Create a RAM disk. `block_size` is the data portion; `md_size`
    /// extends every block when `interleaved`.
    pub fn new(
        num_blocks: u64,
        block_size: u32,
        md_size: u32,
        interleaved: bool,
        dif_type: DifType,
        dif_checks: DifFlags,
    ) -> Self {
        let stride = if interleaved {
            block_size + md_size
        } else {
            block_size
        } as u64;
        Self {
            block_size,
            md_size,
            interleaved,
            dif_type,
            dif_checks,
            num_blocks,
            data: Mutex::new(vec![0u8; (num_blocks * stride) as usize]),
            manual_completion: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Bytes each logical block occupies on the media.
    pub fn stride(&self) -> usize {
        if self.interleaved {
            (self.block_size + self.md_size) as usize
        } else {
            self.block_size as usize
        }
    }

    /// Hold completions until [`MemDisk::drain`] is called.
    pub fn set_manual_completion(&self, manual: bool) {
        self.manual_completion.store(manual, Ordering::Release);
    }

    /// Complete every held operation, in submission order.
    pub fn drain(&self) -> usize {
        let tags: Vec<u64> = self.order.lock().drain(..).collect();
        let mut count = 0;
        for tag in tags {
            if let Some(io) = self.pending.lock().remove(&tag) {
                let status = self.execute(&io.request);
                (io.done)(status);
                count += 1;
            }
        }
        count
    }

    /// Number of held operations.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Read raw media bytes for test assertions.
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    fn execute(&self, request: &IoRequest) -> NvmeStatus {
        let stride = self.stride();
        if request.lba + request.num_blocks > self.num_blocks {
            return NvmeStatus {
                sct: sct::GENERIC,
                sc: sc::INVALID_FIELD,
                dnr: true,
            };
        }
        let start = request.lba as usize * stride;
        let len = request.num_blocks as usize * stride;

        match request.io_type {
            IoType::Read => {
                let media = self.data.lock();
                let mut cursor = SgCursor::new(&request.iovs);
                cursor.write(&media[start..start + len]);
                NvmeStatus::success()
            }
            IoType::Write => {
                let mut staged = vec![0u8; len];
                let mut cursor = SgCursor::new(&request.iovs);
                cursor.read(&mut staged);
                self.data.lock()[start..start + len].copy_from_slice(&staged);
                NvmeStatus::success()
            }
            IoType::Compare => {
                let mut staged = vec![0u8; len];
                let mut cursor = SgCursor::new(&request.iovs);
                cursor.read(&mut staged);
                if self.data.lock()[start..start + len] == staged[..] {
                    NvmeStatus::success()
                } else {
                    NvmeStatus::media(SC_COMPARE_FAILURE)
                }
            }
            IoType::CompareAndWrite => {
                let mut staged = vec![0u8; len];
                let mut cursor = SgCursor::new(&request.iovs);
                cursor.read(&mut staged);
                let mut media = self.data.lock();
                if media[start..start + len] != staged[..] {
                    return NvmeStatus::media(SC_COMPARE_FAILURE);
                }
                media[start..start + len].copy_from_slice(&staged);
                NvmeStatus::success()
            }
            IoType::WriteZeroes | IoType::Unmap => {
                self.data.lock()[start..start + len].fill(0);
                NvmeStatus::success()
            }
            IoType::Flush
            | IoType::Reset
            | IoType::ZoneReport
            | IoType::ZoneManagement
            | IoType::NvmePassthrough => NvmeStatus::success(),
        }
    }
}

impl BlockDevice for MemDisk {
    fn get_block_size(&self) -> u32 {
        self.block_size
    }

    fn get_num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn get_md_size(&self) -> u32 {
        self.md_size
    }

    fn is_md_interleaved(&self) -> bool {
        self.interleaved
    }

    fn get_dif_type(&self) -> DifType {
        self.dif_type
    }

    fn is_dif_check_enabled(&self, check: DifFlags) -> bool {
        self.dif_checks.contains(check)
    }

    fn submit(&self, tag: u64, request: IoRequest, done: IoCompletion) {
        if self.manual_completion.load(Ordering::Acquire) {
            debug!(tag, ?request, "holding operation for manual completion");
            self.order.lock().push(tag);
            self.pending.lock().insert(tag, PendingIo { request, done });
            return;
        }
        let status = self.execute(&request);
        done(status);
    }

    fn abort(&self, tag: u64) -> bool {
        self.order.lock().retain(|&t| t != tag);
        if let Some(io) = self.pending.lock().remove(&tag) {
            (io.done)(NvmeStatus::generic(sc::ABORTED_BY_REQUEST));
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::dma::DmaBuf;
    use std::sync::atomic::AtomicU8;
    use std::sync::Arc;

    fn disk() -> MemDisk {
        MemDisk::new(
            64,
            512,
            8,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK | DifFlags::REFTAG_CHECK,
        )
    }

    fn one_block_iov(fill: u8) -> (Vec<SgEntry>, DmaBuf) {
        let buf = DmaBuf::alloc(520);
        buf.with_mut(0, 520, |b| b.fill(fill));
        (vec![SgEntry::whole(buf.clone())], buf)
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let disk = disk();
        let (iovs, _buf) = one_block_iov(0xA5);
        let status = Arc::new(AtomicU8::new(0xFF));
        let s = status.clone();
        disk.submit(
            1,
            IoRequest {
                io_type: IoType::Write,
                lba: 3,
                num_blocks: 1,
                iovs,
            },
            Box::new(move |st| s.store(st.sc, Ordering::SeqCst)),
        );
        assert_eq!(status.load(Ordering::SeqCst), sc::SUCCESS);
        assert_eq!(disk.peek(3 * 520, 4), vec![0xA5; 4]);

        let out = DmaBuf::alloc(520);
        let s = status.clone();
        disk.submit(
            2,
            IoRequest {
                io_type: IoType::Read,
                lba: 3,
                num_blocks: 1,
                iovs: vec![SgEntry::whole(out.clone())],
            },
            Box::new(move |st| s.store(st.sc, Ordering::SeqCst)),
        );
        assert_eq!(out.to_vec(0, 520), vec![0xA5; 520]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let disk = disk();
        let (iovs, _buf) = one_block_iov(0);
        let status = Arc::new(AtomicU8::new(0));
        let s = status.clone();
        disk.submit(
            1,
            IoRequest {
                io_type: IoType::Write,
                lba: 64,
                num_blocks: 1,
                iovs,
            },
            Box::new(move |st| s.store(st.sc, Ordering::SeqCst)),
        );
        assert_eq!(status.load(Ordering::SeqCst), sc::INVALID_FIELD);
    }

    #[test]
    fn test_manual_completion_and_abort() {
        let disk = disk();
        disk.set_manual_completion(true);
        let (iovs, _buf) = one_block_iov(1);
        let status = Arc::new(AtomicU8::new(0xFF));
        let s = status.clone();
        disk.submit(
            9,
            IoRequest {
                io_type: IoType::Write,
                lba: 0,
                num_blocks: 1,
                iovs,
            },
            Box::new(move |st| s.store(st.sc, Ordering::SeqCst)),
        );
        assert_eq!(disk.pending(), 1);
        assert_eq!(status.load(Ordering::SeqCst), 0xFF);

        assert!(disk.abort(9));
        assert_eq!(status.load(Ordering::SeqCst), sc::ABORTED_BY_REQUEST);
        assert!(!disk.abort(9));
        assert_eq!(disk.drain(), 0);
    }

    #[test]
    fn test_compare_failure() {
        let disk = disk();
        let (iovs, _buf) = one_block_iov(0x11);
        let status = Arc::new(AtomicU8::new(0xFF));
        let s = status.clone();
        disk.submit(
            1,
            IoRequest {
                io_type: IoType::Compare,
                lba: 0,
                num_blocks: 1,
                iovs,
            },
            Box::new(move |st| s.store(st.sc, Ordering::SeqCst)),
        );
        assert_eq!(status.load(Ordering::SeqCst), SC_COMPARE_FAILURE);
    }
}
