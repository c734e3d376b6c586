//! End-to-end data-integrity scenarios.
//!
//! Covers protection-information insertion on the write path through a
//! live target (extended LBA), separate-metadata verification on the
//! host side (DIX), and randomized generate/verify round trips over
//! split scatter/gather layouts.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use tempest::backend::MemDisk;
use tempest::config::TransportOpts;
use tempest::host::request::{HostRequest, Payload};
use tempest::proto::{opc, NvmeCmd};
use tempest::target::transport::RdmaTargetTransport;
use tempest::transport::FabricTransport;
use tempest::util::crc16::crc16_t10dif;
use tempest::util::dif::{self, DifCtx, DifErrorType, DifFlags, DifType};
use tempest::util::dma::DmaBuf;
use tempest::util::sg::{SgCursor, SgEntry};
use tempest::{Controller, ControllerOpts};

/// Run a target for `disk` on a background thread until the returned
/// stop flag is raised; the poll group is handed back at join.
fn start_target(
    addr: &'static str,
    disk: Arc<MemDisk>,
    dif_insert_or_strip: bool,
) -> (
    Arc<RdmaTargetTransport>,
    Arc<AtomicBool>,
    std::thread::JoinHandle<tempest::target::poll_group::PollGroup>,
) {
    let mut opts = TransportOpts {
        num_shared_buffers: 128,
        dif_insert_or_strip,
        ..Default::default()
    };
    opts.validate().unwrap();
    let rdma_opts = tempest::RdmaOpts {
        max_srq_depth: 128,
        ..Default::default()
    };
    let transport = RdmaTargetTransport::new(opts, rdma_opts, disk).unwrap();
    let mut group = transport.create_poll_group();
    transport.listen(addr).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let transport = transport.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                transport.accept_poll();
                transport.attach_pending(&mut group);
                group.poll();
                std::thread::sleep(Duration::from_millis(1));
            }
            group
        })
    };
    (transport, stop, handle)
}

fn wait_for_status(status: &Arc<AtomicU8>, ctrlr: &mut Controller, qid: u16) -> u8 {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let _ = ctrlr.process_completions(qid, 0);
        let sc = status.load(Ordering::Acquire);
        if sc != 0xFF {
            return sc;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for a completion");
}

/// Single-block 4 KiB-formatted write with transport-inserted protection:
/// the media ends up carrying a 520-byte extended block whose trailing
/// tuple matches the recomputed guard and the command's tags.
#[test]
fn test_write_with_pi_insertion_extended_lba() {
    let disk = Arc::new(MemDisk::new(
        64,
        512,
        8,
        true,
        DifType::Type1,
        DifFlags::GUARD_CHECK | DifFlags::APPTAG_CHECK | DifFlags::REFTAG_CHECK,
    ));
    let (transport, stop, handle) = start_target("dif-e2e-0:4420", disk.clone(), true);

    // The target hides PI from hosts, so it advertises no in-capsule
    // capacity; every write travels as a keyed SGL.
    let mut ctrlr = Controller::connect(
        "dif-e2e-0:4420",
        ControllerOpts {
            ioccsz_bytes: 0,
            io_queue_size: 16,
            ..Default::default()
        },
    )
    .unwrap();
    let qid = ctrlr.create_io_qpair(None).unwrap();

    let payload = DmaBuf::alloc(512);
    ctrlr.register_payload(&payload).unwrap();

    let status = Arc::new(AtomicU8::new(0xFF));
    let s = status.clone();
    ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::WRITE,
                    nsid: 1,
                    cdw10: 0,                    // starting LBA 0
                    cdw12: (1 << 29) | (1 << 28) | (1 << 26), // PRACT + guard/reftag checks
                    cdw15: 0xFFFF_0000 | 0x1234, // apptag mask and value
                    ..Default::default()
                },
                payload: Payload::Contig(SgEntry::whole(payload.clone())),
                cb: Some(Box::new(move |cpl| {
                    s.store(cpl.status.sc, Ordering::Release);
                })),
            },
        )
        .unwrap();

    assert_eq!(wait_for_status(&status, &mut ctrlr, qid), 0);

    // The media holds the zero data plus the generated tuple.
    let block = disk.peek(0, 520);
    assert_eq!(&block[..512], &[0u8; 512][..]);
    let guard = crc16_t10dif(0, &[0u8; 512]);
    assert_eq!(&block[512..514], &guard.to_be_bytes());
    assert_eq!(&block[514..516], &0x1234u16.to_be_bytes());
    assert_eq!(&block[516..520], &0u32.to_be_bytes());

    stop.store(true, Ordering::Release);
    let group = handle.join().unwrap();
    assert_eq!(group.qpair_count(), 2);
    drop(transport);
}

/// Two-block read with separate metadata: the host verifies the tuples
/// the target produced, and any tag corruption reports the failing
/// block index.
#[test]
fn test_dix_read_verify_and_corruption() {
    let ctx = DifCtx::new(
        512,
        8,
        false,
        true,
        DifType::Type1,
        DifFlags::REFTAG_CHECK,
        0,
        0xFFFF,
        0,
    )
    .unwrap();

    // The target returned two arbitrary data blocks plus their metadata.
    let data = SgEntry::whole(DmaBuf::alloc(2 * 512));
    data.with_mut(0, 1024, |bytes| {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    });
    let md = SgEntry::whole(DmaBuf::alloc(2 * 8));
    dif::dix_generate(std::slice::from_ref(&data), &md, 2, &ctx).unwrap();

    // Reference tags land big-endian in each slot: 0 then 1.
    let mut slot = [0u8; 8];
    md.read_at(0, &mut slot);
    assert_eq!(u32::from_be_bytes([slot[4], slot[5], slot[6], slot[7]]), 0);
    md.read_at(8, &mut slot);
    assert_eq!(u32::from_be_bytes([slot[4], slot[5], slot[6], slot[7]]), 1);

    dif::dix_verify(std::slice::from_ref(&data), &md, 2, &ctx).unwrap();

    // Corrupting the second block's reference tag is caught with the
    // failing block index.
    md.write_at(8 + 7, &[0x99]);
    let err = dif::dix_verify(std::slice::from_ref(&data), &md, 2, &ctx).unwrap_err();
    assert_eq!(err.err_type, DifErrorType::RefTag);
    assert_eq!(err.err_offset, 1);
}

/// The generate/verify pair leaves the data portion untouched.
#[test]
fn test_generate_preserves_data_portion() {
    let ctx = DifCtx::new(
        520,
        8,
        true,
        true,
        DifType::Type2,
        DifFlags::GUARD_CHECK | DifFlags::APPTAG_CHECK | DifFlags::REFTAG_CHECK,
        7,
        0xFFFF,
        0x00AA,
    )
    .unwrap();
    let iovs = vec![SgEntry::whole(DmaBuf::alloc(4 * 520))];
    let mut before = vec![0u8; 4 * 520];
    for (i, b) in before.iter_mut().enumerate() {
        *b = (i * 7 % 256) as u8;
    }
    SgCursor::new(&iovs).write(&before);

    dif::generate(&iovs, 4, &ctx).unwrap();
    dif::verify(&iovs, 4, &ctx).unwrap();

    let mut after = vec![0u8; 4 * 520];
    SgCursor::new(&iovs).read(&mut after);
    for block in 0..4 {
        let base = block * 520;
        assert_eq!(before[base..base + 512], after[base..base + 512]);
    }
}

proptest! {
    /// CRC-16 seedable composition: crc(crc(0, a), b) == crc(0, a ++ b).
    #[test]
    fn prop_crc16_composition(a in proptest::collection::vec(any::<u8>(), 0..256),
                              b in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        prop_assert_eq!(
            crc16_t10dif(crc16_t10dif(0, &a), &b),
            crc16_t10dif(0, &joined)
        );
    }

    /// Generate then verify succeeds over arbitrary region splits, and
    /// the split traversal produces byte-identical tuples to the
    /// contiguous one.
    #[test]
    fn prop_dif_roundtrip_arbitrary_splits(
        blocks in 1usize..5,
        splits in proptest::collection::vec(1usize..600, 0..4),
        seed in any::<u8>(),
    ) {
        let ctx = DifCtx::new(
            520,
            8,
            true,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK | DifFlags::APPTAG_CHECK | DifFlags::REFTAG_CHECK,
            3,
            0xFFFF,
            0x0BAD,
        ).unwrap();
        let total = blocks * 520;

        // Carve the payload at the proposed split points.
        let mut lens = Vec::new();
        let mut used = 0usize;
        for s in splits {
            if used + s >= total {
                break;
            }
            lens.push(s);
            used += s;
        }
        lens.push(total - used);

        let iovs: Vec<SgEntry> = lens
            .iter()
            .map(|&l| SgEntry::whole(DmaBuf::alloc(l)))
            .collect();
        let payload: Vec<u8> = (0..total).map(|i| (i as u8).wrapping_mul(seed)).collect();
        SgCursor::new(&iovs).write(&payload);

        dif::generate(&iovs, blocks, &ctx).unwrap();
        prop_assert!(dif::verify(&iovs, blocks, &ctx).is_ok());

        // Flatten and verify through the whole-block fast path as well.
        let flat = vec![SgEntry::whole(DmaBuf::alloc(total))];
        let mut bytes = vec![0u8; total];
        SgCursor::new(&iovs).read(&mut bytes);
        SgCursor::new(&flat).write(&bytes);
        prop_assert!(dif::verify(&flat, blocks, &ctx).is_ok());
    }
}
