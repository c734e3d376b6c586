//! Full initiator-to-target round trips over the loopback fabric.
//!
//! A target runs on a background thread; the host connects, moves data
//! both directions, aborts an executing command, and the queue-pair
//! invariants are checked once everything quiesces.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tempest::backend::MemDisk;
use tempest::config::TransportOpts;
use tempest::host::request::{HostRequest, Payload, VecSglPayload};
use tempest::proto::{opc, sc, NvmeCmd};
use tempest::target::poll_group::PollGroup;
use tempest::target::request::RequestState;
use tempest::target::transport::RdmaTargetTransport;
use tempest::transport::FabricTransport;
use tempest::util::dif::{DifFlags, DifType};
use tempest::util::dma::DmaBuf;
use tempest::util::sg::SgEntry;
use tempest::{Controller, ControllerOpts};

fn plain_disk() -> Arc<MemDisk> {
    Arc::new(MemDisk::new(
        1024,
        512,
        0,
        false,
        DifType::Disable,
        DifFlags::empty(),
    ))
}

fn start_target(
    addr: &'static str,
    disk: Arc<MemDisk>,
) -> (
    Arc<RdmaTargetTransport>,
    Arc<AtomicBool>,
    std::thread::JoinHandle<PollGroup>,
) {
    let mut opts = TransportOpts {
        num_shared_buffers: 128,
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

fn wait_for(cond: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {}", what);
}

fn io_status(
    ctrlr: &mut Controller,
    qid: u16,
    status: &Arc<AtomicU8>,
) -> u8 {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let _ = ctrlr.process_completions(qid, 0);
        let sc = status.load(Ordering::Acquire);
        if sc != 0xFF {
            return sc;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for an I/O completion");
}

/// Inline write, keyed read back, data intact, and every counter back
/// at its resting value afterwards.
#[test]
fn test_write_read_roundtrip_and_quiescent_invariants() {
    let disk = plain_disk();
    let (_transport, stop, handle) = start_target("e2e-rw:4420", disk.clone());

    let mut ctrlr = Controller::connect("e2e-rw:4420", ControllerOpts::default()).unwrap();
    let qid = ctrlr.create_io_qpair(Some(32)).unwrap();

    // Inline write of eight blocks of deterministic random data.
    let mut rng = StdRng::seed_from_u64(0x7e3a);
    let wbuf = DmaBuf::alloc(4096);
    wbuf.with_mut(0, 4096, |b| rng.fill(b));
    ctrlr.register_payload(&wbuf).unwrap();

    let wstatus = Arc::new(AtomicU8::new(0xFF));
    let s = wstatus.clone();
    ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::WRITE,
                    nsid: 1,
                    cdw10: 16, // LBA 16
                    cdw12: 7,  // eight blocks
                    ..Default::default()
                },
                payload: Payload::Contig(SgEntry::whole(wbuf.clone())),
                cb: Some(Box::new(move |cpl| s.store(cpl.status.sc, Ordering::Release))),
            },
        )
        .unwrap();
    assert_eq!(io_status(&mut ctrlr, qid, &wstatus), sc::SUCCESS);
    assert_eq!(disk.peek(16 * 512, 8), wbuf.to_vec(0, 8));

    // Keyed read into a fresh buffer: the target pushes the data with
    // RDMA WRITE ahead of the completion send.
    let rbuf = DmaBuf::alloc(4096);
    ctrlr.register_payload(&rbuf).unwrap();
    let rstatus = Arc::new(AtomicU8::new(0xFF));
    let s = rstatus.clone();
    ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::READ,
                    nsid: 1,
                    cdw10: 16,
                    cdw12: 7,
                    ..Default::default()
                },
                payload: Payload::Contig(SgEntry::whole(rbuf.clone())),
                cb: Some(Box::new(move |cpl| s.store(cpl.status.sc, Ordering::Release))),
            },
        )
        .unwrap();
    assert_eq!(io_status(&mut ctrlr, qid, &rstatus), sc::SUCCESS);
    assert_eq!(rbuf.to_vec(0, 4096), wbuf.to_vec(0, 4096));

    // A scattered read through the iterator contract exercises the
    // multi-descriptor wire form.
    let sbuf_a = DmaBuf::alloc(2048);
    let sbuf_b = DmaBuf::alloc(2048);
    ctrlr.register_payload(&sbuf_a).unwrap();
    ctrlr.register_payload(&sbuf_b).unwrap();
    let sstatus = Arc::new(AtomicU8::new(0xFF));
    let s = sstatus.clone();
    ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::READ,
                    nsid: 1,
                    cdw10: 16,
                    cdw12: 7,
                    ..Default::default()
                },
                payload: Payload::Sgl {
                    iter: Box::new(VecSglPayload::new(vec![
                        SgEntry::whole(sbuf_a.clone()),
                        SgEntry::whole(sbuf_b.clone()),
                    ])),
                    size: 4096,
                },
                cb: Some(Box::new(move |cpl| s.store(cpl.status.sc, Ordering::Release))),
            },
        )
        .unwrap();
    assert_eq!(io_status(&mut ctrlr, qid, &sstatus), sc::SUCCESS);
    assert_eq!(sbuf_a.to_vec(0, 2048), wbuf.to_vec(0, 2048));
    assert_eq!(sbuf_b.to_vec(0, 2048), wbuf.to_vec(2048, 2048));

    // Let the target settle, then check §8-style invariants at
    // quiescence.
    std::thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Release);
    let group = handle.join().unwrap();
    for poller in &group.pollers {
        for qpair in poller.qpairs.values() {
            let core = &qpair.core;
            assert!(core.current_send_depth <= core.max_send_depth);
            assert!(core.current_read_depth <= core.max_read_depth);
            assert!(core.current_recv_depth <= core.max_queue_depth);
            assert_eq!(core.current_send_depth, 0);
            assert_eq!(core.current_read_depth, 0);
            assert_eq!(core.qd, 0);

            let rsrc = qpair.resources.as_ref().or(poller.resources.as_ref()).unwrap();
            for req in &rsrc.reqs {
                if qpair.resources.is_some() || req.qp_num == core.qp_num {
                    assert_eq!(req.state, RequestState::Free);
                }
                assert_eq!(req.num_outstanding_data_wr, 0);
                assert!(req.data_wrs.is_empty());
            }
        }
    }
}

/// Aborting a command while it executes at the block device: the back
/// end's abort entry point fires, the victim completes with the aborted
/// status, and the ABORT command reports success in CDW0 bit zero.
#[test]
fn test_abort_of_executing_request() {
    let disk = plain_disk();
    disk.set_manual_completion(true);
    let (_transport, stop, handle) = start_target("e2e-abort:4420", disk.clone());

    let mut ctrlr = Controller::connect("e2e-abort:4420", ControllerOpts::default()).unwrap();
    let qid = ctrlr.create_io_qpair(Some(16)).unwrap();

    let wbuf = DmaBuf::alloc(512);
    ctrlr.register_payload(&wbuf).unwrap();

    let wstatus = Arc::new(AtomicU8::new(0xFF));
    let s = wstatus.clone();
    let cid = ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::WRITE,
                    nsid: 1,
                    cdw10: 0,
                    cdw12: 0,
                    ..Default::default()
                },
                payload: Payload::Contig(SgEntry::whole(wbuf.clone())),
                cb: Some(Box::new(move |cpl| s.store(cpl.status.sc, Ordering::Release))),
            },
        )
        .unwrap();

    // The command reaches the device and is held there.
    wait_for(|| disk.pending() == 1, "the write to reach the device");

    // ABORT names the victim by submission queue id and command id.
    let abort_cdw0 = Arc::new(AtomicU32::new(u32::MAX));
    let a = abort_cdw0.clone();
    ctrlr
        .submit_admin(HostRequest {
            cmd: NvmeCmd {
                opc: opc::ABORT,
                cdw10: ((cid as u32) << 16) | qid as u32,
                ..Default::default()
            },
            payload: Payload::None,
            cb: Some(Box::new(move |cpl| a.store(cpl.cdw0, Ordering::Release))),
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let _ = ctrlr.process_admin_completions(0);
        let _ = ctrlr.process_completions(qid, 0);
        if abort_cdw0.load(Ordering::Acquire) != u32::MAX
            && wstatus.load(Ordering::Acquire) != 0xFF
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    // The device saw the abort, the victim completed aborted, and CDW0
    // bit zero reports success.
    assert_eq!(disk.pending(), 0);
    assert_eq!(wstatus.load(Ordering::Acquire), sc::ABORTED_BY_REQUEST);
    assert_eq!(abort_cdw0.load(Ordering::Acquire) & 1, 0);

    stop.store(true, Ordering::Release);
    let _ = handle.join().unwrap();
}

/// An ABORT naming a command that no longer exists reports "not
/// aborted" in CDW0 bit zero.
#[test]
fn test_abort_of_unknown_command() {
    let disk = plain_disk();
    let (_transport, stop, handle) = start_target("e2e-abort-miss:4420", disk);

    let mut ctrlr = Controller::connect("e2e-abort-miss:4420", ControllerOpts::default()).unwrap();
    let qid = ctrlr.create_io_qpair(Some(16)).unwrap();

    let abort_cdw0 = Arc::new(AtomicU32::new(u32::MAX));
    let a = abort_cdw0.clone();
    ctrlr
        .submit_admin(HostRequest {
            cmd: NvmeCmd {
                opc: opc::ABORT,
                cdw10: (42u32 << 16) | qid as u32,
                ..Default::default()
            },
            payload: Payload::None,
            cb: Some(Box::new(move |cpl| a.store(cpl.cdw0, Ordering::Release))),
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && abort_cdw0.load(Ordering::Acquire) == u32::MAX {
        let _ = ctrlr.process_admin_completions(0);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(abort_cdw0.load(Ordering::Acquire) & 1, 1);

    stop.store(true, Ordering::Release);
    let _ = handle.join().unwrap();
}

/// Flush carries no data in either direction and completes successfully.
#[test]
fn test_flush_no_data_command() {
    let disk = plain_disk();
    let (_transport, stop, handle) = start_target("e2e-flush:4420", disk);

    let mut ctrlr = Controller::connect("e2e-flush:4420", ControllerOpts::default()).unwrap();
    let qid = ctrlr.create_io_qpair(Some(16)).unwrap();

    let status = Arc::new(AtomicU8::new(0xFF));
    let s = status.clone();
    ctrlr
        .submit_io(
            qid,
            HostRequest {
                cmd: NvmeCmd {
                    opc: opc::FLUSH,
                    nsid: 1,
                    ..Default::default()
                },
                payload: Payload::None,
                cb: Some(Box::new(move |cpl| s.store(cpl.status.sc, Ordering::Release))),
            },
        )
        .unwrap();
    assert_eq!(io_status(&mut ctrlr, qid, &status), sc::SUCCESS);

    stop.store(true, Ordering::Release);
    let _ = handle.join().unwrap();
}
