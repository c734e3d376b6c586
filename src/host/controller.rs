//! Initiator controller façade.
//!
//! One controller per remote target association: it discovers the
//! listening target, brings up the admin queue pair first, then creates
//! and destroys I/O queue pairs on demand. Admin-side completion polling
//! and connection-event processing run on the controller's exclusive
//! handle, so the admin path is never re-entered.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::qpair::{HostQpair, QpairCaps, TransportFailure};
use crate::host::request::HostRequest;
use crate::rdma::cm::{
    CmEvent, CmEventChannel, STALE_CONN_RETRY_DELAY, STALE_CONN_RETRY_MAX,
};
use crate::rdma::mem::MemMap;
use crate::rdma::verbs::{Device, DeviceAttr};
use crate::util::dma::DmaBuf;

/// Controller construction options.
#[derive(Debug, Clone)]
pub struct ControllerOpts {
    /// Admin queue depth
    pub admin_queue_size: u16,
    /// Default I/O queue depth
    pub io_queue_size: u16,
    /// Queue pairs allowed per controller, admin included
    pub max_qpairs: u16,
    /// Controller id to request (0xFFFF asks the target to assign one)
    pub cntlid: u16,
    /// Inline capacity advertised by the target
    pub ioccsz_bytes: u32,
    /// In-capsule data offset advertised by the target
    pub icdoff: u16,
    /// SGL fan-out limit advertised by the target
    pub max_sges: usize,
    /// Defer work-request posting to completion polling
    pub delay_cmd_submit: bool,
}

impl Default for ControllerOpts {
    fn default() -> Self {
        Self {
            admin_queue_size: 32,
            io_queue_size: 128,
            max_qpairs: 128,
            cntlid: 0xFFFF,
            ioccsz_bytes: 4096,
            icdoff: 0,
            max_sges: crate::proto::MAX_SGL_DESCRIPTORS,
            delay_cmd_submit: false,
        }
    }
}

/// A connected initiator controller.
pub struct Controller {
    /// The target address this controller is associated with
    pub addr: String,
    /// Controller id of the association
    pub cntlid: u16,
    opts: ControllerOpts,
    device: Device,
    pd: crate::rdma::verbs::Pd,
    channel: CmEventChannel,
    mr_map: MemMap,
    admin: HostQpair,
    ios: HashMap<u16, HostQpair>,
    next_qid: u16,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("addr", &self.addr)
            .field("cntlid", &self.cntlid)
            .finish()
    }
}

impl Controller {
    /// Discover and connect the controller at `addr`: the admin queue
    /// pair comes up first, with the stale-connection backoff applied to
    /// the whole connect sequence.
    pub fn connect(addr: &str, opts: ControllerOpts) -> Result<Self> {
        let device = Device::new("tempest-host0", DeviceAttr::default());
        let pd = device.alloc_pd();
        let channel = CmEventChannel::new();

        let mut admin = HostQpair::new(
            device.clone(),
            pd.clone(),
            0,
            opts.admin_queue_size,
            opts.delay_cmd_submit,
        );
        admin.set_caps(QpairCaps {
            ioccsz_bytes: opts.ioccsz_bytes,
            icdoff: opts.icdoff,
            max_sges: opts.max_sges,
        });
        Self::connect_qpair_with_retry(&channel, &mut admin, addr, opts.cntlid)?;

        let mr_map = MemMap::for_pd(&pd, None);
        info!(addr, "controller connected");
        Ok(Self {
            addr: addr.to_string(),
            cntlid: opts.cntlid,
            opts,
            device,
            pd,
            channel,
            mr_map,
            admin,
            ios: HashMap::new(),
            next_qid: 1,
        })
    }

    /// Run the connect sequence, retrying with backoff while the target
    /// reports a stale connection.
    fn connect_qpair_with_retry(
        channel: &CmEventChannel,
        qpair: &mut HostQpair,
        addr: &str,
        cntlid: u16,
    ) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match qpair.connect(channel, addr, cntlid) {
                Ok(()) => return Ok(()),
                Err(err) if err.errno() == crate::error::Errno::Stale => {
                    if attempts >= STALE_CONN_RETRY_MAX {
                        warn!(
                            qid = qpair.qid,
                            attempts, "stale connection persisted past the retry budget"
                        );
                        return Err(err);
                    }
                    // Give the target time to reap the stale side, then
                    // run the whole sequence again.
                    warn!(
                        qid = qpair.qid,
                        attempt = attempts,
                        "detected stale connection on target side, retrying"
                    );
                    qpair.disconnect();
                    std::thread::sleep(STALE_CONN_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Register a payload buffer so the builders can translate it.
    pub fn register_payload(&self, buf: &DmaBuf) -> Result<()> {
        self.mr_map.register(buf)
    }

    /// Create and connect an I/O queue pair; returns its queue id.
    pub fn create_io_qpair(&mut self, queue_size: Option<u16>) -> Result<u16> {
        if 1 + self.ios.len() as u16 >= self.opts.max_qpairs {
            return Err(Error::range("queue pair limit reached for this controller"));
        }
        let qid = self.next_qid;
        self.next_qid += 1;

        let mut qpair = HostQpair::new(
            self.device.clone(),
            self.pd.clone(),
            qid,
            queue_size.unwrap_or(self.opts.io_queue_size),
            self.opts.delay_cmd_submit,
        );
        qpair.set_caps(QpairCaps {
            ioccsz_bytes: self.opts.ioccsz_bytes,
            icdoff: self.opts.icdoff,
            max_sges: self.opts.max_sges,
        });
        Self::connect_qpair_with_retry(&self.channel, &mut qpair, &self.addr, self.cntlid)?;

        debug!(qid, "I/O queue pair connected");
        self.ios.insert(qid, qpair);
        Ok(qid)
    }

    /// Disconnect and free an I/O queue pair.
    pub fn delete_io_qpair(&mut self, qid: u16) -> Result<()> {
        let mut qpair = self
            .ios
            .remove(&qid)
            .ok_or_else(|| Error::not_found(format!("no I/O queue pair {}", qid)))?;
        qpair.disconnect();
        qpair.abort_reqs(true);
        Ok(())
    }

    /// Access an I/O queue pair.
    pub fn io_qpair_mut(&mut self, qid: u16) -> Option<&mut HostQpair> {
        self.ios.get_mut(&qid)
    }

    /// Submit a command on an I/O queue pair.
    pub fn submit_io(&mut self, qid: u16, req: HostRequest) -> Result<u16> {
        self.ios
            .get_mut(&qid)
            .ok_or_else(|| Error::not_found(format!("no I/O queue pair {}", qid)))?
            .submit(req)
    }

    /// Reap completions on an I/O queue pair.
    pub fn process_completions(&mut self, qid: u16, max: usize) -> Result<usize> {
        self.ios
            .get_mut(&qid)
            .ok_or_else(|| Error::not_found(format!("no I/O queue pair {}", qid)))?
            .process_completions(max)
    }

    /// Submit an admin command.
    pub fn submit_admin(&mut self, req: HostRequest) -> Result<u16> {
        self.admin.submit(req)
    }

    /// Reap admin completions.
    ///
    /// Connection events are drained first, on the same exclusive
    /// handle, so a disconnect observed here marks its queue pair before
    /// any further admin work runs.
    pub fn process_admin_completions(&mut self, max: usize) -> Result<usize> {
        self.drain_cm_events(Duration::ZERO);
        self.admin.process_completions(max)
    }

    fn drain_cm_events(&mut self, wait: Duration) {
        let first = if wait.is_zero() {
            self.channel.poll()
        } else {
            self.channel.poll_timeout(wait)
        };
        let mut next = first;
        while let Some((token, event)) = next {
            match event {
                CmEvent::Disconnected => {
                    if self.admin.cm_token() == Some(token) {
                        warn!("admin queue pair disconnected by the peer");
                        self.admin.failure = Some(TransportFailure::Remote);
                        self.admin.abort_reqs(false);
                    } else if let Some(qpair) = self
                        .ios
                        .values_mut()
                        .find(|q| q.cm_token() == Some(token))
                    {
                        warn!(qid = qpair.qid, "queue pair disconnected by the peer");
                        qpair.failure = Some(TransportFailure::Remote);
                        qpair.abort_reqs(false);
                    }
                }
                CmEvent::DeviceRemoval => {
                    if let Some(qpair) = self
                        .ios
                        .values_mut()
                        .find(|q| q.cm_token() == Some(token))
                    {
                        qpair.failure = Some(TransportFailure::Local);
                    }
                }
                _ => {}
            }
            next = self.channel.poll();
        }
    }

    /// The largest single transfer this transport supports; the generic
    /// layer moderates it with controller data.
    pub fn max_xfer_size(&self) -> u32 {
        u32::MAX
    }

    /// The SGL fan-out limit of this controller.
    pub fn max_sges(&self) -> usize {
        self.opts.max_sges
    }

    /// Tear down the association: I/O queue pairs first, admin last.
    pub fn disconnect(mut self) {
        let qids: Vec<u16> = self.ios.keys().copied().collect();
        for qid in qids {
            let _ = self.delete_io_qpair(qid);
        }
        self.admin.disconnect();
        self.admin.abort_reqs(true);
        self.mr_map.release();
        info!(addr = %self.addr, "controller disconnected");
    }
}

/// Convenience probe: connect with default options.
pub fn probe(addr: &str) -> Result<Controller> {
    Controller::connect(addr, ControllerOpts::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_unreachable_address() {
        let err = probe("no-such-target:4420").unwrap_err();
        // The connect reaped UNREACHABLE while expecting ESTABLISHED.
        assert_eq!(err.errno(), crate::error::Errno::BadMsg);
    }
}
