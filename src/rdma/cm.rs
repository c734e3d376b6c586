//! Connection manager.
//!
//! An asynchronous event channel carries connection-lifecycle events to
//! their owners. The client side walks the address-resolution, route-
//! resolution, and connect steps awaiting exactly one expected event after
//! each; the listener side receives connect requests and accepts or
//! rejects them with typed private data. A REJECTED event with the stale-
//! connection status converts into a retryable error, which the client
//! resolves with a bounded backoff loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proto::{ConnectAcceptData, ConnectRejectData, RejectStatus};
use crate::rdma::verbs::Qp;

/// Maximum full connect-sequence attempts when the peer reports a stale
/// connection.
pub const STALE_CONN_RETRY_MAX: usize = 5;

/// Delay between stale-connection retries.
pub const STALE_CONN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Reject status value the verbs layer reports for a stale connection.
pub const STALE_CONN_REJECT_STATUS: u16 = 10;

/// Identifies one connection endpoint within its owner's event channel.
pub type CmToken = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> CmToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// The far end of an established connection: where disconnect
/// notifications for it are delivered.
#[derive(Clone)]
pub struct RemoteEnd {
    /// Event sender of the peer's channel
    pub tx: CmEventSender,
    /// The peer's token on that channel
    pub token: CmToken,
}

impl std::fmt::Debug for RemoteEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEnd").field("token", &self.token).finish()
    }
}

/// An inbound connection request delivered to a listener.
#[derive(Clone)]
pub struct ConnectRequest {
    /// Private data carried in the CONNECT message
    pub private_data: Vec<u8>,
    /// How many outstanding RDMA READs the initiator will issue
    pub initiator_depth: u16,
    /// How many inbound RDMA READs the initiator accepts
    pub responder_resources: u16,
    /// The listen address the request arrived on
    pub listen_addr: String,
    /// The connecting queue pair
    pub client_qp: Qp,
    /// The client endpoint to answer to
    pub client: RemoteEnd,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("listen_addr", &self.listen_addr)
            .field("private_data_len", &self.private_data.len())
            .field("initiator_depth", &self.initiator_depth)
            .finish()
    }
}

impl ConnectRequest {
    /// Accept: pair the server queue pair with the client's and deliver
    /// ESTABLISHED with the accept private data.
    pub fn accept(&self, server: &CmId, server_qp: &Qp, data: ConnectAcceptData) {
        Qp::connect_pair(&self.client_qp, server_qp);
        server.set_remote(self.client.clone());
        self.client.tx.send(
            self.client.token,
            CmEvent::Established {
                accept: data,
                remote: RemoteEnd {
                    tx: server.tx().clone(),
                    token: server.token(),
                },
            },
        );
        debug!(listen_addr = %self.listen_addr, "accepted connection");
    }

    /// Reject with the given status.
    pub fn reject(&self, status: RejectStatus) {
        self.reject_raw(ConnectRejectData::new(status).sts);
    }

    /// Reject with a raw status value (used for the stale-connection code,
    /// which is not part of the NVMe-oF reject enumeration).
    pub fn reject_raw(&self, status: u16) {
        self.client
            .tx
            .send(self.client.token, CmEvent::Rejected { status });
        debug!(listen_addr = %self.listen_addr, status, "rejected connection");
    }
}

/// Connection-lifecycle events.
#[derive(Debug, Clone)]
pub enum CmEvent {
    /// Address resolution finished
    AddrResolved,
    /// Address resolution failed
    AddrError,
    /// Route resolution finished
    RouteResolved,
    /// Route resolution failed
    RouteError,
    /// A peer wants to connect (listener side)
    ConnectRequest(ConnectRequest),
    /// Connect response without established state
    ConnectResponse,
    /// The connect attempt failed
    ConnectError,
    /// The destination is unreachable
    Unreachable,
    /// The peer rejected the connection
    Rejected {
        /// Reject status; 10 means stale connection
        status: u16,
    },
    /// The connection is established
    Established {
        /// Accept private data from the peer
        accept: ConnectAcceptData,
        /// The peer endpoint for future notifications
        remote: RemoteEnd,
    },
    /// The peer disconnected
    Disconnected,
    /// The underlying device was removed
    DeviceRemoval,
    /// The listener's address changed
    AddrChange,
    /// The connection left the timewait state
    TimewaitExit,
}

/// Discriminant of [`CmEvent`], used to express the one expected event of
/// each connect step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    /// Address resolution finished
    AddrResolved,
    /// Route resolution finished
    RouteResolved,
    /// A peer wants to connect
    ConnectRequest,
    /// The connection is established
    Established,
    /// The peer disconnected
    Disconnected,
    /// The peer rejected the connection
    Rejected,
    /// Any other event
    Other,
}

impl CmEvent {
    /// The discriminant of this event.
    pub fn kind(&self) -> CmEventKind {
        match self {
            CmEvent::AddrResolved => CmEventKind::AddrResolved,
            CmEvent::RouteResolved => CmEventKind::RouteResolved,
            CmEvent::ConnectRequest(_) => CmEventKind::ConnectRequest,
            CmEvent::Established { .. } => CmEventKind::Established,
            CmEvent::Disconnected => CmEventKind::Disconnected,
            CmEvent::Rejected { .. } => CmEventKind::Rejected,
            _ => CmEventKind::Other,
        }
    }
}

/// Cloneable sending half of an event channel.
#[derive(Clone)]
pub struct CmEventSender {
    tx: Sender<(CmToken, CmEvent)>,
}

impl CmEventSender {
    /// Deliver `event` for `token`. Delivery to a closed channel is
    /// silently dropped, matching events racing a teardown.
    pub fn send(&self, token: CmToken, event: CmEvent) {
        let _ = self.tx.send((token, event));
    }
}

/// An asynchronous connection-event channel.
pub struct CmEventChannel {
    tx: Sender<(CmToken, CmEvent)>,
    rx: Receiver<(CmToken, CmEvent)>,
    /// Events reaped while waiting for a different endpoint's event.
    pending: Mutex<VecDeque<(CmToken, CmEvent)>>,
}

impl Default for CmEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CmEventChannel {
    /// Create an event channel.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// A sender handle for this channel.
    pub fn sender(&self) -> CmEventSender {
        CmEventSender {
            tx: self.tx.clone(),
        }
    }

    /// Reap the next event without blocking.
    pub fn poll(&self) -> Option<(CmToken, CmEvent)> {
        if let Some(ev) = self.pending.lock().pop_front() {
            return Some(ev);
        }
        self.rx.try_recv().ok()
    }

    /// Reap the next event, waiting up to `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<(CmToken, CmEvent)> {
        if let Some(ev) = self.pending.lock().pop_front() {
            return Some(ev);
        }
        self.rx.recv_timeout(timeout).ok()
    }

    /// Wait for the one `expected` event of `token`.
    ///
    /// Events for other endpoints on the same channel are set aside and
    /// re-delivered by later polls. A mismatched event type yields a
    /// bad-message error, except REJECTED with the stale-connection status
    /// which converts into a retryable stale error.
    pub fn await_event(
        &self,
        token: CmToken,
        expected: CmEventKind,
        timeout: Duration,
    ) -> Result<CmEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some((ev_token, event)) = self.poll_timeout(remaining) else {
                return Err(Error::not_found(format!(
                    "no connection event arrived within {:?}",
                    timeout
                )));
            };
            if ev_token != token {
                self.pending.lock().push_back((ev_token, event));
                if Instant::now() >= deadline {
                    return Err(Error::not_found("no connection event arrived"));
                }
                continue;
            }

            let kind = event.kind();
            if kind == expected {
                return Ok(event);
            }
            if expected == CmEventKind::Established {
                if let CmEvent::Rejected { status } = &event {
                    if *status == STALE_CONN_REJECT_STATUS {
                        info!("received a stale connection notice during connection");
                        return Err(Error::stale("peer reported a stale connection"));
                    }
                }
            }
            warn!(
                ?expected,
                got = ?kind,
                "unexpected event reaped from connection channel"
            );
            return Err(Error::bad_msg(format!(
                "expected {:?} but reaped {:?}",
                expected, kind
            )));
        }
    }
}

struct ListenerEntry {
    tx: CmEventSender,
    token: CmToken,
}

lazy_static::lazy_static! {
    static ref LISTENERS: DashMap<String, ListenerEntry> = DashMap::new();
}

/// Connection parameters passed to [`CmId::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnParam {
    /// Private data carried in the CONNECT message
    pub private_data: Vec<u8>,
    /// Outstanding RDMA READs this side will issue
    pub initiator_depth: u16,
    /// Inbound RDMA READs this side accepts
    pub responder_resources: u16,
}

struct CmIdInner {
    token: CmToken,
    tx: CmEventSender,
    dst: Mutex<Option<String>>,
    qp: Mutex<Option<Qp>>,
    remote: Mutex<Option<RemoteEnd>>,
}

/// One connection endpoint: the client or server half of a connection.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl std::fmt::Debug for CmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmId")
            .field("token", &self.inner.token)
            .finish()
    }
}

impl CmId {
    /// Create an endpoint whose events are delivered to `tx`.
    pub fn new(tx: CmEventSender) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                token: next_token(),
                tx,
                dst: Mutex::new(None),
                qp: Mutex::new(None),
                remote: Mutex::new(None),
            }),
        }
    }

    /// This endpoint's token on its event channel.
    pub fn token(&self) -> CmToken {
        self.inner.token
    }

    /// The sender events for this endpoint go through.
    pub fn tx(&self) -> &CmEventSender {
        &self.inner.tx
    }

    /// Attach the queue pair this endpoint connects.
    pub fn set_qp(&self, qp: Qp) {
        *self.inner.qp.lock() = Some(qp);
    }

    /// The attached queue pair.
    pub fn qp(&self) -> Option<Qp> {
        self.inner.qp.lock().clone()
    }

    /// Record the peer endpoint of an established connection.
    pub fn set_remote(&self, remote: RemoteEnd) {
        *self.inner.remote.lock() = Some(remote);
    }

    /// Resolve the destination address. Completes with ADDR_RESOLVED.
    pub fn resolve_addr(&self, dst: &str) {
        *self.inner.dst.lock() = Some(dst.to_string());
        self.inner.tx.send(self.inner.token, CmEvent::AddrResolved);
    }

    /// Resolve the route. Completes with ROUTE_RESOLVED.
    pub fn resolve_route(&self) {
        let event = if self.inner.dst.lock().is_some() {
            CmEvent::RouteResolved
        } else {
            CmEvent::RouteError
        };
        self.inner.tx.send(self.inner.token, event);
    }

    /// Send a CONNECT to the resolved destination.
    ///
    /// Completes with ESTABLISHED, REJECTED, or UNREACHABLE on this
    /// endpoint's channel; the listener sees CONNECT_REQUEST.
    pub fn connect(&self, param: ConnParam) -> Result<()> {
        let dst = self
            .inner
            .dst
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid("connect before address resolution"))?;
        let qp = self
            .inner
            .qp
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid("connect without a queue pair"))?;

        let Some(listener) = LISTENERS.get(&dst) else {
            self.inner.tx.send(self.inner.token, CmEvent::Unreachable);
            return Ok(());
        };

        listener.tx.send(
            listener.token,
            CmEvent::ConnectRequest(ConnectRequest {
                private_data: param.private_data,
                initiator_depth: param.initiator_depth,
                responder_resources: param.responder_resources,
                listen_addr: dst,
                client_qp: qp,
                client: RemoteEnd {
                    tx: self.inner.tx.clone(),
                    token: self.inner.token,
                },
            }),
        );
        Ok(())
    }

    /// Tear the connection down: the queue pair moves to the error state
    /// and both ends observe DISCONNECTED.
    pub fn disconnect(&self) {
        if let Some(qp) = self.inner.qp.lock().as_ref() {
            qp.disconnect();
        }
        if let Some(remote) = self.inner.remote.lock().take() {
            remote.tx.send(remote.token, CmEvent::Disconnected);
        }
        self.inner.tx.send(self.inner.token, CmEvent::Disconnected);
    }
}

/// A bound listening address.
pub struct CmListener {
    addr: String,
    token: CmToken,
}

impl std::fmt::Debug for CmListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmListener").field("addr", &self.addr).finish()
    }
}

impl CmListener {
    /// Bind `addr` and deliver CONNECT_REQUEST events to `tx`.
    pub fn bind(addr: &str, backlog: usize, tx: CmEventSender) -> Result<Self> {
        let token = next_token();
        let backlog = backlog.max(1);
        let entry = ListenerEntry { tx, token };
        match LISTENERS.entry(addr.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::invalid(format!("address {} already in use", addr)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                info!(addr, backlog, "listening");
                Ok(Self {
                    addr: addr.to_string(),
                    token,
                })
            }
        }
    }

    /// The listener's token on its event channel.
    pub fn token(&self) -> CmToken {
        self.token
    }

    /// The bound address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop listening.
    pub fn unbind(&self) {
        LISTENERS.remove(&self.addr);
        info!(addr = %self.addr, "stopped listening");
    }
}

impl Drop for CmListener {
    fn drop(&mut self) {
        LISTENERS.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::verbs::{Cq, Device, DeviceAttr, QpCaps};

    fn make_qp(device: &Device) -> Qp {
        let pd = device.alloc_pd();
        let caps = QpCaps {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        Qp::new(device, &pd, Cq::new(8), Cq::new(8), caps, None)
    }

    #[test]
    fn test_connect_accept_establishes() {
        let device = Device::new("cm0", DeviceAttr::default());
        let server_channel = CmEventChannel::new();
        let listener =
            CmListener::bind("cm0-addr:4420", 100, server_channel.sender()).unwrap();

        let client_channel = CmEventChannel::new();
        let client = CmId::new(client_channel.sender());
        client.set_qp(make_qp(&device));

        client.resolve_addr("cm0-addr:4420");
        client_channel
            .await_event(client.token(), CmEventKind::AddrResolved, Duration::from_secs(1))
            .unwrap();
        client.resolve_route();
        client_channel
            .await_event(client.token(), CmEventKind::RouteResolved, Duration::from_secs(1))
            .unwrap();
        client.connect(ConnParam::default()).unwrap();

        let (_, event) = server_channel.poll_timeout(Duration::from_secs(1)).unwrap();
        let CmEvent::ConnectRequest(request) = event else {
            panic!("expected a connect request");
        };
        let server = CmId::new(server_channel.sender());
        let server_qp = make_qp(&device);
        server.set_qp(server_qp.clone());
        request.accept(
            &server,
            &server_qp,
            ConnectAcceptData {
                recfmt: 0,
                crqsize: 31,
            },
        );

        let event = client_channel
            .await_event(client.token(), CmEventKind::Established, Duration::from_secs(1))
            .unwrap();
        let CmEvent::Established { accept, .. } = event else {
            panic!("expected established");
        };
        assert_eq!(accept.crqsize, 31);
        listener.unbind();
    }

    #[test]
    fn test_unexpected_event_is_bad_msg_and_stale_converts() {
        let channel = CmEventChannel::new();
        let id = CmId::new(channel.sender());

        id.tx().send(id.token(), CmEvent::RouteResolved);
        let err = channel
            .await_event(id.token(), CmEventKind::AddrResolved, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::BadMsg);

        id.tx().send(
            id.token(),
            CmEvent::Rejected {
                status: STALE_CONN_REJECT_STATUS,
            },
        );
        let err = channel
            .await_event(id.token(), CmEventKind::Established, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::Stale);

        // A reject with any other status while awaiting ESTABLISHED stays
        // a bad-message error.
        id.tx().send(id.token(), CmEvent::Rejected { status: 6 });
        let err = channel
            .await_event(id.token(), CmEventKind::Established, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::BadMsg);
    }

    #[test]
    fn test_connect_to_unbound_address_is_unreachable() {
        let device = Device::new("cm1", DeviceAttr::default());
        let channel = CmEventChannel::new();
        let client = CmId::new(channel.sender());
        client.set_qp(make_qp(&device));
        client.resolve_addr("nowhere:4420");
        let _ = channel.poll_timeout(Duration::from_millis(50));
        client.connect(ConnParam::default()).unwrap();
        let (_, event) = channel.poll_timeout(Duration::from_millis(50)).unwrap();
        assert!(matches!(event, CmEvent::Unreachable));
    }

    #[test]
    fn test_bind_conflict() {
        let channel = CmEventChannel::new();
        let a = CmListener::bind("cm2-addr:4420", 10, channel.sender()).unwrap();
        assert!(CmListener::bind("cm2-addr:4420", 10, channel.sender()).is_err());
        a.unbind();
        let b = CmListener::bind("cm2-addr:4420", 10, channel.sender()).unwrap();
        b.unbind();
    }
}
