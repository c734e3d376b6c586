//! Target side of the transport.
//!
//! - [`qpair`]: queue-pair resource arenas and depth accounting
//! - [`request`]: the request record and its lifecycle state machine
//! - [`poll_group`]: pollers, completion dispatch, pending-list servicing
//! - [`listener`]: connect-request validation and queue-depth negotiation
//! - [`transport`]: the target transport object tying everything together

pub mod listener;
pub mod poll_group;
pub mod qpair;
pub mod request;
pub mod transport;

/// What a work-request cookie refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrKind {
    /// A posted receive (cookie indexes the receive arena)
    Recv,
    /// A response send (cookie indexes the request arena)
    Send,
    /// A data transfer (cookie indexes the request arena)
    Data,
}

/// Pack a work-request cookie.
pub fn pack_wr_id(kind: WrKind, idx: u16) -> u64 {
    let tag: u64 = match kind {
        WrKind::Recv => 0,
        WrKind::Send => 1,
        WrKind::Data => 2,
    };
    (tag << 32) | idx as u64
}

/// Unpack a work-request cookie.
pub fn unpack_wr_id(wr_id: u64) -> (WrKind, u16) {
    let kind = match wr_id >> 32 {
        0 => WrKind::Recv,
        1 => WrKind::Send,
        _ => WrKind::Data,
    };
    (kind, (wr_id & 0xFFFF) as u16)
}

/// Queue-pair lifecycle state above the RDMA level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpairState {
    /// Created but not yet added to a poll group
    Uninitialized,
    /// Serving requests
    Active,
    /// Failed; draining toward destruction
    Error,
}

/// Why a queue pair failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The peer went away (DISCONNECTED)
    Remote,
    /// The local device went away (DEVICE_REMOVAL) or errored
    Local,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_id_roundtrip() {
        for (kind, idx) in [
            (WrKind::Recv, 0u16),
            (WrKind::Send, 17),
            (WrKind::Data, u16::MAX),
        ] {
            let (k, i) = unpack_wr_id(pack_wr_id(kind, idx));
            assert_eq!(k, kind);
            assert_eq!(i, idx);
        }
    }
}
