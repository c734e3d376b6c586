//! Connect-request validation and queue-depth negotiation.
//!
//! Each inbound CONNECT carries a fixed-format private data block. The
//! listener validates it, then sizes the new queue pair as the minimum of
//! what the target allows, what the device supports, and what the host
//! asked for.

use tracing::{debug, warn};

use crate::proto::{ConnectRequestData, RejectStatus, CONNECT_REQUEST_DATA_SIZE};
use crate::rdma::cm::ConnectRequest;
use crate::target::poll_group::{NewQpair, TargetCtx};

/// Validate a connect request and negotiate its queue depths.
///
/// On success returns the queue-pair skeleton to hand to a poll group;
/// on failure the request has been rejected with the appropriate status
/// and `None` is returned.
pub fn handle_connect_request(ctx: &TargetCtx, request: ConnectRequest) -> Option<NewQpair> {
    if request.private_data.len() < CONNECT_REQUEST_DATA_SIZE {
        warn!(
            len = request.private_data.len(),
            "connect request carried no usable private data"
        );
        request.reject(RejectStatus::InvalidPrivateDataLength);
        return None;
    }
    let private_data = match ConnectRequestData::from_bytes(&request.private_data) {
        Ok(data) => data,
        Err(_) => {
            request.reject(RejectStatus::InvalidPrivateDataLength);
            return None;
        }
    };

    if private_data.recfmt != 0 {
        warn!(recfmt = private_data.recfmt, "connect request with unknown record format");
        request.reject(RejectStatus::InvalidRecfmt);
        return None;
    }
    if private_data.hrqsize == 0 {
        request.reject(RejectStatus::InvalidHrqsize);
        return None;
    }

    // The supported queue depth folds together the target's configured
    // limit, the local device's hardware limits, and the host's request.
    let attr = ctx.device.attr();
    let mut max_queue_depth = ctx.opts.max_queue_depth;
    let mut max_read_depth = ctx.opts.max_queue_depth;

    max_queue_depth = max_queue_depth.min(attr.max_qp_wr);
    max_read_depth = max_read_depth.min(attr.max_qp_init_rd_atom);

    if request.initiator_depth > 0 {
        max_read_depth = max_read_depth.min(request.initiator_depth as u32);
    }

    max_queue_depth = max_queue_depth.min(private_data.hrqsize as u32);
    max_queue_depth = max_queue_depth.min(private_data.hsqsize as u32 + 1);

    debug!(
        qid = private_data.qid,
        max_queue_depth, max_read_depth, "negotiated queue depths"
    );

    Some(NewQpair {
        listen_addr: request.listen_addr.clone(),
        qid: private_data.qid,
        max_queue_depth: max_queue_depth as u16,
        max_read_depth: max_read_depth as u16,
        connect: request,
    })
}
