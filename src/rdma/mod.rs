//! RDMA plumbing shared by the initiator and the target.
//!
//! - [`verbs`]: the software verbs provider (devices, queue pairs,
//!   completion queues, registered memory, loopback data movement)
//! - [`mem`]: the process-wide memory registration map
//! - [`batch`]: staged work-request batching with partial-failure rewind
//! - [`cm`]: the connection manager and its asynchronous event channel

pub mod batch;
pub mod cm;
pub mod mem;
pub mod verbs;
