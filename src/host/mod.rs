//! Initiator (host) side of the transport.
//!
//! - [`request`]: payload descriptors and the SGL/inline send builders
//! - [`qpair`]: the host queue pair, its connect sequence, and completion
//!   pairing
//! - [`controller`]: the controller façade managing admin and I/O queues

pub mod controller;
pub mod qpair;
pub mod request;
