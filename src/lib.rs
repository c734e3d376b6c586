//! # Tempest: Memory-Safe NVMe-oF RDMA Transport Engine
//!
//! Tempest is an NVMe-over-Fabrics transport engine for RDMA-capable
//! fabrics, built as a passive library: both the initiator side (submit
//! NVMe commands over reliable-connected queue pairs) and the target side
//! (accept connections, pull and push data with one-sided RDMA, execute
//! against a block device, return completions) run on cooperative
//! poll-group threads with no locks on the per-queue-pair hot path.
//!
//! ## UNIQUENESS Features
//!
//! - **Explicit request lifecycle**: a thirteen-state machine governs
//!   buffer acquisition, RDMA READ/WRITE data movement, execution, and
//!   completion - every suspension point is a poll-loop yield
//! - **End-to-end data integrity**: a T10-DIF/DIX engine generates and
//!   verifies per-block protection tuples, including blocks that straddle
//!   scatter/gather boundaries
//! - **Zero-copy data path**: payloads move between registered memory
//!   regions through keyed remote access, never through intermediate
//!   copies
//! - **Bounded resources**: shared buffer pools, per-group caches, and
//!   work-request pools make every allocation path backpressure-aware
//!
//! ## Architecture
//!
//! ```text
//! Tempest Architecture
//! ├── util        Scatter/gather, CRC-16 T10-DIF, DIF/DIX engine
//! ├── rdma        Software verbs, memory maps, WR batching, CM events
//! ├── transport   Registry, options, shared buffer pools
//! ├── target      Listener, poll groups, request state machine
//! ├── host        Connect sequence, payload builders, controller
//! └── backend     Block-device trait + RAM-disk test device
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempest::backend::MemDisk;
//! use tempest::config::TransportOpts;
//! use tempest::transport::FabricTransport;
//! use tempest::util::dif::{DifFlags, DifType};
//!
//! let disk = Arc::new(MemDisk::new(
//!     1024, 512, 0, false, DifType::Disable, DifFlags::empty(),
//! ));
//! let mut opts = TransportOpts::default();
//! opts.validate().unwrap();
//! let transport = tempest::target::transport::RdmaTargetTransport::new(
//!     opts,
//!     Default::default(),
//!     disk,
//! ).unwrap();
//! transport.listen("10.0.0.1:4420").unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod proto;
pub mod rdma;
pub mod target;
pub mod transport;
pub mod util;

// Re-export main types
pub use config::{RdmaOpts, TransportOpts};
pub use error::{Errno, Error, Result};
pub use host::controller::{Controller, ControllerOpts};
pub use target::transport::RdmaTargetTransport;
