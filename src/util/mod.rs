//! Utility building blocks shared by both sides of the transport.
//!
//! - [`dma`]: reference-counted buffers carrying a stable virtual address,
//!   the process-memory model every registration and translation works on
//! - [`sg`]: scatter/gather lists and block-wise traversal
//! - [`crc16`]: the CRC-16 T10-DIF checksum
//! - [`dif`]: the protection-information engine (DIF and DIX)

pub mod crc16;
pub mod dif;
pub mod dma;
pub mod sg;
