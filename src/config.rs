//! Transport configuration.
//!
//! [`TransportOpts`] is the process-wide option block shared by every
//! fabric transport; it is validated and clamped once at transport
//! creation and immutable afterwards. [`RdmaOpts`] carries the
//! RDMA-specific knobs and decodes from JSON, tolerating unknown keys.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::proto::{MAX_SGL_DESCRIPTORS, NVME_CMD_SIZE, SGL_DESC_SIZE};

/// Default per-queue-pair command depth.
pub const DEFAULT_MAX_QUEUE_DEPTH: u32 = 128;
/// Default admin-queue depth.
pub const DEFAULT_MAX_AQ_DEPTH: u32 = 128;
/// Default per-controller queue-pair limit (admin included).
pub const DEFAULT_MAX_QPAIRS_PER_CTRLR: u32 = 128;
/// Default in-capsule data limit.
pub const DEFAULT_IN_CAPSULE_DATA_SIZE: u32 = 4096;
/// Default largest single I/O.
pub const DEFAULT_MAX_IO_SIZE: u32 = 131_072;
/// Default shared-buffer count.
pub const DEFAULT_NUM_SHARED_BUFFERS: u32 = 4095;
/// Default per-poll-group buffer cache size.
pub const DEFAULT_BUF_CACHE_SIZE: u32 = 32;
/// Default seconds an ABORT waits for an outstanding transfer.
pub const DEFAULT_ABORT_TIMEOUT_SEC: u32 = 1;
/// Default idle-association timeout in milliseconds.
pub const DEFAULT_ASSOCIATION_TIMEOUT_MS: u32 = 120_000;
/// Default acceptor poll interval in microseconds.
pub const DEFAULT_ACCEPTOR_POLL_RATE_US: u32 = 10_000;
/// Smallest admin queue depth the protocol permits.
pub const MIN_ADMIN_QUEUE_DEPTH: u32 = 32;
/// Smallest I/O buffer unit.
pub const MIN_IO_UNIT_SIZE: u32 = DEFAULT_MAX_IO_SIZE / MAX_SGL_DESCRIPTORS as u32;
/// Data buffers are carved on this alignment.
pub const DATA_BUFFER_ALIGNMENT: u32 = 4096;

/// Process-wide transport options, immutable once a transport is created.
#[derive(Debug, Clone, Serialize)]
pub struct TransportOpts {
    /// Upper bound on in-flight commands per queue pair
    pub max_queue_depth: u32,
    /// Per-controller queue-pair limit, admin queue included
    pub max_qpairs_per_ctrlr: u32,
    /// Largest payload that may ride inline in a command capsule
    pub in_capsule_data_size: u32,
    /// Largest single I/O payload
    pub max_io_size: u32,
    /// Buffer-pool element size
    pub io_unit_size: u32,
    /// Admin-queue depth
    pub max_aq_depth: u32,
    /// Total shared data buffers
    pub num_shared_buffers: u32,
    /// Per-poll-group buffer cache reservation
    pub buf_cache_size: u32,
    /// Hide protection information from upper layers
    pub dif_insert_or_strip: bool,
    /// Seconds ABORT waits for a target-side transfer to drain
    pub abort_timeout_sec: u32,
    /// Idle-association disconnect timeout in milliseconds
    pub association_timeout_ms: u32,
    /// Acceptor poll interval in microseconds
    pub acceptor_poll_rate_us: u32,
}

impl Default for TransportOpts {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_qpairs_per_ctrlr: DEFAULT_MAX_QPAIRS_PER_CTRLR,
            in_capsule_data_size: DEFAULT_IN_CAPSULE_DATA_SIZE,
            max_io_size: DEFAULT_MAX_IO_SIZE,
            io_unit_size: MIN_IO_UNIT_SIZE,
            max_aq_depth: DEFAULT_MAX_AQ_DEPTH,
            num_shared_buffers: DEFAULT_NUM_SHARED_BUFFERS,
            buf_cache_size: DEFAULT_BUF_CACHE_SIZE,
            dif_insert_or_strip: false,
            abort_timeout_sec: DEFAULT_ABORT_TIMEOUT_SEC,
            association_timeout_ms: DEFAULT_ASSOCIATION_TIMEOUT_MS,
            acceptor_poll_rate_us: DEFAULT_ACCEPTOR_POLL_RATE_US,
        }
    }
}

impl TransportOpts {
    /// Validate and clamp the option block.
    ///
    /// Hard violations fail; soft ones are clamped with a warning, the
    /// way a production target keeps limping along on an imperfect
    /// configuration.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_io_size != 0
            && (!self.max_io_size.is_power_of_two() || self.max_io_size < 8192)
        {
            return Err(Error::invalid(format!(
                "max_io_size {} must be a power of two and at least 8 KiB",
                self.max_io_size
            )));
        }

        if self.max_aq_depth < MIN_ADMIN_QUEUE_DEPTH {
            warn!(
                max_aq_depth = self.max_aq_depth,
                "admin queue depth below the protocol minimum, clamping up"
            );
            self.max_aq_depth = MIN_ADMIN_QUEUE_DEPTH;
        }

        // The I/O unit cannot be larger than the largest I/O.
        if self.io_unit_size > self.max_io_size {
            self.io_unit_size = self.max_io_size;
        }
        if self.io_unit_size == 0 {
            return Err(Error::invalid("io_unit_size must be non-zero"));
        }

        if self.num_shared_buffers < (MAX_SGL_DESCRIPTORS as u32) * 2 {
            return Err(Error::invalid(format!(
                "num_shared_buffers {} cannot guarantee forward progress, need at least {}",
                self.num_shared_buffers,
                MAX_SGL_DESCRIPTORS * 2
            )));
        }

        let sge_count = self.max_io_size / self.io_unit_size;
        if sge_count > MAX_SGL_DESCRIPTORS as u32 {
            return Err(Error::invalid(format!(
                "io_unit_size {} would need {} SGEs per I/O, the limit is {}",
                self.io_unit_size, sge_count, MAX_SGL_DESCRIPTORS
            )));
        }

        let min_in_capsule = (SGL_DESC_SIZE * MAX_SGL_DESCRIPTORS) as u32;
        if self.in_capsule_data_size < min_in_capsule {
            warn!(
                in_capsule_data_size = self.in_capsule_data_size,
                min_in_capsule, "in-capsule data size below the descriptor-list minimum, clamping"
            );
            self.in_capsule_data_size = min_in_capsule;
        }

        Ok(())
    }

    /// Round the I/O unit so one I/O fits in the device's SGE budget:
    /// divide `max_io_size` across the SGEs, then round up to the data
    /// buffer alignment.
    pub fn adjust_io_unit_for_device(&mut self, device_max_sge: u32) {
        if self.io_unit_size as u64 * device_max_sge as u64 >= self.max_io_size as u64 {
            return;
        }
        let mut unit = self.max_io_size.div_ceil(device_max_sge);
        unit = (unit + DATA_BUFFER_ALIGNMENT - 1) & !(DATA_BUFFER_ALIGNMENT - 1);
        self.io_unit_size = unit.max(MIN_IO_UNIT_SIZE);
        warn!(
            io_unit_size = self.io_unit_size,
            "adjusted the I/O unit size to fit the device's SGE budget"
        );
    }

    /// The default in-capsule command size advertised to hosts, in
    /// 16-byte units.
    pub fn ioccsz(&self) -> u32 {
        if self.dif_insert_or_strip {
            // In-capsule data only works when the upper layer sees raw
            // protection bytes, so advertise a bare command.
            (NVME_CMD_SIZE / 16) as u32
        } else {
            ((NVME_CMD_SIZE as u32) + self.in_capsule_data_size) / 16
        }
    }
}

fn default_num_cqe() -> i32 {
    4096
}

fn default_max_srq_depth() -> u32 {
    4096
}

fn default_acceptor_backlog() -> i32 {
    100
}

/// RDMA-specific transport options, decoded from JSON configuration.
///
/// All keys are optional; unknown keys are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaOpts {
    /// Completion-queue size when no shared receive queue is used
    #[serde(default = "default_num_cqe")]
    pub num_cqe: i32,
    /// Shared receive queue depth
    #[serde(default = "default_max_srq_depth")]
    pub max_srq_depth: u32,
    /// Disable the shared receive queue
    #[serde(default)]
    pub no_srq: bool,
    /// Disable work-request batching
    #[serde(default)]
    pub no_wr_batching: bool,
    /// Listen backlog of the acceptor
    #[serde(default = "default_acceptor_backlog")]
    pub acceptor_backlog: i32,
}

impl Default for RdmaOpts {
    fn default() -> Self {
        Self {
            num_cqe: default_num_cqe(),
            max_srq_depth: default_max_srq_depth(),
            no_srq: false,
            no_wr_batching: false,
            acceptor_backlog: default_acceptor_backlog(),
        }
    }
}

impl RdmaOpts {
    /// Decode from a JSON object, applying defaults for missing keys.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut opts: RdmaOpts = serde_json::from_str(raw)
            .map_err(|e| Error::invalid(format!("bad RDMA transport options: {}", e)))?;
        opts.validate();
        Ok(opts)
    }

    /// Clamp out-of-range values back to their defaults.
    pub fn validate(&mut self) {
        if self.acceptor_backlog <= 0 {
            warn!(
                acceptor_backlog = self.acceptor_backlog,
                "acceptor backlog cannot be less than 1, resetting to default"
            );
            self.acceptor_backlog = default_acceptor_backlog();
        }
        if self.num_cqe <= 0 {
            warn!(num_cqe = self.num_cqe, "num_cqe must be positive, resetting");
            self.num_cqe = default_num_cqe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_clean() {
        let mut opts = TransportOpts::default();
        opts.validate().unwrap();
        assert_eq!(opts.max_queue_depth, 128);
        assert_eq!(opts.io_unit_size, 8192);
    }

    #[test]
    fn test_max_io_size_must_be_pow2() {
        let mut opts = TransportOpts {
            max_io_size: 100_000,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let mut opts = TransportOpts {
            max_io_size: 4096,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_aq_depth_clamps_up() {
        let mut opts = TransportOpts {
            max_aq_depth: 4,
            ..Default::default()
        };
        opts.validate().unwrap();
        assert_eq!(opts.max_aq_depth, MIN_ADMIN_QUEUE_DEPTH);
    }

    #[test]
    fn test_shared_buffer_floor() {
        let mut opts = TransportOpts {
            num_shared_buffers: 8,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_io_unit_adjusts_for_device_sge() {
        let mut opts = TransportOpts {
            io_unit_size: 4096,
            ..Default::default()
        };
        // 4 KiB units over 16 SGEs cover only 64 KiB of a 128 KiB I/O.
        opts.adjust_io_unit_for_device(16);
        assert_eq!(opts.io_unit_size, 8192);
        assert_eq!(opts.io_unit_size % DATA_BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn test_in_capsule_minimum() {
        let mut opts = TransportOpts {
            in_capsule_data_size: 64,
            ..Default::default()
        };
        opts.validate().unwrap();
        assert_eq!(
            opts.in_capsule_data_size,
            (SGL_DESC_SIZE * MAX_SGL_DESCRIPTORS) as u32
        );
    }

    #[test]
    fn test_rdma_opts_json_tolerates_unknown_keys() {
        let opts =
            RdmaOpts::from_json(r#"{"max_srq_depth": 1024, "wombat": true, "num_cqe": 512}"#)
                .unwrap();
        assert_eq!(opts.max_srq_depth, 1024);
        assert_eq!(opts.num_cqe, 512);
        assert!(!opts.no_srq);
        assert_eq!(opts.acceptor_backlog, 100);
    }

    #[test]
    fn test_rdma_opts_backlog_clamp() {
        let mut opts = RdmaOpts {
            acceptor_backlog: -5,
            ..Default::default()
        };
        opts.validate();
        assert_eq!(opts.acceptor_backlog, 100);
    }
}
