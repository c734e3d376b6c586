//! Error types for the Tempest transport engine.
//!
//! Tempest uses structured error handling with an errno-style code attached
//! to every failure so transport-level errors can propagate to upper layers
//! the same way a kernel driver would surface them.

/// Result type alias for Tempest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errno-style error codes surfaced by the transport.
///
/// These mirror the negated errno values a verbs-based transport reports to
/// its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Out of memory or out of pool elements (ENOMEM)
    NoMem,
    /// Temporarily out of resources, retry may succeed (EAGAIN)
    Again,
    /// Invalid argument or malformed capsule (EINVAL)
    Invalid,
    /// Unexpected message on a connection channel (EBADMSG)
    BadMsg,
    /// Operation on a dead or unusable queue pair (EBADF)
    BadFd,
    /// Value outside the representable range (ERANGE)
    Range,
    /// No translation or no such object (ENOENT)
    NotFound,
    /// Stale connection detected during connect (ESTALE)
    Stale,
    /// Device removed while in use (ENODEV)
    Removed,
}

impl Errno {
    /// The negated errno value as seen by C-level consumers.
    pub fn as_neg_errno(self) -> i32 {
        match self {
            Errno::NoMem => -12,
            Errno::Again => -11,
            Errno::Invalid => -22,
            Errno::BadMsg => -74,
            Errno::BadFd => -9,
            Errno::Range => -34,
            Errno::NotFound => -2,
            Errno::Stale => -116,
            Errno::Removed => -19,
        }
    }
}

/// Comprehensive error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pool or allocation exhaustion
    #[error("out of memory: {message}")]
    NoMem {
        /// Descriptive error message
        message: String,
    },

    /// Transient resource shortage, the caller may resubmit
    #[error("resources temporarily unavailable: {message}")]
    Again {
        /// Descriptive error message
        message: String,
    },

    /// Invalid argument, option, or capsule contents
    #[error("invalid argument: {message}")]
    Invalid {
        /// Descriptive error message
        message: String,
    },

    /// An unexpected event or message was reaped from a channel
    #[error("unexpected message: {message}")]
    BadMsg {
        /// Descriptive error message
        message: String,
    },

    /// The queue pair or channel is no longer usable
    #[error("bad queue pair state: {message}")]
    BadFd {
        /// Descriptive error message
        message: String,
    },

    /// A size or depth fell outside the supported range
    #[error("out of range: {message}")]
    Range {
        /// Descriptive error message
        message: String,
    },

    /// Lookup failed (address translation, listener, transport name)
    #[error("not found: {message}")]
    NotFound {
        /// Descriptive error message
        message: String,
    },

    /// The peer reported a stale connection; retry with backoff
    #[error("stale connection: {message}")]
    Stale {
        /// Descriptive error message
        message: String,
    },

    /// The underlying device went away
    #[error("device removed: {message}")]
    Removed {
        /// Descriptive error message
        message: String,
    },
}

impl Error {
    /// Create an out-of-memory error
    pub fn no_mem<S: Into<String>>(message: S) -> Self {
        Self::NoMem {
            message: message.into(),
        }
    }

    /// Create a retryable resource-shortage error
    pub fn again<S: Into<String>>(message: S) -> Self {
        Self::Again {
            message: message.into(),
        }
    }

    /// Create an invalid-argument error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an unexpected-message error
    pub fn bad_msg<S: Into<String>>(message: S) -> Self {
        Self::BadMsg {
            message: message.into(),
        }
    }

    /// Create a bad-queue-pair error
    pub fn bad_fd<S: Into<String>>(message: S) -> Self {
        Self::BadFd {
            message: message.into(),
        }
    }

    /// Create an out-of-range error
    pub fn range<S: Into<String>>(message: S) -> Self {
        Self::Range {
            message: message.into(),
        }
    }

    /// Create a lookup-failure error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a stale-connection error
    pub fn stale<S: Into<String>>(message: S) -> Self {
        Self::Stale {
            message: message.into(),
        }
    }

    /// Create a device-removed error
    pub fn removed<S: Into<String>>(message: S) -> Self {
        Self::Removed {
            message: message.into(),
        }
    }

    /// The errno-style code for this error
    pub fn errno(&self) -> Errno {
        match self {
            Self::NoMem { .. } => Errno::NoMem,
            Self::Again { .. } => Errno::Again,
            Self::Invalid { .. } => Errno::Invalid,
            Self::BadMsg { .. } => Errno::BadMsg,
            Self::BadFd { .. } => Errno::BadFd,
            Self::Range { .. } => Errno::Range,
            Self::NotFound { .. } => Errno::NotFound,
            Self::Stale { .. } => Errno::Stale,
            Self::Removed { .. } => Errno::Removed,
        }
    }

    /// Check if this is a recoverable error.
    ///
    /// Recoverable errors park the request or the connect attempt; the
    /// caller is expected to re-drive them. Everything else is terminal for
    /// the operation that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoMem { .. } | Self::Again { .. } | Self::Stale { .. }
        )
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoMem { .. } => "no_mem",
            Self::Again { .. } => "again",
            Self::Invalid { .. } => "invalid",
            Self::BadMsg { .. } => "bad_msg",
            Self::BadFd { .. } => "bad_fd",
            Self::Range { .. } => "range",
            Self::NotFound { .. } => "not_found",
            Self::Stale { .. } => "stale",
            Self::Removed { .. } => "removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::no_mem("pool empty").errno(), Errno::NoMem);
        assert_eq!(Error::stale("reject status 10").errno(), Errno::Stale);
        assert_eq!(Errno::NoMem.as_neg_errno(), -12);
        assert_eq!(Errno::Stale.as_neg_errno(), -116);
        assert_eq!(Errno::BadMsg.as_neg_errno(), -74);
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::no_mem("x").is_recoverable());
        assert!(Error::again("x").is_recoverable());
        assert!(Error::stale("x").is_recoverable());
        assert!(!Error::invalid("x").is_recoverable());
        assert!(!Error::bad_msg("x").is_recoverable());
    }
}
