//! Error types for heap initialization and page allocation.

use std::io;

use thiserror::Error;

/// Failure to bring up the heap.
#[derive(Debug, Error)]
pub enum HeapError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),

    /// Not enough address space could be reserved, even discontiguously.
    #[error("failed to reserve enough address space for the heap ({reserved} bytes reserved, {required} bytes required)")]
    ReservationFailed {
        /// Bytes actually reserved before giving up.
        reserved: usize,
        /// Minimum number of bytes needed.
        required: usize,
    },

    /// The configured backend does not work on this platform.
    #[error("memory backend is not supported on this platform")]
    UnsupportedPlatform,

    /// The initial capacity could not be committed.
    #[error("failed to commit the initial heap capacity ({committed} of {requested} bytes)")]
    InitialCommitFailed {
        /// Bytes committed before the failure.
        committed: usize,
        /// Bytes requested.
        requested: usize,
    },

    /// An operating system primitive failed.
    #[error("memory backend error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to allocate a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// A non-blocking request could not be satisfied without stalling.
    #[error("allocation would stall")]
    WouldStall,

    /// A stalled request was failed after a major collection freed too little.
    #[error("out of memory")]
    OutOfMemory,

    /// No contiguous virtual range of the requested size is available.
    #[error("virtual address space exhausted")]
    AddressSpaceExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_sizes() {
        let err = HeapError::ReservationFailed {
            reserved: 10,
            required: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("10 bytes reserved"));
        assert!(msg.contains("20 bytes required"));
    }

    #[test]
    fn test_io_conversion() {
        let err: HeapError = io::Error::from(io::ErrorKind::OutOfMemory).into();
        assert!(matches!(err, HeapError::Io(_)));
    }
}
