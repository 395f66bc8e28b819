//! Error types for the memory management core.
//!
//! Narrower than a whole-kernel error enum: this crate only needs the
//! handful of recoverable failure modes spec.md assigns to `alloc`,
//! `map_page`, and `create_pagedir`. Everything else spec.md calls an
//! "unrecoverable invariant violation" panics with a diagnostic instead
//! of being represented here (see `mm::page_fault`).

use core::fmt;

/// Errors returned by the memory management core's fallible operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "memory management errors must be handled, not silently discarded"]
pub enum MmError {
    /// The frame allocator could not satisfy a request of the given size.
    OutOfMemory { frames_requested: u32 },
    /// A run length outside `1..=32` was requested from the frame allocator.
    InvalidRunLength { frames_requested: u32 },
    /// A subsystem was used before its one-shot `init`/bootstrap ran.
    NotInitialized { subsystem: &'static str },
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { frames_requested } => {
                write!(f, "out of memory: no run of {frames_requested} free frames")
            }
            Self::InvalidRunLength { frames_requested } => {
                write!(
                    f,
                    "invalid run length {frames_requested}: must be in 1..=32"
                )
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {subsystem}")
            }
        }
    }
}

/// Result type alias for memory management operations.
pub type MmResult<T> = Result<T, MmError>;
