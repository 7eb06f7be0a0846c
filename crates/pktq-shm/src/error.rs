//! Error types for region setup and packet copies.
//!
//! A full queue is not an error: it is reported through
//! [`EnqueueOutcome`](crate::EnqueueOutcome) so the caller can account drops.

use std::io;

/// Errors raised while enabling or reconfiguring a region.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// Backing memory could not be allocated or mapped.
    #[error("failed to allocate {size} bytes of queue memory: {source}")]
    Alloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The configuration was rejected before anything was allocated.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// The endpoint must be disabled, and fully drained, before its
    /// configuration can change.
    #[error("region is enabled or still draining; disable it and release its readers first")]
    Busy,
}

/// Geometry and configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("region too small: need {needed} bytes, have {available}")]
    RegionTooSmall { needed: usize, available: usize },

    #[error("region base address is not {align}-byte aligned")]
    Misaligned { align: usize },

    #[error("region size overflows usize")]
    Overflow,
}

/// A packet buffer reported fewer bytes than it declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CopyError {
    #[error("short copy: wanted {wanted} bytes, buffer holds {available}")]
    Short { wanted: usize, available: usize },
}
