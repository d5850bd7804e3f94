//! Failure modes surfaced by the pool allocator.

use std::fmt;

/// Everything that can go wrong when using a [`crate::Pool`].
///
/// Per the allocator's contract there is no partial success: on any `Err`
/// return, no pool state has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested size was zero or exceeded the pool's `max_alloc`.
    ///
    /// Callers that only care about the two-way split documented in the
    /// allocator's error-handling contract can match this the same as
    /// [`PoolError::OutOfMemory`] — it exists as a distinct variant purely
    /// so log messages and test assertions can tell the two apart.
    InvalidSize,
    /// No existing page could satisfy the request and either the page
    /// source refused to grow the pool, or the caller forbade blocking
    /// growth via [`crate::GrowthPolicy::NonBlocking`].
    OutOfMemory,
    /// A [`crate::PoolConfig`] violated one of the allocator's geometric
    /// invariants (see the field docs on `PoolConfig`).
    InvalidConfig,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "requested size is zero or exceeds the pool's maximum allocation size"),
            Self::OutOfMemory => write!(f, "pool is out of memory"),
            Self::InvalidConfig => write!(f, "pool configuration violates a geometric invariant"),
        }
    }
}

impl std::error::Error for PoolError {}
