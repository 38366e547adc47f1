//! Error types for space-manager operations.

use thiserror::Error;

use crate::addr::Address;

/// Errors returned by [`SpaceManager`](crate::SpaceManager) operations.
///
/// All errors are local and synchronous; the manager has no retry policy.
/// Internal consistency violations (a block unlinked from a free list that
/// is not marked free, metadata reads outside the backed range) are not
/// errors but panics: they indicate a corrupted space, and continuing would
/// risk corrupting unrelated live allocations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpaceError {
    /// Requested allocation size was zero.
    #[error("invalid allocation size {size}")]
    InvalidSize {
        /// The rejected size.
        size: u64,
    },
    /// The address is outside the managed range or is not the start of a
    /// currently allocated block.
    #[error("invalid block address {addr}")]
    InvalidAddress {
        /// The rejected address.
        addr: Address,
    },
    /// No free block satisfies the request.
    #[error("managed space exhausted")]
    OutOfSpace,
    /// The extend region is not adjacent to the managed range.
    #[error("extend region at {beginning} (size {size}) is not contiguous with the managed range")]
    NonContiguousExtend {
        /// Start of the rejected region.
        beginning: Address,
        /// Size of the rejected region.
        size: u64,
    },
    /// Construction or extend parameters are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),
}
