//! Per-block metadata contract shared by both storage strategies.
//!
//! Every block of the managed range carries five words of state:
//!
//! ```text
//! |----- prev physical -----|
//! |----- block address -----|
//! |----- size field ----P-F-|
//! |----- prev free link ----|
//! |----- next free link ----|
//! ```
//!
//! The size field packs the block's accessible size with two flag bits:
//! `F` marks the block itself free, `P` marks the *previous* physical block
//! free (the boundary tag that makes backward coalescing O(1)).

use crate::addr::Address;

/// Width of one metadata field.
pub const METADATA_UNIT_BYTES: u64 = 8;

/// Full size of a block's metadata record (five fields).
pub const METADATA_SIZE_BYTES: u64 = 5 * METADATA_UNIT_BYTES;

/// Net per-block overhead of the embedded strategy.
///
/// Three of the five fields are reclaimable while a block is allocated: the
/// two free-list links overlap the user's bytes, and the prev-physical
/// field lives in the predecessor's tail. Only the address and size fields
/// stay reserved.
pub const DIVISION_METADATA_OVERHEAD: u64 = 2 * METADATA_UNIT_BYTES;

/// Offset of a block's accessible bytes from its start (embedded strategy).
pub const ACCESSIBLE_MEM_OFFSET: u64 = 3 * METADATA_UNIT_BYTES;

/// Smallest accessible size a block may have: a freed block must be able to
/// carry its free-list links again.
pub const MIN_BLOCK_SIZE: u64 = METADATA_SIZE_BYTES - DIVISION_METADATA_OVERHEAD;

/// Size-field bit marking the block itself free.
pub(crate) const FREE_BIT: u64 = 1 << 0;

/// Size-field bit marking the previous physical block free.
pub(crate) const PREV_FREE_BIT: u64 = 1 << 1;

pub(crate) const FLAG_MASK: u64 = FREE_BIT | PREV_FREE_BIT;

/// Storage strategy for per-block metadata.
///
/// The allocator core reads and writes block state exclusively through this
/// trait. The only layout fact it may depend on is [`separated`]: separated
/// stores consume no bytes of the managed range (accessible size equals the
/// allocated span), embedded stores reserve [`DIVISION_METADATA_OVERHEAD`]
/// per block inside the range.
///
/// [`separated`]: DivisionStore::separated
pub trait DivisionStore {
    /// Whether metadata lives outside the managed bytes.
    fn separated(&self) -> bool;

    /// Back-reference to the physically preceding block.
    fn prev_physical(&self, addr: Address) -> Option<Address>;

    /// Sets the back-reference to the physically preceding block.
    fn set_prev_physical(&mut self, addr: Address, prev: Option<Address>);

    /// Start of the next physical block, derived from `addr` and the
    /// block's accessible size.
    fn next_physical(&self, addr: Address) -> Address;

    /// The block-start address recorded in the block's own metadata, used
    /// to validate release calls. `None` if nothing readable is recorded
    /// at `addr`.
    fn recorded_address(&self, addr: Address) -> Option<Address>;

    /// Stamps `addr` into its own metadata record.
    fn record_address(&mut self, addr: Address);

    /// The block's accessible size, with the flag bits masked off.
    fn accessible_size(&self, addr: Address) -> u64;

    /// Sets the accessible size, preserving the flag bits packed into the
    /// same field.
    fn set_accessible_size(&mut self, addr: Address, size: u64);

    /// Previous block in the same free-list bucket.
    fn prev_free_link(&self, addr: Address) -> Option<Address>;

    /// Sets the previous free-list link.
    fn set_prev_free_link(&mut self, addr: Address, link: Option<Address>);

    /// Next block in the same free-list bucket.
    fn next_free_link(&self, addr: Address) -> Option<Address>;

    /// Sets the next free-list link.
    fn set_next_free_link(&mut self, addr: Address, link: Option<Address>);

    /// Whether the block is free.
    fn is_free(&self, addr: Address) -> bool;

    /// Marks the block free.
    fn set_free(&mut self, addr: Address);

    /// Marks the block used.
    fn set_used(&mut self, addr: Address);

    /// Whether the previous physical block is free.
    fn is_prev_free(&self, addr: Address) -> bool;

    /// Marks the previous physical block free.
    fn set_prev_free(&mut self, addr: Address);

    /// Marks the previous physical block used.
    fn set_prev_used(&mut self, addr: Address);

    /// Drops any out-of-band record for an absorbed block. No-op for stores
    /// whose metadata lives inside the managed bytes.
    fn clear(&mut self, _addr: Address) {}

    /// Called after the managed range has grown by a contiguous region so
    /// the store can back it. No-op for separated stores.
    fn extend_backing(&mut self, _beginning: Address, _size: u64) {}
}

/// Whether the block at `addr` is the last physical block of the range
/// ending at `ending`.
///
/// `data_offset` is [`ACCESSIBLE_MEM_OFFSET`] for the embedded strategy and
/// zero for separated stores. A pure function of explicit state so boundary
/// arithmetic stays independently testable.
#[must_use]
pub fn is_terminal_block(
    addr: Address,
    accessible_size: u64,
    data_offset: u64,
    ending: Address,
) -> bool {
    addr.offset() + data_offset + accessible_size >= ending.offset()
}
