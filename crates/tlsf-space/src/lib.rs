//! Two-level segregated-fit (TLSF) space allocator.
//!
//! Manages a contiguous address range and hands out sub-ranges in
//! O(1) amortized time: a two-level bitmap index over segregated free
//! lists answers "is there a block at least this big" with two 64-bit
//! scans, and boundary tags make coalescing on release constant-time.
//!
//! Addresses are opaque offsets, so the same allocator runs over real
//! memory ([`EmbeddedDivisionStore`], metadata packed inside the managed
//! bytes) or purely logical spaces ([`TableDivisionStore`], metadata in
//! an out-of-band table). The strategy is picked at construction:
//!
//! ```
//! use tlsf_space::{Address, SpaceManager, TableDivisionStore};
//!
//! let space = SpaceManager::new(TableDivisionStore::new(), 4, Address::new(0), 1024)?;
//! let block = space.allocate(100)?;
//! assert!(space.accessible_size(block)? >= 100);
//! space.release(block)?;
//! # Ok::<(), tlsf_space::SpaceError>(())
//! ```

#![deny(unsafe_code)]

pub mod addr;
pub mod bucket;
pub mod division;
pub mod embedded_store;
pub mod error;
pub mod manager;
pub mod table_store;

pub use addr::Address;
pub use division::DivisionStore;
pub use embedded_store::EmbeddedDivisionStore;
pub use error::SpaceError;
pub use manager::{MIN_ALIGNMENT, SpaceLogLevel, SpaceLogRecord, SpaceManager};
pub use table_store::TableDivisionStore;
