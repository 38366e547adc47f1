//! Embedded metadata storage inside the managed bytes.
//!
//! The real-memory strategy: all five metadata fields are little-endian
//! `u64`s packed at the start of each block, inside the managed range
//! itself. A block's accessible bytes begin at [`ACCESSIBLE_MEM_OFFSET`];
//! the trailing [`METADATA_UNIT_BYTES`] of its accessible span double as
//! the *next* block's prev-physical field (a shared boundary footer, only
//! written while this block is free), so the net per-block overhead is
//! [`DIVISION_METADATA_OVERHEAD`](crate::division::DIVISION_METADATA_OVERHEAD).
//!
//! The backing is an owned, zero-filled byte vector; physical mapping of
//! real memory is the caller's business, not the allocator's.

use crate::addr::Address;
use crate::division::{
    ACCESSIBLE_MEM_OFFSET, DivisionStore, FLAG_MASK, FREE_BIT, METADATA_UNIT_BYTES, PREV_FREE_BIT,
};

const PREV_PHYSICAL_OFFSET: u64 = 0;
const ADDRESS_OFFSET: u64 = METADATA_UNIT_BYTES;
const SIZE_FIELD_OFFSET: u64 = 2 * METADATA_UNIT_BYTES;
const PREV_FREE_LINK_OFFSET: u64 = 3 * METADATA_UNIT_BYTES;
const NEXT_FREE_LINK_OFFSET: u64 = 4 * METADATA_UNIT_BYTES;

/// Embedded [`DivisionStore`] over an owned byte buffer.
pub struct EmbeddedDivisionStore {
    base: u64,
    bytes: Vec<u8>,
}

impl EmbeddedDivisionStore {
    /// Creates a zero-filled backing for `[beginning, beginning + size)`.
    ///
    /// The manager constructed over this store must be given the same
    /// `beginning` and `size`; field access outside the backed range
    /// panics.
    #[must_use]
    pub fn new(beginning: Address, size: u64) -> Self {
        Self {
            base: beginning.offset(),
            bytes: vec![0; usize::try_from(size).expect("backing size fits in memory")],
        }
    }

    /// Borrows a block's accessible bytes.
    ///
    /// The caller is responsible for passing a live block start returned by
    /// the manager; arbitrary addresses read whatever bytes happen to be
    /// there.
    #[must_use]
    pub fn accessible_bytes(&self, addr: Address) -> &[u8] {
        let size = self.accessible_size(addr);
        let start = self.index_of(addr.offset() + ACCESSIBLE_MEM_OFFSET);
        &self.bytes[start..start + size as usize]
    }

    /// Mutably borrows a block's accessible bytes.
    ///
    /// This is the write surface for owners that treat the range as real
    /// storage. Writing past the returned slice is impossible; writing a
    /// *wrong* block's slice corrupts that block's user data but never the
    /// allocator's bookkeeping of other free blocks.
    pub fn accessible_bytes_mut(&mut self, addr: Address) -> &mut [u8] {
        let size = self.accessible_size(addr);
        let start = self.index_of(addr.offset() + ACCESSIBLE_MEM_OFFSET);
        &mut self.bytes[start..start + size as usize]
    }

    fn index_of(&self, at: u64) -> usize {
        assert!(
            at >= self.base && at < self.base + self.bytes.len() as u64,
            "metadata access at {at:#x} outside the backed range"
        );
        (at - self.base) as usize
    }

    fn get_u64(&self, at: u64) -> u64 {
        let index = self.index_of(at);
        let end = index + METADATA_UNIT_BYTES as usize;
        assert!(end <= self.bytes.len(), "metadata field at {at:#x} truncated");
        u64::from_le_bytes(self.bytes[index..end].try_into().expect("eight-byte field"))
    }

    fn put_u64(&mut self, at: u64, value: u64) {
        let index = self.index_of(at);
        let end = index + METADATA_UNIT_BYTES as usize;
        assert!(end <= self.bytes.len(), "metadata field at {at:#x} truncated");
        self.bytes[index..end].copy_from_slice(&value.to_le_bytes());
    }
}

impl DivisionStore for EmbeddedDivisionStore {
    fn separated(&self) -> bool {
        false
    }

    fn prev_physical(&self, addr: Address) -> Option<Address> {
        Address::decode_link(self.get_u64(addr.offset() + PREV_PHYSICAL_OFFSET))
    }

    fn set_prev_physical(&mut self, addr: Address, prev: Option<Address>) {
        self.put_u64(addr.offset() + PREV_PHYSICAL_OFFSET, Address::encode_link(prev));
    }

    fn next_physical(&self, addr: Address) -> Address {
        addr.forward(ACCESSIBLE_MEM_OFFSET + self.accessible_size(addr) - METADATA_UNIT_BYTES)
    }

    fn recorded_address(&self, addr: Address) -> Option<Address> {
        // Answered, not asserted: release validation probes arbitrary
        // addresses, and a probe whose header would run off the backing is
        // simply not a block.
        if addr.offset() < self.base
            || addr.offset() + ACCESSIBLE_MEM_OFFSET > self.base + self.bytes.len() as u64
        {
            return None;
        }
        Address::decode_link(self.get_u64(addr.offset() + ADDRESS_OFFSET))
    }

    fn record_address(&mut self, addr: Address) {
        self.put_u64(addr.offset() + ADDRESS_OFFSET, addr.offset());
    }

    fn accessible_size(&self, addr: Address) -> u64 {
        self.get_u64(addr.offset() + SIZE_FIELD_OFFSET) & !FLAG_MASK
    }

    fn set_accessible_size(&mut self, addr: Address, size: u64) {
        debug_assert_eq!(size & FLAG_MASK, 0, "accessible size collides with flag bits");
        let at = addr.offset() + SIZE_FIELD_OFFSET;
        let field = self.get_u64(at);
        self.put_u64(at, size | (field & FLAG_MASK));
    }

    fn prev_free_link(&self, addr: Address) -> Option<Address> {
        Address::decode_link(self.get_u64(addr.offset() + PREV_FREE_LINK_OFFSET))
    }

    fn set_prev_free_link(&mut self, addr: Address, link: Option<Address>) {
        self.put_u64(addr.offset() + PREV_FREE_LINK_OFFSET, Address::encode_link(link));
    }

    fn next_free_link(&self, addr: Address) -> Option<Address> {
        Address::decode_link(self.get_u64(addr.offset() + NEXT_FREE_LINK_OFFSET))
    }

    fn set_next_free_link(&mut self, addr: Address, link: Option<Address>) {
        self.put_u64(addr.offset() + NEXT_FREE_LINK_OFFSET, Address::encode_link(link));
    }

    fn is_free(&self, addr: Address) -> bool {
        self.get_u64(addr.offset() + SIZE_FIELD_OFFSET) & FREE_BIT != 0
    }

    fn set_free(&mut self, addr: Address) {
        let at = addr.offset() + SIZE_FIELD_OFFSET;
        let field = self.get_u64(at);
        self.put_u64(at, field | FREE_BIT);
    }

    fn set_used(&mut self, addr: Address) {
        let at = addr.offset() + SIZE_FIELD_OFFSET;
        let field = self.get_u64(at);
        self.put_u64(at, field & !FREE_BIT);
    }

    fn is_prev_free(&self, addr: Address) -> bool {
        self.get_u64(addr.offset() + SIZE_FIELD_OFFSET) & PREV_FREE_BIT != 0
    }

    fn set_prev_free(&mut self, addr: Address) {
        let at = addr.offset() + SIZE_FIELD_OFFSET;
        let field = self.get_u64(at);
        self.put_u64(at, field | PREV_FREE_BIT);
    }

    fn set_prev_used(&mut self, addr: Address) {
        let at = addr.offset() + SIZE_FIELD_OFFSET;
        let field = self.get_u64(at);
        self.put_u64(at, field & !PREV_FREE_BIT);
    }

    fn extend_backing(&mut self, beginning: Address, size: u64) {
        let at = beginning.offset();
        let len = self.bytes.len() as u64;
        let grown = usize::try_from(size).expect("backing growth fits in memory");
        if at == self.base + len {
            self.bytes.resize(self.bytes.len() + grown, 0);
        } else if at + size == self.base {
            let mut bytes = vec![0; grown];
            bytes.extend_from_slice(&self.bytes);
            self.bytes = bytes;
            self.base = at;
        } else {
            panic!("extend region at {beginning} (size {size}) is not adjacent to the backed range");
        }
    }
}
