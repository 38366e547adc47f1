//! Out-of-band metadata storage.
//!
//! Records live in a table keyed by block address and consume no bytes of
//! the managed range, so a block's accessible size equals its allocated
//! span exactly. Suited to logical spaces (slot numbers, file extents) and
//! to deterministic testing of the allocator without touching real memory.

use std::collections::HashMap;

use crate::addr::Address;
use crate::division::{DivisionStore, FLAG_MASK, FREE_BIT, PREV_FREE_BIT};

/// One block's metadata record.
#[derive(Debug, Default, Clone)]
struct DivisionRecord {
    prev_physical: Option<Address>,
    recorded: Option<Address>,
    /// Accessible size with the two flag bits packed into the low bits.
    size_field: u64,
    prev_free: Option<Address>,
    next_free: Option<Address>,
}

/// Out-of-band [`DivisionStore`] backed by a hash table.
#[derive(Debug, Default)]
pub struct TableDivisionStore {
    records: HashMap<Address, DivisionRecord>,
}

impl TableDivisionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held (one per live block).
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn record(&self, addr: Address) -> &DivisionRecord {
        self.records
            .get(&addr)
            .expect("no division record at address; space metadata is corrupted")
    }

    fn record_mut(&mut self, addr: Address) -> &mut DivisionRecord {
        self.records.entry(addr).or_default()
    }
}

impl DivisionStore for TableDivisionStore {
    fn separated(&self) -> bool {
        true
    }

    fn prev_physical(&self, addr: Address) -> Option<Address> {
        self.record(addr).prev_physical
    }

    fn set_prev_physical(&mut self, addr: Address, prev: Option<Address>) {
        self.record_mut(addr).prev_physical = prev;
    }

    fn next_physical(&self, addr: Address) -> Address {
        addr.forward(self.accessible_size(addr))
    }

    fn recorded_address(&self, addr: Address) -> Option<Address> {
        self.records.get(&addr).and_then(|record| record.recorded)
    }

    fn record_address(&mut self, addr: Address) {
        self.record_mut(addr).recorded = Some(addr);
    }

    fn accessible_size(&self, addr: Address) -> u64 {
        self.record(addr).size_field & !FLAG_MASK
    }

    fn set_accessible_size(&mut self, addr: Address, size: u64) {
        debug_assert_eq!(size & FLAG_MASK, 0, "accessible size collides with flag bits");
        let record = self.record_mut(addr);
        record.size_field = size | (record.size_field & FLAG_MASK);
    }

    fn prev_free_link(&self, addr: Address) -> Option<Address> {
        self.record(addr).prev_free
    }

    fn set_prev_free_link(&mut self, addr: Address, link: Option<Address>) {
        self.record_mut(addr).prev_free = link;
    }

    fn next_free_link(&self, addr: Address) -> Option<Address> {
        self.record(addr).next_free
    }

    fn set_next_free_link(&mut self, addr: Address, link: Option<Address>) {
        self.record_mut(addr).next_free = link;
    }

    fn is_free(&self, addr: Address) -> bool {
        self.record(addr).size_field & FREE_BIT != 0
    }

    fn set_free(&mut self, addr: Address) {
        self.record_mut(addr).size_field |= FREE_BIT;
    }

    fn set_used(&mut self, addr: Address) {
        self.record_mut(addr).size_field &= !FREE_BIT;
    }

    fn is_prev_free(&self, addr: Address) -> bool {
        self.record(addr).size_field & PREV_FREE_BIT != 0
    }

    fn set_prev_free(&mut self, addr: Address) {
        self.record_mut(addr).size_field |= PREV_FREE_BIT;
    }

    fn set_prev_used(&mut self, addr: Address) {
        self.record_mut(addr).size_field &= !PREV_FREE_BIT;
    }

    fn clear(&mut self, addr: Address) {
        self.records.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_field_preserves_flags() {
        let mut store = TableDivisionStore::new();
        let addr = Address::new(64);

        store.set_accessible_size(addr, 128);
        store.set_free(addr);
        store.set_prev_free(addr);
        assert_eq!(store.accessible_size(addr), 128);
        assert!(store.is_free(addr));
        assert!(store.is_prev_free(addr));

        store.set_accessible_size(addr, 256);
        assert!(store.is_free(addr));
        assert!(store.is_prev_free(addr));
        assert_eq!(store.accessible_size(addr), 256);

        store.set_used(addr);
        store.set_prev_used(addr);
        assert!(!store.is_free(addr));
        assert!(!store.is_prev_free(addr));
        assert_eq!(store.accessible_size(addr), 256);
    }

    #[test]
    fn test_next_physical_is_span_end() {
        let mut store = TableDivisionStore::new();
        let addr = Address::new(100);
        store.set_accessible_size(addr, 40);
        assert_eq!(store.next_physical(addr), Address::new(140));
    }

    #[test]
    fn test_recorded_address_of_unknown_block() {
        let mut store = TableDivisionStore::new();
        assert_eq!(store.recorded_address(Address::new(7)), None);
        store.record_address(Address::new(7));
        assert_eq!(store.recorded_address(Address::new(7)), Some(Address::new(7)));
    }

    #[test]
    fn test_clear_drops_record() {
        let mut store = TableDivisionStore::new();
        let addr = Address::new(8);
        store.record_address(addr);
        store.set_accessible_size(addr, 32);
        assert_eq!(store.record_count(), 1);

        store.clear(addr);
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.recorded_address(addr), None);
    }

    #[test]
    fn test_free_links_roundtrip() {
        let mut store = TableDivisionStore::new();
        let addr = Address::new(16);
        store.set_prev_free_link(addr, Some(Address::new(48)));
        store.set_next_free_link(addr, None);
        assert_eq!(store.prev_free_link(addr), Some(Address::new(48)));
        assert_eq!(store.next_free_link(addr), None);
    }

    #[test]
    #[should_panic(expected = "no division record")]
    fn test_reading_missing_record_is_fatal() {
        let store = TableDivisionStore::new();
        let _ = store.accessible_size(Address::new(1));
    }
}
