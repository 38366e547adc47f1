//! Allocator core.
//!
//! Orchestrates the bucket index and the division store: size-class
//! mapping, good-fit search, splitting, boundary-tag coalescing. One
//! manager instance owns one contiguous address range; instances share
//! nothing, so disjoint ranges can be operated concurrently from
//! different threads.

use parking_lot::Mutex;
use serde::Serialize;

use crate::addr::Address;
use crate::bucket::{
    self, BucketIndex, FIRST_LEVEL_INDEX_COUNT, SECOND_LEVEL_INDEX_COUNT,
    SECOND_LEVEL_INDEX_COUNT_LOG2,
};
use crate::division::{
    ACCESSIBLE_MEM_OFFSET, DIVISION_METADATA_OVERHEAD, DivisionStore, METADATA_SIZE_BYTES,
    METADATA_UNIT_BYTES, MIN_BLOCK_SIZE, is_terminal_block,
};
use crate::error::SpaceError;

/// Smallest permitted alignment.
pub const MIN_ALIGNMENT: u64 = 4;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpaceLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
}

/// Structured lifecycle record appended by every manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Severity level.
    pub level: SpaceLogLevel,
    /// API operation (`allocate`, `try_allocate`, `release`, `extend`).
    pub op: &'static str,
    /// Event kind (`alloc`, `free`, `extend`, `reject`, ...).
    pub event: &'static str,
    /// Block address involved in the event.
    pub addr: Option<Address>,
    /// Size value involved in the event.
    pub size: Option<u64>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Snapshot: managed range size at the time of the event.
    pub managed_size: u64,
}

struct SpaceInner<S> {
    buckets: BucketIndex,
    store: S,
    alignment: u64,
    /// First-level shift derived once from the alignment, so that the
    /// smallest first-level class starts right where the small-size
    /// path (`fli = 0`) ends.
    first_level_index_shift: u32,
    beginning: Address,
    ending: Address,
    /// Monotonic lifecycle decision id.
    next_decision_id: u64,
    /// Structured lifecycle records.
    lifecycle_logs: Vec<SpaceLogRecord>,
}

/// TLSF space manager over a pluggable division store.
///
/// All operations acquire one instance-wide mutex for their full
/// duration; the index bitmaps, the free lists and the boundary tags
/// change together and are never observed mid-update.
pub struct SpaceManager<S> {
    inner: Mutex<SpaceInner<S>>,
}

impl<S: DivisionStore> SpaceManager<S> {
    /// Applies TLSF to the range `[beginning, beginning + size)`,
    /// installing a single free block spanning the whole range.
    ///
    /// `alignment` must be a power of two at least [`MIN_ALIGNMENT`] and
    /// `size` a positive multiple of it. The embedded strategy further
    /// requires `size >=` [`METADATA_SIZE_BYTES`] so the initial block
    /// can carry its full metadata record, free-list links included.
    pub fn new(
        store: S,
        alignment: u64,
        beginning: Address,
        size: u64,
    ) -> Result<Self, SpaceError> {
        if alignment < MIN_ALIGNMENT || !alignment.is_power_of_two() {
            return Err(SpaceError::Configuration(format!(
                "alignment {alignment} is not a power of two >= {MIN_ALIGNMENT}"
            )));
        }
        if size == 0 || size % alignment != 0 {
            return Err(SpaceError::Configuration(format!(
                "size {size} is not a positive multiple of alignment {alignment}"
            )));
        }
        if !store.separated() && size < METADATA_SIZE_BYTES {
            return Err(SpaceError::Configuration(format!(
                "size {size} cannot hold embedded division metadata"
            )));
        }

        let mut inner = SpaceInner {
            buckets: BucketIndex::new(),
            store,
            alignment,
            first_level_index_shift: bucket::highest_one_bit(
                FIRST_LEVEL_INDEX_COUNT as u64 * alignment,
            ) - 1,
            beginning,
            ending: beginning.forward(size),
            next_decision_id: 1,
            lifecycle_logs: Vec::new(),
        };

        let accessible = if inner.store.separated() {
            size
        } else {
            size - DIVISION_METADATA_OVERHEAD - METADATA_UNIT_BYTES
        };
        inner.store.set_prev_physical(beginning, None);
        inner.init_free_block(beginning, accessible);
        let (fli, sli) = inner.mapping(accessible);
        inner.insert_free_space(beginning, fli, sli);
        inner.record(
            SpaceLogLevel::Debug,
            "new",
            "init",
            Some(beginning),
            Some(accessible),
            "success",
        );

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Allocates a block of at least `size` accessible bytes.
    ///
    /// The request is aligned up and clamped to [`MIN_BLOCK_SIZE`], then
    /// served good-fit: any block found in the searched bucket is
    /// guaranteed to satisfy the original request.
    pub fn allocate(&self, size: u64) -> Result<Address, SpaceError> {
        let mut inner = self.inner.lock();
        if size == 0 {
            inner.record(
                SpaceLogLevel::Warn,
                "allocate",
                "reject",
                None,
                Some(size),
                "invalid_size",
            );
            return Err(SpaceError::InvalidSize { size });
        }

        let aligned = inner.align_up(size).max(MIN_BLOCK_SIZE);
        match inner.pickout_free_space(aligned) {
            Some(addr) => {
                inner.prepare_space_for_use(addr, aligned);
                inner.record(
                    SpaceLogLevel::Trace,
                    "allocate",
                    "alloc",
                    Some(addr),
                    Some(aligned),
                    "success",
                );
                Ok(addr)
            }
            None => {
                inner.record(
                    SpaceLogLevel::Warn,
                    "allocate",
                    "alloc",
                    None,
                    Some(aligned),
                    "out_of_space",
                );
                Err(SpaceError::OutOfSpace)
            }
        }
    }

    /// Like [`allocate`](Self::allocate), but on good-fit miss falls back
    /// to the single biggest free block regardless of whether it
    /// satisfies `size`.
    ///
    /// Fails with [`SpaceError::OutOfSpace`] only when no free block
    /// exists at all. The returned block's accessible size may be smaller
    /// than requested; callers compare via
    /// [`accessible_size`](Self::accessible_size).
    pub fn try_allocate(&self, size: u64) -> Result<Address, SpaceError> {
        let mut inner = self.inner.lock();
        if size == 0 {
            inner.record(
                SpaceLogLevel::Warn,
                "try_allocate",
                "reject",
                None,
                Some(size),
                "invalid_size",
            );
            return Err(SpaceError::InvalidSize { size });
        }

        let aligned = inner.align_up(size).max(MIN_BLOCK_SIZE);
        let addr = match inner.pickout_free_space(aligned) {
            Some(addr) => addr,
            None => {
                inner.record(
                    SpaceLogLevel::Debug,
                    "try_allocate",
                    "alloc",
                    None,
                    Some(aligned),
                    "fallback_biggest",
                );
                match inner.pickout_biggest_free_space() {
                    Some(addr) => addr,
                    None => {
                        inner.record(
                            SpaceLogLevel::Warn,
                            "try_allocate",
                            "alloc",
                            None,
                            Some(aligned),
                            "out_of_space",
                        );
                        return Err(SpaceError::OutOfSpace);
                    }
                }
            }
        };

        inner.prepare_space_for_use(addr, aligned);
        inner.record(
            SpaceLogLevel::Trace,
            "try_allocate",
            "alloc",
            Some(addr),
            Some(aligned),
            "success",
        );
        Ok(addr)
    }

    /// Releases a previously allocated block, coalescing it with free
    /// physical neighbors.
    ///
    /// Fails with [`SpaceError::InvalidAddress`] when `addr` is outside
    /// the managed range or is not the start of a currently allocated
    /// block (double release included).
    pub fn release(&self, addr: Address) -> Result<(), SpaceError> {
        let mut inner = self.inner.lock();
        if addr < inner.beginning || addr >= inner.ending {
            inner.record(
                SpaceLogLevel::Warn,
                "release",
                "reject",
                Some(addr),
                None,
                "out_of_range",
            );
            return Err(SpaceError::InvalidAddress { addr });
        }
        if inner.store.recorded_address(addr) != Some(addr) || inner.store.is_free(addr) {
            inner.record(
                SpaceLogLevel::Warn,
                "release",
                "reject",
                Some(addr),
                None,
                "not_an_allocated_block",
            );
            return Err(SpaceError::InvalidAddress { addr });
        }

        inner.store.set_free(addr);
        if !inner.is_terminal(addr) {
            let next = inner.store.next_physical(addr);
            inner.store.set_prev_physical(next, Some(addr));
            inner.store.set_prev_free(next);
        }
        let merged = inner.merge(addr);
        let merged_size = inner.store.accessible_size(merged);
        inner.record(
            SpaceLogLevel::Trace,
            "release",
            "free",
            Some(merged),
            Some(merged_size),
            "success",
        );
        Ok(())
    }

    /// Grows the managed range by one contiguous region, appended right
    /// after the current ending or prepended right before the current
    /// beginning.
    ///
    /// A prepended region coalesces immediately with any free space at
    /// the old boundary. Any other placement fails with
    /// [`SpaceError::NonContiguousExtend`].
    pub fn extend(&self, beginning: Address, size: u64) -> Result<(), SpaceError> {
        let mut inner = self.inner.lock();
        if size == 0 || size % inner.alignment != 0 {
            return Err(SpaceError::Configuration(format!(
                "extend size {size} is not a positive multiple of alignment {}",
                inner.alignment
            )));
        }
        if !inner.store.separated() && size < METADATA_SIZE_BYTES {
            return Err(SpaceError::Configuration(format!(
                "extend size {size} cannot hold embedded division metadata"
            )));
        }

        let accessible = if inner.store.separated() {
            size
        } else {
            size - DIVISION_METADATA_OVERHEAD
        };

        if beginning == inner.ending {
            inner.store.extend_backing(beginning, size);
            // An embedded block starts one unit early, sharing the old
            // terminal block's footer word. Its prev-physical field is
            // left untouched: that word belongs to the predecessor's
            // accessible bytes until the predecessor is freed.
            let block = if inner.store.separated() {
                beginning
            } else {
                beginning.backward(METADATA_UNIT_BYTES)
            };
            inner.init_free_block(block, accessible);
            let (fli, sli) = inner.mapping(accessible);
            inner.insert_free_space(block, fli, sli);
            inner.ending = beginning.forward(size);
            inner.record(
                SpaceLogLevel::Info,
                "extend",
                "extend",
                Some(block),
                Some(size),
                "appended",
            );
            Ok(())
        } else if beginning.forward(size) == inner.beginning {
            inner.store.extend_backing(beginning, size);
            inner.store.set_prev_physical(beginning, None);
            inner.init_free_block(beginning, accessible);

            // The new block's next physical is the old first block.
            let next = inner.store.next_physical(beginning);
            inner.store.set_prev_physical(next, Some(beginning));
            inner.store.set_prev_free(next);

            inner.merge(beginning);
            inner.beginning = beginning;
            inner.record(
                SpaceLogLevel::Info,
                "extend",
                "extend",
                Some(beginning),
                Some(size),
                "prepended",
            );
            Ok(())
        } else {
            inner.record(
                SpaceLogLevel::Warn,
                "extend",
                "reject",
                Some(beginning),
                Some(size),
                "non_contiguous",
            );
            Err(SpaceError::NonContiguousExtend { beginning, size })
        }
    }

    /// Total size of the managed range.
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.ending.offset() - inner.beginning.offset()
    }

    /// Accessible size of the block starting at `addr`.
    ///
    /// Valid for any live block, allocated or free. Fails with
    /// [`SpaceError::InvalidAddress`] when `addr` is not a block start;
    /// try-allocate callers use this to detect under-allocation.
    pub fn accessible_size(&self, addr: Address) -> Result<u64, SpaceError> {
        let inner = self.inner.lock();
        if addr < inner.beginning || addr >= inner.ending {
            return Err(SpaceError::InvalidAddress { addr });
        }
        if inner.store.recorded_address(addr) != Some(addr) {
            return Err(SpaceError::InvalidAddress { addr });
        }
        Ok(inner.store.accessible_size(addr))
    }

    /// Start of the managed range.
    pub fn beginning(&self) -> Address {
        self.inner.lock().beginning
    }

    /// One past the end of the managed range.
    pub fn ending(&self) -> Address {
        self.inner.lock().ending
    }

    /// The configured alignment.
    pub fn alignment(&self) -> u64 {
        self.inner.lock().alignment
    }

    /// Runs `f` against the division store under the instance lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.lock().store)
    }

    /// Runs `f` against the division store, mutably, under the instance
    /// lock.
    pub fn with_store_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock().store)
    }

    /// Clones the accumulated lifecycle records.
    pub fn lifecycle_logs(&self) -> Vec<SpaceLogRecord> {
        self.inner.lock().lifecycle_logs.clone()
    }

    /// Takes the accumulated lifecycle records, leaving the log empty.
    pub fn drain_lifecycle_logs(&self) -> Vec<SpaceLogRecord> {
        std::mem::take(&mut self.inner.lock().lifecycle_logs)
    }
}

impl<S: DivisionStore> SpaceInner<S> {
    fn record(
        &mut self,
        level: SpaceLogLevel,
        op: &'static str,
        event: &'static str,
        addr: Option<Address>,
        size: Option<u64>,
        outcome: &'static str,
    ) {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.lifecycle_logs.push(SpaceLogRecord {
            decision_id,
            level,
            op,
            event,
            addr,
            size,
            outcome,
            managed_size: self.ending.offset() - self.beginning.offset(),
        });
    }

    /// Saturates near `u64::MAX`; a request that large cannot fit any
    /// managed range and fails the bucket search instead of overflowing.
    fn align_up(&self, size: u64) -> u64 {
        size.saturating_add(self.alignment - 1) & !(self.alignment - 1)
    }

    fn data_offset(&self) -> u64 {
        if self.store.separated() {
            0
        } else {
            ACCESSIBLE_MEM_OFFSET
        }
    }

    fn is_terminal(&self, addr: Address) -> bool {
        is_terminal_block(
            addr,
            self.store.accessible_size(addr),
            self.data_offset(),
            self.ending,
        )
    }

    /// The TLSF mapping function: small sizes go to `fli = 0` with a
    /// linear second level, larger sizes to the logarithmic two-level
    /// grid shifted down by the alignment-derived constant.
    fn mapping(&self, size: u64) -> (usize, usize) {
        if size < SECOND_LEVEL_INDEX_COUNT as u64 * self.alignment {
            (0, (size / self.alignment) as usize)
        } else {
            let fli = bucket::highest_one_bit(size);
            let sli =
                (size >> (fli - SECOND_LEVEL_INDEX_COUNT_LOG2)) ^ (1 << SECOND_LEVEL_INDEX_COUNT_LOG2);
            ((fli - self.first_level_index_shift) as usize, sli as usize)
        }
    }

    /// Initializes a block's own metadata as a free head-of-nothing
    /// block; does not touch its prev-physical field and does not insert
    /// it into any bucket.
    fn init_free_block(&mut self, addr: Address, accessible: u64) {
        self.store.record_address(addr);
        self.store.set_accessible_size(addr, accessible);
        self.store.set_free(addr);
        self.store.set_prev_used(addr);
    }

    fn insert_free_space(&mut self, addr: Address, fli: usize, sli: usize) {
        let head = self.buckets.head(fli, sli);
        if let Some(head) = head {
            self.store.set_prev_free_link(head, Some(addr));
        }
        self.store.set_next_free_link(addr, head);
        self.store.set_prev_free_link(addr, None);
        self.buckets.install_head(fli, sli, addr);
    }

    fn remove_free_space(&mut self, addr: Address, fli: usize, sli: usize) {
        assert!(
            self.store.is_free(addr),
            "unlinking a block that is not free; space metadata is corrupted"
        );

        let prev = self.store.prev_free_link(addr);
        let next = self.store.next_free_link(addr);
        if let Some(prev) = prev {
            self.store.set_next_free_link(prev, next);
        }
        if let Some(next) = next {
            self.store.set_prev_free_link(next, prev);
        }
        if prev.is_none() {
            self.buckets.replace_head(fli, sli, next);
        }
    }

    /// Unlinks and returns a free block guaranteed to hold `size`, or
    /// `None` when no bucket at or above the request's class is
    /// non-empty.
    fn pickout_free_space(&mut self, size: u64) -> Option<Address> {
        let mut size = size;
        // Good-fit rounding: push the request up to the next class
        // boundary so any block in the searched bucket satisfies it. A
        // request too large to round has no satisfiable bucket at all.
        if size >= 1 << SECOND_LEVEL_INDEX_COUNT_LOG2 {
            size = size.checked_add(
                (1u64 << (bucket::highest_one_bit(size) - SECOND_LEVEL_INDEX_COUNT_LOG2)) - 1,
            )?;
        }

        let (fli, sli) = self.mapping(size);
        let (fli, sli) = self.buckets.search_at_or_above(fli, sli)?;
        let addr = self.buckets.head(fli, sli)?;
        self.remove_free_space(addr, fli, sli);
        Some(addr)
    }

    /// Unlinks and returns the single biggest free block, if any.
    fn pickout_biggest_free_space(&mut self) -> Option<Address> {
        let (fli, sli) = self.buckets.biggest()?;
        let addr = self.buckets.head(fli, sli)?;
        self.remove_free_space(addr, fli, sli);
        Some(addr)
    }

    /// Fuses `addr` into `prev`, which absorbs its span (plus the freed
    /// metadata overhead for the embedded strategy) and inherits its
    /// physical successor.
    fn absorb(&mut self, prev: Address, addr: Address) -> Address {
        let prev_size = self.store.accessible_size(prev);
        let cur_size = self.store.accessible_size(addr);
        let merged = if self.store.separated() {
            prev_size + cur_size
        } else {
            prev_size + cur_size + DIVISION_METADATA_OVERHEAD
        };

        let next = (!self.is_terminal(addr)).then(|| self.store.next_physical(addr));
        self.store.set_accessible_size(prev, merged);
        if let Some(next) = next {
            self.store.set_prev_physical(next, Some(prev));
            self.store.set_prev_free(next);
        }
        self.store.clear(addr);
        prev
    }

    fn merge_prev(&mut self, addr: Address) -> Address {
        if !self.store.is_prev_free(addr) {
            return addr;
        }
        let prev = self
            .store
            .prev_physical(addr)
            .expect("previous block marked free without a back-pointer; space metadata is corrupted");
        let (fli, sli) = self.mapping(self.store.accessible_size(prev));
        self.remove_free_space(prev, fli, sli);
        self.absorb(prev, addr)
    }

    fn merge_next(&mut self, addr: Address) -> Address {
        if self.is_terminal(addr) {
            return addr;
        }
        let next = self.store.next_physical(addr);
        if !self.store.is_free(next) {
            return addr;
        }
        let (fli, sli) = self.mapping(self.store.accessible_size(next));
        self.remove_free_space(next, fli, sli);
        self.absorb(addr, next)
    }

    /// Coalesces with both free physical neighbors and reinserts the
    /// merged block at its new size class.
    fn merge(&mut self, addr: Address) -> Address {
        let addr = self.merge_prev(addr);
        let addr = self.merge_next(addr);
        let (fli, sli) = self.mapping(self.store.accessible_size(addr));
        self.insert_free_space(addr, fli, sli);
        addr
    }

    /// Splits a free block into an exactly `size`-d head and a free
    /// remainder; returns the remainder's address.
    ///
    /// The successor's back-pointer is fixed before the head's size field
    /// shrinks, while next-physical is still derivable from it.
    fn split(&mut self, addr: Address, size: u64) -> Address {
        assert!(
            self.store.is_free(addr),
            "splitting a block that is not free; space metadata is corrupted"
        );

        let (remainder, remainder_size) = if self.store.separated() {
            (addr.forward(size), self.store.accessible_size(addr) - size)
        } else {
            (
                addr.forward(ACCESSIBLE_MEM_OFFSET + size - METADATA_UNIT_BYTES),
                self.store.accessible_size(addr) - (size + DIVISION_METADATA_OVERHEAD),
            )
        };
        let next = (!self.is_terminal(addr)).then(|| self.store.next_physical(addr));

        self.store.set_prev_physical(remainder, Some(addr));
        self.store.record_address(remainder);
        self.store.set_accessible_size(remainder, remainder_size);
        self.store.set_free(remainder);
        self.store.set_prev_free(remainder);

        if let Some(next) = next {
            self.store.set_prev_physical(next, Some(remainder));
            self.store.set_prev_free(next);
        }

        self.store.set_accessible_size(addr, size);
        remainder
    }

    /// Puts back the extra space of a block above the strategy's
    /// splitting threshold; below it the remainder would be unusable as a
    /// future allocation and stays with the block.
    fn trim_free_space(&mut self, addr: Address, size: u64) {
        let threshold = if self.store.separated() {
            size.checked_add(self.alignment)
        } else {
            size.checked_add(METADATA_SIZE_BYTES.max(self.alignment))
        };
        // An unrepresentable threshold means the request dwarfs every
        // possible remainder; keep the block whole.
        let Some(threshold) = threshold else { return };
        if self.store.accessible_size(addr) < threshold {
            return;
        }

        let remainder = self.split(addr, size);
        let (fli, sli) = self.mapping(self.store.accessible_size(remainder));
        self.insert_free_space(remainder, fli, sli);
    }

    /// Trims an unlinked free block to the request and marks it used,
    /// flipping the successor's boundary tag.
    fn prepare_space_for_use(&mut self, addr: Address, size: u64) {
        self.trim_free_space(addr, size);

        if !self.is_terminal(addr) {
            let next = self.store.next_physical(addr);
            self.store.set_prev_used(next);
        }
        self.store.set_used(addr);
    }
}
